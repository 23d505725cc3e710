//! Node-compat polyfill resolution.
//!
//! Bundling is a pre-processing step elsewhere; the only imports a
//! deployed script may still contain are `node:*` specifiers that the
//! bundler left for the runtime's compatibility layer. Those resolve
//! against the directory named by `HOSTEDAT_UNENV_PATH`; without the
//! variable, any remaining import fails to resolve at compile time.

use std::path::{Path, PathBuf};

use hostedat_js_runtime::host::ModuleProvider;
use oxc_resolver::{ResolveOptions, Resolver};

/// Environment variable redirecting the polyfill search path.
pub const ENV_UNENV_PATH: &str = "HOSTEDAT_UNENV_PATH";

/// Resolves `node:*` modules from an on-disk polyfill tree.
pub struct UnenvModules {
    root: Option<PathBuf>,
    resolver: Resolver,
}

impl UnenvModules {
    /// Reads the search path from `HOSTEDAT_UNENV_PATH`.
    pub fn from_env() -> Self {
        Self::with_root(std::env::var_os(ENV_UNENV_PATH).map(PathBuf::from))
    }

    /// Uses an explicit root, or no modules at all when `None`.
    pub fn with_root(root: Option<PathBuf>) -> Self {
        let resolver = Resolver::new(ResolveOptions {
            extensions: vec![".js".into(), ".mjs".into()],
            condition_names: vec!["import".into(), "module".into()],
            ..Default::default()
        });
        Self { root, resolver }
    }

    fn root(&self) -> anyhow::Result<&Path> {
        self.root.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "no Node-compat modules are available (set {ENV_UNENV_PATH} to enable them)"
            )
        })
    }
}

impl ModuleProvider for UnenvModules {
    fn resolve(&self, base: &str, specifier: &str) -> anyhow::Result<String> {
        let root = self.root()?;
        // relative imports inside the polyfill tree resolve against the
        // importing module's directory; everything else is a polyfill
        // name under the root
        let (dir, name) = if specifier.starts_with('.') {
            (PathBuf::from(base), specifier.to_string())
        } else {
            let name = specifier.strip_prefix("node:").unwrap_or(specifier);
            (root.to_path_buf(), format!("./{name}"))
        };

        tracing::debug!(base = %dir.display(), specifier = %name, "resolving module");
        let resolved = self.resolver.resolve(&dir, &name).map_err(|e| {
            anyhow::anyhow!("failed to resolve module '{specifier}' from '{base}': {e:?}")
        })?;
        Ok(resolved.path().to_string_lossy().to_string())
    }

    fn load(&self, path: &str) -> anyhow::Result<String> {
        tracing::debug!(path = %path, "loading module");
        std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read module '{path}': {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_root_fails_resolution() {
        let modules = UnenvModules::with_root(None);
        assert!(modules.resolve(".", "node:fs").is_err());
    }

    #[test]
    fn polyfills_resolve_under_the_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fs.mjs"), "export default {};").unwrap();
        let modules = UnenvModules::with_root(Some(dir.path().to_path_buf()));
        let path = modules.resolve(".", "node:fs").unwrap();
        assert!(path.ends_with("fs.mjs"), "{path}");
        assert!(modules.load(&path).unwrap().contains("export default"));
    }
}
