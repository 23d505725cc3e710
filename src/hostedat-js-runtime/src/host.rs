use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use hostedat_js_common::{WorkerRequest, WorkerResult};

use crate::ops::OpCompletion;

/// A trait representing the host environment for the isolate runtime.
/// The engine crate implements this; the runtime never calls a socket,
/// an HTTP client or a database directly.
///
/// Async operations take an [`OpCompletion`]: the implementation does
/// its work on its own threads and posts the outcome back into the
/// isolate's completion queue. Host threads must never touch the VM.
pub trait Host: Send + Sync {
    /// Run a blocking job (store access, D1 query) off the isolate
    /// thread. The job owns its completion handle.
    fn run_blocking(&self, job: Box<dyn FnOnce() + Send + 'static>);

    /// Perform an outbound HTTP request. The returned handle cancels
    /// the in-flight request when an `AbortSignal` fires.
    fn fetch(&self, req: HttpRequest, done: OpCompletion) -> CancelHandle;

    /// Open an outbound TCP connection. Connection setup (including the
    /// SSRF check) happens asynchronously; failures surface through the
    /// socket's `opened` op.
    fn tcp_connect(
        &self,
        addr: TcpAddress,
        opts: TcpOptions,
    ) -> Result<Arc<dyn TcpConnection>, String>;

    /// Route a service-binding fetch to another worker.
    fn dispatch_service(&self, target: ServiceTarget, req: WorkerRequest, done: OpCompletion);

    /// Open a D1 database bridge by database id. Handles are tracked in
    /// request state and closed at teardown.
    fn open_d1(&self, database_id: &str) -> Result<Arc<dyn D1Database>, String>;
}

/// One outbound HTTP request, fully buffered.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// min(remaining request deadline, engine fetch timeout), millis.
    pub timeout_ms: u64,
}

/// Target of a `connect()` call, before any SSRF validation.
#[derive(Debug, Clone)]
pub struct TcpAddress {
    pub hostname: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpOptions {
    /// True when the dialer should negotiate TLS immediately after
    /// connecting (`secureTransport: "on"`).
    pub secure_transport: bool,
    pub allow_half_open: bool,
}

/// Identifies the worker a service binding points at.
#[derive(Debug, Clone)]
pub struct ServiceTarget {
    pub site_id: String,
    pub deploy_key: String,
}

/// Routes service-binding calls between workers. Provided by the host
/// dispatcher, injected with `Engine::set_dispatcher`.
pub trait WorkerDispatcher: Send + Sync {
    fn execute(
        &self,
        site_id: &str,
        deploy_key: &str,
        env: crate::env::Env,
        req: WorkerRequest,
    ) -> WorkerResult;
}

/// Cancels an in-flight host operation. Dropping the handle without
/// calling [`cancel`](Self::cancel) lets the operation run to
/// completion.
pub struct CancelHandle(Option<Box<dyn FnOnce() + Send>>);

impl CancelHandle {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    /// A handle for operations that cannot be cancelled.
    pub fn noop() -> Self {
        Self(None)
    }

    pub fn cancel(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// An established (or establishing) TCP connection owned by the host.
///
/// Reads are level-triggered against a host-side buffer: `read` drains
/// buffered bytes immediately when any are available and otherwise
/// parks the completion until the background reader signals.
pub trait TcpConnection: Send + Sync {
    /// Resolves `{}` once the connection is established (and TLS
    /// negotiated, when requested); rejects on dial or SSRF failure.
    fn opened(&self, done: OpCompletion);

    /// Resolves `{"data": <base64>}` with up to `max` buffered bytes,
    /// or `{"done": true}` at EOF.
    fn read(&self, max: usize, done: OpCompletion);

    /// Resolves `{}` when the bytes have been handed to the kernel.
    fn write(&self, data: Vec<u8>, done: OpCompletion);

    /// Half-close the write side.
    fn close_write(&self);

    /// Tear the connection down.
    fn close(&self);

    /// Resolves `{}` when the connection has fully closed.
    fn closed(&self, done: OpCompletion);

    /// Upgrade the connection to TLS. Returns the replacement
    /// connection; the original must refuse further reads and writes.
    fn start_tls(self: Arc<Self>) -> Result<Arc<dyn TcpConnection>, String>;
}

/// An open D1 database bridge.
pub trait D1Database: Send + Sync {
    /// Run one parameterised statement. `params_json` is a JSON array
    /// of scalars. Returns `{"results": [...], "meta": {...}}` JSON.
    fn query(&self, sql: &str, params_json: &str) -> Result<String, String>;

    /// Execute a batch of semicolon-separated statements; returns the
    /// statement count.
    fn exec(&self, sql: &str) -> Result<u64, String>;

    fn close(&self);
}

/// Lazily resolves `node:*` polyfill modules for worker scripts that
/// were bundled against the Node compatibility layer.
pub trait ModuleProvider: Send + Sync {
    fn resolve(&self, base: &str, specifier: &str) -> Result<String>;
    fn load(&self, path: &str) -> Result<String>;
}

/// A provider with no modules; every import fails to resolve.
pub struct NoModules;

impl ModuleProvider for NoModules {
    fn resolve(&self, _base: &str, specifier: &str) -> Result<String> {
        anyhow::bail!("unable to resolve module '{specifier}'")
    }

    fn load(&self, path: &str) -> Result<String> {
        anyhow::bail!("unable to load module '{path}'")
    }
}

/// Flattens binding-layer header pairs into the wire map shape
/// (`lower-case name -> comma-joined value`).
pub fn flatten_headers(pairs: &[(String, String)]) -> HashMap<String, String> {
    let mut out: HashMap<String, String> = HashMap::new();
    for (name, value) in pairs {
        let name = name.to_ascii_lowercase();
        match out.get_mut(&name) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => {
                out.insert(name, value.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_joins_repeated_headers() {
        let pairs = vec![
            ("Accept".to_string(), "text/html".to_string()),
            ("accept".to_string(), "application/json".to_string()),
            ("X-One".to_string(), "1".to_string()),
        ];
        let map = flatten_headers(&pairs);
        assert_eq!(map["accept"], "text/html, application/json");
        assert_eq!(map["x-one"], "1");
    }
}
