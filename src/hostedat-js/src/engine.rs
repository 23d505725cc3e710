//! The engine facade: pools, request lifecycle and the public
//! execution entry points. Every method is safe for concurrent
//! invocation; no two concurrent requests ever share an isolate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hostedat_js_common::{WorkerRequest, WorkerResponse, WorkerResult};
use hostedat_js_runtime::env::Env;
use hostedat_js_runtime::host::{flatten_headers, ModuleProvider, WorkerDispatcher};
use hostedat_js_runtime::state::{RequestLimits, RequestState};
use hostedat_js_runtime::{Isolate, ResponseOut};
use sha2::{Digest, Sha256};
use tracing::{instrument, Level};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::hostio::HostIo;
use crate::metrics::{record_watchdog_fired, METRIC_COMPILES, METRIC_REQUESTS};
use crate::pool::{CompiledModule, Pool, PoolRegistry};
use crate::unenv::UnenvModules;

/// Provides worker source on demand. Called lazily the first time a
/// pool is instantiated for a deploy that was never compiled
/// explicitly.
pub trait SourceLoader: Send + Sync {
    /// Returns the bundled, self-contained script for a deploy.
    fn get_worker_script(
        &self,
        site_id: &str,
        deploy_key: &str,
    ) -> std::result::Result<String, String>;
}

/// The embedding runtime: per-deploy isolate pools plus the request
/// lifecycle around them.
pub struct Engine {
    config: EngineConfig,
    registry: PoolRegistry,
    source_loader: Arc<dyn SourceLoader>,
    host: Arc<HostIo>,
    modules: Arc<dyn ModuleProvider>,
    shut_down: AtomicBool,
}

impl Engine {
    /// Builds an engine around a source loader with the given limits.
    pub fn new(config: EngineConfig, source_loader: Arc<dyn SourceLoader>) -> Self {
        let host = HostIo::new(
            config.max_response_bytes,
            config.socket_buffer_bytes,
            config.d1_data_dir.clone(),
        );
        Self {
            config,
            registry: PoolRegistry::default(),
            source_loader,
            host,
            modules: Arc::new(UnenvModules::from_env()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Installs the dispatcher service bindings route through.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn WorkerDispatcher>) {
        self.host.set_dispatcher(dispatcher);
    }

    /// The configured hard cap on serialised response bodies.
    pub fn max_response_bytes(&self) -> usize {
        self.config.max_response_bytes
    }

    /// Runs the `fetch` export for one inbound request.
    #[instrument(skip(self, env, request), level = Level::INFO)]
    pub fn execute(
        &self,
        site_id: &str,
        deploy_key: &str,
        env: Env,
        request: WorkerRequest,
    ) -> WorkerResult {
        self.run(site_id, deploy_key, env, |isolate| {
            let out = isolate.run_fetch(&request)?;
            Ok(Some(out))
        })
    }

    /// Invokes the `scheduled` export with the firing cron expression.
    #[instrument(skip(self, env), level = Level::INFO)]
    pub fn execute_scheduled(
        &self,
        site_id: &str,
        deploy_key: &str,
        env: Env,
        cron_expr: &str,
    ) -> WorkerResult {
        self.run(site_id, deploy_key, env, |isolate| {
            isolate.run_scheduled(cron_expr)?;
            Ok(None)
        })
    }

    /// Invokes the `tail` export with a batch of trace events.
    #[instrument(skip(self, env, events), level = Level::INFO)]
    pub fn execute_tail(
        &self,
        site_id: &str,
        deploy_key: &str,
        env: Env,
        events: serde_json::Value,
    ) -> WorkerResult {
        self.run(site_id, deploy_key, env, |isolate| {
            isolate.run_tail(&events)?;
            Ok(None)
        })
    }

    /// Invokes an arbitrary named export with JSON-serialisable
    /// arguments; the result lands in `WorkerResult::data`.
    #[instrument(skip(self, env, args), level = Level::INFO)]
    pub fn execute_function(
        &self,
        site_id: &str,
        deploy_key: &str,
        env: Env,
        name: &str,
        args: &[serde_json::Value],
    ) -> WorkerResult {
        let mut data = None;
        let mut result = self.run(site_id, deploy_key, env, |isolate| {
            data = Some(isolate.run_function(name, args)?);
            Ok(None)
        });
        result.data = data;
        result
    }

    /// Compiles a deploy's source to bytecode and caches it for the
    /// pools that follow. Compile failures never poison anything.
    #[instrument(skip(self, source), level = Level::INFO)]
    pub fn compile_and_cache(
        &self,
        site_id: &str,
        deploy_key: &str,
        source: &str,
    ) -> Result<Vec<u8>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(EngineError::ShutDown);
        }
        let module = self.compile_module(source)?;
        let bytecode = module.bytecode.as_ref().clone();
        self.registry.store_compiled(site_id, deploy_key, module);
        metrics::counter!(METRIC_COMPILES).increment(1);
        Ok(bytecode)
    }

    /// Tombstones the deploy's pool and drops its cached bytecode.
    /// Outstanding requests run to completion on their isolates, which
    /// are discarded on return.
    #[instrument(skip(self), level = Level::INFO)]
    pub fn invalidate_pool(&self, site_id: &str, deploy_key: &str) {
        self.registry.invalidate(site_id, deploy_key);
    }

    /// Stops accepting work and tombstones every pool.
    #[instrument(skip(self), level = Level::INFO)]
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.registry.clear();
    }

    // -- internals ---------------------------------------------------------

    /// The shared request lifecycle: resolve pool, check out an
    /// isolate, install request state, run, drain `waitUntil`, tear
    /// down, return the isolate, and assemble the result.
    fn run(
        &self,
        site_id: &str,
        deploy_key: &str,
        env: Env,
        body: impl FnOnce(&mut Isolate) -> anyhow::Result<Option<ResponseOut>>,
    ) -> WorkerResult {
        let started = Instant::now();
        metrics::counter!(METRIC_REQUESTS).increment(1);

        let mut result = WorkerResult::default();

        let (pool, mut isolate) = match self.checkout(site_id, deploy_key) {
            Ok(pair) => pair,
            Err(e) => {
                result.error = Some(e.to_string());
                result.duration = started.elapsed();
                return result;
            }
        };

        let deadline = Instant::now() + Duration::from_millis(self.config.execution_timeout_ms);
        let limits = RequestLimits {
            max_fetch: self.config.max_fetch_requests,
            max_response_bytes: self.config.max_response_bytes,
            fetch_timeout_ms: self.config.fetch_timeout_sec * 1000,
            max_sockets: self.config.max_sockets_per_request,
            socket_buffer_bytes: self.config.socket_buffer_bytes,
        };
        isolate.begin_request(RequestState::new(site_id, deploy_key, env, deadline, limits));

        let outcome = body(&mut isolate);
        if outcome.is_ok() {
            isolate.drain_wait_until();
        }
        let state = isolate.end_request();
        pool.restore(isolate);

        match outcome {
            Ok(Some(out)) => {
                result.response = Some(WorkerResponse {
                    status_code: out.status,
                    headers: flatten_headers(&out.headers),
                    body: out.body,
                    has_web_socket: out.has_web_socket,
                });
            }
            Ok(None) => {}
            Err(e) => {
                result.error = Some(self.classify(e).to_string());
            }
        }
        if let Some(state) = state {
            result.logs = state.logs;
            result.web_socket = state.web_socket;
        }
        result.duration = started.elapsed();
        result
    }

    fn checkout(&self, site_id: &str, deploy_key: &str) -> Result<(Arc<Pool>, Isolate)> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(EngineError::ShutDown);
        }
        let pool = self.resolve_pool(site_id, deploy_key)?;
        let isolate = pool.checkout(Duration::from_millis(self.config.execution_timeout_ms))?;
        Ok((pool, isolate))
    }

    /// Finds the live pool for a deploy, creating one (compiling the
    /// source if it was never cached) when needed. Compilation runs
    /// outside the registry locks.
    fn resolve_pool(&self, site_id: &str, deploy_key: &str) -> Result<Arc<Pool>> {
        if let Some(pool) = self.registry.live_pool(site_id, deploy_key) {
            return Ok(pool);
        }

        let module = match self.registry.compiled(site_id, deploy_key) {
            Some(module) => module,
            None => {
                let source = self
                    .source_loader
                    .get_worker_script(site_id, deploy_key)
                    .map_err(EngineError::Compile)?;
                let module = self.compile_module(&source)?;
                self.registry
                    .store_compiled(site_id, deploy_key, module.clone());
                module
            }
        };

        let pool = Pool::new(
            module,
            self.config.pool_size,
            self.config.memory_limit_bytes(),
            self.host.clone(),
            self.modules.clone(),
            self.registry.next_generation(),
        );
        Ok(self.registry.install_pool(site_id, deploy_key, pool))
    }

    fn compile_module(&self, source: &str) -> Result<CompiledModule> {
        if source.len() > self.config.max_script_size_kb * 1024 {
            return Err(EngineError::Compile(format!(
                "script of {} bytes exceeds the {}KB limit",
                source.len(),
                self.config.max_script_size_kb
            )));
        }
        // a scratch isolate compiles; the bytecode is engine-portable
        // across every isolate built with the same configuration
        let scratch = Isolate::new(
            self.host.clone(),
            self.modules.clone(),
            self.config.memory_limit_bytes(),
        )
        .map_err(|e| EngineError::Internal(format!("scratch isolate failed: {e}")))?;
        let bytecode = scratch
            .compile("worker.mjs", source)
            .map_err(|e| EngineError::Compile(e.to_string()))?;

        let fingerprint = hex_digest(source);
        Ok(CompiledModule {
            bytecode: Arc::new(bytecode),
            fingerprint,
        })
    }

    /// Maps a runtime failure onto the engine error taxonomy.
    fn classify(&self, e: anyhow::Error) -> EngineError {
        let message = e.to_string();
        let chain = format!("{e:#}");
        // the deadline surfaces either as the loop noticing the cutoff
        // or as the engine interrupt unwinding running JS
        if chain.contains("execution deadline exceeded") || chain.contains("interrupted") {
            record_watchdog_fired();
            return EngineError::ExecutionTimeout(self.config.execution_timeout_ms);
        }
        if chain.contains("memory limit exceeded") {
            return EngineError::MemoryLimit;
        }
        if chain.contains("size limit") {
            return EngineError::ResponseTooLarge(self.config.max_response_bytes);
        }
        EngineError::JsException(message)
    }
}

fn hex_digest(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}
