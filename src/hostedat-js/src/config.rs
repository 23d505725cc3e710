use std::path::PathBuf;

/// Engine limits and sizing. Read-only once the engine is built.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pre-warmed VMs per (site, deploy) pool.
    pub pool_size: usize,
    /// Hard heap cap per isolate, in megabytes.
    pub memory_limit_mb: usize,
    /// Wall-clock budget per request; also the checkout timeout.
    pub execution_timeout_ms: u64,
    /// Outbound `fetch` calls allowed per request.
    pub max_fetch_requests: u32,
    /// Per-fetch timeout ceiling, seconds.
    pub fetch_timeout_sec: u64,
    /// Hard cap on a serialised response body.
    pub max_response_bytes: usize,
    /// Rejection threshold for `compile_and_cache` input.
    pub max_script_size_kb: usize,
    /// Open TCP sockets allowed per request.
    pub max_sockets_per_request: u32,
    /// Per-socket host read buffer cap.
    pub socket_buffer_bytes: usize,
    /// Directory for file-backed D1 databases; in-memory when absent.
    pub d1_data_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            memory_limit_mb: 128,
            execution_timeout_ms: 5_000,
            max_fetch_requests: 50,
            fetch_timeout_sec: 30,
            max_response_bytes: 10 * 1024 * 1024,
            max_script_size_kb: 5 * 1024,
            max_sockets_per_request: 10,
            socket_buffer_bytes: 1024 * 1024,
            d1_data_dir: None,
        }
    }
}

impl EngineConfig {
    pub(crate) fn memory_limit_bytes(&self) -> usize {
        self.memory_limit_mb * 1024 * 1024
    }
}
