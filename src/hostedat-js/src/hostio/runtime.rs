//! Shared Tokio runtime for host-side I/O.
//!
//! One lazily-initialized runtime carries every outbound fetch, TCP
//! driver task and blocking store call, instead of spawning OS threads
//! per operation. Isolate threads never run on it; they only receive
//! completions through their channels.
//!
//! The worker thread count can be set with the `HOSTEDAT_IO_THREADS`
//! environment variable before first use (default 2). If runtime
//! creation fails, the `None` is cached permanently — no retry
//! mechanism, to avoid retry storms.

use std::sync::LazyLock;

use tokio::runtime::Runtime;

/// Environment variable controlling the I/O runtime worker count.
pub(crate) const ENV_IO_THREADS: &str = "HOSTEDAT_IO_THREADS";

const DEFAULT_IO_RUNTIME_WORKERS: usize = 2;

static IO_RUNTIME: LazyLock<Option<Runtime>> = LazyLock::new(|| {
    let workers = std::env::var(ENV_IO_THREADS)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_IO_RUNTIME_WORKERS);

    match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("hostedat-io")
        .enable_time()
        .enable_io()
        .build()
    {
        Ok(rt) => {
            tracing::debug!(workers, "initialized host I/O runtime");
            Some(rt)
        }
        Err(e) => {
            tracing::error!(
                "failed to create the host I/O runtime: {}. Host bindings will be unavailable.",
                e
            );
            None
        }
    }
});

/// The shared I/O runtime, or `None` if creation failed.
pub(crate) fn get_io_runtime() -> Option<&'static Runtime> {
    IO_RUNTIME.as_ref()
}
