use thiserror::Error;

/// Everything the engine can report to its caller. One variant per
/// failure class; binding-level failures never reach this type — they
/// surface inside the VM as rejected promises instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Source failed to parse or compile. Never poisons a pool.
    #[error("compile error: {0}")]
    Compile(String),

    /// An isolate failed to bootstrap; the whole pool is failed until
    /// the host invalidates and recompiles.
    #[error("pool bootstrap failed: {0}")]
    PoolBootstrap(String),

    /// No isolate became available before the checkout deadline.
    #[error("pool exhausted: no isolate became available within {0}ms")]
    PoolExhausted(u64),

    /// The watchdog fired.
    #[error("execution timed out after {0}ms")]
    ExecutionTimeout(u64),

    /// The isolate hit its heap cap; it is poisoned and discarded.
    #[error("memory limit exceeded")]
    MemoryLimit,

    /// The handler threw (or returned a rejected promise).
    #[error("{0}")]
    JsException(String),

    /// The serialised response body is over the configured cap.
    #[error("response exceeds the configured limit of {0} bytes")]
    ResponseTooLarge(usize),

    #[error("engine is shut down")]
    ShutDown,

    #[error("{0}")]
    Internal(String),
}

/// The Result alias used across the engine crate.
pub type Result<T> = std::result::Result<T, EngineError>;
