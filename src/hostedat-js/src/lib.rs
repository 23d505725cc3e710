//! This crate embeds a JavaScript engine inside a host process to run
//! untrusted Cloudflare-Workers-style scripts: per-deploy isolate
//! pools with bytecode caching, a deadline- and memory-bounded request
//! lifecycle, and the host side of the fetch / TCP / D1 bindings.
#![deny(missing_docs, unused_mut)]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

mod config;
mod d1;
mod engine;
mod error;
mod hostio;
mod metrics;
mod pool;
mod unenv;

/// The engine facade: pools, request lifecycle, execution entry points.
pub use engine::Engine;
/// Provides worker source on demand when a pool instantiates lazily.
pub use engine::SourceLoader;
/// Engine limits and sizing.
pub use config::EngineConfig;
/// The error taxonomy the engine reports.
pub use error::EngineError;
/// The Result alias used throughout the engine.
pub use error::Result;
/// Node-compat polyfill resolution (`HOSTEDAT_UNENV_PATH`).
pub use unenv::{UnenvModules, ENV_UNENV_PATH};
/// The bindings bundle passed per request.
pub use hostedat_js_runtime::env::{CustomBinding, Env};
/// The dispatcher trait service bindings route through.
pub use hostedat_js_runtime::host::{ServiceTarget, WorkerDispatcher};
/// Per-request resource limits (derived from [`EngineConfig`]).
pub use hostedat_js_runtime::state::RequestLimits;
/// Wire types at the host boundary, plus the abstract stores and their
/// in-memory reference implementations.
pub use hostedat_js_common as common;
