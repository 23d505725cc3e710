//! Shared types for hostedat-js.
//!
//! This crate holds everything that crosses the boundary between the
//! host-side engine crate and the isolate-side runtime crate: the wire
//! structs used at the host boundary, and the abstract store traits the
//! bindings are built against. In-memory reference implementations of
//! the stores live here as well so both crates can test against them.

mod stores;
mod wire;
mod ws;

pub mod memory;

pub use stores::{
    AssetsFetcher, CacheEntry, CacheStore, DurableObjectStore, KvEntry, KvListKey, KvListPage,
    KvStore, QueueMessage, QueueSender, R2ListPage, R2Object, R2ObjectMeta, R2Store, StoreError,
};
pub use wire::{LogEntry, LogLevel, WorkerRequest, WorkerResponse, WorkerResult};
pub use ws::{WebSocketHandle, WsClose, WsMessage};

/// Identifies the tenant a worker belongs to.
pub type SiteId = String;

/// Opaque identifier pinning one immutable source version of a worker.
/// Different keys get separate isolate pools.
pub type DeployKey = String;
