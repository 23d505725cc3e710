//! Abstract stores the engine binds workers against.
//!
//! The engine core never talks to a concrete backend; it only sees
//! these traits. Implementations are expected to be internally
//! thread-safe — binding callbacks invoke them from I/O worker threads.

use std::collections::HashMap;

use crate::{WorkerRequest, WorkerResponse};

/// Error produced by a store backend. Surfaced to JS as a rejected
/// Promise with the message intact; never poisons an isolate.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

/// A value read from KV together with its stored metadata.
///
/// Metadata is kept as the raw string it was written with. The binding
/// layer applies the round-trip rule: valid JSON is exposed to JS as
/// the parsed value, anything else as the original string.
#[derive(Debug, Clone)]
pub struct KvEntry {
    pub value: Vec<u8>,
    pub metadata: Option<String>,
}

/// One key in a KV list page.
#[derive(Debug, Clone)]
pub struct KvListKey {
    pub name: String,
    pub metadata: Option<String>,
}

/// A page of KV keys. `cursor` is opaque base64 and must round-trip
/// unchanged into the next `list` call.
#[derive(Debug, Clone)]
pub struct KvListPage {
    pub keys: Vec<KvListKey>,
    pub list_complete: bool,
    pub cursor: Option<String>,
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError>;
    fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        metadata: Option<String>,
        ttl_sec: Option<u64>,
    ) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    fn list(
        &self,
        prefix: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<KvListPage, StoreError>;
}

/// A cached response entry. `expires_at_ms` is absolute wall-clock
/// milliseconds; `None` means no expiry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: u16,
    pub headers_json: String,
    pub body: Vec<u8>,
    pub expires_at_ms: Option<u64>,
}

pub trait CacheStore: Send + Sync {
    fn match_entry(&self, cache_name: &str, url: &str) -> Result<Option<CacheEntry>, StoreError>;
    fn put(
        &self,
        cache_name: &str,
        url: &str,
        status: u16,
        headers_json: &str,
        body: Vec<u8>,
        ttl_sec: Option<u64>,
    ) -> Result<(), StoreError>;
    fn delete(&self, cache_name: &str, url: &str) -> Result<bool, StoreError>;
    /// URLs currently stored under `cache_name`, insertion order.
    fn keys(&self, cache_name: &str) -> Result<Vec<String>, StoreError>;
    /// Names of the caches that have ever been opened.
    fn cache_names(&self) -> Result<Vec<String>, StoreError>;
}

/// Metadata of one stored object.
#[derive(Debug, Clone)]
pub struct R2ObjectMeta {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub uploaded_ms: u64,
    pub http_metadata: HashMap<String, String>,
    pub custom_metadata: HashMap<String, String>,
}

/// Object metadata plus body, as returned by `get`.
#[derive(Debug, Clone)]
pub struct R2Object {
    pub meta: R2ObjectMeta,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct R2ListPage {
    pub objects: Vec<R2ObjectMeta>,
    pub truncated: bool,
    pub cursor: Option<String>,
    pub delimited_prefixes: Vec<String>,
}

pub trait R2Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<R2Object>, StoreError>;
    fn head(&self, key: &str) -> Result<Option<R2ObjectMeta>, StoreError>;
    fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        http_metadata: HashMap<String, String>,
        custom_metadata: HashMap<String, String>,
    ) -> Result<R2ObjectMeta, StoreError>;
    fn delete(&self, keys: &[String]) -> Result<(), StoreError>;
    fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<R2ListPage, StoreError>;
    fn presigned_get_url(&self, key: &str, expires_sec: u64) -> Result<String, StoreError>;
    fn public_url(&self, key: &str) -> Result<Option<String>, StoreError>;
}

pub trait DurableObjectStore: Send + Sync {
    fn get(&self, namespace: &str, id: &str, key: &str) -> Result<Option<String>, StoreError>;
    fn get_multi(
        &self,
        namespace: &str,
        id: &str,
        keys: &[String],
    ) -> Result<HashMap<String, String>, StoreError>;
    fn put(&self, namespace: &str, id: &str, key: &str, value: String) -> Result<(), StoreError>;
    fn put_multi(
        &self,
        namespace: &str,
        id: &str,
        entries: HashMap<String, String>,
    ) -> Result<(), StoreError>;
    fn delete(&self, namespace: &str, id: &str, key: &str) -> Result<bool, StoreError>;
    fn delete_multi(&self, namespace: &str, id: &str, keys: &[String])
        -> Result<u64, StoreError>;
    fn delete_all(&self, namespace: &str, id: &str) -> Result<(), StoreError>;
    fn list(
        &self,
        namespace: &str,
        id: &str,
        prefix: &str,
        limit: usize,
        reverse: bool,
    ) -> Result<Vec<(String, String)>, StoreError>;
}

/// A message handed to a queue producer binding.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub body: Vec<u8>,
    pub content_type: String,
}

pub trait QueueSender: Send + Sync {
    fn send(&self, message: QueueMessage) -> Result<(), StoreError>;
    fn send_batch(&self, messages: Vec<QueueMessage>) -> Result<(), StoreError>;
}

/// Serves static assets for `env.ASSETS.fetch(req)`.
pub trait AssetsFetcher: Send + Sync {
    fn fetch(&self, req: WorkerRequest) -> Result<WorkerResponse, StoreError>;
}
