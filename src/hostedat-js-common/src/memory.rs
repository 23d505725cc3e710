//! In-memory reference implementations of the abstract stores.
//!
//! These back the test suites of both crates and are usable as a
//! development backend. TTLs are enforced lazily on read against the
//! process wall clock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;

use crate::{
    AssetsFetcher, CacheEntry, CacheStore, DurableObjectStore, KvEntry, KvListKey, KvListPage,
    KvStore, QueueMessage, QueueSender, R2ListPage, R2Object, R2ObjectMeta, R2Store, StoreError,
    WorkerRequest, WorkerResponse,
};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct KvRecord {
    value: Vec<u8>,
    metadata: Option<String>,
    expires_at_ms: Option<u64>,
}

/// KV over a `BTreeMap` so `list` pages in key order and cursors are
/// stable. The cursor is the base64 of the last returned key.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, KvRecord>>,
}

impl MemoryKvStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        let mut entries = self.entries.lock();
        if let Some(rec) = entries.get(key) {
            if rec.expires_at_ms.is_some_and(|t| t <= now_ms()) {
                entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(KvEntry {
                value: rec.value.clone(),
                metadata: rec.metadata.clone(),
            }));
        }
        Ok(None)
    }

    fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        metadata: Option<String>,
        ttl_sec: Option<u64>,
    ) -> Result<(), StoreError> {
        self.entries.lock().insert(
            key.to_string(),
            KvRecord {
                value,
                metadata,
                expires_at_ms: ttl_sec.map(|s| now_ms() + s * 1000),
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn list(
        &self,
        prefix: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<KvListPage, StoreError> {
        let after = match cursor {
            Some(c) => Some(
                String::from_utf8(
                    STANDARD
                        .decode(c)
                        .map_err(|_| StoreError::new("invalid list cursor"))?,
                )
                .map_err(|_| StoreError::new("invalid list cursor"))?,
            ),
            None => None,
        };
        let now = now_ms();
        let entries = self.entries.lock();
        let mut keys = Vec::new();
        let mut more = false;
        for (name, rec) in entries.range(prefix.to_string()..) {
            if !name.starts_with(prefix) {
                break;
            }
            if rec.expires_at_ms.is_some_and(|t| t <= now) {
                continue;
            }
            if after.as_deref().is_some_and(|a| name.as_str() <= a) {
                continue;
            }
            if keys.len() == limit {
                more = true;
                break;
            }
            keys.push(KvListKey {
                name: name.clone(),
                metadata: rec.metadata.clone(),
            });
        }
        let cursor = if more {
            keys.last().map(|k| STANDARD.encode(k.name.as_bytes()))
        } else {
            None
        };
        Ok(KvListPage {
            keys,
            list_complete: !more,
            cursor,
        })
    }
}

#[derive(Default)]
pub struct MemoryCacheStore {
    // cache name -> url -> entry, with per-cache insertion order kept
    // alongside for `keys`.
    caches: Mutex<HashMap<String, (Vec<String>, HashMap<String, CacheEntry>)>>,
    opened: Mutex<Vec<String>>,
}

impl MemoryCacheStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl CacheStore for MemoryCacheStore {
    fn match_entry(&self, cache_name: &str, url: &str) -> Result<Option<CacheEntry>, StoreError> {
        let caches = self.caches.lock();
        let Some((_, by_url)) = caches.get(cache_name) else {
            return Ok(None);
        };
        match by_url.get(url) {
            Some(e) if e.expires_at_ms.is_some_and(|t| t <= now_ms()) => Ok(None),
            Some(e) => Ok(Some(e.clone())),
            None => Ok(None),
        }
    }

    fn put(
        &self,
        cache_name: &str,
        url: &str,
        status: u16,
        headers_json: &str,
        body: Vec<u8>,
        ttl_sec: Option<u64>,
    ) -> Result<(), StoreError> {
        let mut opened = self.opened.lock();
        if !opened.iter().any(|n| n == cache_name) {
            opened.push(cache_name.to_string());
        }
        let mut caches = self.caches.lock();
        let (order, by_url) = caches.entry(cache_name.to_string()).or_default();
        if !by_url.contains_key(url) {
            order.push(url.to_string());
        }
        by_url.insert(
            url.to_string(),
            CacheEntry {
                status,
                headers_json: headers_json.to_string(),
                body,
                expires_at_ms: ttl_sec.map(|s| now_ms() + s * 1000),
            },
        );
        Ok(())
    }

    fn delete(&self, cache_name: &str, url: &str) -> Result<bool, StoreError> {
        let mut caches = self.caches.lock();
        let Some((order, by_url)) = caches.get_mut(cache_name) else {
            return Ok(false);
        };
        order.retain(|u| u != url);
        Ok(by_url.remove(url).is_some())
    }

    fn keys(&self, cache_name: &str) -> Result<Vec<String>, StoreError> {
        let caches = self.caches.lock();
        Ok(caches
            .get(cache_name)
            .map(|(order, _)| order.clone())
            .unwrap_or_default())
    }

    fn cache_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.opened.lock().clone())
    }
}

#[derive(Default)]
pub struct MemoryR2Store {
    objects: Mutex<BTreeMap<String, R2Object>>,
    /// Base URL for `public_url`, e.g. `https://pub.example.com`.
    pub public_base: Option<String>,
}

impl MemoryR2Store {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl R2Store for MemoryR2Store {
    fn get(&self, key: &str) -> Result<Option<R2Object>, StoreError> {
        Ok(self.objects.lock().get(key).cloned())
    }

    fn head(&self, key: &str) -> Result<Option<R2ObjectMeta>, StoreError> {
        Ok(self.objects.lock().get(key).map(|o| o.meta.clone()))
    }

    fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        http_metadata: HashMap<String, String>,
        custom_metadata: HashMap<String, String>,
    ) -> Result<R2ObjectMeta, StoreError> {
        let mut hasher = Md5ish::new();
        hasher.update(&body);
        let meta = R2ObjectMeta {
            key: key.to_string(),
            size: body.len() as u64,
            etag: hasher.finish(),
            uploaded_ms: now_ms(),
            http_metadata,
            custom_metadata,
        };
        self.objects.lock().insert(
            key.to_string(),
            R2Object {
                meta: meta.clone(),
                body,
            },
        );
        Ok(meta)
    }

    fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut objects = self.objects.lock();
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<R2ListPage, StoreError> {
        let after = match cursor {
            Some(c) => Some(
                String::from_utf8(
                    STANDARD
                        .decode(c)
                        .map_err(|_| StoreError::new("invalid list cursor"))?,
                )
                .map_err(|_| StoreError::new("invalid list cursor"))?,
            ),
            None => None,
        };
        let objects = self.objects.lock();
        let mut page = R2ListPage::default();
        for (key, obj) in objects.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if after.as_deref().is_some_and(|a| key.as_str() <= a) {
                continue;
            }
            if let Some(delim) = delimiter {
                if let Some(pos) = key[prefix.len()..].find(delim) {
                    let group = key[..prefix.len() + pos + delim.len()].to_string();
                    if !page.delimited_prefixes.contains(&group) {
                        page.delimited_prefixes.push(group);
                    }
                    continue;
                }
            }
            if page.objects.len() == limit {
                page.truncated = true;
                page.cursor = page
                    .objects
                    .last()
                    .map(|o| STANDARD.encode(o.key.as_bytes()));
                break;
            }
            page.objects.push(obj.meta.clone());
        }
        Ok(page)
    }

    fn presigned_get_url(&self, key: &str, expires_sec: u64) -> Result<String, StoreError> {
        Ok(format!(
            "https://r2.invalid/{key}?expires={expires_sec}&sig=memory"
        ))
    }

    fn public_url(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .public_base
            .as_ref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), key)))
    }
}

/// Cheap stand-in etag hash; not cryptographic, just stable.
struct Md5ish(u64);

impl Md5ish {
    fn new() -> Self {
        Self(0xcbf29ce484222325)
    }
    fn update(&mut self, data: &[u8]) {
        for b in data {
            self.0 ^= u64::from(*b);
            self.0 = self.0.wrapping_mul(0x100000001b3);
        }
    }
    fn finish(&self) -> String {
        format!("{:016x}", self.0)
    }
}

#[derive(Default)]
pub struct MemoryDurableObjectStore {
    // (namespace, id) -> ordered key/value map
    data: Mutex<HashMap<(String, String), BTreeMap<String, String>>>,
}

impl MemoryDurableObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl DurableObjectStore for MemoryDurableObjectStore {
    fn get(&self, namespace: &str, id: &str, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .data
            .lock()
            .get(&(namespace.to_string(), id.to_string()))
            .and_then(|m| m.get(key).cloned()))
    }

    fn get_multi(
        &self,
        namespace: &str,
        id: &str,
        keys: &[String],
    ) -> Result<HashMap<String, String>, StoreError> {
        let data = self.data.lock();
        let mut out = HashMap::new();
        if let Some(m) = data.get(&(namespace.to_string(), id.to_string())) {
            for key in keys {
                if let Some(v) = m.get(key) {
                    out.insert(key.clone(), v.clone());
                }
            }
        }
        Ok(out)
    }

    fn put(&self, namespace: &str, id: &str, key: &str, value: String) -> Result<(), StoreError> {
        self.data
            .lock()
            .entry((namespace.to_string(), id.to_string()))
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn put_multi(
        &self,
        namespace: &str,
        id: &str,
        entries: HashMap<String, String>,
    ) -> Result<(), StoreError> {
        self.data
            .lock()
            .entry((namespace.to_string(), id.to_string()))
            .or_default()
            .extend(entries);
        Ok(())
    }

    fn delete(&self, namespace: &str, id: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .data
            .lock()
            .get_mut(&(namespace.to_string(), id.to_string()))
            .is_some_and(|m| m.remove(key).is_some()))
    }

    fn delete_multi(
        &self,
        namespace: &str,
        id: &str,
        keys: &[String],
    ) -> Result<u64, StoreError> {
        let mut data = self.data.lock();
        let Some(m) = data.get_mut(&(namespace.to_string(), id.to_string())) else {
            return Ok(0);
        };
        Ok(keys.iter().filter(|k| m.remove(*k).is_some()).count() as u64)
    }

    fn delete_all(&self, namespace: &str, id: &str) -> Result<(), StoreError> {
        self.data
            .lock()
            .remove(&(namespace.to_string(), id.to_string()));
        Ok(())
    }

    fn list(
        &self,
        namespace: &str,
        id: &str,
        prefix: &str,
        limit: usize,
        reverse: bool,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let data = self.data.lock();
        let Some(m) = data.get(&(namespace.to_string(), id.to_string())) else {
            return Ok(Vec::new());
        };
        let matching = m
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()));
        let out: Vec<_> = if reverse {
            matching.rev().take(limit).collect()
        } else {
            matching.take(limit).collect()
        };
        Ok(out)
    }
}

/// Collects sent messages for assertions.
#[derive(Default)]
pub struct MemoryQueue {
    pub messages: Mutex<Vec<QueueMessage>>,
}

impl MemoryQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl QueueSender for MemoryQueue {
    fn send(&self, message: QueueMessage) -> Result<(), StoreError> {
        self.messages.lock().push(message);
        Ok(())
    }

    fn send_batch(&self, messages: Vec<QueueMessage>) -> Result<(), StoreError> {
        self.messages.lock().extend(messages);
        Ok(())
    }
}

/// Serves a fixed path -> (content-type, bytes) map.
#[derive(Default)]
pub struct MemoryAssets {
    pub files: HashMap<String, (String, Vec<u8>)>,
}

impl AssetsFetcher for MemoryAssets {
    fn fetch(&self, req: WorkerRequest) -> Result<WorkerResponse, StoreError> {
        let path = req
            .url
            .split_once("://")
            .and_then(|(_, rest)| rest.split_once('/'))
            .map(|(_, p)| format!("/{p}"))
            .unwrap_or_else(|| "/".to_string());
        let path = path.split(['?', '#']).next().unwrap_or("/").to_string();
        match self.files.get(&path) {
            Some((content_type, bytes)) => Ok(WorkerResponse {
                status_code: 200,
                headers: HashMap::from([("content-type".into(), content_type.clone())]),
                body: bytes.clone(),
                has_web_socket: false,
            }),
            None => Ok(WorkerResponse {
                status_code: 404,
                headers: HashMap::new(),
                body: b"not found".to_vec(),
                has_web_socket: false,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_list_pages_each_key_exactly_once() {
        let kv = MemoryKvStore::new();
        for i in 0..10 {
            kv.put(&format!("key{i:02}"), b"v".to_vec(), None, None)
                .unwrap();
        }
        kv.put("other", b"v".to_vec(), None, None).unwrap();

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = kv.list("key", 3, cursor.as_deref()).unwrap();
            seen.extend(page.keys.iter().map(|k| k.name.clone()));
            if page.list_complete {
                assert!(page.cursor.is_none());
                break;
            }
            cursor = page.cursor;
            assert!(cursor.is_some());
        }
        let expected: Vec<_> = (0..10).map(|i| format!("key{i:02}")).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn kv_metadata_survives_round_trip() {
        let kv = MemoryKvStore::new();
        kv.put("k", b"v".to_vec(), Some(r#"{"tag":"test"}"#.into()), None)
            .unwrap();
        let entry = kv.get("k").unwrap().unwrap();
        assert_eq!(entry.metadata.as_deref(), Some(r#"{"tag":"test"}"#));
        let page = kv.list("k", 10, None).unwrap();
        assert_eq!(page.keys[0].metadata.as_deref(), Some(r#"{"tag":"test"}"#));
    }

    #[test]
    fn cache_expired_entries_are_filtered() {
        let cache = MemoryCacheStore::new();
        cache
            .put("default", "http://a/", 200, "{}", b"x".to_vec(), Some(0))
            .unwrap();
        // ttl 0 expires immediately
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(cache.match_entry("default", "http://a/").unwrap().is_none());
    }

    #[test]
    fn r2_list_delimiter_groups_prefixes() {
        let r2 = MemoryR2Store::new();
        for key in ["a/1", "a/2", "b/1", "top"] {
            r2.put(key, b"x".to_vec(), HashMap::new(), HashMap::new())
                .unwrap();
        }
        let page = r2.list("", Some("/"), None, 10).unwrap();
        assert_eq!(page.delimited_prefixes, vec!["a/", "b/"]);
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].key, "top");
    }

    #[test]
    fn durable_object_list_reverse() {
        let store = MemoryDurableObjectStore::new();
        for k in ["a", "b", "c"] {
            store.put("ns", "id", k, k.to_uppercase()).unwrap();
        }
        let forward = store.list("ns", "id", "", 10, false).unwrap();
        assert_eq!(forward[0].0, "a");
        let reverse = store.list("ns", "id", "", 2, true).unwrap();
        assert_eq!(reverse[0].0, "c");
        assert_eq!(reverse.len(), 2);
    }
}
