//! The per-request `env` object.
//!
//! The host hands the engine an [`Env`] bundle of vars, secrets and
//! store handles; this module turns it into the JS object the handler
//! receives. Every binding closure captures its store `Arc` and the
//! isolate core directly, so no request id ever crosses the VM
//! boundary. Store calls run on the host blocking pool and resolve
//! through the op queue.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hostedat_js_common::{
    AssetsFetcher, CacheStore, DurableObjectStore, KvStore, QueueMessage, QueueSender, R2Store,
    WorkerRequest,
};
use rquickjs::{Class, Ctx, Exception, FromJs, Object, Result, Value};

use crate::core::{blocking_op, SharedCore};
use crate::host::{flatten_headers, D1Database, ServiceTarget};
use crate::web::request::Request;
use crate::web::response::Response;
use crate::web::streams::new_readable_from_bytes;
use crate::web::support::{self, arg, as_bytes, map_promise, native_fn, undef};

/// An opaque host-supplied binding factory: receives the VM context,
/// returns the value installed at `env[name]`.
pub type CustomBinding =
    Arc<dyn for<'js> Fn(&Ctx<'js>) -> Result<Value<'js>> + Send + Sync>;

/// The bindings bundle the host passes per request.
#[derive(Clone, Default)]
pub struct Env {
    pub vars: HashMap<String, String>,
    pub secrets: HashMap<String, String>,
    pub kv: HashMap<String, Arc<dyn KvStore>>,
    pub storage: HashMap<String, Arc<dyn R2Store>>,
    pub queues: HashMap<String, Arc<dyn QueueSender>>,
    pub durable_objects: HashMap<String, Arc<dyn DurableObjectStore>>,
    /// binding name -> database id, opened through the host's D1 dir.
    pub d1_bindings: HashMap<String, String>,
    pub service_bindings: HashMap<String, ServiceTarget>,
    pub assets: Option<Arc<dyn AssetsFetcher>>,
    pub cache: Option<Arc<dyn CacheStore>>,
    pub custom: HashMap<String, CustomBinding>,
}

/// JSON metadata round-trip rule: a valid JSON string is exposed as
/// the parsed value, anything else as the original string.
fn metadata_json(meta: Option<String>) -> serde_json::Value {
    match meta {
        None => serde_json::Value::Null,
        Some(s) => serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s)),
    }
}

/// Builds the `env` object for the active request.
pub(crate) fn build_env_object<'js>(ctx: &Ctx<'js>, core: &SharedCore) -> Result<Object<'js>> {
    let env = core.borrow().request().map_err(|e| {
        Exception::throw_internal(ctx, &format!("env requested outside a request: {e}"))
    })?.env.clone();

    let object = Object::new(ctx.clone())?;

    for (name, value) in &env.vars {
        object.set(name.as_str(), value.as_str())?;
    }
    for (name, value) in &env.secrets {
        object.set(name.as_str(), value.as_str())?;
    }
    for (name, store) in &env.kv {
        object.set(name.as_str(), kv_binding(ctx, core, store.clone())?)?;
    }
    for (name, store) in &env.storage {
        object.set(name.as_str(), r2_binding(ctx, core, store.clone())?)?;
    }
    for (name, queue) in &env.queues {
        object.set(name.as_str(), queue_binding(ctx, core, queue.clone())?)?;
    }
    for (name, store) in &env.durable_objects {
        object.set(
            name.as_str(),
            durable_object_binding(ctx, core, name.clone(), store.clone())?,
        )?;
    }
    for (name, database_id) in &env.d1_bindings {
        object.set(name.as_str(), d1_binding(ctx, core, database_id.clone())?)?;
    }
    for (name, target) in &env.service_bindings {
        object.set(name.as_str(), service_binding(ctx, core, target.clone())?)?;
    }
    if let Some(assets) = &env.assets {
        object.set("ASSETS", assets_binding(ctx, core, assets.clone())?)?;
    }
    for (name, factory) in &env.custom {
        object.set(name.as_str(), factory(ctx)?)?;
    }

    Ok(object)
}

// ---------------------------------------------------------------------------
// KV
// ---------------------------------------------------------------------------

fn kv_binding<'js>(
    ctx: &Ctx<'js>,
    core: &SharedCore,
    store: Arc<dyn KvStore>,
) -> Result<Object<'js>> {
    let binding = Object::new(ctx.clone())?;

    // get(key, type?) — "text" (default), "json", "arrayBuffer"
    let get_core = core.clone();
    let get_store = store.clone();
    binding.set(
        "get",
        native_fn(ctx, move |ctx, args| {
            let key: String = FromJs::from_js(&ctx, arg(&ctx, &args, 0))?;
            let kind = parse_kv_type(&ctx, args.0.get(1))?;
            let store = get_store.clone();
            let raw = blocking_op(&ctx, &get_core, move || {
                match store.get(&key).map_err(|e| e.to_string())? {
                    None => Ok(serde_json::json!({ "found": false })),
                    Some(entry) => Ok(serde_json::json!({
                        "found": true,
                        "value": STANDARD.encode(&entry.value),
                    })),
                }
            })?;
            Ok(map_promise(&ctx, raw.into_value(), move |ctx, payload| {
                kv_value_from_payload(&ctx, &payload, kind)
            })?
            .into_value())
        })?
        .with_name("get")?,
    )?;

    // getWithMetadata(key, type?)
    let gwm_core = core.clone();
    let gwm_store = store.clone();
    binding.set(
        "getWithMetadata",
        native_fn(ctx, move |ctx, args| {
            let key: String = FromJs::from_js(&ctx, arg(&ctx, &args, 0))?;
            let kind = parse_kv_type(&ctx, args.0.get(1))?;
            let store = gwm_store.clone();
            let raw = blocking_op(&ctx, &gwm_core, move || {
                match store.get(&key).map_err(|e| e.to_string())? {
                    None => Ok(serde_json::json!({ "found": false })),
                    Some(entry) => Ok(serde_json::json!({
                        "found": true,
                        "value": STANDARD.encode(&entry.value),
                        "metadata": metadata_json(entry.metadata),
                    })),
                }
            })?;
            Ok(map_promise(&ctx, raw.into_value(), move |ctx, payload| {
                let value = kv_value_from_payload(&ctx, &payload, kind)?;
                let result = Object::new(ctx.clone())?;
                result.set("value", value)?;
                let metadata: Value = payload
                    .as_object()
                    .and_then(|o| o.get("metadata").ok())
                    .unwrap_or_else(|| Value::new_null(ctx.clone()));
                result.set("metadata", metadata)?;
                Ok(result.into_value())
            })?
            .into_value())
        })?
        .with_name("getWithMetadata")?,
    )?;

    // put(key, value, options? {metadata, expirationTtl})
    let put_core = core.clone();
    let put_store = store.clone();
    binding.set(
        "put",
        native_fn(ctx, move |ctx, args| {
            let key: String = FromJs::from_js(&ctx, arg(&ctx, &args, 0))?;
            let value = as_bytes(&arg(&ctx, &args, 1))?;
            let options = args.0.get(2).and_then(|v| v.as_object().cloned());
            let metadata = match options.as_ref().and_then(|o| o.get::<_, Value>("metadata").ok())
            {
                Some(v) if !v.is_undefined() && !v.is_null() => ctx
                    .json_stringify(v)?
                    .map(|s| s.to_string())
                    .transpose()?,
                _ => None,
            };
            let ttl = options
                .and_then(|o| o.get::<_, f64>("expirationTtl").ok())
                .map(|t| t.max(0.0) as u64);
            let store = put_store.clone();
            Ok(blocking_op(&ctx, &put_core, move || {
                store
                    .put(&key, value, metadata, ttl)
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::Value::Null)
            })?
            .into_value())
        })?
        .with_name("put")?,
    )?;

    // delete(key)
    let delete_core = core.clone();
    let delete_store = store.clone();
    binding.set(
        "delete",
        native_fn(ctx, move |ctx, args| {
            let key: String = FromJs::from_js(&ctx, arg(&ctx, &args, 0))?;
            let store = delete_store.clone();
            Ok(blocking_op(&ctx, &delete_core, move || {
                store.delete(&key).map_err(|e| e.to_string())?;
                Ok(serde_json::Value::Null)
            })?
            .into_value())
        })?
        .with_name("delete")?,
    )?;

    // list({prefix, limit, cursor})
    let list_core = core.clone();
    binding.set(
        "list",
        native_fn(ctx, move |ctx, args| {
            let options = args.0.first().and_then(|v| v.as_object().cloned());
            let prefix: String = options
                .as_ref()
                .and_then(|o| o.get("prefix").ok())
                .unwrap_or_default();
            let limit: usize = options
                .as_ref()
                .and_then(|o| o.get::<_, f64>("limit").ok())
                .map(|l| l.max(1.0) as usize)
                .unwrap_or(1000);
            let cursor: Option<String> = options.and_then(|o| o.get("cursor").ok());
            let store = store.clone();
            let raw = blocking_op(&ctx, &list_core, move || {
                let page = store
                    .list(&prefix, limit, cursor.as_deref())
                    .map_err(|e| e.to_string())?;
                let keys: Vec<serde_json::Value> = page
                    .keys
                    .into_iter()
                    .map(|k| {
                        let mut entry = serde_json::json!({ "name": k.name });
                        let metadata = metadata_json(k.metadata);
                        if !metadata.is_null() {
                            entry["metadata"] = metadata;
                        }
                        entry
                    })
                    .collect();
                let mut out = serde_json::json!({
                    "keys": keys,
                    "listComplete": page.list_complete,
                });
                if let Some(cursor) = page.cursor {
                    out["cursor"] = serde_json::Value::String(cursor);
                }
                Ok(out)
            })?;
            Ok(raw.into_value())
        })?
        .with_name("list")?,
    )?;

    Ok(binding)
}

#[derive(Clone, Copy)]
enum KvType {
    Text,
    Json,
    ArrayBuffer,
}

fn parse_kv_type<'js>(ctx: &Ctx<'js>, value: Option<&Value<'js>>) -> Result<KvType> {
    let Some(value) = value else {
        return Ok(KvType::Text);
    };
    if value.is_undefined() || value.is_null() {
        return Ok(KvType::Text);
    }
    let name: String = FromJs::from_js(ctx, value.clone())?;
    match name.as_str() {
        "text" => Ok(KvType::Text),
        "json" => Ok(KvType::Json),
        "arrayBuffer" => Ok(KvType::ArrayBuffer),
        other => Err(Exception::throw_type(
            ctx,
            &format!("unsupported KV value type {other:?}"),
        )),
    }
}

fn kv_value_from_payload<'js>(
    ctx: &Ctx<'js>,
    payload: &Value<'js>,
    kind: KvType,
) -> Result<Value<'js>> {
    let Some(obj) = payload.as_object() else {
        return Ok(Value::new_null(ctx.clone()));
    };
    if !obj.get("found").unwrap_or(false) {
        return Ok(Value::new_null(ctx.clone()));
    }
    let encoded: String = obj.get("value").unwrap_or_default();
    let bytes = STANDARD.decode(encoded).unwrap_or_default();
    match kind {
        KvType::Text => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            Ok(rquickjs::String::from_str(ctx.clone(), &text)?.into_value())
        }
        KvType::Json => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            ctx.json_parse(text)
        }
        KvType::ArrayBuffer => Ok(support::bytes_to_array_buffer(ctx, &bytes)?.into_value()),
    }
}

// ---------------------------------------------------------------------------
// R2
// ---------------------------------------------------------------------------

fn r2_meta_to_json(meta: &hostedat_js_common::R2ObjectMeta) -> serde_json::Value {
    serde_json::json!({
        "key": meta.key,
        "size": meta.size,
        "etag": meta.etag,
        "uploaded": meta.uploaded_ms,
        "httpMetadata": meta.http_metadata,
        "customMetadata": meta.custom_metadata,
    })
}

/// Lifts an R2 payload into the object shape handlers expect; when
/// `body` bytes are present the object also carries the body readers.
fn r2_object_from_payload<'js>(ctx: &Ctx<'js>, payload: &Value<'js>) -> Result<Value<'js>> {
    let Some(obj) = payload.as_object() else {
        return Ok(Value::new_null(ctx.clone()));
    };
    if !obj.get("found").unwrap_or(false) {
        return Ok(Value::new_null(ctx.clone()));
    }
    let result = Object::new(ctx.clone())?;
    for field in ["key", "etag"] {
        let value: Value = obj.get(field).unwrap_or_else(|_| undef(ctx));
        result.set(field, value)?;
    }
    let size: f64 = obj.get("size").unwrap_or(0.0);
    result.set("size", size)?;
    let uploaded: f64 = obj.get("uploaded").unwrap_or(0.0);
    result.set("uploaded", uploaded)?;
    for field in ["httpMetadata", "customMetadata"] {
        let value: Value = obj.get(field).unwrap_or_else(|_| undef(ctx));
        result.set(field, value)?;
    }

    if let Ok(encoded) = obj.get::<_, String>("body") {
        let bytes = Arc::new(STANDARD.decode(encoded).unwrap_or_default());

        let text_bytes = bytes.clone();
        result.set(
            "text",
            native_fn(ctx, move |ctx, _args| {
                let text = String::from_utf8_lossy(&text_bytes).into_owned();
                let value = rquickjs::String::from_str(ctx.clone(), &text)?.into_value();
                Ok(support::resolved_promise(&ctx, value)?.into_value())
            })?,
        )?;

        let json_bytes = bytes.clone();
        result.set(
            "json",
            native_fn(ctx, move |ctx, _args| {
                let text = String::from_utf8_lossy(&json_bytes).into_owned();
                match ctx.json_parse(text) {
                    Ok(value) => Ok(support::resolved_promise(&ctx, value)?.into_value()),
                    Err(e) => {
                        let err = support::caught_value(&ctx, e);
                        Ok(support::rejected_promise(&ctx, err)?.into_value())
                    }
                }
            })?,
        )?;

        let ab_bytes = bytes.clone();
        result.set(
            "arrayBuffer",
            native_fn(ctx, move |ctx, _args| {
                let buffer = support::bytes_to_array_buffer(&ctx, &ab_bytes)?;
                Ok(support::resolved_promise(&ctx, buffer.into_value())?.into_value())
            })?,
        )?;

        result.set("body", new_readable_from_bytes(ctx, &bytes)?)?;
    }
    Ok(result.into_value())
}

fn r2_binding<'js>(
    ctx: &Ctx<'js>,
    core: &SharedCore,
    store: Arc<dyn R2Store>,
) -> Result<Object<'js>> {
    let binding = Object::new(ctx.clone())?;

    let get_core = core.clone();
    let get_store = store.clone();
    binding.set(
        "get",
        native_fn(ctx, move |ctx, args| {
            let key: String = FromJs::from_js(&ctx, arg(&ctx, &args, 0))?;
            let store = get_store.clone();
            let raw = blocking_op(&ctx, &get_core, move || {
                match store.get(&key).map_err(|e| e.to_string())? {
                    None => Ok(serde_json::json!({ "found": false })),
                    Some(object) => {
                        let mut payload = r2_meta_to_json(&object.meta);
                        payload["found"] = serde_json::Value::Bool(true);
                        payload["body"] =
                            serde_json::Value::String(STANDARD.encode(&object.body));
                        Ok(payload)
                    }
                }
            })?;
            Ok(map_promise(&ctx, raw.into_value(), |ctx, payload| {
                r2_object_from_payload(&ctx, &payload)
            })?
            .into_value())
        })?
        .with_name("get")?,
    )?;

    let head_core = core.clone();
    let head_store = store.clone();
    binding.set(
        "head",
        native_fn(ctx, move |ctx, args| {
            let key: String = FromJs::from_js(&ctx, arg(&ctx, &args, 0))?;
            let store = head_store.clone();
            let raw = blocking_op(&ctx, &head_core, move || {
                match store.head(&key).map_err(|e| e.to_string())? {
                    None => Ok(serde_json::json!({ "found": false })),
                    Some(meta) => {
                        let mut payload = r2_meta_to_json(&meta);
                        payload["found"] = serde_json::Value::Bool(true);
                        Ok(payload)
                    }
                }
            })?;
            Ok(map_promise(&ctx, raw.into_value(), |ctx, payload| {
                r2_object_from_payload(&ctx, &payload)
            })?
            .into_value())
        })?
        .with_name("head")?,
    )?;

    let put_core = core.clone();
    let put_store = store.clone();
    binding.set(
        "put",
        native_fn(ctx, move |ctx, args| {
            let key: String = FromJs::from_js(&ctx, arg(&ctx, &args, 0))?;
            let body = as_bytes(&arg(&ctx, &args, 1))?;
            let options = args.0.get(2).and_then(|v| v.as_object().cloned());
            let http_metadata = string_map(&ctx, options.as_ref(), "httpMetadata")?;
            let custom_metadata = string_map(&ctx, options.as_ref(), "customMetadata")?;
            let store = put_store.clone();
            let raw = blocking_op(&ctx, &put_core, move || {
                let meta = store
                    .put(&key, body, http_metadata, custom_metadata)
                    .map_err(|e| e.to_string())?;
                let mut payload = r2_meta_to_json(&meta);
                payload["found"] = serde_json::Value::Bool(true);
                Ok(payload)
            })?;
            Ok(map_promise(&ctx, raw.into_value(), |ctx, payload| {
                r2_object_from_payload(&ctx, &payload)
            })?
            .into_value())
        })?
        .with_name("put")?,
    )?;

    let delete_core = core.clone();
    let delete_store = store.clone();
    binding.set(
        "delete",
        native_fn(ctx, move |ctx, args| {
            let target = arg(&ctx, &args, 0);
            let keys: Vec<String> = if let Some(s) = target.as_string() {
                vec![s.to_string()?]
            } else if let Some(array) = target.as_object().and_then(|o| o.as_array()) {
                array.iter::<String>().collect::<Result<Vec<_>>>()?
            } else {
                return Err(Exception::throw_type(
                    &ctx,
                    "delete takes a key or an array of keys",
                ));
            };
            let store = delete_store.clone();
            Ok(blocking_op(&ctx, &delete_core, move || {
                store.delete(&keys).map_err(|e| e.to_string())?;
                Ok(serde_json::Value::Null)
            })?
            .into_value())
        })?
        .with_name("delete")?,
    )?;

    let list_core = core.clone();
    let list_store = store.clone();
    binding.set(
        "list",
        native_fn(ctx, move |ctx, args| {
            let options = args.0.first().and_then(|v| v.as_object().cloned());
            let prefix: String = options
                .as_ref()
                .and_then(|o| o.get("prefix").ok())
                .unwrap_or_default();
            let delimiter: Option<String> = options.as_ref().and_then(|o| o.get("delimiter").ok());
            let cursor: Option<String> = options.as_ref().and_then(|o| o.get("cursor").ok());
            let limit: usize = options
                .and_then(|o| o.get::<_, f64>("limit").ok())
                .map(|l| l.max(1.0) as usize)
                .unwrap_or(1000);
            let store = list_store.clone();
            Ok(blocking_op(&ctx, &list_core, move || {
                let page = store
                    .list(&prefix, delimiter.as_deref(), cursor.as_deref(), limit)
                    .map_err(|e| e.to_string())?;
                let objects: Vec<serde_json::Value> =
                    page.objects.iter().map(r2_meta_to_json).collect();
                let mut out = serde_json::json!({
                    "objects": objects,
                    "truncated": page.truncated,
                    "delimitedPrefixes": page.delimited_prefixes,
                });
                if let Some(cursor) = page.cursor {
                    out["cursor"] = serde_json::Value::String(cursor);
                }
                Ok(out)
            })?
            .into_value())
        })?
        .with_name("list")?,
    )?;

    let presign_core = core.clone();
    let presign_store = store.clone();
    binding.set(
        "presignedGetURL",
        native_fn(ctx, move |ctx, args| {
            let key: String = FromJs::from_js(&ctx, arg(&ctx, &args, 0))?;
            let expires: u64 = args
                .0
                .get(1)
                .and_then(|v| v.as_number())
                .map(|n| n.max(0.0) as u64)
                .unwrap_or(3600);
            let store = presign_store.clone();
            Ok(blocking_op(&ctx, &presign_core, move || {
                let url = store
                    .presigned_get_url(&key, expires)
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::Value::String(url))
            })?
            .into_value())
        })?
        .with_name("presignedGetURL")?,
    )?;

    let public_core = core.clone();
    binding.set(
        "publicURL",
        native_fn(ctx, move |ctx, args| {
            let key: String = FromJs::from_js(&ctx, arg(&ctx, &args, 0))?;
            let store = store.clone();
            Ok(blocking_op(&ctx, &public_core, move || {
                match store.public_url(&key).map_err(|e| e.to_string())? {
                    Some(url) => Ok(serde_json::Value::String(url)),
                    None => Ok(serde_json::Value::Null),
                }
            })?
            .into_value())
        })?
        .with_name("publicURL")?,
    )?;

    Ok(binding)
}

fn string_map<'js>(
    ctx: &Ctx<'js>,
    options: Option<&Object<'js>>,
    field: &str,
) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    if let Some(obj) = options.and_then(|o| o.get::<_, Object>(field).ok()) {
        for prop in obj.props::<String, rquickjs::Coerced<String>>() {
            let (key, value) = prop?;
            out.insert(key, value.0);
        }
    }
    let _ = ctx;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

fn queue_message<'js>(
    ctx: &Ctx<'js>,
    body: &Value<'js>,
    content_type: Option<String>,
) -> Result<QueueMessage> {
    if let Some(text) = body.as_string() {
        return Ok(QueueMessage {
            body: text.to_string()?.into_bytes(),
            content_type: content_type.unwrap_or_else(|| "text".to_string()),
        });
    }
    if body.is_object() && body.as_object().is_some_and(|o| o.as_typed_array::<u8>().is_some()) {
        return Ok(QueueMessage {
            body: as_bytes(body)?,
            content_type: content_type.unwrap_or_else(|| "bytes".to_string()),
        });
    }
    let json = ctx
        .json_stringify(body.clone())?
        .ok_or_else(|| Exception::throw_type(ctx, "queue message is not serialisable"))?
        .to_string()?;
    Ok(QueueMessage {
        body: json.into_bytes(),
        content_type: content_type.unwrap_or_else(|| "json".to_string()),
    })
}

fn queue_binding<'js>(
    ctx: &Ctx<'js>,
    core: &SharedCore,
    queue: Arc<dyn QueueSender>,
) -> Result<Object<'js>> {
    let binding = Object::new(ctx.clone())?;

    let send_core = core.clone();
    let send_queue = queue.clone();
    binding.set(
        "send",
        native_fn(ctx, move |ctx, args| {
            let body = arg(&ctx, &args, 0);
            let content_type = args
                .0
                .get(1)
                .and_then(|v| v.as_object())
                .and_then(|o| o.get::<_, String>("contentType").ok());
            let message = queue_message(&ctx, &body, content_type)?;
            let queue = send_queue.clone();
            Ok(blocking_op(&ctx, &send_core, move || {
                queue.send(message).map_err(|e| e.to_string())?;
                Ok(serde_json::Value::Null)
            })?
            .into_value())
        })?
        .with_name("send")?,
    )?;

    let batch_core = core.clone();
    binding.set(
        "sendBatch",
        native_fn(ctx, move |ctx, args| {
            let list = arg(&ctx, &args, 0);
            let Some(array) = list.as_object().and_then(|o| o.as_array()) else {
                return Err(Exception::throw_type(
                    &ctx,
                    "sendBatch takes an array of messages",
                ));
            };
            let mut messages = Vec::new();
            for entry in array.iter::<Value>() {
                let entry = entry?;
                let (body, content_type) = match entry.as_object() {
                    Some(obj) if obj.contains_key("body")? => (
                        obj.get::<_, Value>("body")?,
                        obj.get::<_, String>("contentType").ok(),
                    ),
                    _ => (entry, None),
                };
                messages.push(queue_message(&ctx, &body, content_type)?);
            }
            let queue = queue.clone();
            Ok(blocking_op(&ctx, &batch_core, move || {
                queue.send_batch(messages).map_err(|e| e.to_string())?;
                Ok(serde_json::Value::Null)
            })?
            .into_value())
        })?
        .with_name("sendBatch")?,
    )?;

    Ok(binding)
}

// ---------------------------------------------------------------------------
// Durable Objects
// ---------------------------------------------------------------------------

fn durable_object_binding<'js>(
    ctx: &Ctx<'js>,
    core: &SharedCore,
    namespace: String,
    store: Arc<dyn DurableObjectStore>,
) -> Result<Object<'js>> {
    let binding = Object::new(ctx.clone())?;

    binding.set(
        "idFromName",
        native_fn(ctx, move |ctx, args| {
            let name: String = FromJs::from_js(&ctx, arg(&ctx, &args, 0))?;
            let id = Object::new(ctx.clone())?;
            id.set("name", name.clone())?;
            let to_string = native_fn(&ctx, move |ctx, _args| {
                Ok(rquickjs::String::from_str(ctx.clone(), &name)?.into_value())
            })?;
            id.set("toString", to_string)?;
            Ok(id.into_value())
        })?
        .with_name("idFromName")?,
    )?;

    let get_core = core.clone();
    binding.set(
        "get",
        native_fn(ctx, move |ctx, args| {
            let id_value = arg(&ctx, &args, 0);
            let id = id_value
                .as_object()
                .and_then(|o| o.get::<_, String>("name").ok())
                .or_else(|| id_value.as_string().and_then(|s| s.to_string().ok()))
                .ok_or_else(|| Exception::throw_type(&ctx, "expected a durable object id"))?;
            durable_object_stub(&ctx, &get_core, namespace.clone(), id, store.clone())
                .map(|o| o.into_value())
        })?
        .with_name("get")?,
    )?;

    Ok(binding)
}

fn durable_object_stub<'js>(
    ctx: &Ctx<'js>,
    core: &SharedCore,
    namespace: String,
    id: String,
    store: Arc<dyn DurableObjectStore>,
) -> Result<Object<'js>> {
    let stub = Object::new(ctx.clone())?;
    stub.set("id", id.clone())?;
    let storage = Object::new(ctx.clone())?;

    let get_core = core.clone();
    let get_store = store.clone();
    let get_ns = namespace.clone();
    let get_id = id.clone();
    storage.set(
        "get",
        native_fn(ctx, move |ctx, args| {
            let key: String = FromJs::from_js(&ctx, arg(&ctx, &args, 0))?;
            let store = get_store.clone();
            let namespace = get_ns.clone();
            let id = get_id.clone();
            let raw = blocking_op(&ctx, &get_core, move || {
                match store.get(&namespace, &id, &key).map_err(|e| e.to_string())? {
                    None => Ok(serde_json::json!({ "found": false })),
                    Some(value) => Ok(serde_json::json!({
                        "found": true,
                        "value": metadata_json(Some(value)),
                    })),
                }
            })?;
            Ok(map_promise(&ctx, raw.into_value(), |ctx, payload| {
                let Some(obj) = payload.as_object() else {
                    return Ok(undef(&ctx));
                };
                if !obj.get("found").unwrap_or(false) {
                    return Ok(undef(&ctx));
                }
                obj.get("value")
            })?
            .into_value())
        })?
        .with_name("get")?,
    )?;

    let put_core = core.clone();
    let put_store = store.clone();
    let put_ns = namespace.clone();
    let put_id = id.clone();
    storage.set(
        "put",
        native_fn(ctx, move |ctx, args| {
            let key: String = FromJs::from_js(&ctx, arg(&ctx, &args, 0))?;
            let value = ctx
                .json_stringify(arg(&ctx, &args, 1))?
                .ok_or_else(|| {
                    Exception::throw_type(&ctx, "durable object values must be serialisable")
                })?
                .to_string()?;
            let store = put_store.clone();
            let namespace = put_ns.clone();
            let id = put_id.clone();
            Ok(blocking_op(&ctx, &put_core, move || {
                store
                    .put(&namespace, &id, &key, value)
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::Value::Null)
            })?
            .into_value())
        })?
        .with_name("put")?,
    )?;

    let delete_core = core.clone();
    let delete_store = store.clone();
    let delete_ns = namespace.clone();
    let delete_id = id.clone();
    storage.set(
        "delete",
        native_fn(ctx, move |ctx, args| {
            let key: String = FromJs::from_js(&ctx, arg(&ctx, &args, 0))?;
            let store = delete_store.clone();
            let namespace = delete_ns.clone();
            let id = delete_id.clone();
            Ok(blocking_op(&ctx, &delete_core, move || {
                let deleted = store
                    .delete(&namespace, &id, &key)
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::Value::Bool(deleted))
            })?
            .into_value())
        })?
        .with_name("delete")?,
    )?;

    let delete_all_core = core.clone();
    let delete_all_store = store.clone();
    let delete_all_ns = namespace.clone();
    let delete_all_id = id.clone();
    storage.set(
        "deleteAll",
        native_fn(ctx, move |ctx, _args| {
            let store = delete_all_store.clone();
            let namespace = delete_all_ns.clone();
            let id = delete_all_id.clone();
            Ok(blocking_op(&ctx, &delete_all_core, move || {
                store.delete_all(&namespace, &id).map_err(|e| e.to_string())?;
                Ok(serde_json::Value::Null)
            })?
            .into_value())
        })?
        .with_name("deleteAll")?,
    )?;

    let list_core = core.clone();
    storage.set(
        "list",
        native_fn(ctx, move |ctx, args| {
            let options = args.0.first().and_then(|v| v.as_object().cloned());
            let prefix: String = options
                .as_ref()
                .and_then(|o| o.get("prefix").ok())
                .unwrap_or_default();
            let limit: usize = options
                .as_ref()
                .and_then(|o| o.get::<_, f64>("limit").ok())
                .map(|l| l.max(1.0) as usize)
                .unwrap_or(1000);
            let reverse: bool = options
                .and_then(|o| o.get("reverse").ok())
                .unwrap_or(false);
            let store = store.clone();
            let namespace = namespace.clone();
            let id = id.clone();
            Ok(blocking_op(&ctx, &list_core, move || {
                let entries = store
                    .list(&namespace, &id, &prefix, limit, reverse)
                    .map_err(|e| e.to_string())?;
                let mut out = serde_json::Map::new();
                for (key, value) in entries {
                    out.insert(key, metadata_json(Some(value)));
                }
                Ok(serde_json::Value::Object(out))
            })?
            .into_value())
        })?
        .with_name("list")?,
    )?;

    stub.set("storage", storage)?;
    Ok(stub)
}

// ---------------------------------------------------------------------------
// D1
// ---------------------------------------------------------------------------

fn d1_binding<'js>(
    ctx: &Ctx<'js>,
    core: &SharedCore,
    database_id: String,
) -> Result<Object<'js>> {
    let binding = Object::new(ctx.clone())?;
    // one bridge per binding per request, opened on first use and
    // closed at teardown through the request's handle list
    let handle: std::rc::Rc<std::cell::RefCell<Option<Arc<dyn D1Database>>>> =
        std::rc::Rc::new(std::cell::RefCell::new(None));

    let open = {
        let core = core.clone();
        let handle = handle.clone();
        move |ctx: &Ctx<'_>| -> Result<Arc<dyn D1Database>> {
            if let Some(db) = handle.borrow().clone() {
                return Ok(db);
            }
            let mut core_ref = core.borrow_mut();
            let host = core_ref.host.clone();
            let db = host
                .open_d1(&database_id)
                .map_err(|e| Exception::throw_message(ctx, &e))?;
            core_ref
                .request_mut()
                .map_err(|_| Exception::throw_message(ctx, "no active request"))?
                .d1_handles
                .push(db.clone());
            *handle.borrow_mut() = Some(db.clone());
            Ok(db)
        }
    };

    let prepare_core = core.clone();
    let prepare_open = open.clone();
    binding.set(
        "prepare",
        native_fn(ctx, move |ctx, args| {
            let sql: String = FromJs::from_js(&ctx, arg(&ctx, &args, 0))?;
            let db = prepare_open(&ctx)?;
            d1_statement(&ctx, &prepare_core, db, sql, Vec::new()).map(|o| o.into_value())
        })?
        .with_name("prepare")?,
    )?;

    let exec_core = core.clone();
    binding.set(
        "exec",
        native_fn(ctx, move |ctx, args| {
            let sql: String = FromJs::from_js(&ctx, arg(&ctx, &args, 0))?;
            let db = open(&ctx)?;
            Ok(blocking_op(&ctx, &exec_core, move || {
                let count = db.exec(&sql)?;
                Ok(serde_json::json!({ "count": count }))
            })?
            .into_value())
        })?
        .with_name("exec")?,
    )?;

    Ok(binding)
}

fn d1_statement<'js>(
    ctx: &Ctx<'js>,
    core: &SharedCore,
    db: Arc<dyn D1Database>,
    sql: String,
    params: Vec<serde_json::Value>,
) -> Result<Object<'js>> {
    let statement = Object::new(ctx.clone())?;

    let bind_core = core.clone();
    let bind_db = db.clone();
    let bind_sql = sql.clone();
    statement.set(
        "bind",
        native_fn(ctx, move |ctx, args| {
            let mut params = Vec::with_capacity(args.0.len());
            for value in &args.0 {
                let json = ctx
                    .json_stringify(value.clone())?
                    .map(|s| s.to_string())
                    .transpose()?
                    .unwrap_or_else(|| "null".to_string());
                params.push(serde_json::from_str(&json).unwrap_or(serde_json::Value::Null));
            }
            d1_statement(&ctx, &bind_core, bind_db.clone(), bind_sql.clone(), params)
                .map(|o| o.into_value())
        })?
        .with_name("bind")?,
    )?;

    let all_core = core.clone();
    let all_db = db.clone();
    let all_sql = sql.clone();
    let all_params = params.clone();
    statement.set(
        "all",
        native_fn(ctx, move |ctx, _args| {
            let raw = d1_run(&ctx, &all_core, all_db.clone(), all_sql.clone(), &all_params)?;
            Ok(raw.into_value())
        })?
        .with_name("all")?,
    )?;

    let first_core = core.clone();
    let first_db = db.clone();
    let first_sql = sql.clone();
    let first_params = params.clone();
    statement.set(
        "first",
        native_fn(ctx, move |ctx, args| {
            let column: Option<String> = args
                .0
                .first()
                .and_then(|v| v.as_string())
                .and_then(|s| s.to_string().ok());
            let raw = d1_run(
                &ctx,
                &first_core,
                first_db.clone(),
                first_sql.clone(),
                &first_params,
            )?;
            Ok(map_promise(&ctx, raw.into_value(), move |ctx, payload| {
                let results: Value = payload
                    .as_object()
                    .and_then(|o| o.get("results").ok())
                    .unwrap_or_else(|| Value::new_null(ctx.clone()));
                let Some(rows) = results.as_object().and_then(|o| o.as_array()) else {
                    return Ok(Value::new_null(ctx.clone()));
                };
                if rows.is_empty() {
                    return Ok(Value::new_null(ctx.clone()));
                }
                let row: Value = rows.get(0)?;
                match &column {
                    None => Ok(row),
                    Some(column) => row
                        .as_object()
                        .map(|o| o.get(column.as_str()))
                        .transpose()
                        .map(|v| v.unwrap_or_else(|| Value::new_null(ctx.clone()))),
                }
            })?
            .into_value())
        })?
        .with_name("first")?,
    )?;

    let run_core = core.clone();
    statement.set(
        "run",
        native_fn(ctx, move |ctx, _args| {
            let raw = d1_run(&ctx, &run_core, db.clone(), sql.clone(), &params)?;
            Ok(raw.into_value())
        })?
        .with_name("run")?,
    )?;

    Ok(statement)
}

fn d1_run<'js>(
    ctx: &Ctx<'js>,
    core: &SharedCore,
    db: Arc<dyn D1Database>,
    sql: String,
    params: &[serde_json::Value],
) -> Result<rquickjs::Promise<'js>> {
    let params_json = serde_json::to_string(params).unwrap_or_else(|_| "[]".to_string());
    blocking_op(ctx, core, move || {
        let rows = db.query(&sql, &params_json)?;
        serde_json::from_str(&rows).map_err(|e| e.to_string())
    })
}

// ---------------------------------------------------------------------------
// Service bindings and assets
// ---------------------------------------------------------------------------

/// Lowers a `Request` (or URL string) into the wire shape.
fn wire_request<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<WorkerRequest> {
    if let Some(s) = value.as_string() {
        return Ok(WorkerRequest {
            method: "GET".to_string(),
            url: s.to_string()?,
            headers: HashMap::new(),
            body: Vec::new(),
        });
    }
    let request = Class::<Request>::from_js(ctx, value)
        .map_err(|_| Exception::throw_type(ctx, "expected a Request or URL string"))?;
    let request = request.borrow();
    let headers = flatten_headers(&request.headers_class(ctx)?.borrow().pairs());
    let body = request
        .body
        .bytes()
        .map(|b| b.as_ref().clone())
        .unwrap_or_default();
    Ok(WorkerRequest {
        method: request.method.clone(),
        url: request.url.clone(),
        headers,
        body,
    })
}

fn response_from_wire<'js>(
    ctx: &Ctx<'js>,
    payload: &Value<'js>,
) -> Result<Value<'js>> {
    let Some(obj) = payload.as_object() else {
        return Err(Exception::throw_type(ctx, "malformed service response"));
    };
    let status: u16 = obj.get("status").unwrap_or(500);
    let body: String = obj.get("body").unwrap_or_default();
    let body = STANDARD.decode(body).unwrap_or_default();
    let mut headers = Vec::new();
    if let Ok(map) = obj.get::<_, Object>("headers") {
        for prop in map.props::<String, String>() {
            let (name, value) = prop?;
            headers.push((name, value));
        }
    }
    let url: String = obj.get("url").unwrap_or_default();
    Ok(Response::from_parts(ctx, status, None, headers, body, &url)?.into_value())
}

fn service_binding<'js>(
    ctx: &Ctx<'js>,
    core: &SharedCore,
    target: ServiceTarget,
) -> Result<Object<'js>> {
    let binding = Object::new(ctx.clone())?;
    let fetch_core = core.clone();
    binding.set(
        "fetch",
        native_fn(ctx, move |ctx, args| {
            let wire = wire_request(&ctx, arg(&ctx, &args, 0))?;
            let (promise, resolve, reject) = rquickjs::Promise::new(&ctx)?;
            let (completion, host) = {
                let mut core_ref = fetch_core.borrow_mut();
                let completion = core_ref.begin_op(&ctx, resolve, reject);
                (completion, core_ref.host.clone())
            };
            host.dispatch_service(target.clone(), wire, completion);
            Ok(map_promise(&ctx, promise.into_value(), |ctx, payload| {
                response_from_wire(&ctx, &payload)
            })?
            .into_value())
        })?
        .with_name("fetch")?,
    )?;
    Ok(binding)
}

fn assets_binding<'js>(
    ctx: &Ctx<'js>,
    core: &SharedCore,
    assets: Arc<dyn AssetsFetcher>,
) -> Result<Object<'js>> {
    let binding = Object::new(ctx.clone())?;
    let fetch_core = core.clone();
    binding.set(
        "fetch",
        native_fn(ctx, move |ctx, args| {
            let wire = wire_request(&ctx, arg(&ctx, &args, 0))?;
            let assets = assets.clone();
            let raw = blocking_op(&ctx, &fetch_core, move || {
                let response = assets.fetch(wire).map_err(|e| e.to_string())?;
                Ok(serde_json::json!({
                    "status": response.status_code,
                    "headers": response.headers,
                    "body": STANDARD.encode(&response.body),
                }))
            })?;
            Ok(map_promise(&ctx, raw.into_value(), |ctx, payload| {
                response_from_wire(&ctx, &payload)
            })?
            .into_value())
        })?
        .with_name("fetch")?,
    )?;
    Ok(binding)
}
