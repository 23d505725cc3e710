//! The Cache API (`caches.default`, `caches.open(...)`), backed by the
//! abstract cache store from the request's env. Store calls run on the
//! host's blocking pool and resolve through the op queue.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hostedat_js_common::CacheStore;
use rquickjs::class::Trace;
use rquickjs::prelude::Opt;
use rquickjs::{Class, Ctx, Exception, FromJs, JsLifetime, Object, Persistent, Promise, Result, Value};

use super::request::Request;
use super::response::Response;
use super::support::{self, arg, native_fn, undef};
use crate::core::{blocking_op, SharedCore};

/// `Cache-Control` TTL: `s-maxage` wins over `max-age`, per shared
/// cache semantics.
pub(crate) fn ttl_from_cache_control(header: &str) -> Option<u64> {
    let mut max_age = None;
    let mut s_maxage = None;
    for directive in header.split(',') {
        let directive = directive.trim().to_ascii_lowercase();
        if let Some(value) = directive.strip_prefix("s-maxage=") {
            s_maxage = value.trim().parse::<u64>().ok();
        } else if let Some(value) = directive.strip_prefix("max-age=") {
            max_age = value.trim().parse::<u64>().ok();
        }
    }
    s_maxage.or(max_age)
}

/// The URL key for a cache operation: a string or a `Request`.
fn cache_key<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Result<String> {
    if let Some(s) = value.as_string() {
        return Ok(s.to_string()?);
    }
    if let Ok(request) = Class::<Request>::from_js(ctx, value.clone()) {
        return Ok(request.borrow().url.clone());
    }
    Err(Exception::throw_type(
        ctx,
        "cache operations take a URL string or a Request",
    ))
}

fn store_of(core: &SharedCore) -> Option<Arc<dyn CacheStore>> {
    core.borrow()
        .request
        .as_ref()
        .and_then(|r| r.env.cache.clone())
}

/// Maps the op's JSON into a `Response` (or `undefined` on a miss).
fn entry_promise<'js>(ctx: &Ctx<'js>, raw: Promise<'js>) -> Result<Promise<'js>> {
    let (promise, resolve, reject) = Promise::new(ctx)?;
    let resolve = Persistent::save(ctx, resolve);
    let on_ok = native_fn(ctx, move |ctx, args| {
        let payload = arg(&ctx, &args, 0);
        let resolve = resolve.clone().restore(&ctx)?;
        let Some(obj) = payload.as_object() else {
            resolve.call::<_, ()>((undef(&ctx),))?;
            return Ok(undef(&ctx));
        };
        if !obj.get("found").unwrap_or(false) {
            resolve.call::<_, ()>((undef(&ctx),))?;
            return Ok(undef(&ctx));
        }
        let status: u16 = obj.get("status").unwrap_or(200);
        let headers_json: String = obj.get("headers").unwrap_or_default();
        let body_b64: String = obj.get("body").unwrap_or_default();
        let url: String = obj.get("url").unwrap_or_default();
        let headers: Vec<(String, String)> =
            serde_json::from_str::<std::collections::HashMap<String, String>>(&headers_json)
                .map(|m| m.into_iter().collect())
                .unwrap_or_default();
        let body = STANDARD.decode(body_b64).unwrap_or_default();
        let response = Response::from_parts(&ctx, status, None, headers, body, &url)?;
        resolve.call::<_, ()>((response.into_value(),))?;
        Ok(undef(&ctx))
    })?;
    let reject = Persistent::save(ctx, reject);
    let on_err = native_fn(ctx, move |ctx, args| {
        let reject = reject.clone().restore(&ctx)?;
        reject.call::<_, ()>((arg(&ctx, &args, 0),))?;
        Ok(undef(&ctx))
    })?;
    support::then(ctx, raw.into_value(), on_ok, Some(on_err))?;
    Ok(promise)
}

fn match_in<'js>(
    ctx: &Ctx<'js>,
    core: &SharedCore,
    cache_name: String,
    key: String,
) -> Result<Promise<'js>> {
    let Some(store) = store_of(core) else {
        return support::resolved_promise(ctx, undef(ctx));
    };
    let raw = blocking_op(ctx, core, move || {
        match store.match_entry(&cache_name, &key).map_err(|e| e.to_string())? {
            None => Ok(serde_json::json!({ "found": false })),
            Some(entry) => Ok(serde_json::json!({
                "found": true,
                "status": entry.status,
                "headers": entry.headers_json,
                "body": STANDARD.encode(&entry.body),
                "url": key,
            })),
        }
    })?;
    entry_promise(ctx, raw)
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct Cache {
    #[qjs(skip_trace)]
    name: String,
    #[qjs(skip_trace)]
    core: SharedCore,
}

#[rquickjs::methods]
impl Cache {
    pub fn put<'js>(&self, ctx: Ctx<'js>, request: Value<'js>, response: Value<'js>) -> Result<Promise<'js>> {
        let key = cache_key(&ctx, &request)?;
        let Ok(response) = Class::<Response>::from_js(&ctx, response) else {
            return support::rejected_type_error(&ctx, "Cache.put requires a Response");
        };
        let (status, header_pairs, body) = {
            let response = response.borrow();
            let body = response
                .body
                .bytes()
                .map(|b| b.as_ref().clone())
                .unwrap_or_default();
            (
                response.status,
                response.headers_class(&ctx)?.borrow().pairs(),
                body,
            )
        };
        let ttl = header_pairs
            .iter()
            .find(|(name, _)| name == "cache-control")
            .and_then(|(_, value)| ttl_from_cache_control(value));
        let headers_map: std::collections::HashMap<String, String> =
            crate::host::flatten_headers(&header_pairs);
        let headers_json = serde_json::to_string(&headers_map)
            .map_err(|e| Exception::throw_internal(&ctx, &e.to_string()))?;

        let Some(store) = store_of(&self.core) else {
            return support::resolved_promise(&ctx, undef(&ctx));
        };
        let cache_name = self.name.clone();
        blocking_op(&ctx, &self.core, move || {
            store
                .put(&cache_name, &key, status, &headers_json, body, ttl)
                .map_err(|e| e.to_string())?;
            Ok(serde_json::Value::Null)
        })
    }

    #[qjs(rename = "match")]
    pub fn match_js<'js>(&self, ctx: Ctx<'js>, request: Value<'js>) -> Result<Promise<'js>> {
        let key = cache_key(&ctx, &request)?;
        match_in(&ctx, &self.core, self.name.clone(), key)
    }

    #[qjs(rename = "matchAll")]
    pub fn match_all<'js>(&self, ctx: Ctx<'js>, request: Opt<Value<'js>>) -> Result<Promise<'js>> {
        // zero or one result; the store keys entries by exact URL
        match request.0 {
            None => {
                let array = rquickjs::Array::new(ctx.clone())?;
                support::resolved_promise(&ctx, array.into_value())
            }
            Some(request) => {
                let single = self.match_js(ctx.clone(), request)?;
                let (promise, resolve, reject) = Promise::new(&ctx)?;
                let resolve = Persistent::save(&ctx, resolve);
                let on_ok = native_fn(&ctx, move |ctx, args| {
                    let hit = arg(&ctx, &args, 0);
                    let array = rquickjs::Array::new(ctx.clone())?;
                    if !hit.is_undefined() {
                        array.set(0, hit)?;
                    }
                    let resolve = resolve.clone().restore(&ctx)?;
                    resolve.call::<_, ()>((array,))?;
                    Ok(undef(&ctx))
                })?;
                let reject = Persistent::save(&ctx, reject);
                let on_err = native_fn(&ctx, move |ctx, args| {
                    let reject = reject.clone().restore(&ctx)?;
                    reject.call::<_, ()>((arg(&ctx, &args, 0),))?;
                    Ok(undef(&ctx))
                })?;
                support::then(&ctx, single.into_value(), on_ok, Some(on_err))?;
                Ok(promise)
            }
        }
    }

    pub fn delete<'js>(&self, ctx: Ctx<'js>, request: Value<'js>) -> Result<Promise<'js>> {
        let key = cache_key(&ctx, &request)?;
        let Some(store) = store_of(&self.core) else {
            let value = rquickjs::IntoJs::into_js(false, &ctx)?;
            return support::resolved_promise(&ctx, value);
        };
        let cache_name = self.name.clone();
        blocking_op(&ctx, &self.core, move || {
            let deleted = store.delete(&cache_name, &key).map_err(|e| e.to_string())?;
            Ok(serde_json::Value::Bool(deleted))
        })
    }

    pub fn keys<'js>(&self, ctx: Ctx<'js>, request: Opt<Value<'js>>) -> Result<Promise<'js>> {
        let filter = match request.0 {
            Some(v) if !v.is_undefined() && !v.is_null() => Some(cache_key(&ctx, &v)?),
            _ => None,
        };
        let Some(store) = store_of(&self.core) else {
            let array = rquickjs::Array::new(ctx.clone())?;
            return support::resolved_promise(&ctx, array.into_value());
        };
        let cache_name = self.name.clone();
        let raw = blocking_op(&ctx, &self.core, move || {
            let mut keys = store.keys(&cache_name).map_err(|e| e.to_string())?;
            if let Some(filter) = filter {
                keys.retain(|k| *k == filter);
            }
            Ok(serde_json::json!(keys))
        })?;

        // lift URL strings into Request objects
        let (promise, resolve, reject) = Promise::new(&ctx)?;
        let resolve = Persistent::save(&ctx, resolve);
        let on_ok = native_fn(&ctx, move |ctx, args| {
            let urls = arg(&ctx, &args, 0);
            let array = rquickjs::Array::new(ctx.clone())?;
            if let Some(list) = urls.as_object().and_then(|o| o.as_array()) {
                for (i, url) in list.iter::<String>().enumerate() {
                    let url = url?;
                    let request = Request::from_parts(&ctx, "GET", &url, Vec::new(), Vec::new())?;
                    array.set(i, request)?;
                }
            }
            let resolve = resolve.clone().restore(&ctx)?;
            resolve.call::<_, ()>((array,))?;
            Ok(undef(&ctx))
        })?;
        let reject = Persistent::save(&ctx, reject);
        let on_err = native_fn(&ctx, move |ctx, args| {
            let reject = reject.clone().restore(&ctx)?;
            reject.call::<_, ()>((arg(&ctx, &args, 0),))?;
            Ok(undef(&ctx))
        })?;
        support::then(&ctx, raw.into_value(), on_ok, Some(on_err))?;
        Ok(promise)
    }
}

pub fn setup(ctx: &Ctx<'_>, core: &SharedCore) -> Result<()> {
    let globals = ctx.globals();
    Class::<Cache>::define(&globals)?;

    let caches = Object::new(ctx.clone())?;

    let default = Class::instance(
        ctx.clone(),
        Cache {
            name: "default".to_string(),
            core: core.clone(),
        },
    )?;
    caches.set("default", default)?;

    // open() is idempotent per name: equal names yield caches over the
    // same stored namespace.
    let open_core = core.clone();
    caches.set(
        "open",
        native_fn(ctx, move |ctx, args| {
            let name: String = FromJs::from_js(&ctx, arg(&ctx, &args, 0))?;
            let cache = Class::instance(
                ctx.clone(),
                Cache {
                    name,
                    core: open_core.clone(),
                },
            )?;
            Ok(support::resolved_promise(&ctx, cache.into_value())?.into_value())
        })?
        .with_name("open")?,
    )?;

    let has_core = core.clone();
    caches.set(
        "has",
        native_fn(ctx, move |ctx, args| {
            let name: String = FromJs::from_js(&ctx, arg(&ctx, &args, 0))?;
            let Some(store) = store_of(&has_core) else {
                let value = rquickjs::IntoJs::into_js(false, &ctx)?;
                return Ok(support::resolved_promise(&ctx, value)?.into_value());
            };
            let raw = blocking_op(&ctx, &has_core, move || {
                let names = store.cache_names().map_err(|e| e.to_string())?;
                Ok(serde_json::Value::Bool(names.contains(&name)))
            })?;
            Ok(raw.into_value())
        })?
        .with_name("has")?,
    )?;

    let delete_core = core.clone();
    caches.set(
        "delete",
        native_fn(ctx, move |ctx, args| {
            let name: String = FromJs::from_js(&ctx, arg(&ctx, &args, 0))?;
            let Some(store) = store_of(&delete_core) else {
                let value = rquickjs::IntoJs::into_js(false, &ctx)?;
                return Ok(support::resolved_promise(&ctx, value)?.into_value());
            };
            let raw = blocking_op(&ctx, &delete_core, move || {
                let keys = store.keys(&name).map_err(|e| e.to_string())?;
                let existed = !keys.is_empty();
                for key in keys {
                    store.delete(&name, &key).map_err(|e| e.to_string())?;
                }
                Ok(serde_json::Value::Bool(existed))
            })?;
            Ok(raw.into_value())
        })?
        .with_name("delete")?,
    )?;

    let keys_core = core.clone();
    caches.set(
        "keys",
        native_fn(ctx, move |ctx, _args| {
            let Some(store) = store_of(&keys_core) else {
                let array = rquickjs::Array::new(ctx.clone())?;
                return Ok(support::resolved_promise(&ctx, array.into_value())?.into_value());
            };
            let raw = blocking_op(&ctx, &keys_core, move || {
                let names = store.cache_names().map_err(|e| e.to_string())?;
                Ok(serde_json::json!(names))
            })?;
            Ok(raw.into_value())
        })?
        .with_name("keys")?,
    )?;

    // caches.match searches every named cache, default first
    let match_core = core.clone();
    caches.set(
        "match",
        native_fn(ctx, move |ctx, args| {
            let key = cache_key(&ctx, &arg(&ctx, &args, 0))?;
            let Some(store) = store_of(&match_core) else {
                return Ok(support::resolved_promise(&ctx, undef(&ctx))?.into_value());
            };
            let lookup = key.clone();
            let raw = blocking_op(&ctx, &match_core, move || {
                let mut names = store.cache_names().map_err(|e| e.to_string())?;
                if !names.iter().any(|n| n == "default") {
                    names.insert(0, "default".to_string());
                }
                for name in names {
                    if let Some(entry) = store
                        .match_entry(&name, &lookup)
                        .map_err(|e| e.to_string())?
                    {
                        return Ok(serde_json::json!({
                            "found": true,
                            "status": entry.status,
                            "headers": entry.headers_json,
                            "body": STANDARD.encode(&entry.body),
                            "url": lookup,
                        }));
                    }
                }
                Ok(serde_json::json!({ "found": false }))
            })?;
            Ok(entry_promise(&ctx, raw)?.into_value())
        })?
        .with_name("match")?,
    )?;

    globals.set("caches", caches)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::ttl_from_cache_control;

    #[test]
    fn max_age_is_extracted() {
        assert_eq!(ttl_from_cache_control("public, max-age=60"), Some(60));
        assert_eq!(ttl_from_cache_control("no-store"), None);
    }

    #[test]
    fn s_maxage_takes_precedence() {
        assert_eq!(
            ttl_from_cache_control("max-age=60, s-maxage=120"),
            Some(120)
        );
    }
}
