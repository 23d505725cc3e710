//! The global `fetch`: per-request accounting, abort wiring, body
//! buffering, and dispatch to the host HTTP client (which owns the
//! SSRF guard, redirects and timeouts).

use std::cell::RefCell;
use std::rc::Rc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rquickjs::prelude::Opt;
use rquickjs::{Class, Ctx, Function, FromJs, Object, Persistent, Promise, Result, Value};

use super::events::register_abort_hook;
use super::request::Request;
use super::response::Response;
use super::support::{self, arg, as_bytes, error_value, native_fn, undef};
use crate::core::SharedCore;
use crate::host::{CancelHandle, HttpRequest};

/// Decodes the wire body the host posted (standard base64).
pub(crate) fn decode_wire_body(encoded: &str) -> Vec<u8> {
    STANDARD.decode(encoded).unwrap_or_default()
}

fn header_pairs_from_json(value: &serde_json::Value) -> Vec<(String, String)> {
    value
        .as_array()
        .map(|pairs| {
            pairs
                .iter()
                .filter_map(|pair| {
                    let name = pair.get(0)?.as_str()?.to_string();
                    let val = pair.get(1)?.as_str()?.to_string();
                    Some((name, val))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Builds a `Response` class value from the JSON a host fetch op
/// resolves with.
pub(crate) fn response_from_op_json<'js>(
    ctx: &Ctx<'js>,
    payload: &serde_json::Value,
) -> Result<Value<'js>> {
    let status = payload.get("status").and_then(|s| s.as_u64()).unwrap_or(0) as u16;
    let status_text = payload
        .get("statusText")
        .and_then(|s| s.as_str())
        .map(|s| s.to_string());
    let headers = header_pairs_from_json(payload.get("headers").unwrap_or(&serde_json::Value::Null));
    let body = payload
        .get("body")
        .and_then(|b| b.as_str())
        .map(decode_wire_body)
        .unwrap_or_default();
    let url = payload.get("url").and_then(|u| u.as_str()).unwrap_or("");
    let redirected = payload
        .get("redirected")
        .and_then(|r| r.as_bool())
        .unwrap_or(false);

    let response = Response::from_parts(ctx, status, status_text, headers, body, url)?;
    response.borrow_mut().redirected = redirected;
    Ok(response.into_value())
}

fn dispatch<'js>(
    ctx: &Ctx<'js>,
    core: &SharedCore,
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    timeout_ms: u64,
    cancel_slot: Rc<RefCell<Option<CancelHandle>>>,
    resolve: Persistent<Function<'static>>,
    reject: Persistent<Function<'static>>,
) -> Result<()> {
    let (raw_promise, raw_resolve, raw_reject) = Promise::new(ctx)?;
    let (completion, host) = {
        let mut core_ref = core.borrow_mut();
        let completion = core_ref.begin_op(ctx, raw_resolve, raw_reject);
        (completion, core_ref.host.clone())
    };

    let handle = host.fetch(
        HttpRequest {
            method,
            url,
            headers,
            body,
            timeout_ms,
        },
        completion,
    );
    *cancel_slot.borrow_mut() = Some(handle);

    let on_ok = native_fn(ctx, move |ctx, args| {
        let payload = arg(&ctx, &args, 0);
        let json = ctx
            .json_stringify(payload)?
            .map(|s| s.to_string())
            .transpose()?
            .unwrap_or_else(|| "null".to_string());
        let payload: serde_json::Value = serde_json::from_str(&json).unwrap_or_default();
        let response = response_from_op_json(&ctx, &payload)?;
        let resolve = resolve.clone().restore(&ctx)?;
        resolve.call::<_, ()>((response,))?;
        Ok(undef(&ctx))
    })?;
    let on_err = native_fn(ctx, move |ctx, args| {
        let reject = reject.clone().restore(&ctx)?;
        reject.call::<_, ()>((arg(&ctx, &args, 0),))?;
        Ok(undef(&ctx))
    })?;
    support::then(ctx, raw_promise.into_value(), on_ok, Some(on_err))
}

fn fetch_impl<'js>(
    ctx: &Ctx<'js>,
    core: &SharedCore,
    input: Value<'js>,
    init: Opt<Object<'js>>,
) -> Result<Promise<'js>> {
    // Normalise through the Request constructor so strings, URLs and
    // Request instances all take the same path.
    let request = match Class::<Request>::from_js(ctx, input.clone()) {
        Ok(existing) if init.0.is_none() => existing,
        _ => Class::instance(ctx.clone(), Request::new(ctx.clone(), input, init)?)?,
    };

    // fetch accounting against the per-request cap
    let timeout_ms = {
        let mut core_ref = core.borrow_mut();
        let request_state = match core_ref.request_mut() {
            Ok(state) => state,
            Err(_) => {
                drop(core_ref);
                return support::rejected_type_error(ctx, "fetch is unavailable outside a request");
            }
        };
        if request_state.fetch_count >= request_state.limits.max_fetch {
            let max = request_state.limits.max_fetch;
            drop(core_ref);
            let err = error_value(
                ctx,
                &format!("too many subrequests: the limit is {max} fetch calls per request"),
            )?;
            return support::rejected_promise(ctx, err);
        }
        request_state.fetch_count += 1;
        request_state
            .limits
            .fetch_timeout_ms
            .min(request_state.remaining_ms().max(1))
    };

    let (promise, resolve, reject) = Promise::new(ctx)?;
    let resolve = Persistent::save(ctx, resolve);
    let reject = Persistent::save(ctx, reject);

    let cancel_slot: Rc<RefCell<Option<CancelHandle>>> = Rc::new(RefCell::new(None));

    // abort wiring: an already-aborted signal short-circuits, a live
    // one cancels the in-flight host op when it fires
    let (method, url, headers, signal) = {
        let req = request.borrow();
        let signal = req.signal_class(ctx);
        if let Some(signal) = &signal {
            if signal.borrow().aborted() {
                let reason = signal.borrow().reason(ctx.clone())?;
                let reason = if reason.is_undefined() {
                    super::events::dom_exception(ctx, "AbortError", "the operation was aborted")?
                } else {
                    reason
                };
                return support::rejected_promise(ctx, reason);
            }
        }
        (
            req.method.clone(),
            req.url.clone(),
            req.headers_class(ctx)?.borrow().pairs(),
            signal,
        )
    };
    if let Some(signal) = signal {
        let inner = signal.borrow().inner.clone();
        let hook_slot = cancel_slot.clone();
        let hook = native_fn(ctx, move |ctx, _args| {
            if let Some(handle) = hook_slot.borrow_mut().take() {
                handle.cancel();
            }
            Ok(undef(&ctx))
        })?;
        register_abort_hook(ctx, &inner, hook)?;
    }

    // Buffered bodies dispatch immediately; stream bodies drain first
    // (no streaming upload).
    let body_cell = request.borrow().body.clone();
    if let Some(stream_saved) = body_cell.stream_saved() {
        body_cell.mark_used();
        let stream = stream_saved.restore(ctx)?;
        let Some(inner) = super::streams::readable_inner_of(&stream) else {
            return support::rejected_type_error(ctx, "request body is not a ReadableStream");
        };
        let done_core = core.clone();
        let done_reject = reject.clone();
        let done_method = method.clone();
        let done_url = url.clone();
        let done_headers = headers.clone();
        let done_slot = cancel_slot.clone();
        let done_resolve = resolve.clone();
        let done = native_fn(ctx, move |ctx, args| {
            let bytes = as_bytes(&arg(&ctx, &args, 0))?;
            dispatch(
                &ctx,
                &done_core,
                done_method.clone(),
                done_url.clone(),
                done_headers.clone(),
                bytes,
                timeout_ms,
                done_slot.clone(),
                done_resolve.clone(),
                done_reject.clone(),
            )?;
            Ok(undef(&ctx))
        })?;
        let fail_reject = reject;
        let fail = native_fn(ctx, move |ctx, args| {
            let reject = fail_reject.clone().restore(&ctx)?;
            reject.call::<_, ()>((arg(&ctx, &args, 0),))?;
            Ok(undef(&ctx))
        })?;
        super::body::drain_readable(ctx, inner, None, done, fail)?;
        return Ok(promise);
    }

    let bytes = body_cell
        .bytes()
        .map(|b| b.as_ref().clone())
        .unwrap_or_default();
    body_cell.mark_used();
    dispatch(
        ctx, core, method, url, headers, bytes, timeout_ms, cancel_slot, resolve, reject,
    )?;
    Ok(promise)
}

pub fn setup(ctx: &Ctx<'_>, core: &SharedCore) -> Result<()> {
    let fetch_core = core.clone();
    ctx.globals().set(
        "fetch",
        native_fn(ctx, move |ctx, args| {
            let input = arg(&ctx, &args, 0);
            let init = Opt(args.0.get(1).and_then(|v| v.as_object().cloned()));
            Ok(fetch_impl(&ctx, &fetch_core, input, init)?.into_value())
        })?
        .with_name("fetch")?,
    )?;
    Ok(())
}
