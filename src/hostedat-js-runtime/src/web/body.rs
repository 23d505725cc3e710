//! The body mixin shared by `Request` and `Response`.
//!
//! A body is either absent, buffered bytes, or a `ReadableStream`.
//! Consuming methods are one-shot: they flip `bodyUsed` and, for
//! stream bodies, drain the stream to completion before converting.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rquickjs::{Class, Ctx, Function, Object, Persistent, Promise, Result, Value};

use super::blob::{parse_multipart, Blob, FormData, FormEntry};
use super::streams::{new_readable_from_bytes, ReadableStream};
use super::support::{
    self, arg, as_bytes, bytes_to_array_buffer, bytes_to_js, native_fn, type_error_value, undef,
};
use super::url::{parse_query, UrlSearchParams};

type SavedVal = Persistent<Value<'static>>;

pub(crate) enum BodySource {
    None,
    Bytes(Rc<Vec<u8>>),
    Stream(SavedVal),
}

pub(crate) struct BodyCell {
    source: RefCell<BodySource>,
    used: Cell<bool>,
    stream_cache: RefCell<Option<SavedVal>>,
}

pub(crate) type SharedBody = Rc<BodyCell>;

impl BodyCell {
    pub fn none() -> SharedBody {
        Rc::new(Self {
            source: RefCell::new(BodySource::None),
            used: Cell::new(false),
            stream_cache: RefCell::new(None),
        })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> SharedBody {
        Rc::new(Self {
            source: RefCell::new(BodySource::Bytes(Rc::new(bytes))),
            used: Cell::new(false),
            stream_cache: RefCell::new(None),
        })
    }

    pub fn from_source(source: BodySource) -> SharedBody {
        Rc::new(Self {
            source: RefCell::new(source),
            used: Cell::new(false),
            stream_cache: RefCell::new(None),
        })
    }

    pub fn is_none(&self) -> bool {
        matches!(*self.source.borrow(), BodySource::None)
    }

    /// Buffered bytes, when the body never left host memory.
    pub fn bytes(&self) -> Option<Rc<Vec<u8>>> {
        match &*self.source.borrow() {
            BodySource::Bytes(b) => Some(b.clone()),
            _ => None,
        }
    }

    pub fn stream_saved(&self) -> Option<SavedVal> {
        match &*self.source.borrow() {
            BodySource::Stream(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn mark_used(&self) {
        self.used.set(true);
    }
}

/// `bodyUsed`: true after a consuming method, or while the stream view
/// of the body is locked.
pub(crate) fn body_used(ctx: &Ctx<'_>, body: &SharedBody) -> bool {
    if body.used.get() {
        return true;
    }
    let locked = |saved: &SavedVal| -> bool {
        saved
            .clone()
            .restore(ctx)
            .ok()
            .and_then(|v| super::streams::readable_inner_of(&v))
            .map(|inner| inner.borrow().locked)
            .unwrap_or(false)
    };
    if let Some(saved) = body.stream_saved() {
        return locked(&saved);
    }
    if let Some(saved) = body.stream_cache.borrow().clone() {
        return locked(&saved);
    }
    false
}

/// The `body` property: null when absent, otherwise a `ReadableStream`
/// (lazily created over buffered bytes, stable across accesses).
pub(crate) fn body_stream_value<'js>(ctx: &Ctx<'js>, body: &SharedBody) -> Result<Value<'js>> {
    match &*body.source.borrow() {
        BodySource::None => return Ok(Value::new_null(ctx.clone())),
        BodySource::Stream(saved) => return saved.clone().restore(ctx),
        BodySource::Bytes(_) => {}
    }
    if let Some(cached) = body.stream_cache.borrow().clone() {
        return cached.restore(ctx);
    }
    let bytes = body.bytes().expect("byte body checked above");
    let stream = new_readable_from_bytes(ctx, &bytes)?.into_value();
    *body.stream_cache.borrow_mut() = Some(Persistent::save(ctx, stream.clone()));
    Ok(stream)
}

/// Interprets a BodyInit value. Returns the body source plus the
/// content type the body implies (only applied when the caller did not
/// set one explicitly).
pub(crate) fn extract_body_init<'js>(
    ctx: &Ctx<'js>,
    value: Value<'js>,
) -> Result<(BodySource, Option<String>)> {
    if value.is_undefined() || value.is_null() {
        return Ok((BodySource::None, None));
    }
    if let Some(text) = value.as_string() {
        return Ok((
            BodySource::Bytes(Rc::new(text.to_string()?.into_bytes())),
            Some("text/plain;charset=UTF-8".to_string()),
        ));
    }
    if let Ok(blob) = Class::<Blob>::from_js(ctx, value.clone()) {
        let blob = blob.borrow();
        let mime = if blob.mime.is_empty() {
            None
        } else {
            Some(blob.mime.clone())
        };
        return Ok((BodySource::Bytes(blob.data.clone()), mime));
    }
    if let Ok(params) = Class::<UrlSearchParams>::from_js(ctx, value.clone()) {
        let serialised = params.borrow().serialised();
        return Ok((
            BodySource::Bytes(Rc::new(serialised.into_bytes())),
            Some("application/x-www-form-urlencoded;charset=UTF-8".to_string()),
        ));
    }
    if let Ok(form) = Class::<FormData>::from_js(ctx, value.clone()) {
        let boundary = super::blob::make_boundary();
        let entries = form.borrow().entries.borrow().clone();
        let bytes = super::blob::to_multipart(&entries, &boundary);
        return Ok((
            BodySource::Bytes(Rc::new(bytes)),
            Some(format!("multipart/form-data; boundary={boundary}")),
        ));
    }
    if Class::<ReadableStream>::from_js(ctx, value.clone()).is_ok() {
        return Ok((BodySource::Stream(Persistent::save(ctx, value)), None));
    }
    // typed arrays, DataView, ArrayBuffer
    let bytes = as_bytes(&value)?;
    Ok((BodySource::Bytes(Rc::new(bytes)), None))
}

/// Pumps a readable to completion, feeding accumulated bytes to `done`
/// (as a `Uint8Array`) or the failure to `fail`. `limit` errors the
/// drain when the total exceeds it.
pub(crate) fn drain_readable<'js>(
    ctx: &Ctx<'js>,
    inner: super::streams::SharedReadable,
    limit: Option<usize>,
    done: Function<'js>,
    fail: Function<'js>,
) -> Result<()> {
    let acc: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let done = Persistent::save(ctx, done);
    let fail = Persistent::save(ctx, fail);
    pump(ctx, inner, acc, limit, done, fail)
}

fn pump<'js>(
    ctx: &Ctx<'js>,
    inner: super::streams::SharedReadable,
    acc: Rc<RefCell<Vec<u8>>>,
    limit: Option<usize>,
    done: Persistent<Function<'static>>,
    fail: Persistent<Function<'static>>,
) -> Result<()> {
    let read = super::streams::readable::read_internal(ctx, &inner)?;
    let ok_inner = inner;
    let ok_acc = acc;
    let ok_done = done;
    let ok_fail = fail.clone();
    let on_ok = native_fn(ctx, move |ctx, args| {
        let result = arg(&ctx, &args, 0);
        let result = result
            .as_object()
            .ok_or_else(|| rquickjs::Exception::throw_type(&ctx, "malformed read result"))?
            .clone();
        let is_done: bool = result.get("done").unwrap_or(true);
        if is_done {
            let bytes = ok_acc.borrow().clone();
            let array = bytes_to_js(&ctx, &bytes)?;
            let done = ok_done.clone().restore(&ctx)?;
            done.call::<_, ()>((array,))?;
            return Ok(undef(&ctx));
        }
        let value: Value = result.get("value")?;
        let chunk = as_bytes(&value)?;
        {
            let mut acc = ok_acc.borrow_mut();
            acc.extend_from_slice(&chunk);
            if limit.is_some_and(|l| acc.len() > l) {
                drop(acc);
                let err = type_error_value(&ctx, "body exceeded the configured size limit")?;
                let fail = ok_fail.clone().restore(&ctx)?;
                fail.call::<_, ()>((err,))?;
                return Ok(undef(&ctx));
            }
        }
        pump(
            &ctx,
            ok_inner.clone(),
            ok_acc.clone(),
            limit,
            ok_done.clone(),
            ok_fail.clone(),
        )?;
        Ok(undef(&ctx))
    })?;
    let err_fail = fail;
    let on_err = native_fn(ctx, move |ctx, args| {
        let fail = err_fail.clone().restore(&ctx)?;
        fail.call::<_, ()>((arg(&ctx, &args, 0),))?;
        Ok(undef(&ctx))
    })?;
    support::then(ctx, read.into_value(), on_ok, Some(on_err))
}

/// What a consuming method converts the drained bytes into.
#[derive(Clone, Copy)]
pub(crate) enum Convert {
    Text,
    Json,
    ArrayBuffer,
    Bytes,
    Blob,
    FormData,
}

fn convert_bytes<'js>(
    ctx: &Ctx<'js>,
    bytes: &[u8],
    how: Convert,
    content_type: &str,
) -> Result<Value<'js>> {
    match how {
        Convert::Text => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            Ok(rquickjs::String::from_str(ctx.clone(), &text)?.into_value())
        }
        Convert::Json => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            ctx.json_parse(text)
        }
        Convert::ArrayBuffer => Ok(bytes_to_array_buffer(ctx, bytes)?.into_value()),
        Convert::Bytes => bytes_to_js(ctx, bytes),
        Convert::Blob => {
            let mime = content_type.split(';').next().unwrap_or("").trim();
            let blob = Blob::from_bytes(bytes.to_vec(), mime);
            Ok(Class::instance(ctx.clone(), blob)?.into_value())
        }
        Convert::FormData => {
            let lower = content_type.to_ascii_lowercase();
            if lower.starts_with("application/x-www-form-urlencoded") {
                let text = String::from_utf8_lossy(bytes);
                let entries = parse_query(&text)
                    .into_iter()
                    .map(|(k, v)| (k, FormEntry::Text(v)))
                    .collect();
                let form = FormData::from_entries(entries);
                return Ok(Class::instance(ctx.clone(), form)?.into_value());
            }
            if lower.starts_with("multipart/form-data") {
                let boundary = lower
                    .split("boundary=")
                    .nth(1)
                    .map(|b| b.split(';').next().unwrap_or(b).trim().trim_matches('"'))
                    .filter(|b| !b.is_empty())
                    .ok_or_else(|| {
                        rquickjs::Exception::throw_type(
                            ctx,
                            "multipart body is missing its boundary parameter",
                        )
                    })?;
                // the boundary token survives lower-casing only if the
                // sender used a lower-case one; re-extract from the raw
                // header to be safe
                let raw_boundary = content_type
                    .split_once("boundary=")
                    .map(|(_, b)| b.split(';').next().unwrap_or(b).trim().trim_matches('"'))
                    .unwrap_or(boundary);
                let entries = parse_multipart(bytes, raw_boundary)
                    .map_err(|e| rquickjs::Exception::throw_type(ctx, &e))?;
                let form = FormData::from_entries(entries);
                return Ok(Class::instance(ctx.clone(), form)?.into_value());
            }
            Err(rquickjs::Exception::throw_type(
                ctx,
                "body is not form data",
            ))
        }
    }
}

/// One-shot consumption. Rejects when the body was already used, flips
/// `bodyUsed`, drains stream bodies, converts, resolves.
pub(crate) fn consume<'js>(
    ctx: &Ctx<'js>,
    body: &SharedBody,
    how: Convert,
    content_type: String,
) -> Result<Promise<'js>> {
    if body_used(ctx, body) {
        return support::rejected_type_error(ctx, "body has already been used");
    }
    body.mark_used();

    // buffered (or absent) bodies convert synchronously
    let buffered: Option<Vec<u8>> = match &*body.source.borrow() {
        BodySource::None => Some(Vec::new()),
        BodySource::Bytes(b) => Some(b.as_ref().clone()),
        BodySource::Stream(_) => None,
    };
    if let Some(bytes) = buffered {
        return match convert_bytes(ctx, &bytes, how, &content_type) {
            Ok(value) => support::resolved_promise(ctx, value),
            Err(e) => {
                let err = support::caught_value(ctx, e);
                support::rejected_promise(ctx, err)
            }
        };
    }

    let saved = body.stream_saved().expect("stream body checked above");
    let stream = saved.restore(ctx)?;
    let Some(inner) = super::streams::readable_inner_of(&stream) else {
        return support::rejected_type_error(ctx, "body stream is not a ReadableStream");
    };

    let (promise, resolve, reject) = Promise::new(ctx)?;
    let resolve = Persistent::save(ctx, resolve);
    let reject_for_done = Persistent::save(ctx, reject.clone());
    let done = native_fn(ctx, move |ctx, args| {
        let array = arg(&ctx, &args, 0);
        let bytes = as_bytes(&array)?;
        match convert_bytes(&ctx, &bytes, how, &content_type) {
            Ok(value) => {
                let resolve = resolve.clone().restore(&ctx)?;
                resolve.call::<_, ()>((value,))?;
            }
            Err(e) => {
                let err = support::caught_value(&ctx, e);
                let reject = reject_for_done.clone().restore(&ctx)?;
                reject.call::<_, ()>((err,))?;
            }
        }
        Ok(undef(&ctx))
    })?;
    let reject = Persistent::save(ctx, reject);
    let fail = native_fn(ctx, move |ctx, args| {
        let reject = reject.clone().restore(&ctx)?;
        reject.call::<_, ()>((arg(&ctx, &args, 0),))?;
        Ok(undef(&ctx))
    })?;
    drain_readable(ctx, inner, None, done, fail)?;
    Ok(promise)
}

/// Splits a body for `clone()`. Buffered bodies share their bytes;
/// stream bodies are teed, with the first branch replacing the
/// original.
pub(crate) fn clone_body<'js>(ctx: &Ctx<'js>, body: &SharedBody) -> Result<SharedBody> {
    let saved = match &*body.source.borrow() {
        BodySource::None => return Ok(BodyCell::none()),
        BodySource::Bytes(b) => return Ok(BodyCell::from_source(BodySource::Bytes(b.clone()))),
        BodySource::Stream(s) => s.clone(),
    };
    let stream = saved.restore(ctx)?;
    let Some(obj) = stream.as_object() else {
        return Ok(BodyCell::none());
    };
    let branches: rquickjs::Array = support::call_method(ctx, obj, "tee", [])?;
    let first: Value = branches.get(0)?;
    let second: Value = branches.get(1)?;
    *body.source.borrow_mut() = BodySource::Stream(Persistent::save(ctx, first));
    Ok(BodyCell::from_source(BodySource::Stream(Persistent::save(
        ctx, second,
    ))))
}

use rquickjs::FromJs;
