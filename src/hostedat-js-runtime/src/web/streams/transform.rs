//! `TransformStream` and friends.
//!
//! The writable and readable halves are wired through shared state
//! cells rather than object references: the writable's sink callbacks
//! push into the readable's queue, so neither half owns the other.

use std::cell::Cell;
use std::rc::Rc;

use rquickjs::class::Trace;
use rquickjs::prelude::Opt;
use rquickjs::{
    Class, Ctx, Exception, Function, JsLifetime, Object, Persistent, Promise, Result, Value,
};

use super::readable::{
    self, enqueue_chunk, error_stream, new_readable_with_source, request_close, ReadableStream,
    SharedReadable,
};
use super::writable::{error_writable, new_writable_with_sink, SharedWritable};
use super::high_water_mark;
use crate::web::support::{self, arg, as_bytes, bytes_to_js, native_fn, type_error_value, undef};

type SavedVal = Persistent<Value<'static>>;

#[rquickjs::class]
#[derive(Trace, JsLifetime)]
pub struct TransformStream {
    #[qjs(skip_trace)]
    readable: SavedVal,
    #[qjs(skip_trace)]
    writable: SavedVal,
}

#[rquickjs::methods]
impl TransformStream {
    #[qjs(constructor)]
    pub fn new<'js>(
        ctx: Ctx<'js>,
        transformer: Opt<Object<'js>>,
        writable_strategy: Opt<Object<'js>>,
        readable_strategy: Opt<Object<'js>>,
    ) -> Result<Self> {
        let readable_hwm = high_water_mark(&readable_strategy, 0.0);
        let writable_hwm = high_water_mark(&writable_strategy, 1.0);

        let transform_fn = transformer
            .0
            .as_ref()
            .and_then(|t| t.get::<_, Function>("transform").ok());
        let flush_fn = transformer
            .0
            .as_ref()
            .and_then(|t| t.get::<_, Function>("flush").ok());

        let (readable, writable) = transform_pair(
            &ctx,
            transform_fn,
            flush_fn,
            readable_hwm,
            writable_hwm,
            LengthRule::None,
        )?;
        Ok(Self {
            readable: Persistent::save(&ctx, readable),
            writable: Persistent::save(&ctx, writable),
        })
    }

    #[qjs(get)]
    pub fn readable<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        self.readable.clone().restore(&ctx)
    }

    #[qjs(get)]
    pub fn writable<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        self.writable.clone().restore(&ctx)
    }
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct TransformStreamDefaultController {
    #[qjs(skip_trace)]
    readable: SharedReadable,
    #[qjs(skip_trace)]
    writable: SharedWritable,
}

#[rquickjs::methods]
impl TransformStreamDefaultController {
    #[qjs(get, rename = "desiredSize")]
    pub fn desired_size(&self) -> Option<f64> {
        // mirrors the readable side's remaining appetite
        Some(1.0)
    }

    pub fn enqueue<'js>(&self, ctx: Ctx<'js>, chunk: Value<'js>) -> Result<()> {
        enqueue_chunk(&ctx, &self.readable, chunk)
    }

    pub fn error<'js>(&self, ctx: Ctx<'js>, reason: Opt<Value<'js>>) -> Result<()> {
        let reason = reason.0.unwrap_or_else(|| undef(&ctx));
        error_stream(&ctx, &self.readable, reason.clone())?;
        error_writable(&ctx, &self.writable, reason)
    }

    pub fn terminate(&self, ctx: Ctx<'_>) -> Result<()> {
        request_close(&ctx, &self.readable)?;
        let err = type_error_value(&ctx, "stream was terminated")?;
        error_writable(&ctx, &self.writable, err)
    }
}

#[derive(Clone, Copy)]
enum LengthRule {
    None,
    /// Identity over bytes; total written must equal the expected
    /// length exactly.
    Exact(u64),
}

/// Wires up a writable/readable pair through an optional transformer.
/// Returns the two class instances as values.
fn transform_pair<'js>(
    ctx: &Ctx<'js>,
    transform_fn: Option<Function<'js>>,
    flush_fn: Option<Function<'js>>,
    readable_hwm: f64,
    writable_hwm: f64,
    rule: LengthRule,
) -> Result<(Value<'js>, Value<'js>)> {
    let readable = new_readable_with_source(ctx, None, None, readable_hwm)?;
    let rs_inner: SharedReadable = readable.borrow().inner.clone();

    let transform_saved = transform_fn.map(|f| Persistent::save(ctx, f));
    let flush_saved = flush_fn.map(|f| Persistent::save(ctx, f));
    let flushed = Rc::new(Cell::new(false));
    let written = Rc::new(Cell::new(0u64));

    // sink.write
    let write_rs = rs_inner.clone();
    let write_written = written.clone();
    let write_transform = transform_saved.clone();
    let ws_for_ctrl: Rc<std::cell::RefCell<Option<SharedWritable>>> =
        Rc::new(std::cell::RefCell::new(None));
    let ws_ctrl_write = ws_for_ctrl.clone();
    let sink_write = native_fn(ctx, move |ctx, args| {
        let chunk = arg(&ctx, &args, 0);
        match &write_transform {
            Some(transform) => {
                let transform = transform.clone().restore(&ctx)?;
                let controller = Class::instance(
                    ctx.clone(),
                    TransformStreamDefaultController {
                        readable: write_rs.clone(),
                        writable: ws_ctrl_write
                            .borrow()
                            .clone()
                            .expect("writable is wired before any write"),
                    },
                )?;
                // the transformer's (maybe-)promise is returned so the
                // writable waits for it
                transform.call((chunk, controller))
            }
            None => {
                if let LengthRule::Exact(expected) = rule {
                    let bytes = as_bytes(&chunk)?;
                    let total = write_written.get() + bytes.len() as u64;
                    if total > expected {
                        return Err(Exception::throw_type(
                            &ctx,
                            "attempt to write more bytes than the stream's fixed length",
                        ));
                    }
                    write_written.set(total);
                    let chunk = bytes_to_js(&ctx, &bytes)?;
                    enqueue_chunk(&ctx, &write_rs, chunk)?;
                } else {
                    enqueue_chunk(&ctx, &write_rs, chunk)?;
                }
                Ok(undef(&ctx))
            }
        }
    })?;

    // sink.close — flush exactly once, forward its output, then close
    // the readable side
    let close_rs = rs_inner.clone();
    let close_written = written;
    let ws_ctrl_close = ws_for_ctrl.clone();
    let sink_close = native_fn(ctx, move |ctx, _args| {
        if flushed.replace(true) {
            return Ok(undef(&ctx));
        }
        if let LengthRule::Exact(expected) = rule {
            if close_written.get() != expected {
                let err = type_error_value(
                    &ctx,
                    "stream closed before reaching its fixed length",
                )?;
                error_stream(&ctx, &close_rs, err.clone())?;
                return Err(ctx.throw(err));
            }
        }
        match &flush_saved {
            None => {
                request_close(&ctx, &close_rs)?;
                Ok(undef(&ctx))
            }
            Some(flush) => {
                let flush = flush.clone().restore(&ctx)?;
                let controller = Class::instance(
                    ctx.clone(),
                    TransformStreamDefaultController {
                        readable: close_rs.clone(),
                        writable: ws_ctrl_close
                            .borrow()
                            .clone()
                            .expect("writable is wired before close"),
                    },
                )?;
                let result: Value = flush.call((controller,))?;
                let (promise, resolve, reject) = Promise::new(&ctx)?;
                let ok_rs = close_rs.clone();
                let resolve = Persistent::save(&ctx, resolve);
                let on_ok = native_fn(&ctx, move |ctx, _args| {
                    request_close(&ctx, &ok_rs)?;
                    let resolve = resolve.clone().restore(&ctx)?;
                    resolve.call::<_, ()>((undef(&ctx),))?;
                    Ok(undef(&ctx))
                })?;
                let err_rs = close_rs.clone();
                let reject = Persistent::save(&ctx, reject);
                let on_err = native_fn(&ctx, move |ctx, args| {
                    let err = arg(&ctx, &args, 0);
                    error_stream(&ctx, &err_rs, err.clone())?;
                    let reject = reject.clone().restore(&ctx)?;
                    reject.call::<_, ()>((err,))?;
                    Ok(undef(&ctx))
                })?;
                support::then(&ctx, result, on_ok, Some(on_err))?;
                Ok(promise.into_value())
            }
        }
    })?;

    // sink.abort — error the readable side
    let abort_rs = rs_inner.clone();
    let sink_abort = native_fn(ctx, move |ctx, args| {
        error_stream(&ctx, &abort_rs, arg(&ctx, &args, 0))?;
        Ok(undef(&ctx))
    })?;

    let writable =
        new_writable_with_sink(ctx, Some(sink_write), Some(sink_close), Some(sink_abort), {
            writable_hwm
        })?;
    let ws_inner: SharedWritable = writable.borrow().inner.clone();
    *ws_for_ctrl.borrow_mut() = Some(ws_inner.clone());

    // readable cancel -> error the writable side
    let cancel_ws = ws_inner;
    let readable_cancel = native_fn(ctx, move |ctx, args| {
        error_writable(&ctx, &cancel_ws, arg(&ctx, &args, 0))?;
        Ok(undef(&ctx))
    })?;
    set_readable_cancel(ctx, &rs_inner, readable_cancel);

    Ok((readable.into_value(), writable.into_value()))
}

fn set_readable_cancel<'js>(ctx: &Ctx<'js>, inner: &SharedReadable, cancel: Function<'js>) {
    readable::set_cancel_fn(ctx, inner, cancel);
}

#[rquickjs::class]
#[derive(Trace, JsLifetime)]
pub struct IdentityTransformStream {
    #[qjs(skip_trace)]
    readable: SavedVal,
    #[qjs(skip_trace)]
    writable: SavedVal,
}

#[rquickjs::methods]
impl IdentityTransformStream {
    #[qjs(constructor)]
    pub fn new(ctx: Ctx<'_>) -> Result<Self> {
        let (readable, writable) = transform_pair(&ctx, None, None, 0.0, 1.0, LengthRule::None)?;
        Ok(Self {
            readable: Persistent::save(&ctx, readable),
            writable: Persistent::save(&ctx, writable),
        })
    }

    #[qjs(get)]
    pub fn readable<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        self.readable.clone().restore(&ctx)
    }

    #[qjs(get)]
    pub fn writable<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        self.writable.clone().restore(&ctx)
    }
}

#[rquickjs::class]
#[derive(Trace, JsLifetime)]
pub struct FixedLengthStream {
    #[qjs(skip_trace)]
    readable: SavedVal,
    #[qjs(skip_trace)]
    writable: SavedVal,
    expected: u64,
}

#[rquickjs::methods]
impl FixedLengthStream {
    #[qjs(constructor)]
    pub fn new(ctx: Ctx<'_>, expected_length: f64) -> Result<Self> {
        if !expected_length.is_finite() || expected_length < 0.0 {
            return Err(Exception::throw_type(
                &ctx,
                "FixedLengthStream requires a non-negative length",
            ));
        }
        let expected = expected_length as u64;
        let (readable, writable) =
            transform_pair(&ctx, None, None, 0.0, 1.0, LengthRule::Exact(expected))?;
        Ok(Self {
            readable: Persistent::save(&ctx, readable),
            writable: Persistent::save(&ctx, writable),
            expected,
        })
    }

    #[qjs(get, rename = "expectedLength")]
    pub fn expected_length(&self) -> f64 {
        self.expected as f64
    }

    #[qjs(get)]
    pub fn readable<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        self.readable.clone().restore(&ctx)
    }

    #[qjs(get)]
    pub fn writable<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        self.writable.clone().restore(&ctx)
    }
}

pub(crate) fn define_identity_classes(ctx: &Ctx<'_>) -> Result<()> {
    let globals = ctx.globals();
    Class::<IdentityTransformStream>::define(&globals)?;
    Class::<FixedLengthStream>::define(&globals)?;
    Ok(())
}

/// Builds a transform pair around native transform/flush callbacks;
/// the text stream classes use this.
pub(crate) fn transform_pair_with_native<'js>(
    ctx: &Ctx<'js>,
    transform: Function<'js>,
    flush: Option<Function<'js>>,
) -> Result<(Value<'js>, Value<'js>)> {
    transform_pair(ctx, Some(transform), flush, 0.0, 1.0, LengthRule::None)
}

/// The shared readable cell behind a `ReadableStream` class value.
pub(crate) fn readable_inner_of(value: &Value<'_>) -> Option<SharedReadable> {
    use rquickjs::FromJs;
    let class = Class::<ReadableStream>::from_js(value.ctx(), value.clone()).ok()?;
    let inner = class.borrow().inner.clone();
    Some(inner)
}

