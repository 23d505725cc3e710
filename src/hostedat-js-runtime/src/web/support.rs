//! Conversion helpers shared by the web-platform bindings.

use rquickjs::function::{Args, Constructor};
use rquickjs::prelude::Rest;
use rquickjs::{
    ArrayBuffer, Ctx, Exception, FromJs, Function, Object, Promise, Result, TypedArray, Value,
};

/// Rust cannot infer the higher-ranked lifetime of a bare closure
/// (rust-lang/rust#97362): this identity function pins the closure to
/// the signature where the returned `Value` borrows from the `Ctx`
/// argument.
fn coerce_fn_signature<F>(f: F) -> F
where
    F: for<'a> Fn(Ctx<'a>, Rest<Value<'a>>) -> Result<Value<'a>>,
{
    f
}

/// Builds a JS function from a native callback. Every hand-rolled
/// callback in the web layer uses this one uniform shape — positional
/// args arrive through `Rest`, results go back as a `Value`.
pub fn native_fn<'js, F>(ctx: &Ctx<'js>, f: F) -> Result<Function<'js>>
where
    F: for<'a> Fn(Ctx<'a>, Rest<Value<'a>>) -> Result<Value<'a>> + 'static,
{
    Function::new(ctx.clone(), coerce_fn_signature(f))
}

/// `undefined`, as a value.
pub fn undef<'js>(ctx: &Ctx<'js>) -> Value<'js> {
    Value::new_undefined(ctx.clone())
}

/// Positional argument or `undefined`.
pub fn arg<'js>(ctx: &Ctx<'js>, args: &Rest<Value<'js>>, index: usize) -> Value<'js> {
    args.0.get(index).cloned().unwrap_or_else(|| undef(ctx))
}

/// Calls `method` on `target` with `this` bound, mirroring a JS
/// `target.method(...)` call.
pub fn call_method<'js, R: FromJs<'js>>(
    ctx: &Ctx<'js>,
    target: &Object<'js>,
    method: &str,
    args_values: impl IntoIterator<Item = Value<'js>>,
) -> Result<R> {
    let f: Function = target.get(method)?;
    let values: Vec<Value> = args_values.into_iter().collect();
    let mut args = Args::new(ctx.clone(), values.len());
    args.this(target.clone())?;
    for v in values {
        args.push_arg(v)?;
    }
    f.call_arg(args)
}

/// Converts a JavaScript value to a byte vector.
/// Accepts a String, any typed array / DataView, or an ArrayBuffer.
pub fn as_bytes(value: &Value<'_>) -> Result<Vec<u8>> {
    if let Some(txt) = value.as_string() {
        return Ok(txt.to_string()?.into_bytes());
    }

    if let Some(obj) = value.as_object() {
        if let Some(array) = obj.as_typed_array::<u8>() {
            if let Some(bytes) = array.as_bytes() {
                return Ok(bytes.to_vec());
            }
        }
        // Other typed arrays and DataView: go through the backing
        // buffer with the view's offset and length.
        if let Ok(buffer) = obj.get::<_, ArrayBuffer>("buffer") {
            let offset: usize = obj.get("byteOffset").unwrap_or(0);
            let length: usize = obj.get("byteLength").unwrap_or(0);
            if let Some(bytes) = buffer.as_bytes() {
                let end = (offset + length).min(bytes.len());
                return Ok(bytes[offset.min(end)..end].to_vec());
            }
        }
    }

    if let Ok(buffer) = ArrayBuffer::from_js(value.ctx(), value.clone()) {
        if let Some(bytes) = buffer.as_bytes() {
            return Ok(bytes.to_vec());
        }
    }

    Err(Exception::throw_type(
        value.ctx(),
        "expected a string, ArrayBuffer or ArrayBuffer view",
    ))
}

/// Wraps bytes as a `Uint8Array`.
pub fn bytes_to_js<'js>(ctx: &Ctx<'js>, bytes: &[u8]) -> Result<Value<'js>> {
    Ok(TypedArray::<u8>::new_copy(ctx.clone(), bytes)?
        .as_value()
        .clone())
}

/// Wraps bytes as an `ArrayBuffer`.
pub fn bytes_to_array_buffer<'js>(ctx: &Ctx<'js>, bytes: &[u8]) -> Result<ArrayBuffer<'js>> {
    ArrayBuffer::new_copy(ctx.clone(), bytes)
}

/// A promise already resolved with `value`.
pub fn resolved_promise<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<Promise<'js>> {
    let (promise, resolve, _reject) = Promise::new(ctx)?;
    resolve.call::<_, ()>((value,))?;
    Ok(promise)
}

/// A promise already rejected with `value`.
pub fn rejected_promise<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<Promise<'js>> {
    let (promise, _resolve, reject) = Promise::new(ctx)?;
    reject.call::<_, ()>((value,))?;
    Ok(promise)
}

/// A promise rejected with `new TypeError(message)`.
pub fn rejected_type_error<'js>(ctx: &Ctx<'js>, message: &str) -> Result<Promise<'js>> {
    let err = type_error_value(ctx, message)?;
    rejected_promise(ctx, err)
}

/// Builds a `TypeError` instance without throwing it.
pub fn type_error_value<'js>(ctx: &Ctx<'js>, message: &str) -> Result<Value<'js>> {
    let ctor: Constructor = ctx.globals().get("TypeError")?;
    ctor.construct((message,))
}

/// Builds an `Error` instance without throwing it.
pub fn error_value<'js>(ctx: &Ctx<'js>, message: &str) -> Result<Value<'js>> {
    let ctor: Constructor = ctx.globals().get("Error")?;
    ctor.construct((message,))
}

/// `Promise.resolve(value).then(on_ok, on_err)` — normalises both plain
/// values and thenables onto the microtask queue.
pub fn then<'js>(
    ctx: &Ctx<'js>,
    value: Value<'js>,
    on_ok: Function<'js>,
    on_err: Option<Function<'js>>,
) -> Result<()> {
    let promise_ctor: Object = ctx.globals().get("Promise")?;
    let resolve: Function = promise_ctor.get("resolve")?;
    let mut args = Args::new(ctx.clone(), 1);
    args.this(promise_ctor.clone())?;
    args.push_arg(value)?;
    let promise: Object = resolve.call_arg(args)?;
    let then_fn: Function = promise.get("then")?;
    let mut targs = Args::new(ctx.clone(), 2);
    targs.this(promise)?;
    targs.push_arg(on_ok)?;
    match on_err {
        Some(f) => targs.push_arg(f)?,
        None => targs.push_arg(Value::new_undefined(ctx.clone()))?,
    }
    then_fn.call_arg::<()>(targs)?;
    Ok(())
}

/// Chains a mapping step onto a promise-like value: the returned
/// promise resolves with `mapper(value)` and propagates rejections.
pub fn map_promise<'js, F>(ctx: &Ctx<'js>, input: Value<'js>, mapper: F) -> Result<Promise<'js>>
where
    F: for<'a> Fn(Ctx<'a>, Value<'a>) -> Result<Value<'a>> + 'static,
{
    let (promise, resolve, reject) = Promise::new(ctx)?;
    let resolve = rquickjs::Persistent::save(ctx, resolve);
    let reject_ok = rquickjs::Persistent::save(ctx, reject.clone());
    let on_ok = native_fn(ctx, move |ctx, args| {
        let value = arg(&ctx, &args, 0);
        match mapper(ctx.clone(), value) {
            Ok(mapped) => {
                let resolve = resolve.clone().restore(&ctx)?;
                resolve.call::<_, ()>((mapped,))?;
            }
            Err(e) => {
                let err = caught_value(&ctx, e);
                let reject = reject_ok.clone().restore(&ctx)?;
                reject.call::<_, ()>((err,))?;
            }
        }
        Ok(undef(&ctx))
    })?;
    let reject = rquickjs::Persistent::save(ctx, reject);
    let on_err = native_fn(ctx, move |ctx, args| {
        let reject = reject.clone().restore(&ctx)?;
        reject.call::<_, ()>((arg(&ctx, &args, 0),))?;
        Ok(undef(&ctx))
    })?;
    then(ctx, input, on_ok, Some(on_err))?;
    Ok(promise)
}

/// Converts a raised error into the thrown JS value, catching a
/// pending exception off the context when there is one.
pub fn caught_value<'js>(ctx: &Ctx<'js>, err: rquickjs::Error) -> Value<'js> {
    if err.is_exception() {
        ctx.catch()
    } else {
        error_value(ctx, &err.to_string()).unwrap_or_else(|_| Value::new_undefined(ctx.clone()))
    }
}

/// Attaches a no-op rejection handler so a promise whose outcome is
/// reported elsewhere does not trip unhandled-rejection tracking.
pub fn swallow_rejection<'js>(ctx: &Ctx<'js>, promise: Value<'js>) -> Result<()> {
    let noop = Function::new(ctx.clone(), |_err: Value<'_>| {})?;
    let ok = Function::new(ctx.clone(), |_v: Value<'_>| {})?;
    then(ctx, promise, ok, Some(noop))
}

/// Extracts the message of a pending exception for logging, clearing
/// the error so later calls on the context are not confused by it.
pub fn describe_caught(ctx: &Ctx<'_>, err: rquickjs::Error) -> String {
    if err.is_exception() {
        let caught = ctx.catch();
        if let Some(exc) = caught.as_exception() {
            let message = exc.message().unwrap_or_default();
            return if message.is_empty() {
                "uncaught exception".to_string()
            } else {
                message
            };
        }
        if let Some(s) = caught.as_string() {
            if let Ok(s) = s.to_string() {
                return s;
            }
        }
        return format!("{caught:?}");
    }
    err.to_string()
}
