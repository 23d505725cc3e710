//! WHATWG stream plumbing: `ReadableStream`, `WritableStream`,
//! `TransformStream` and the two queuing strategies, plus the
//! workers-specific `IdentityTransformStream` / `FixedLengthStream`.
//!
//! The state machines live in Rust; the readable/writable halves of a
//! transform are two class views over one shared state cell, so there
//! are no reference cycles for the GC to chase. Underlying sources and
//! sinks — whether user-supplied JS or native hooks — are stored
//! uniformly as persistent functions.

pub(crate) mod readable;
pub(crate) mod transform;
pub(crate) mod writable;

use rquickjs::class::Trace;
use rquickjs::prelude::Opt;
use rquickjs::{Class, Ctx, Exception, Function, JsLifetime, Object, Result, Value};

pub use readable::{
    new_readable_from_bytes, new_readable_with_source, ReadableInner, ReadableStream,
    ReadableStreamBYOBReader, ReadableStreamDefaultController, ReadableStreamDefaultReader,
    SharedReadable,
};
pub use transform::{TransformStream, TransformStreamDefaultController};
pub use writable::{
    new_writable_with_sink, SharedWritable, WritableInner, WritableStream,
    WritableStreamDefaultWriter,
};

pub(crate) use transform::readable_inner_of;

/// Builds the `{value, done}` object every read settles with.
pub(crate) fn iter_result<'js>(
    ctx: &Ctx<'js>,
    value: Option<Value<'js>>,
    done: bool,
) -> Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    obj.set("value", value.unwrap_or_else(|| Value::new_undefined(ctx.clone())))?;
    obj.set("done", done)?;
    Ok(obj)
}

/// Reads `highWaterMark` out of a queuing-strategy object, tolerating a
/// `CountQueuingStrategy` / `ByteLengthQueuingStrategy` instance or any
/// plain object.
pub(crate) fn high_water_mark(strategy: &Opt<Object<'_>>, default: f64) -> f64 {
    strategy
        .0
        .as_ref()
        .and_then(|o| o.get::<_, f64>("highWaterMark").ok())
        .unwrap_or(default)
}

#[rquickjs::class]
#[derive(Trace, JsLifetime)]
pub struct CountQueuingStrategy {
    #[qjs(get, rename = "highWaterMark")]
    pub high_water_mark: f64,
}

#[rquickjs::methods]
impl CountQueuingStrategy {
    #[qjs(constructor)]
    pub fn new(ctx: Ctx<'_>, init: Object<'_>) -> Result<Self> {
        let high_water_mark: f64 = init
            .get("highWaterMark")
            .map_err(|_| Exception::throw_type(&ctx, "highWaterMark is required"))?;
        Ok(Self { high_water_mark })
    }

    pub fn size(&self) -> f64 {
        1.0
    }
}

#[rquickjs::class]
#[derive(Trace, JsLifetime)]
pub struct ByteLengthQueuingStrategy {
    #[qjs(get, rename = "highWaterMark")]
    pub high_water_mark: f64,
}

#[rquickjs::methods]
impl ByteLengthQueuingStrategy {
    #[qjs(constructor)]
    pub fn new(ctx: Ctx<'_>, init: Object<'_>) -> Result<Self> {
        let high_water_mark: f64 = init
            .get("highWaterMark")
            .map_err(|_| Exception::throw_type(&ctx, "highWaterMark is required"))?;
        Ok(Self { high_water_mark })
    }

    pub fn size(&self, chunk: Value<'_>) -> f64 {
        chunk
            .as_object()
            .and_then(|o| o.get::<_, f64>("byteLength").ok())
            .unwrap_or(1.0)
    }
}

pub fn setup(ctx: &Ctx<'_>) -> Result<()> {
    let globals = ctx.globals();
    Class::<ReadableStream>::define(&globals)?;
    Class::<ReadableStreamDefaultReader>::define(&globals)?;
    Class::<ReadableStreamBYOBReader>::define(&globals)?;
    Class::<ReadableStreamDefaultController>::define(&globals)?;
    Class::<WritableStream>::define(&globals)?;
    Class::<WritableStreamDefaultWriter>::define(&globals)?;
    Class::<TransformStream>::define(&globals)?;
    Class::<TransformStreamDefaultController>::define(&globals)?;
    Class::<CountQueuingStrategy>::define(&globals)?;
    Class::<ByteLengthQueuingStrategy>::define(&globals)?;
    transform::define_identity_classes(ctx)?;
    readable::define_statics(ctx)?;

    // `ReadableStream.prototype[Symbol.asyncIterator] = values`
    let rs_ctor: Object = globals.get("ReadableStream")?;
    let proto: Object = rs_ctor.get("prototype")?;
    let values: Function = proto.get("values")?;
    proto.set(rquickjs::atom::PredefinedAtom::SymbolAsyncIterator, values)?;
    Ok(())
}
