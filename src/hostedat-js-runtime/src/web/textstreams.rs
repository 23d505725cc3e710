//! `TextEncoderStream` / `TextDecoderStream` on top of the transform
//! machinery.

use std::cell::RefCell;
use std::rc::Rc;

use encoding_rs::{Decoder, Encoding};
use rquickjs::class::Trace;
use rquickjs::prelude::Opt;
use rquickjs::{Class, Ctx, Exception, JsLifetime, Persistent, Result, Value};

use super::streams::transform::transform_pair_with_native;
use super::support::{arg, as_bytes, bytes_to_js, native_fn, undef};

type SavedVal = Persistent<Value<'static>>;

#[rquickjs::class]
#[derive(Trace, JsLifetime)]
pub struct TextEncoderStream {
    #[qjs(skip_trace)]
    readable: SavedVal,
    #[qjs(skip_trace)]
    writable: SavedVal,
}

#[rquickjs::methods]
impl TextEncoderStream {
    #[qjs(constructor)]
    pub fn new(ctx: Ctx<'_>) -> Result<Self> {
        let transform = native_fn(&ctx, |ctx, args| {
            let chunk = arg(&ctx, &args, 0);
            let controller = arg(&ctx, &args, 1);
            let controller = controller
                .as_object()
                .ok_or_else(|| Exception::throw_type(&ctx, "missing controller"))?
                .clone();
            let text: String = rquickjs::Coerced::<String>::from_js(&ctx, chunk)?.0;
            let bytes = bytes_to_js(&ctx, text.as_bytes())?;
            super::support::call_method::<()>(&ctx, &controller, "enqueue", [bytes])?;
            Ok(undef(&ctx))
        })?;
        let (readable, writable) = transform_pair_with_native(&ctx, transform, None)?;
        Ok(Self {
            readable: Persistent::save(&ctx, readable),
            writable: Persistent::save(&ctx, writable),
        })
    }

    #[qjs(get)]
    pub fn encoding(&self) -> &'static str {
        "utf-8"
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
pub struct TextDecoderStream {
    #[qjs(skip_trace)]
    readable: SavedVal,
    #[qjs(skip_trace)]
    writable: SavedVal,
    #[qjs(skip_trace)]
    label: String,
}

#[rquickjs::methods]
impl TextDecoderStream {
    #[qjs(constructor)]
    pub fn new(ctx: Ctx<'_>, label: Opt<String>) -> Result<Self> {
        let label = label.0.unwrap_or_else(|| "utf-8".to_string());
        let encoding = Encoding::for_label(label.trim().as_bytes()).ok_or_else(|| {
            Exception::throw_range(&ctx, &format!("unknown encoding label {label:?}"))
        })?;
        let decoder: Rc<RefCell<Decoder>> =
            Rc::new(RefCell::new(encoding.new_decoder_with_bom_removal()));

        let transform_decoder = decoder.clone();
        let transform = native_fn(&ctx, move |ctx, args| {
            let chunk = arg(&ctx, &args, 0);
            let controller = arg(&ctx, &args, 1);
            let controller = controller
                .as_object()
                .ok_or_else(|| Exception::throw_type(&ctx, "missing controller"))?
                .clone();
            let bytes = as_bytes(&chunk)?;
            let mut decoder = transform_decoder.borrow_mut();
            let mut out = String::with_capacity(
                decoder
                    .max_utf8_buffer_length(bytes.len())
                    .unwrap_or(bytes.len() + 4),
            );
            let _ = decoder.decode_to_string(&bytes, &mut out, false);
            if !out.is_empty() {
                let text = rquickjs::String::from_str(ctx.clone(), &out)?.into_value();
                super::support::call_method::<()>(&ctx, &controller, "enqueue", [text])?;
            }
            Ok(undef(&ctx))
        })?;

        let flush_decoder = decoder;
        let flush = native_fn(&ctx, move |ctx, args| {
            let controller = arg(&ctx, &args, 0);
            let controller = controller
                .as_object()
                .ok_or_else(|| Exception::throw_type(&ctx, "missing controller"))?
                .clone();
            let mut decoder = flush_decoder.borrow_mut();
            let mut out = String::with_capacity(4);
            let _ = decoder.decode_to_string(&[], &mut out, true);
            if !out.is_empty() {
                let text = rquickjs::String::from_str(ctx.clone(), &out)?.into_value();
                super::support::call_method::<()>(&ctx, &controller, "enqueue", [text])?;
            }
            Ok(undef(&ctx))
        })?;

        let (readable, writable) = transform_pair_with_native(&ctx, transform, Some(flush))?;
        Ok(Self {
            readable: Persistent::save(&ctx, readable),
            writable: Persistent::save(&ctx, writable),
            label: encoding.name().to_ascii_lowercase(),
        })
    }

    #[qjs(get)]
    pub fn encoding(&self) -> String {
        self.label.clone()
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

pub fn setup(ctx: &Ctx<'_>) -> Result<()> {
    let globals = ctx.globals();
    Class::<TextEncoderStream>::define(&globals)?;
    Class::<TextDecoderStream>::define(&globals)?;
    Ok(())
}

use rquickjs::FromJs;
