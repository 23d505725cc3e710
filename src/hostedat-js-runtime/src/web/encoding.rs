//! `TextEncoder` / `TextDecoder` globals.
//!
//! Encoding is always UTF-8. Decoding supports every WHATWG label via
//! `encoding_rs`; the `encoding` property reports the canonical name
//! for whatever label the decoder was constructed with.

use std::cell::RefCell;

use encoding_rs::{Decoder, Encoding};
use rquickjs::class::Trace;
use rquickjs::prelude::Opt;
use rquickjs::{Class, Ctx, Exception, JsLifetime, Object, Result, TypedArray, Value};

use super::support::as_bytes;

#[rquickjs::class]
#[derive(Trace, JsLifetime)]
pub struct TextEncoder {}

#[rquickjs::methods]
impl TextEncoder {
    #[qjs(constructor)]
    pub fn new() -> Self {
        Self {}
    }

    #[qjs(get)]
    pub fn encoding(&self) -> &'static str {
        "utf-8"
    }

    pub fn encode<'js>(&self, ctx: Ctx<'js>, input: Opt<String>) -> Result<TypedArray<'js, u8>> {
        let text = input.0.unwrap_or_default();
        TypedArray::new_copy(ctx, text.as_bytes())
    }

    #[qjs(rename = "encodeInto")]
    pub fn encode_into<'js>(
        &self,
        ctx: Ctx<'js>,
        input: String,
        destination: Value<'js>,
    ) -> Result<Object<'js>> {
        let Some(obj) = destination.as_object() else {
            return Err(Exception::throw_type(&ctx, "destination must be a Uint8Array"));
        };
        if obj.as_typed_array::<u8>().is_none() {
            return Err(Exception::throw_type(&ctx, "destination must be a Uint8Array"));
        }
        let buffer: rquickjs::ArrayBuffer = obj.get("buffer")?;
        let offset: usize = obj.get("byteOffset").unwrap_or(0);
        let capacity: usize = obj.get("byteLength").unwrap_or(0);

        let mut read = 0usize;
        let mut written = 0usize;
        let mut encoded = Vec::with_capacity(capacity);
        for ch in input.chars() {
            let mut buf = [0u8; 4];
            let bytes = ch.encode_utf8(&mut buf).as_bytes();
            if written + bytes.len() > capacity {
                break;
            }
            encoded.extend_from_slice(bytes);
            written += bytes.len();
            read += ch.len_utf16();
        }

        // The destination's backing store is only reachable through the
        // raw buffer pointer; the borrow of `obj` keeps it alive.
        if let Some(raw) = buffer.as_raw() {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    encoded.as_ptr(),
                    raw.ptr.as_ptr().add(offset),
                    written,
                );
            }
        }

        let result = Object::new(ctx)?;
        result.set("read", read)?;
        result.set("written", written)?;
        Ok(result)
    }
}

#[rquickjs::class]
#[derive(JsLifetime)]
pub struct TextDecoder {
    #[qjs(skip_trace)]
    encoding: &'static Encoding,
    #[qjs(skip_trace)]
    decoder: RefCell<Option<Decoder>>,
    fatal: bool,
    ignore_bom: bool,
}

impl<'js> Trace<'js> for TextDecoder {
    fn trace<'a>(&self, _tracer: rquickjs::class::Tracer<'a, 'js>) {}
}

impl TextDecoder {
    fn fresh_decoder(&self) -> Decoder {
        if self.ignore_bom {
            self.encoding.new_decoder_without_bom_handling()
        } else {
            self.encoding.new_decoder_with_bom_removal()
        }
    }
}

#[rquickjs::methods]
impl TextDecoder {
    #[qjs(constructor)]
    pub fn new(ctx: Ctx<'_>, label: Opt<String>, options: Opt<Object<'_>>) -> Result<Self> {
        let label = label.0.unwrap_or_else(|| "utf-8".to_string());
        let encoding = Encoding::for_label(label.trim().as_bytes()).ok_or_else(|| {
            Exception::throw_range(&ctx, &format!("unknown encoding label {label:?}"))
        })?;
        let (fatal, ignore_bom) = match options.0 {
            Some(opts) => (
                opts.get("fatal").unwrap_or(false),
                opts.get("ignoreBOM").unwrap_or(false),
            ),
            None => (false, false),
        };
        Ok(Self {
            encoding,
            decoder: RefCell::new(None),
            fatal,
            ignore_bom,
        })
    }

    #[qjs(get)]
    pub fn encoding(&self) -> String {
        self.encoding.name().to_ascii_lowercase()
    }

    #[qjs(get)]
    pub fn fatal(&self) -> bool {
        self.fatal
    }

    #[qjs(get, rename = "ignoreBOM")]
    pub fn ignore_bom(&self) -> bool {
        self.ignore_bom
    }

    pub fn decode(
        &self,
        ctx: Ctx<'_>,
        input: Opt<Value<'_>>,
        options: Opt<Object<'_>>,
    ) -> Result<String> {
        let bytes = match input.0 {
            Some(v) if !v.is_undefined() && !v.is_null() => as_bytes(&v)?,
            _ => Vec::new(),
        };
        let stream = options
            .0
            .map(|o| o.get("stream").unwrap_or(false))
            .unwrap_or(false);

        let mut slot = self.decoder.borrow_mut();
        let decoder = slot.get_or_insert_with(|| self.fresh_decoder());

        let mut out = String::with_capacity(
            decoder
                .max_utf8_buffer_length(bytes.len())
                .unwrap_or(bytes.len() + 4),
        );
        let last = !stream;
        let (_result, _read, had_errors) = decoder.decode_to_string(&bytes, &mut out, last);
        if last {
            *slot = None;
        }
        if had_errors && self.fatal {
            return Err(Exception::throw_type(&ctx, "the encoded data was not valid"));
        }
        Ok(out)
    }
}

pub fn setup(ctx: &Ctx<'_>) -> Result<()> {
    let globals = ctx.globals();
    Class::<TextEncoder>::define(&globals)?;
    Class::<TextDecoder>::define(&globals)?;
    Ok(())
}
