//! `console` wired into the per-request log buffer.
//!
//! Arguments are joined with spaces; plain values coerce, objects are
//! JSON-stringified so log lines stay greppable. Every record also
//! mirrors to host tracing at debug level.

use hostedat_js_common::LogLevel;
use rquickjs::prelude::Rest;
use rquickjs::{Coerced, Ctx, Function, Object, Result, Value};

use super::support::{native_fn, undef};
use crate::core::SharedCore;

fn format_args<'js>(ctx: &Ctx<'js>, args: &Rest<Value<'js>>) -> String {
    let mut parts = Vec::with_capacity(args.0.len());
    for value in &args.0 {
        if value.is_object() && !value.is_function() {
            if let Ok(Some(json)) = ctx.json_stringify(value.clone()) {
                if let Ok(json) = json.to_string() {
                    parts.push(json);
                    continue;
                }
            }
        }
        match Coerced::<String>::from_js(ctx, value.clone()) {
            Ok(text) => parts.push(text.0),
            Err(_) => parts.push("<unprintable>".to_string()),
        }
    }
    parts.join(" ")
}

fn log_fn<'js>(ctx: &Ctx<'js>, core: &SharedCore, level: LogLevel) -> Result<Function<'js>> {
    let core = core.clone();
    native_fn(ctx, move |ctx, args| {
        let message = format_args(&ctx, &args);
        tracing::debug!(target: "worker", level = ?level, "{message}");
        if let Ok(request) = core.borrow_mut().request_mut() {
            request.log(level, message);
        }
        Ok(undef(&ctx))
    })
}

pub fn setup(ctx: &Ctx<'_>, core: &SharedCore) -> Result<()> {
    let console = Object::new(ctx.clone())?;
    console.set("log", log_fn(ctx, core, LogLevel::Log)?)?;
    console.set("info", log_fn(ctx, core, LogLevel::Info)?)?;
    console.set("warn", log_fn(ctx, core, LogLevel::Warn)?)?;
    console.set("error", log_fn(ctx, core, LogLevel::Error)?)?;
    console.set("debug", log_fn(ctx, core, LogLevel::Debug)?)?;
    ctx.globals().set("console", console)?;
    Ok(())
}

use rquickjs::FromJs;
