//! Small global odds and ends: `structuredClone`, `reportError`,
//! `navigator.userAgent`.

use hostedat_js_common::LogLevel;
use rquickjs::{Ctx, Object, Result};

use super::events::throw_dom;
use super::support::{arg, native_fn, undef};
use crate::core::SharedCore;

pub fn setup(ctx: &Ctx<'_>, core: &SharedCore) -> Result<()> {
    let globals = ctx.globals();

    // JSON-semantics clone: plain data round-trips, functions throw
    globals.set(
        "structuredClone",
        native_fn(ctx, |ctx, args| {
            let value = arg(&ctx, &args, 0);
            if value.is_function() {
                return Err(throw_dom(
                    &ctx,
                    "DataCloneError",
                    "function objects cannot be cloned",
                ));
            }
            if value.is_undefined() || value.is_null() {
                return Ok(value);
            }
            let json = ctx
                .json_stringify(value)?
                .ok_or_else(|| throw_dom(&ctx, "DataCloneError", "value cannot be cloned"))?
                .to_string()?;
            ctx.json_parse(json)
        })?
        .with_name("structuredClone")?,
    )?;

    let report_core = core.clone();
    globals.set(
        "reportError",
        native_fn(ctx, move |ctx, args| {
            let err = arg(&ctx, &args, 0);
            let message = err
                .as_object()
                .and_then(|o| o.get::<_, String>("message").ok())
                .or_else(|| err.as_string().and_then(|s| s.to_string().ok()))
                .unwrap_or_else(|| "uncaught error".to_string());
            if let Ok(request) = report_core.borrow_mut().request_mut() {
                request.log(LogLevel::Error, message);
            }
            Ok(undef(&ctx))
        })?
        .with_name("reportError")?,
    )?;

    let navigator = Object::new(ctx.clone())?;
    navigator.set("userAgent", "HostedAt-Workers")?;
    globals.set("navigator", navigator)?;

    Ok(())
}
