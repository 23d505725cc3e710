//! `setTimeout` / `setInterval` / `clearTimeout` / `clearInterval` and
//! `queueMicrotask`.
//!
//! Timer ids are monotonic per isolate. Zero-delay timers fire after
//! the current microtask drain; equal deadlines fire in insertion
//! order. Clearing an id that is currently being invoked is a no-op.

use std::time::Duration;

use rquickjs::prelude::Rest;
use rquickjs::{Ctx, Exception, Function, Persistent, Result, Value};

use super::support::{self, arg, native_fn, undef};
use crate::core::SharedCore;

fn schedule<'js>(
    ctx: &Ctx<'js>,
    core: &SharedCore,
    args: &Rest<Value<'js>>,
    repeating: bool,
) -> Result<f64> {
    let callback = arg(ctx, args, 0);
    let Ok(callback) = Function::from_js(ctx, callback) else {
        return Err(Exception::throw_type(ctx, "callback must be a function"));
    };
    let delay_ms = args
        .0
        .get(1)
        .and_then(|v| v.as_number())
        .unwrap_or(0.0)
        .max(0.0) as u64;

    // Extra args are bound into the invocation.
    let bound: Vec<Persistent<Value<'static>>> = args.0[2.min(args.0.len())..]
        .iter()
        .map(|v| Persistent::save(ctx, v.clone()))
        .collect();
    let callback = if bound.is_empty() {
        callback
    } else {
        let saved = Persistent::save(ctx, callback);
        native_fn(ctx, move |ctx, _args| {
            let callback = saved.clone().restore(&ctx)?;
            let mut call_args = rquickjs::function::Args::new(ctx.clone(), bound.len());
            for value in &bound {
                call_args.push_arg(value.clone().restore(&ctx)?)?;
            }
            callback.call_arg::<Value>(call_args)
        })?
    };

    let interval = repeating.then(|| Duration::from_millis(delay_ms.max(1)));
    let id = core.borrow_mut().timers.schedule(
        Persistent::save(ctx, callback),
        Duration::from_millis(delay_ms),
        interval,
    );
    Ok(id as f64)
}

fn clear(core: &SharedCore, id: Option<f64>) {
    if let Some(id) = id {
        if id.is_finite() && id >= 0.0 {
            core.borrow_mut().timers.cancel(id as u64);
        }
    }
}

pub fn setup(ctx: &Ctx<'_>, core: &SharedCore) -> Result<()> {
    let globals = ctx.globals();

    let set_timeout_core = core.clone();
    globals.set(
        "setTimeout",
        native_fn(ctx, move |ctx, args| {
            let id = schedule(&ctx, &set_timeout_core, &args, false)?;
            Ok(rquickjs::IntoJs::into_js(id, &ctx)?)
        })?
        .with_name("setTimeout")?,
    )?;

    let set_interval_core = core.clone();
    globals.set(
        "setInterval",
        native_fn(ctx, move |ctx, args| {
            let id = schedule(&ctx, &set_interval_core, &args, true)?;
            Ok(rquickjs::IntoJs::into_js(id, &ctx)?)
        })?
        .with_name("setInterval")?,
    )?;

    let clear_timeout_core = core.clone();
    globals.set(
        "clearTimeout",
        native_fn(ctx, move |ctx, args| {
            clear(&clear_timeout_core, args.0.first().and_then(|v| v.as_number()));
            Ok(undef(&ctx))
        })?
        .with_name("clearTimeout")?,
    )?;

    let clear_interval_core = core.clone();
    globals.set(
        "clearInterval",
        native_fn(ctx, move |ctx, args| {
            clear(&clear_interval_core, args.0.first().and_then(|v| v.as_number()));
            Ok(undef(&ctx))
        })?
        .with_name("clearInterval")?,
    )?;

    globals.set(
        "queueMicrotask",
        native_fn(ctx, |ctx, args| {
            let callback = arg(&ctx, &args, 0);
            let Ok(callback) = Function::from_js(&ctx, callback) else {
                return Err(Exception::throw_type(&ctx, "callback must be a function"));
            };
            support::then(&ctx, undef(&ctx), callback, None)?;
            Ok(undef(&ctx))
        })?
        .with_name("queueMicrotask")?,
    )?;

    Ok(())
}

use rquickjs::FromJs;
