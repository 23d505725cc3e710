//! Everything that runs on an isolate thread: one rquickjs runtime and
//! context per isolate, the cooperative event loop that drives timers,
//! microtasks and host-op completions, the web-platform globals, and
//! the per-request execution entry points the engine calls.

pub mod core;
pub mod env;
pub mod host;
pub mod ops;
pub mod state;
pub mod web;

use std::cell::Cell;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context as _};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use hostedat_js_common::WorkerRequest;
use rquickjs::{
    Context, Ctx, Function, FromJs, Module, Object, Persistent, Promise, Runtime, Value,
};
use tracing::instrument;

use crate::core::{Core, SharedCore, Watchdog};
use crate::env::build_env_object;
use crate::host::{Host, ModuleProvider};
use crate::ops::OpOutcome;
use crate::state::RequestState;
use crate::web::request::Request;
use crate::web::response::{begin_extraction, Extraction};
use crate::web::support::{describe_caught, native_fn, undef};
use crate::web::websocket::WebSocket;
pub use crate::web::ResponseOut;

/// Worker scripts assign their module default export here.
const HANDLER_SLOT: &str = "__worker";

/// One JavaScript VM plus its event loop and installed globals.
///
/// An isolate runs exactly one request at a time; the pool hands them
/// out exclusively, so no two threads ever touch the VM concurrently.
pub struct Isolate {
    rt: Runtime,
    context: Context,
    core: SharedCore,
    rx: Receiver<OpOutcome>,
    watchdog: Arc<Watchdog>,
    poisoned: Cell<bool>,
    exports: Option<Persistent<Object<'static>>>,
}

// SAFETY:
// `rquickjs::Context` holds a raw pointer and so is not auto-Send, but
// raw pointers are a lint-level concern rather than a soundness one
// here: every public method takes `&mut self`, and the pool hands an
// isolate to exactly one thread at a time, so the VM is never touched
// concurrently. rquickjs itself implements Send for Context when its
// "parallel" feature is on, which is further evidence the type is
// movable between threads when access is exclusive.
unsafe impl Send for Isolate {}

impl Isolate {
    /// Creates a VM with the web-platform globals installed. The module
    /// provider backs `node:*` polyfill imports; the memory limit is a
    /// hard heap cap enforced by the engine allocator.
    #[instrument(skip_all, level = "debug")]
    pub fn new(
        host: Arc<dyn Host>,
        modules: Arc<dyn ModuleProvider>,
        memory_limit_bytes: usize,
    ) -> anyhow::Result<Self> {
        let rt = Runtime::new().context("unable to initialize the JS runtime")?;
        rt.set_memory_limit(memory_limit_bytes);
        rt.set_max_stack_size(1024 * 1024);

        let resolver = ProviderResolver {
            provider: modules.clone(),
        };
        let loader = ProviderLoader { provider: modules };
        rt.set_loader(resolver, loader);

        let watchdog = Arc::new(Watchdog::default());
        let interrupt_watchdog = watchdog.clone();
        rt.set_interrupt_handler(Some(Box::new(move || interrupt_watchdog.expired())));

        let context = Context::full(&rt).context("unable to create the JS context")?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let core = Core::new(host, tx);

        context.with(|ctx| web::install(&ctx, &core).map_err(|e| map_js_error(&ctx, e)))?;

        Ok(Self {
            rt,
            context,
            core,
            rx,
            watchdog,
            poisoned: Cell::new(false),
            exports: None,
        })
    }

    /// True when the VM can no longer be trusted (allocation failure or
    /// an abort that did not unwind cleanly). Poisoned isolates are
    /// discarded on return to the pool.
    pub fn poisoned(&self) -> bool {
        self.poisoned.get()
    }

    pub fn mark_poisoned(&self) {
        self.poisoned.set(true);
    }

    /// Compiles a module to engine bytecode without retaining it. Used
    /// once per deploy on a scratch isolate; the bytes are shared by
    /// every isolate in the pool.
    pub fn compile(&self, name: &str, source: &str) -> anyhow::Result<Vec<u8>> {
        self.context.with(|ctx| {
            let module = Module::declare(ctx.clone(), name, source)
                .map_err(|e| anyhow!("compile error: {}", describe_caught(&ctx, e)))?;
            module
                .write(rquickjs::module::WriteOptions::default())
                .map_err(|e| anyhow!("bytecode serialisation failed: {e}"))
        })
    }

    /// Loads compiled bytecode, runs the module's top-level code to
    /// quiescence, and publishes the default export on the agreed
    /// global slot for the handler lookups that follow.
    #[instrument(skip_all, level = "debug")]
    pub fn instantiate(&mut self, bytecode: &[u8]) -> anyhow::Result<()> {
        let deadline = Instant::now() + std::time::Duration::from_secs(10);
        let (namespace, evaluated) = self.context.with(|ctx| {
            // SAFETY: the bytecode was produced by `compile` on an
            // identical runtime configuration, which is the contract
            // `Module::load` requires.
            let module = unsafe { Module::load(ctx.clone(), bytecode) }
                .map_err(|e| anyhow!("bytecode load failed: {}", describe_caught(&ctx, e)))?;
            let (module, promise) = module
                .eval()
                .map_err(|e| anyhow!("module evaluation failed: {}", describe_caught(&ctx, e)))?;
            let namespace = module
                .namespace()
                .map_err(|e| anyhow!("module namespace unavailable: {e}"))?;
            Ok::<_, anyhow::Error>((
                Persistent::save(&ctx, namespace),
                Persistent::save(&ctx, promise),
            ))
        })?;

        self.drive_until(deadline, |ctx| {
            promise_settled(ctx, &evaluated).map(|settled| settled.is_some())
        })
        .context("module top-level execution failed")?;

        self.context.with(|ctx| {
            let promise = evaluated.clone().restore(&ctx)?;
            promise
                .finish::<Value>()
                .map_err(|e| anyhow!("module evaluation rejected: {}", describe_caught(&ctx, e)))?;
            let namespace = namespace.restore(&ctx)?;
            let exports: Object = namespace.get("default").map_err(|_| {
                anyhow!("worker module has no default export (missing `export default`)")
            })?;
            ctx.globals().set(HANDLER_SLOT, exports.clone())?;
            self.exports = Some(Persistent::save(&ctx, exports));
            Ok::<_, anyhow::Error>(())
        })?;
        Ok(())
    }

    /// Installs the per-request state. Must be balanced by
    /// [`end_request`](Self::end_request) on every path.
    pub fn begin_request(&mut self, state: RequestState) {
        self.watchdog.arm(state.deadline);
        self.core.borrow_mut().request = Some(state);
    }

    /// Clears request state, releasing every owned resource and
    /// dropping timers and pending ops so late completions fizzle.
    pub fn end_request(&mut self) -> Option<RequestState> {
        self.watchdog.disarm();
        let mut state = {
            let mut core = self.core.borrow_mut();
            core.timers.clear();
            core.ops.clear();
            core.request.take()
        };
        // drain any straggler completions so the channel never grows
        while self.rx.try_recv().is_ok() {}
        if let Some(state) = state.as_mut() {
            state.wait_until.clear();
            state.release_resources();
        }
        state
    }

    /// Runs the module's `fetch` export against one wire request and
    /// serialises the response it returns.
    #[instrument(skip_all, level = "debug", fields(method = %wire.method, url = %wire.url))]
    pub fn run_fetch(&mut self, wire: &WorkerRequest) -> anyhow::Result<ResponseOut> {
        let deadline = self.request_deadline()?;
        let max_response = self
            .core
            .borrow()
            .request()
            .map(|r| r.limits.max_response_bytes)?;

        let result = self.call_export("fetch", |ctx, core| {
            let header_pairs = wire
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let request =
                Request::from_parts(ctx, &wire.method, &wire.url, header_pairs, wire.body.clone())?;
            let env = build_env_object(ctx, core)?;
            let ctx_obj = build_ctx_object(ctx, core)?;
            Ok(vec![
                request.into_value(),
                env.into_value(),
                ctx_obj.into_value(),
            ])
        })?;

        let settled = self.settle(result, deadline)?;

        // serialise the response; stream bodies drain on the loop
        let extraction = self.context.with(|ctx| {
            let value = settled.clone().restore(&ctx)?;
            self.capture_web_socket(&ctx, &value)?;
            begin_extraction(&ctx, value, max_response)
        })?;

        match extraction {
            Extraction::Ready(out) => Ok(out),
            Extraction::Draining { mut meta, slot } => {
                let drain_slot = slot.clone();
                self.drive_until(deadline, move |_ctx| Ok(drain_slot.borrow().is_some()))
                    .context("response body never finished")?;
                let drained = slot.borrow_mut().take().expect("slot checked by drive");
                match drained {
                    Ok(bytes) => {
                        meta.body = bytes;
                        Ok(meta)
                    }
                    Err(message) => bail!("{message}"),
                }
            }
        }
    }

    /// Runs the `scheduled` export with `{scheduledTime, cron}`.
    #[instrument(skip_all, level = "debug")]
    pub fn run_scheduled(&mut self, cron: &str) -> anyhow::Result<()> {
        let deadline = self.request_deadline()?;
        let cron = cron.to_string();
        let result = self.call_export("scheduled", move |ctx, core| {
            let controller = Object::new(ctx.clone())?;
            let now_ms = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as f64)
                .unwrap_or(0.0);
            controller.set("scheduledTime", now_ms)?;
            controller.set("cron", cron.as_str())?;
            let retry_core = core.clone();
            controller.set(
                "noRetry",
                native_fn(ctx, move |ctx, _args| {
                    if let Ok(request) = retry_core.borrow_mut().request_mut() {
                        request.log(
                            hostedat_js_common::LogLevel::Debug,
                            "scheduled controller: retry disabled".to_string(),
                        );
                    }
                    Ok(undef(&ctx))
                })?,
            )?;
            let env = build_env_object(ctx, core)?;
            let ctx_obj = build_ctx_object(ctx, core)?;
            Ok(vec![
                controller.into_value(),
                env.into_value(),
                ctx_obj.into_value(),
            ])
        })?;
        self.settle(result, deadline)?;
        Ok(())
    }

    /// Runs the `tail` export with the given trace events.
    #[instrument(skip_all, level = "debug")]
    pub fn run_tail(&mut self, events: &serde_json::Value) -> anyhow::Result<()> {
        let deadline = self.request_deadline()?;
        let events = serde_json::to_string(events).context("tail events are not serialisable")?;
        let result = self.call_export("tail", move |ctx, core| {
            let events = ctx.json_parse(events.as_str())?;
            let env = build_env_object(ctx, core)?;
            let ctx_obj = build_ctx_object(ctx, core)?;
            Ok(vec![events, env.into_value(), ctx_obj.into_value()])
        })?;
        self.settle(result, deadline)?;
        Ok(())
    }

    /// Invokes an arbitrary named export with JSON-serialisable args
    /// and returns its JSON-serialised result.
    #[instrument(skip_all, level = "debug", fields(export = name))]
    pub fn run_function(
        &mut self,
        name: &str,
        args: &[serde_json::Value],
    ) -> anyhow::Result<serde_json::Value> {
        let deadline = self.request_deadline()?;
        let args_json =
            serde_json::to_string(args).context("function arguments are not serialisable")?;
        let result = self.call_export(name, move |ctx, _core| {
            let parsed = ctx.json_parse(args_json.as_str())?;
            let array = parsed
                .as_object()
                .and_then(|o| o.as_array())
                .cloned()
                .ok_or_else(|| {
                    rquickjs::Exception::throw_internal(ctx, "argument list must be an array")
                })?;
            let mut values = Vec::with_capacity(array.len());
            for value in array.iter::<Value>() {
                values.push(value?);
            }
            Ok(values)
        })?;
        let settled = self.settle(result, deadline)?;
        self.context.with(|ctx| {
            let value = settled.restore(&ctx)?;
            let json = ctx
                .json_stringify(value)
                .map_err(|e| anyhow!("{}", describe_caught(&ctx, e)))?
                .map(|s| s.to_string())
                .transpose()
                .map_err(|e| anyhow!("{e}"))?
                .unwrap_or_else(|| "null".to_string());
            serde_json::from_str(&json).context("export returned malformed JSON")
        })
    }

    /// Awaits the promises collected through `ctx.waitUntil` with the
    /// residual deadline budget. Rejections are logged, never raised.
    #[instrument(skip_all, level = "debug")]
    pub fn drain_wait_until(&mut self) {
        let Ok(deadline) = self.request_deadline() else {
            return;
        };
        let core = self.core.clone();
        let result = self.drive_until(deadline, move |ctx| {
            let pending = {
                let mut core_ref = core.borrow_mut();
                let Ok(state) = core_ref.request_mut() else {
                    return Ok(true);
                };
                std::mem::take(&mut state.wait_until)
            };
            let mut still_pending = Vec::new();
            let mut logs = Vec::new();
            for saved in pending {
                let value = match saved.clone().restore(ctx) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let Some(promise) = value.as_promise() else {
                    continue;
                };
                match promise.finish::<Value>() {
                    Ok(_) => {}
                    Err(rquickjs::Error::WouldBlock) => still_pending.push(saved),
                    Err(e) => {
                        logs.push(describe_caught(ctx, e));
                    }
                }
            }
            let mut core_ref = core.borrow_mut();
            if let Ok(state) = core_ref.request_mut() {
                for message in logs {
                    tracing::debug!(error = %message, "waitUntil promise rejected");
                    state.log(
                        hostedat_js_common::LogLevel::Warn,
                        format!("waitUntil rejected: {message}"),
                    );
                }
                let done = still_pending.is_empty();
                state.wait_until = still_pending;
                Ok(done)
            } else {
                Ok(true)
            }
        });
        if let Err(e) = result {
            tracing::debug!(error = %e, "waitUntil drain ended early");
        }
    }

    // -- internals ---------------------------------------------------------

    fn request_deadline(&self) -> anyhow::Result<Instant> {
        self.core.borrow().request().map(|r| r.deadline)
    }

    /// Phase 1 of every invocation: build args, look up the export and
    /// call it, returning the (maybe-promise) result as a persistent.
    fn call_export(
        &mut self,
        name: &str,
        build_args: impl for<'js> FnOnce(
            &Ctx<'js>,
            &SharedCore,
        ) -> rquickjs::Result<Vec<Value<'js>>>,
    ) -> anyhow::Result<Persistent<Value<'static>>> {
        let exports = self
            .exports
            .clone()
            .ok_or_else(|| anyhow!("isolate has no module loaded"))?;
        let core = self.core.clone();
        self.context.with(|ctx| {
            let exports = exports.restore(&ctx)?;
            let handler: Function = exports.get(name).map_err(|_| {
                anyhow!("worker has no {name:?} handler")
            })?;
            let args =
                build_args(&ctx, &core).map_err(|e| anyhow!("{}", describe_caught(&ctx, e)))?;

            let mut call_args = rquickjs::function::Args::new(ctx.clone(), args.len());
            call_args.this(exports)?;
            for value in args {
                call_args.push_arg(value)?;
            }
            match handler.call_arg::<Value>(call_args) {
                Ok(value) => Ok(Persistent::save(&ctx, value)),
                Err(e) => Err(self.classify(&ctx, e)),
            }
        })
    }

    /// Phase 2: drive the loop until the result (if it is a promise)
    /// settles; plain values pass straight through.
    fn settle(
        &mut self,
        result: Persistent<Value<'static>>,
        deadline: Instant,
    ) -> anyhow::Result<Persistent<Value<'static>>> {
        let is_promise = self
            .context
            .with(|ctx| -> anyhow::Result<bool> {
                let value = result.clone().restore(&ctx)?;
                Ok(value.as_promise().is_some())
            })?;
        if !is_promise {
            return Ok(result);
        }

        let settled: std::rc::Rc<std::cell::RefCell<Option<Persistent<Value<'static>>>>> =
            std::rc::Rc::new(std::cell::RefCell::new(None));
        let watch = result.clone();
        let slot = settled.clone();
        self.drive_until(deadline, move |ctx| {
            let value = watch.clone().restore(ctx)?;
            let promise = value.as_promise().expect("checked above");
            match promise.finish::<Value>() {
                Ok(v) => {
                    *slot.borrow_mut() = Some(Persistent::save(ctx, v));
                    Ok(true)
                }
                Err(rquickjs::Error::WouldBlock) => Ok(false),
                Err(e) => Err(anyhow!("{}", describe_caught(ctx, e))),
            }
        })
        .map_err(|e| self.deadline_aware(e))?;

        let value = settled
            .borrow_mut()
            .take()
            .ok_or_else(|| anyhow!("promise drive ended without a value"))?;
        Ok(value)
    }

    /// The cooperative loop: drain microtasks, deliver host-op
    /// completions in FIFO arrival order, fire due timers, then park
    /// until the next event or the deadline.
    fn drive_until(
        &self,
        deadline: Instant,
        mut done: impl for<'js> FnMut(&Ctx<'js>) -> anyhow::Result<bool>,
    ) -> anyhow::Result<()> {
        loop {
            let finished = self.context.with(|ctx| -> anyhow::Result<bool> {
                self.pump(&ctx)?;
                done(&ctx)
            })?;
            if finished {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                bail!("execution deadline exceeded");
            }
            let next_timer = self.core.borrow().timers.next_due();
            let mut wait = deadline - now;
            if let Some(due) = next_timer {
                wait = wait.min(due.saturating_duration_since(now));
            }
            // zero-duration waits still need one channel poll so I/O
            // completions are not starved by hot timers
            match self.rx.recv_timeout(wait.max(std::time::Duration::from_micros(100))) {
                Ok(outcome) => {
                    self.context
                        .with(|ctx| self.deliver(&ctx, outcome))
                        .map_err(|e| anyhow!("{e}"))?;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    bail!("isolate completion channel closed");
                }
            }
        }
    }

    /// One scheduler pass; loops until no jobs ran, no completions
    /// arrived and no timers fired.
    fn pump(&self, ctx: &Ctx<'_>) -> anyhow::Result<()> {
        loop {
            let mut progressed = self.drain_jobs()?;

            while let Ok(outcome) = self.rx.try_recv() {
                self.deliver(ctx, outcome)?;
                progressed = true;
            }

            let due = self.core.borrow_mut().timers.take_due(Instant::now());
            for timer in due {
                progressed = true;
                let func = match timer.func.restore(ctx) {
                    Ok(f) => f,
                    Err(_) => continue,
                };
                if let Err(e) = func.call::<_, Value>(()) {
                    let message = describe_caught(ctx, e);
                    tracing::debug!(error = %message, "timer callback threw");
                }
            }

            if !progressed {
                return Ok(());
            }
        }
    }

    fn drain_jobs(&self) -> anyhow::Result<bool> {
        let mut ran_any = false;
        loop {
            match self.rt.execute_pending_job() {
                Ok(true) => ran_any = true,
                Ok(false) => return Ok(ran_any),
                Err(e) => {
                    // a job that raised leaves the error on its own
                    // promise chain; the loop keeps going
                    tracing::debug!(error = ?e, "pending job raised");
                    ran_any = true;
                }
            }
        }
    }

    /// Resolve or reject the promise parked for a host-op outcome.
    /// Unknown ids belong to torn-down requests and are dropped.
    fn deliver(&self, ctx: &Ctx<'_>, outcome: OpOutcome) -> anyhow::Result<()> {
        let Some(pending) = self.core.borrow_mut().ops.take(outcome.op_id) else {
            return Ok(());
        };
        match outcome.result {
            Ok(value) => {
                let text = serde_json::to_string(&value).unwrap_or_else(|_| "null".to_string());
                let parsed = ctx
                    .json_parse(text)
                    .map_err(|e| anyhow!("{}", describe_caught(ctx, e)))?;
                let resolve = pending.resolve.restore(ctx)?;
                resolve
                    .call::<_, ()>((parsed,))
                    .map_err(|e| anyhow!("{}", describe_caught(ctx, e)))?;
            }
            Err(message) => {
                let error = crate::web::support::error_value(ctx, &message)
                    .map_err(|e| anyhow!("{}", describe_caught(ctx, e)))?;
                let reject = pending.reject.restore(ctx)?;
                reject
                    .call::<_, ()>((error,))
                    .map_err(|e| anyhow!("{}", describe_caught(ctx, e)))?;
            }
        }
        Ok(())
    }

    /// Pulls the WebSocket handle off a 101 response into request
    /// state, so the engine can surface it on the result.
    fn capture_web_socket<'js>(&self, ctx: &Ctx<'js>, value: &Value<'js>) -> anyhow::Result<()> {
        use rquickjs::Class;
        let Ok(response) = Class::<web::response::Response>::from_js(ctx, value.clone()) else {
            return Ok(());
        };
        let saved = response.borrow().web_socket.clone();
        if let Some(saved) = saved {
            let ws_value = saved.restore(ctx)?;
            if let Some(handle) = WebSocket::handle_of(&ws_value) {
                if let Ok(state) = self.core.borrow_mut().request_mut() {
                    state.web_socket = Some(handle);
                }
            }
        }
        Ok(())
    }

    /// Classifies a call error: allocation failures poison the
    /// isolate, an error raised while the watchdog deadline has passed
    /// is the watchdog's, everything else surfaces as a plain error.
    fn classify(&self, ctx: &Ctx<'_>, e: rquickjs::Error) -> anyhow::Error {
        if matches!(e, rquickjs::Error::Allocation) {
            self.poisoned.set(true);
            return anyhow!("JavaScript heap memory limit exceeded");
        }
        let message = describe_caught(ctx, e);
        if self.watchdog.expired() {
            return anyhow!("execution deadline exceeded (interrupted: {message})");
        }
        anyhow!("{message}")
    }

    /// Rewrites an error that raced the watchdog so callers see the
    /// deadline, not whatever the interrupt unwound with.
    fn deadline_aware(&self, e: anyhow::Error) -> anyhow::Error {
        if self.watchdog.expired() && !e.to_string().contains("deadline") {
            return anyhow!("execution deadline exceeded ({e})");
        }
        e
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        // Persistent handles must be released before the context goes
        // away or the runtime aborts on leaked references.
        self.exports = None;
        let mut core = self.core.borrow_mut();
        core.timers.clear();
        core.ops.clear();
        core.request = None;
    }
}

/// Settled state probe: Some(()) once the promise is no longer
/// pending; rejections surface as errors.
fn promise_settled(
    ctx: &Ctx<'_>,
    saved: &Persistent<Promise<'static>>,
) -> anyhow::Result<Option<()>> {
    let promise = saved.clone().restore(ctx)?;
    match promise.finish::<Value>() {
        Ok(_) => Ok(Some(())),
        Err(rquickjs::Error::WouldBlock) => Ok(None),
        Err(e) => Err(anyhow!("{}", describe_caught(ctx, e))),
    }
}

/// Builds the `ctx` argument handlers receive.
fn build_ctx_object<'js>(ctx: &Ctx<'js>, core: &SharedCore) -> rquickjs::Result<Object<'js>> {
    let object = Object::new(ctx.clone())?;

    let wait_core = core.clone();
    object.set(
        "waitUntil",
        native_fn(ctx, move |ctx, args| {
            let promise = args.0.first().cloned().unwrap_or_else(|| undef(&ctx));
            if let Ok(state) = wait_core.borrow_mut().request_mut() {
                state.wait_until.push(Persistent::save(&ctx, promise));
            }
            Ok(undef(&ctx))
        })?
        .with_name("waitUntil")?,
    )?;

    let pass_core = core.clone();
    object.set(
        "passThroughOnException",
        native_fn(ctx, move |ctx, _args| {
            if let Ok(state) = pass_core.borrow_mut().request_mut() {
                state.pass_through_on_exception = true;
            }
            Ok(undef(&ctx))
        })?
        .with_name("passThroughOnException")?,
    )?;

    Ok(object)
}

fn map_js_error(ctx: &Ctx<'_>, e: rquickjs::Error) -> anyhow::Error {
    anyhow!("{}", describe_caught(ctx, e))
}

// A resolver/loader pair that delegates to the host's module provider
// (the `node:*` polyfill directory).
struct ProviderResolver {
    provider: Arc<dyn ModuleProvider>,
}

impl rquickjs::loader::Resolver for ProviderResolver {
    fn resolve(&mut self, _ctx: &Ctx<'_>, base: &str, name: &str) -> rquickjs::Result<String> {
        // the engine resolver works on directories, while quickjs hands
        // us the importing module's path
        let (dir, _) = base.rsplit_once('/').unwrap_or((".", ""));
        self.provider
            .resolve(dir, name)
            .map(|p| p.replace('\\', "/"))
            .map_err(|_err| rquickjs::Error::new_resolving(base, name))
    }
}

struct ProviderLoader {
    provider: Arc<dyn ModuleProvider>,
}

impl rquickjs::loader::Loader for ProviderLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js>> {
        let source = self
            .provider
            .load(name)
            .map_err(|_err| rquickjs::Error::new_loading(name))?;
        Module::declare(ctx.clone(), name, source)
    }
}
