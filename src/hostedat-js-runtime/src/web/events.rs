//! Events and aborting: `EventTarget`, `Event`, `MessageEvent`,
//! `CloseEvent`, `AbortController` / `AbortSignal`, `DOMException`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use rquickjs::class::Trace;
use rquickjs::prelude::Opt;
use rquickjs::{
    Array, Class, Ctx, Exception, FromJs, Function, JsLifetime, Object, Persistent, Result, Value,
};

use super::support::{arg, native_fn, undef};
use crate::core::SharedCore;

type SavedFn = Persistent<Function<'static>>;
type SavedVal = Persistent<Value<'static>>;

/// Well-known DOMException name -> legacy code table. Unknown names
/// report code 0.
static DOM_EXCEPTION_CODES: phf::Map<&'static str, u8> = phf::phf_map! {
    "IndexSizeError" => 1,
    "HierarchyRequestError" => 3,
    "WrongDocumentError" => 4,
    "InvalidCharacterError" => 5,
    "NoModificationAllowedError" => 7,
    "NotFoundError" => 8,
    "NotSupportedError" => 9,
    "InUseAttributeError" => 10,
    "InvalidStateError" => 11,
    "SyntaxError" => 12,
    "InvalidModificationError" => 13,
    "NamespaceError" => 14,
    "InvalidAccessError" => 15,
    "SecurityError" => 18,
    "NetworkError" => 19,
    "AbortError" => 20,
    "URLMismatchError" => 21,
    "QuotaExceededError" => 22,
    "TimeoutError" => 23,
    "InvalidNodeTypeError" => 24,
    "DataCloneError" => 25,
};

#[rquickjs::class(rename = "DOMException")]
#[derive(Clone, Trace, JsLifetime)]
pub struct DomException {
    #[qjs(get)]
    name: String,
    #[qjs(get)]
    message: String,
}

#[rquickjs::methods]
impl DomException {
    #[qjs(constructor)]
    pub fn new(message: Opt<String>, name: Opt<String>) -> Self {
        Self {
            message: message.0.unwrap_or_default(),
            name: name.0.unwrap_or_else(|| "Error".to_string()),
        }
    }

    #[qjs(get)]
    pub fn code(&self) -> u8 {
        DOM_EXCEPTION_CODES
            .get(self.name.as_str())
            .copied()
            .unwrap_or(0)
    }

    #[qjs(rename = "toString")]
    pub fn to_string_js(&self) -> String {
        format!("{}: {}", self.name, self.message)
    }
}

/// Builds a `DOMException` value without throwing it.
pub fn dom_exception<'js>(ctx: &Ctx<'js>, name: &str, message: &str) -> Result<Value<'js>> {
    let class = Class::instance(
        ctx.clone(),
        DomException {
            name: name.to_string(),
            message: message.to_string(),
        },
    )?;
    Ok(class.into_value())
}

/// Throws a `DOMException` with the given name.
pub fn throw_dom(ctx: &Ctx<'_>, name: &str, message: &str) -> rquickjs::Error {
    match dom_exception(ctx, name, message) {
        Ok(value) => ctx.throw(value),
        Err(e) => e,
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

#[rquickjs::class]
#[derive(Trace, JsLifetime)]
pub struct Event {
    #[qjs(skip_trace)]
    etype: String,
    bubbles: bool,
    cancelable: bool,
    composed: bool,
    #[qjs(skip_trace)]
    default_prevented: Cell<bool>,
    #[qjs(skip_trace)]
    target: RefCell<Option<SavedVal>>,
}

impl Event {
    pub(crate) fn plain(etype: &str) -> Self {
        Self {
            etype: etype.to_string(),
            bubbles: false,
            cancelable: false,
            composed: false,
            default_prevented: Cell::new(false),
            target: RefCell::new(None),
        }
    }
}

#[rquickjs::methods]
impl Event {
    #[qjs(constructor)]
    pub fn new(etype: String, init: Opt<Object<'_>>) -> Self {
        let get = |name: &str| {
            init.0
                .as_ref()
                .and_then(|o| o.get::<_, bool>(name).ok())
                .unwrap_or(false)
        };
        Self {
            etype,
            bubbles: get("bubbles"),
            cancelable: get("cancelable"),
            composed: get("composed"),
            default_prevented: Cell::new(false),
            target: RefCell::new(None),
        }
    }

    #[qjs(get, rename = "type")]
    pub fn etype(&self) -> String {
        self.etype.clone()
    }

    #[qjs(get)]
    pub fn bubbles(&self) -> bool {
        self.bubbles
    }

    #[qjs(get)]
    pub fn cancelable(&self) -> bool {
        self.cancelable
    }

    #[qjs(get)]
    pub fn composed(&self) -> bool {
        self.composed
    }

    #[qjs(get, rename = "defaultPrevented")]
    pub fn default_prevented(&self) -> bool {
        self.default_prevented.get()
    }

    #[qjs(get)]
    pub fn target<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        match self.target.borrow().clone() {
            Some(t) => t.restore(&ctx),
            None => Ok(Value::new_null(ctx)),
        }
    }

    #[qjs(get, rename = "currentTarget")]
    pub fn current_target<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        self.target(ctx)
    }

    #[qjs(rename = "preventDefault")]
    pub fn prevent_default(&self) {
        if self.cancelable {
            self.default_prevented.set(true);
        }
    }

    #[qjs(rename = "stopPropagation")]
    pub fn stop_propagation(&self) {}

    #[qjs(rename = "stopImmediatePropagation")]
    pub fn stop_immediate_propagation(&self) {}

    #[qjs(rename = "composedPath")]
    pub fn composed_path<'js>(&self, ctx: Ctx<'js>) -> Result<Array<'js>> {
        let path = Array::new(ctx.clone())?;
        if let Some(target) = self.target.borrow().clone() {
            path.set(0, target.restore(&ctx)?)?;
        }
        Ok(path)
    }
}

#[rquickjs::class]
#[derive(Trace, JsLifetime)]
pub struct MessageEvent {
    #[qjs(skip_trace)]
    etype: String,
    #[qjs(skip_trace)]
    data: Option<SavedVal>,
}

impl MessageEvent {
    pub(crate) fn with_data<'js>(ctx: &Ctx<'js>, data: Value<'js>) -> Self {
        Self {
            etype: "message".to_string(),
            data: Some(Persistent::save(ctx, data)),
        }
    }
}

#[rquickjs::methods]
impl MessageEvent {
    #[qjs(constructor)]
    pub fn new<'js>(ctx: Ctx<'js>, etype: String, init: Opt<Object<'js>>) -> Self {
        let data = init
            .0
            .and_then(|o| o.get::<_, Value>("data").ok())
            .map(|v| Persistent::save(&ctx, v));
        Self { etype, data }
    }

    #[qjs(get, rename = "type")]
    pub fn etype(&self) -> String {
        self.etype.clone()
    }

    #[qjs(get)]
    pub fn data<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        match self.data.clone() {
            Some(d) => d.restore(&ctx),
            None => Ok(Value::new_null(ctx)),
        }
    }
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct CloseEvent {
    #[qjs(skip_trace)]
    etype: String,
    #[qjs(get)]
    code: u16,
    #[qjs(get)]
    reason: String,
    #[qjs(get, rename = "wasClean")]
    was_clean: bool,
}

impl CloseEvent {
    pub(crate) fn closing(code: u16, reason: String, was_clean: bool) -> Self {
        Self {
            etype: "close".to_string(),
            code,
            reason,
            was_clean,
        }
    }
}

#[rquickjs::methods]
impl CloseEvent {
    #[qjs(constructor)]
    pub fn new(etype: String, init: Opt<Object<'_>>) -> Self {
        let code = init
            .0
            .as_ref()
            .and_then(|o| o.get::<_, u16>("code").ok())
            .unwrap_or(0);
        let reason = init
            .0
            .as_ref()
            .and_then(|o| o.get::<_, String>("reason").ok())
            .unwrap_or_default();
        let was_clean = init
            .0
            .as_ref()
            .and_then(|o| o.get::<_, bool>("wasClean").ok())
            .unwrap_or(false);
        Self {
            etype,
            code,
            reason,
            was_clean,
        }
    }

    #[qjs(get, rename = "type")]
    pub fn etype(&self) -> String {
        self.etype.clone()
    }
}

// ---------------------------------------------------------------------------
// Listener store + EventTarget
// ---------------------------------------------------------------------------

pub(crate) struct ListenerEntry {
    event_type: String,
    callback: SavedFn,
    once: bool,
    id: u64,
}

#[derive(Default)]
pub(crate) struct ListenerStore {
    listeners: Vec<ListenerEntry>,
    next_id: u64,
}

pub(crate) type SharedListeners = Rc<RefCell<ListenerStore>>;

impl ListenerStore {
    pub fn shared() -> SharedListeners {
        Rc::new(RefCell::new(Self::default()))
    }

    fn add<'js>(
        &mut self,
        ctx: &Ctx<'js>,
        event_type: &str,
        callback: Function<'js>,
        once: bool,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.listeners.push(ListenerEntry {
            event_type: event_type.to_string(),
            callback: Persistent::save(ctx, callback),
            once,
            id,
        });
        id
    }

    fn remove_by_id(&mut self, id: u64) {
        self.listeners.retain(|l| l.id != id);
    }

    /// Removing a listener that is not registered is a no-op. Identity
    /// is JS identity (`Object.is`), matched against the stored handle.
    pub(crate) fn remove<'js>(&mut self, ctx: &Ctx<'js>, event_type: &str, callback: &Function<'js>) {
        let object_is: Option<Function> = ctx
            .globals()
            .get::<_, Object>("Object")
            .ok()
            .and_then(|o| o.get("is").ok());
        self.listeners.retain(|l| {
            if l.event_type != event_type {
                return true;
            }
            let Ok(stored) = l.callback.clone().restore(ctx) else {
                return true;
            };
            let same = object_is
                .as_ref()
                .and_then(|f| {
                    f.call::<_, bool>((stored.as_value().clone(), callback.as_value().clone()))
                        .ok()
                })
                .unwrap_or(false);
            !same
        });
    }
}

/// Dispatches `event` to every listener registered for its type, in
/// registration order. Once-listeners are removed before their call.
pub(crate) fn dispatch_to<'js>(
    ctx: &Ctx<'js>,
    store: &SharedListeners,
    event_type: &str,
    event: &Value<'js>,
) -> Result<()> {
    let callbacks: Vec<SavedFn> = {
        let mut st = store.borrow_mut();
        let matching: Vec<SavedFn> = st
            .listeners
            .iter()
            .filter(|l| l.event_type == event_type)
            .map(|l| l.callback.clone())
            .collect();
        st.listeners
            .retain(|l| !(l.event_type == event_type && l.once));
        matching
    };
    for callback in callbacks {
        let callback = callback.restore(ctx)?;
        if let Err(e) = callback.call::<_, ()>((event.clone(),)) {
            let message = super::support::describe_caught(ctx, e);
            tracing::debug!(event = event_type, error = %message, "event listener threw");
        }
    }
    Ok(())
}

/// Registers a listener honouring `{once, signal}` options. Shared by
/// `EventTarget`, `AbortSignal` and the WebSocket classes.
pub(crate) fn add_listener<'js>(
    ctx: &Ctx<'js>,
    store: &SharedListeners,
    event_type: String,
    callback: Function<'js>,
    options: &Opt<Value<'js>>,
) -> Result<()> {
    let (once, signal) = match options.0.as_ref().and_then(|v| v.as_object()) {
        Some(o) => (
            o.get::<_, bool>("once").unwrap_or(false),
            o.get::<_, Value>("signal").ok(),
        ),
        None => (false, None),
    };
    let id = store.borrow_mut().add(ctx, &event_type, callback, once);

    if let Some(signal) = signal {
        if let Ok(signal) = Class::<AbortSignal>::from_js(ctx, signal) {
            let inner = signal.borrow().inner.clone();
            let unregister_store = store.clone();
            let hook = native_fn(ctx, move |ctx, _args| {
                unregister_store.borrow_mut().remove_by_id(id);
                Ok(undef(&ctx))
            })?;
            register_abort_hook(ctx, &inner, hook)?;
        }
    }
    Ok(())
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct EventTarget {
    #[qjs(skip_trace)]
    store: SharedListeners,
}

#[rquickjs::methods]
impl EventTarget {
    #[qjs(constructor)]
    pub fn new() -> Self {
        Self {
            store: ListenerStore::shared(),
        }
    }

    #[qjs(rename = "addEventListener")]
    pub fn add_event_listener<'js>(
        &self,
        ctx: Ctx<'js>,
        event_type: String,
        callback: Function<'js>,
        options: Opt<Value<'js>>,
    ) -> Result<()> {
        add_listener(&ctx, &self.store, event_type, callback, &options)
    }

    #[qjs(rename = "removeEventListener")]
    pub fn remove_event_listener<'js>(
        &self,
        ctx: Ctx<'js>,
        event_type: String,
        callback: Function<'js>,
    ) {
        self.store.borrow_mut().remove(&ctx, &event_type, &callback);
    }

    #[qjs(rename = "dispatchEvent")]
    pub fn dispatch_event<'js>(&self, ctx: Ctx<'js>, event: Value<'js>) -> Result<bool> {
        let Ok(event_class) = Class::<Event>::from_js(&ctx, event.clone()) else {
            return Err(Exception::throw_type(&ctx, "dispatchEvent expects an Event"));
        };
        let etype = event_class.borrow().etype.clone();
        dispatch_to(&ctx, &self.store, &etype, &event)?;
        let default_prevented = event_class.borrow().default_prevented.get();
        Ok(!default_prevented)
    }
}

// ---------------------------------------------------------------------------
// AbortController / AbortSignal
// ---------------------------------------------------------------------------

pub(crate) struct SignalInner {
    aborted: bool,
    reason: Option<SavedVal>,
    listeners: SharedListeners,
    onabort: Option<SavedFn>,
    /// Host-op cancellation hooks and listener-unregistration hooks.
    /// Fired exactly once, on abort.
    hooks: Vec<SavedFn>,
}

pub(crate) type SharedSignal = Rc<RefCell<SignalInner>>;

fn new_signal_inner() -> SharedSignal {
    Rc::new(RefCell::new(SignalInner {
        aborted: false,
        reason: None,
        listeners: ListenerStore::shared(),
        onabort: None,
        hooks: Vec::new(),
    }))
}

/// Runs `hook` when the signal aborts; immediately when it already has.
pub(crate) fn register_abort_hook<'js>(
    ctx: &Ctx<'js>,
    inner: &SharedSignal,
    hook: Function<'js>,
) -> Result<()> {
    let aborted = inner.borrow().aborted;
    if aborted {
        hook.call::<_, ()>(())?;
    } else {
        inner.borrow_mut().hooks.push(Persistent::save(ctx, hook));
    }
    Ok(())
}

/// First abort wins: sets the flag, captures the reason, fires the
/// `abort` event and the registered hooks. Later calls are no-ops.
pub(crate) fn signal_abort<'js>(
    ctx: &Ctx<'js>,
    inner: &SharedSignal,
    signal_value: Value<'js>,
    reason: Option<Value<'js>>,
) -> Result<()> {
    let (listeners, onabort, hooks) = {
        let mut st = inner.borrow_mut();
        if st.aborted {
            return Ok(());
        }
        st.aborted = true;
        let reason = match reason {
            Some(r) if !r.is_undefined() => r,
            _ => dom_exception(ctx, "AbortError", "the operation was aborted")?,
        };
        st.reason = Some(Persistent::save(ctx, reason));
        (
            st.listeners.clone(),
            st.onabort.clone(),
            std::mem::take(&mut st.hooks),
        )
    };

    let event = Class::instance(ctx.clone(), Event::plain("abort"))?;
    *event.borrow().target.borrow_mut() = Some(Persistent::save(ctx, signal_value));
    let event_value = event.into_value();

    if let Some(onabort) = onabort {
        let onabort = onabort.restore(ctx)?;
        if let Err(e) = onabort.call::<_, ()>((event_value.clone(),)) {
            let message = super::support::describe_caught(ctx, e);
            tracing::debug!(error = %message, "onabort handler threw");
        }
    }
    dispatch_to(ctx, &listeners, "abort", &event_value)?;
    for hook in hooks {
        let hook = hook.restore(ctx)?;
        let _ = hook.call::<_, ()>(());
    }
    Ok(())
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct AbortSignal {
    #[qjs(skip_trace)]
    pub(crate) inner: SharedSignal,
}

#[rquickjs::methods]
impl AbortSignal {
    #[qjs(get)]
    pub fn aborted(&self) -> bool {
        self.inner.borrow().aborted
    }

    #[qjs(get)]
    pub fn reason<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        match self.inner.borrow().reason.clone() {
            Some(r) => r.restore(&ctx),
            None => Ok(undef(&ctx)),
        }
    }

    #[qjs(get, rename = "onabort")]
    pub fn onabort<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        match self.inner.borrow().onabort.clone() {
            Some(f) => Ok(f.restore(&ctx)?.into_value()),
            None => Ok(Value::new_null(ctx)),
        }
    }

    #[qjs(set, rename = "onabort")]
    pub fn set_onabort<'js>(&self, ctx: Ctx<'js>, handler: Value<'js>) {
        let mut st = self.inner.borrow_mut();
        st.onabort = Function::from_js(&ctx, handler)
            .ok()
            .map(|f| Persistent::save(&ctx, f));
    }

    #[qjs(rename = "throwIfAborted")]
    pub fn throw_if_aborted<'js>(&self, ctx: Ctx<'js>) -> Result<()> {
        let reason = self.inner.borrow().reason.clone();
        if self.inner.borrow().aborted {
            let reason = match reason {
                Some(r) => r.restore(&ctx)?,
                None => dom_exception(&ctx, "AbortError", "the operation was aborted")?,
            };
            return Err(ctx.throw(reason));
        }
        Ok(())
    }

    #[qjs(rename = "addEventListener")]
    pub fn add_event_listener<'js>(
        &self,
        ctx: Ctx<'js>,
        event_type: String,
        callback: Function<'js>,
        options: Opt<Value<'js>>,
    ) -> Result<()> {
        let listeners = self.inner.borrow().listeners.clone();
        add_listener(&ctx, &listeners, event_type, callback, &options)
    }

    #[qjs(rename = "removeEventListener")]
    pub fn remove_event_listener<'js>(
        &self,
        ctx: Ctx<'js>,
        event_type: String,
        callback: Function<'js>,
    ) {
        let listeners = self.inner.borrow().listeners.clone();
        listeners.borrow_mut().remove(&ctx, &event_type, &callback);
    }
}

#[rquickjs::class]
#[derive(Trace, JsLifetime)]
pub struct AbortController {
    #[qjs(skip_trace)]
    signal_inner: SharedSignal,
    #[qjs(skip_trace)]
    signal_value: SavedVal,
}

#[rquickjs::methods]
impl AbortController {
    #[qjs(constructor)]
    pub fn new(ctx: Ctx<'_>) -> Result<Self> {
        let inner = new_signal_inner();
        let signal = Class::instance(
            ctx.clone(),
            AbortSignal {
                inner: inner.clone(),
            },
        )?;
        Ok(Self {
            signal_inner: inner,
            signal_value: Persistent::save(&ctx, signal.into_value()),
        })
    }

    #[qjs(get)]
    pub fn signal<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        self.signal_value.clone().restore(&ctx)
    }

    pub fn abort<'js>(&self, ctx: Ctx<'js>, reason: Opt<Value<'js>>) -> Result<()> {
        let signal_value = self.signal_value.clone().restore(&ctx)?;
        signal_abort(&ctx, &self.signal_inner, signal_value, reason.0)
    }
}

/// Builds a fresh signal instance plus its shared cell.
pub(crate) fn new_signal<'js>(ctx: &Ctx<'js>) -> Result<(Value<'js>, SharedSignal)> {
    let inner = new_signal_inner();
    let signal = Class::instance(
        ctx.clone(),
        AbortSignal {
            inner: inner.clone(),
        },
    )?;
    Ok((signal.into_value(), inner))
}

pub fn setup(ctx: &Ctx<'_>, core: &SharedCore) -> Result<()> {
    let globals = ctx.globals();
    Class::<Event>::define(&globals)?;
    Class::<MessageEvent>::define(&globals)?;
    Class::<CloseEvent>::define(&globals)?;
    Class::<EventTarget>::define(&globals)?;
    Class::<DomException>::define(&globals)?;
    Class::<AbortSignal>::define(&globals)?;
    Class::<AbortController>::define(&globals)?;

    // DOMException instanceof Error
    let object_ctor: Object = globals.get("Object")?;
    let set_proto: Function = object_ctor.get("setPrototypeOf")?;
    let dom_ctor: Object = globals.get("DOMException")?;
    let dom_proto: Value = dom_ctor.get("prototype")?;
    let error_ctor: Object = globals.get("Error")?;
    let error_proto: Value = error_ctor.get("prototype")?;
    set_proto.call::<_, ()>((dom_proto, error_proto))?;

    // AbortSignal.abort / AbortSignal.timeout / AbortSignal.any
    let signal_ctor: Object = globals.get("AbortSignal")?;

    let abort_static = native_fn(ctx, |ctx, args| {
        let (value, inner) = new_signal(&ctx)?;
        let reason = args.0.first().cloned();
        signal_abort(&ctx, &inner, value.clone(), reason)?;
        Ok(value)
    })?
    .with_name("abort")?;
    signal_ctor.set("abort", abort_static)?;

    let timeout_core = core.clone();
    let timeout_static = native_fn(ctx, move |ctx, args| {
        let ms: u64 = f64::from_js(&ctx, arg(&ctx, &args, 0)).unwrap_or(0.0).max(0.0) as u64;
        let (value, inner) = new_signal(&ctx)?;
        let fire_value = Persistent::save(&ctx, value.clone());
        let fire_inner = inner;
        let callback = native_fn(&ctx, move |ctx, _args| {
            let signal_value = fire_value.clone().restore(&ctx)?;
            let reason = dom_exception(&ctx, "TimeoutError", "the operation timed out")?;
            signal_abort(&ctx, &fire_inner, signal_value, Some(reason))?;
            Ok(undef(&ctx))
        })?;
        timeout_core.borrow_mut().timers.schedule(
            Persistent::save(&ctx, callback),
            Duration::from_millis(ms),
            None,
        );
        Ok(value)
    })?
    .with_name("timeout")?;
    signal_ctor.set("timeout", timeout_static)?;

    let any_static = native_fn(ctx, |ctx, args| {
        let list = arg(&ctx, &args, 0);
        let Some(array) = list.as_object().and_then(|o| o.as_array()) else {
            return Err(Exception::throw_type(
                &ctx,
                "AbortSignal.any expects an array of signals",
            ));
        };
        let (value, inner) = new_signal(&ctx)?;
        for entry in array.iter::<Value>() {
            let entry = entry?;
            let Ok(source) = Class::<AbortSignal>::from_js(&ctx, entry) else {
                return Err(Exception::throw_type(&ctx, "expected an AbortSignal"));
            };
            let source_inner = source.borrow().inner.clone();
            let target_inner = inner.clone();
            let target_value = Persistent::save(&ctx, value.clone());
            let relay_source = source_inner.clone();
            let hook = native_fn(&ctx, move |ctx, _args| {
                let reason = match relay_source.borrow().reason.clone() {
                    Some(r) => Some(r.restore(&ctx)?),
                    None => None,
                };
                let signal_value = target_value.clone().restore(&ctx)?;
                signal_abort(&ctx, &target_inner, signal_value, reason)?;
                Ok(undef(&ctx))
            })?;
            register_abort_hook(&ctx, &source_inner, hook)?;
        }
        Ok(value)
    })?
    .with_name("any")?;
    signal_ctor.set("any", any_static)?;

    Ok(())
}
