//! `WritableStream`, its writer and controller.
//!
//! Writes queue behind one in-flight sink call at a time. Backpressure
//! is the count-based desired size (`highWaterMark − queued`), with the
//! writer's `ready` promise resolving whenever desired size goes
//! positive.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use rquickjs::class::Trace;
use rquickjs::prelude::Opt;
use rquickjs::{
    Class, Ctx, Exception, Function, JsLifetime, Object, Persistent, Promise, Result, Value,
};

use super::high_water_mark;
use super::readable::Settler;
use crate::web::support::{self, arg, caught_value, native_fn, type_error_value, undef};

type SavedFn = Persistent<Function<'static>>;
type SavedVal = Persistent<Value<'static>>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum WState {
    Writable,
    Erroring,
    Errored,
    Closed,
}

enum QueuedOp {
    Write { chunk: SavedVal, done: Settler },
    Close { done: Settler },
}

pub struct WritableInner {
    state: WState,
    stored_error: Option<SavedVal>,
    sink_write: Option<SavedFn>,
    sink_close: Option<SavedFn>,
    sink_abort: Option<SavedFn>,
    queue: VecDeque<QueuedOp>,
    in_flight: bool,
    hwm: f64,
    queued: f64,
    pub locked: bool,
    ready_watchers: Vec<Settler>,
    closed_watchers: Vec<Settler>,
}

pub type SharedWritable = Rc<RefCell<WritableInner>>;

impl WritableInner {
    fn new(hwm: f64) -> SharedWritable {
        Rc::new(RefCell::new(Self {
            state: WState::Writable,
            stored_error: None,
            sink_write: None,
            sink_close: None,
            sink_abort: None,
            queue: VecDeque::new(),
            in_flight: false,
            hwm,
            queued: 0.0,
            locked: false,
            ready_watchers: Vec::new(),
            closed_watchers: Vec::new(),
        }))
    }

    fn desired_size(&self) -> Option<f64> {
        match self.state {
            WState::Writable => Some(self.hwm - self.queued),
            WState::Closed => Some(0.0),
            WState::Erroring | WState::Errored => None,
        }
    }
}

fn settle_resolve<'js>(ctx: &Ctx<'js>, settler: Settler, value: Value<'js>) {
    if let Ok(resolve) = settler.resolve.restore(ctx) {
        let _ = resolve.call::<_, ()>((value,));
    }
}

fn settle_reject<'js>(ctx: &Ctx<'js>, settler: Settler, err: Value<'js>) {
    if let Ok(reject) = settler.reject.restore(ctx) {
        let _ = reject.call::<_, ()>((err,));
    }
}

fn save_settler<'js>(ctx: &Ctx<'js>, resolve: Function<'js>, reject: Function<'js>) -> Settler {
    Settler {
        resolve: Persistent::save(ctx, resolve),
        reject: Persistent::save(ctx, reject),
    }
}

/// Builds a writable driven by native or JS sink callbacks.
pub fn new_writable_with_sink<'js>(
    ctx: &Ctx<'js>,
    write: Option<Function<'js>>,
    close: Option<Function<'js>>,
    abort: Option<Function<'js>>,
    hwm: f64,
) -> Result<Class<'js, WritableStream>> {
    let inner = WritableInner::new(hwm);
    {
        let mut st = inner.borrow_mut();
        st.sink_write = write.map(|f| Persistent::save(ctx, f));
        st.sink_close = close.map(|f| Persistent::save(ctx, f));
        st.sink_abort = abort.map(|f| Persistent::save(ctx, f));
    }
    Class::instance(ctx.clone(), WritableStream { inner })
}

pub(crate) fn write_internal<'js>(
    ctx: &Ctx<'js>,
    shared: &SharedWritable,
    chunk: Value<'js>,
) -> Result<Promise<'js>> {
    let (promise, resolve, reject) = Promise::new(ctx)?;
    {
        let mut st = shared.borrow_mut();
        match st.state {
            WState::Errored | WState::Erroring => {
                let err = st.stored_error.clone();
                drop(st);
                let err = match err {
                    Some(e) => e.restore(ctx)?,
                    None => type_error_value(ctx, "stream is errored")?,
                };
                reject.call::<_, ()>((err,))?;
                return Ok(promise);
            }
            WState::Closed => {
                drop(st);
                let err = type_error_value(ctx, "cannot write to a closed stream")?;
                reject.call::<_, ()>((err,))?;
                return Ok(promise);
            }
            WState::Writable => {
                st.queue.push_back(QueuedOp::Write {
                    chunk: Persistent::save(ctx, chunk),
                    done: save_settler(ctx, resolve, reject),
                });
                st.queued += 1.0;
            }
        }
    }
    advance_queue(ctx, shared)?;
    Ok(promise)
}

pub(crate) fn close_internal<'js>(ctx: &Ctx<'js>, shared: &SharedWritable) -> Result<Promise<'js>> {
    let (promise, resolve, reject) = Promise::new(ctx)?;
    {
        let mut st = shared.borrow_mut();
        match st.state {
            WState::Errored | WState::Erroring => {
                let err = st.stored_error.clone();
                drop(st);
                let err = match err {
                    Some(e) => e.restore(ctx)?,
                    None => type_error_value(ctx, "stream is errored")?,
                };
                reject.call::<_, ()>((err,))?;
                return Ok(promise);
            }
            WState::Closed => {
                drop(st);
                let err = type_error_value(ctx, "stream is already closed")?;
                reject.call::<_, ()>((err,))?;
                return Ok(promise);
            }
            WState::Writable => {
                let already_closing = st
                    .queue
                    .iter()
                    .any(|op| matches!(op, QueuedOp::Close { .. }));
                if already_closing {
                    drop(st);
                    let err = type_error_value(ctx, "stream is already closing")?;
                    reject.call::<_, ()>((err,))?;
                    return Ok(promise);
                }
                st.queue.push_back(QueuedOp::Close {
                    done: save_settler(ctx, resolve, reject),
                });
            }
        }
    }
    advance_queue(ctx, shared)?;
    Ok(promise)
}

pub(crate) fn abort_internal<'js>(
    ctx: &Ctx<'js>,
    shared: &SharedWritable,
    reason: Value<'js>,
) -> Result<Promise<'js>> {
    let (pending, abort_fn) = {
        let mut st = shared.borrow_mut();
        if matches!(st.state, WState::Closed | WState::Errored) {
            drop(st);
            return support::resolved_promise(ctx, undef(ctx));
        }
        st.state = WState::Errored;
        st.stored_error = Some(Persistent::save(ctx, reason.clone()));
        st.queued = 0.0;
        let pending: Vec<Settler> = st
            .queue
            .drain(..)
            .map(|op| match op {
                QueuedOp::Write { done, .. } => done,
                QueuedOp::Close { done } => done,
            })
            .collect();
        (pending, st.sink_abort.take())
    };

    for done in pending {
        settle_reject(ctx, done, reason.clone());
    }
    notify_closed_err(ctx, shared, &reason)?;
    notify_ready_err(ctx, shared, &reason)?;

    let (promise, resolve, reject) = Promise::new(ctx)?;
    match abort_fn {
        None => resolve.call::<_, ()>((undef(ctx),))?,
        Some(f) => {
            let f = f.restore(ctx)?;
            match f.call::<_, Value>((reason,)) {
                Err(e) => {
                    let err = caught_value(ctx, e);
                    reject.call::<_, ()>((err,))?;
                }
                Ok(result) => {
                    let resolve = Persistent::save(ctx, resolve);
                    let on_ok = native_fn(ctx, move |ctx, _args| {
                        let resolve = resolve.clone().restore(&ctx)?;
                        resolve.call::<_, ()>((undef(&ctx),))?;
                        Ok(undef(&ctx))
                    })?;
                    let reject = Persistent::save(ctx, reject);
                    let on_err = native_fn(ctx, move |ctx, args| {
                        let reject = reject.clone().restore(&ctx)?;
                        reject.call::<_, ()>((arg(&ctx, &args, 0),))?;
                        Ok(undef(&ctx))
                    })?;
                    support::then(ctx, result, on_ok, Some(on_err))?;
                }
            }
        }
    }
    Ok(promise)
}

pub(crate) fn error_writable<'js>(
    ctx: &Ctx<'js>,
    shared: &SharedWritable,
    err: Value<'js>,
) -> Result<()> {
    let pending = {
        let mut st = shared.borrow_mut();
        if matches!(st.state, WState::Closed | WState::Errored) {
            return Ok(());
        }
        st.state = WState::Errored;
        st.stored_error = Some(Persistent::save(ctx, err.clone()));
        st.queued = 0.0;
        st.queue
            .drain(..)
            .map(|op| match op {
                QueuedOp::Write { done, .. } => done,
                QueuedOp::Close { done } => done,
            })
            .collect::<Vec<_>>()
    };
    for done in pending {
        settle_reject(ctx, done, err.clone());
    }
    notify_closed_err(ctx, shared, &err)?;
    notify_ready_err(ctx, shared, &err)?;
    Ok(())
}

fn notify_closed_err<'js>(
    ctx: &Ctx<'js>,
    shared: &SharedWritable,
    err: &Value<'js>,
) -> Result<()> {
    let watchers = std::mem::take(&mut shared.borrow_mut().closed_watchers);
    for w in watchers {
        settle_reject(ctx, w, err.clone());
    }
    Ok(())
}

fn notify_ready_err<'js>(ctx: &Ctx<'js>, shared: &SharedWritable, err: &Value<'js>) -> Result<()> {
    let watchers = std::mem::take(&mut shared.borrow_mut().ready_watchers);
    for w in watchers {
        settle_reject(ctx, w, err.clone());
    }
    Ok(())
}

fn notify_ready_ok(ctx: &Ctx<'_>, shared: &SharedWritable) -> Result<()> {
    let watchers = {
        let st = shared.borrow();
        if st.desired_size().is_some_and(|d| d > 0.0) {
            drop(st);
            std::mem::take(&mut shared.borrow_mut().ready_watchers)
        } else {
            Vec::new()
        }
    };
    for w in watchers {
        settle_resolve(ctx, w, undef(ctx));
    }
    Ok(())
}

/// Run the next queued op when no sink call is in flight.
fn advance_queue(ctx: &Ctx<'_>, shared: &SharedWritable) -> Result<()> {
    enum Next {
        Write(SavedVal, SavedFn),
        WriteNoSink,
        Close(Option<SavedFn>),
        Idle,
    }

    let (next, done) = {
        let mut st = shared.borrow_mut();
        if st.in_flight || st.state != WState::Writable {
            return Ok(());
        }
        match st.queue.pop_front() {
            None => (Next::Idle, None),
            Some(QueuedOp::Write { chunk, done }) => {
                st.in_flight = true;
                match st.sink_write.clone() {
                    Some(f) => (Next::Write(chunk, f), Some(done)),
                    None => (Next::WriteNoSink, Some(done)),
                }
            }
            Some(QueuedOp::Close { done }) => {
                st.in_flight = true;
                (Next::Close(st.sink_close.clone()), Some(done))
            }
        }
    };

    match next {
        Next::Idle => Ok(()),
        Next::WriteNoSink => {
            // Discarding sink: the write completes immediately.
            let mut st = shared.borrow_mut();
            st.in_flight = false;
            st.queued -= 1.0;
            drop(st);
            if let Some(done) = done {
                settle_resolve(ctx, done, undef(ctx));
            }
            notify_ready_ok(ctx, shared)?;
            advance_queue(ctx, shared)
        }
        Next::Write(chunk, sink) => {
            let sink = sink.restore(ctx)?;
            let chunk = chunk.restore(ctx)?;
            let controller = controller_value(ctx, shared)?;
            let done = done.expect("write op always carries a settler");
            match sink.call::<_, Value>((chunk, controller)) {
                Err(e) => {
                    shared.borrow_mut().in_flight = false;
                    let err = caught_value(ctx, e);
                    settle_reject(ctx, done, err.clone());
                    error_writable(ctx, shared, err)
                }
                Ok(result) => {
                    let ok_shared = shared.clone();
                    let done_ok = Rc::new(RefCell::new(Some(done)));
                    let done_err = done_ok.clone();
                    let err_shared = shared.clone();
                    let on_ok = native_fn(ctx, move |ctx, _args| {
                        {
                            let mut st = ok_shared.borrow_mut();
                            st.in_flight = false;
                            st.queued -= 1.0;
                        }
                        if let Some(done) = done_ok.borrow_mut().take() {
                            settle_resolve(&ctx, done, undef(&ctx));
                        }
                        notify_ready_ok(&ctx, &ok_shared)?;
                        advance_queue(&ctx, &ok_shared)?;
                        Ok(undef(&ctx))
                    })?;
                    let on_err = native_fn(ctx, move |ctx, args| {
                        err_shared.borrow_mut().in_flight = false;
                        let err = arg(&ctx, &args, 0);
                        if let Some(done) = done_err.borrow_mut().take() {
                            settle_reject(&ctx, done, err.clone());
                        }
                        error_writable(&ctx, &err_shared, err)?;
                        Ok(undef(&ctx))
                    })?;
                    support::then(ctx, result, on_ok, Some(on_err))
                }
            }
        }
        Next::Close(sink) => {
            let done = done.expect("close op always carries a settler");
            let finish_ok = {
                let shared = shared.clone();
                move |ctx: &Ctx<'_>, done: Settler| -> Result<()> {
                    let watchers = {
                        let mut st = shared.borrow_mut();
                        st.in_flight = false;
                        st.state = WState::Closed;
                        std::mem::take(&mut st.closed_watchers)
                    };
                    settle_resolve(ctx, done, undef(ctx));
                    for w in watchers {
                        settle_resolve(ctx, w, undef(ctx));
                    }
                    Ok(())
                }
            };
            match sink {
                None => finish_ok(ctx, done),
                Some(f) => {
                    let f = f.restore(ctx)?;
                    match f.call::<_, Value>(()) {
                        Err(e) => {
                            shared.borrow_mut().in_flight = false;
                            let err = caught_value(ctx, e);
                            settle_reject(ctx, done, err.clone());
                            error_writable(ctx, shared, err)
                        }
                        Ok(result) => {
                            let done_cell = Rc::new(RefCell::new(Some(done)));
                            let done_err = done_cell.clone();
                            let err_shared = shared.clone();
                            let on_ok = native_fn(ctx, move |ctx, _args| {
                                if let Some(done) = done_cell.borrow_mut().take() {
                                    finish_ok(&ctx, done)?;
                                }
                                Ok(undef(&ctx))
                            })?;
                            let on_err = native_fn(ctx, move |ctx, args| {
                                err_shared.borrow_mut().in_flight = false;
                                let err = arg(&ctx, &args, 0);
                                if let Some(done) = done_err.borrow_mut().take() {
                                    settle_reject(&ctx, done, err.clone());
                                }
                                error_writable(&ctx, &err_shared, err)?;
                                Ok(undef(&ctx))
                            })?;
                            support::then(ctx, result, on_ok, Some(on_err))
                        }
                    }
                }
            }
        }
    }
}

fn controller_value<'js>(ctx: &Ctx<'js>, shared: &SharedWritable) -> Result<Value<'js>> {
    let class = Class::instance(
        ctx.clone(),
        WritableStreamDefaultController {
            inner: shared.clone(),
        },
    )?;
    Ok(class.into_value())
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct WritableStream {
    #[qjs(skip_trace)]
    pub(crate) inner: SharedWritable,
}

#[rquickjs::methods]
impl WritableStream {
    #[qjs(constructor)]
    pub fn new<'js>(
        ctx: Ctx<'js>,
        sink: Opt<Object<'js>>,
        strategy: Opt<Object<'js>>,
    ) -> Result<Self> {
        let hwm = high_water_mark(&strategy, 1.0);
        let inner = WritableInner::new(hwm);
        if let Some(sink) = sink.0 {
            let mut st = inner.borrow_mut();
            if let Ok(f) = sink.get::<_, Function>("write") {
                st.sink_write = Some(Persistent::save(&ctx, f));
            }
            if let Ok(f) = sink.get::<_, Function>("close") {
                st.sink_close = Some(Persistent::save(&ctx, f));
            }
            if let Ok(f) = sink.get::<_, Function>("abort") {
                st.sink_abort = Some(Persistent::save(&ctx, f));
            }
            // start runs immediately with the controller
            if let Ok(start) = sink.get::<_, Function>("start") {
                drop(st);
                let controller = controller_value(&ctx, &inner)?;
                if let Err(e) = start.call::<_, Value>((controller,)) {
                    let err = caught_value(&ctx, e);
                    error_writable(&ctx, &inner, err)?;
                }
            }
        }
        Ok(Self { inner })
    }

    #[qjs(get)]
    pub fn locked(&self) -> bool {
        self.inner.borrow().locked
    }

    #[qjs(rename = "getWriter")]
    pub fn get_writer<'js>(
        &self,
        ctx: Ctx<'js>,
    ) -> Result<Class<'js, WritableStreamDefaultWriter>> {
        {
            let mut st = self.inner.borrow_mut();
            if st.locked {
                return Err(Exception::throw_type(
                    &ctx,
                    "WritableStream is already locked to a writer",
                ));
            }
            st.locked = true;
        }
        Class::instance(
            ctx,
            WritableStreamDefaultWriter {
                inner: self.inner.clone(),
                released: Cell::new(false),
            },
        )
    }

    pub fn close<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        if self.inner.borrow().locked {
            return support::rejected_type_error(&ctx, "cannot close a locked stream");
        }
        close_internal(&ctx, &self.inner)
    }

    pub fn abort<'js>(&self, ctx: Ctx<'js>, reason: Opt<Value<'js>>) -> Result<Promise<'js>> {
        if self.inner.borrow().locked {
            return support::rejected_type_error(&ctx, "cannot abort a locked stream");
        }
        let reason = reason.0.unwrap_or_else(|| undef(&ctx));
        abort_internal(&ctx, &self.inner, reason)
    }
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct WritableStreamDefaultController {
    #[qjs(skip_trace)]
    pub(crate) inner: SharedWritable,
}

#[rquickjs::methods]
impl WritableStreamDefaultController {
    pub fn error<'js>(&self, ctx: Ctx<'js>, reason: Opt<Value<'js>>) -> Result<()> {
        let reason = reason.0.unwrap_or_else(|| undef(&ctx));
        error_writable(&ctx, &self.inner, reason)
    }
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct WritableStreamDefaultWriter {
    #[qjs(skip_trace)]
    pub(crate) inner: SharedWritable,
    #[qjs(skip_trace)]
    released: Cell<bool>,
}

#[rquickjs::methods]
impl WritableStreamDefaultWriter {
    #[qjs(get, rename = "desiredSize")]
    pub fn desired_size(&self) -> Option<f64> {
        self.inner.borrow().desired_size()
    }

    #[qjs(get)]
    pub fn ready<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        let now = {
            let st = self.inner.borrow();
            match st.state {
                WState::Errored | WState::Erroring => Some(Err(st.stored_error.clone())),
                _ if st.desired_size().is_some_and(|d| d > 0.0) => Some(Ok(())),
                _ => None,
            }
        };
        match now {
            Some(Ok(())) => support::resolved_promise(&ctx, undef(&ctx)),
            Some(Err(err)) => {
                let err = match err {
                    Some(e) => e.restore(&ctx)?,
                    None => type_error_value(&ctx, "stream is errored")?,
                };
                support::rejected_promise(&ctx, err)
            }
            None => {
                let (promise, resolve, reject) = Promise::new(&ctx)?;
                self.inner
                    .borrow_mut()
                    .ready_watchers
                    .push(save_settler(&ctx, resolve, reject));
                Ok(promise)
            }
        }
    }

    #[qjs(get)]
    pub fn closed<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        let now = {
            let st = self.inner.borrow();
            match st.state {
                WState::Closed => Some(Ok(())),
                WState::Errored | WState::Erroring => Some(Err(st.stored_error.clone())),
                WState::Writable => None,
            }
        };
        match now {
            Some(Ok(())) => support::resolved_promise(&ctx, undef(&ctx)),
            Some(Err(err)) => {
                let err = match err {
                    Some(e) => e.restore(&ctx)?,
                    None => type_error_value(&ctx, "stream is errored")?,
                };
                support::rejected_promise(&ctx, err)
            }
            None => {
                let (promise, resolve, reject) = Promise::new(&ctx)?;
                self.inner
                    .borrow_mut()
                    .closed_watchers
                    .push(save_settler(&ctx, resolve, reject));
                Ok(promise)
            }
        }
    }

    pub fn write<'js>(&self, ctx: Ctx<'js>, chunk: Opt<Value<'js>>) -> Result<Promise<'js>> {
        if self.released.get() {
            return support::rejected_type_error(&ctx, "writer has been released");
        }
        let chunk = chunk.0.unwrap_or_else(|| undef(&ctx));
        write_internal(&ctx, &self.inner, chunk)
    }

    pub fn close<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        if self.released.get() {
            return support::rejected_type_error(&ctx, "writer has been released");
        }
        close_internal(&ctx, &self.inner)
    }

    pub fn abort<'js>(&self, ctx: Ctx<'js>, reason: Opt<Value<'js>>) -> Result<Promise<'js>> {
        if self.released.get() {
            return support::rejected_type_error(&ctx, "writer has been released");
        }
        let reason = reason.0.unwrap_or_else(|| undef(&ctx));
        abort_internal(&ctx, &self.inner, reason)
    }

    #[qjs(rename = "releaseLock")]
    pub fn release_lock(&self) {
        if !self.released.replace(true) {
            self.inner.borrow_mut().locked = false;
        }
    }
}
