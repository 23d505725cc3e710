//! `ReadableStream` and its readers/controller.
//!
//! One shared state cell per stream; the stream, its controller and its
//! reader are all views over it. Persistent handles root queued chunks
//! and callbacks, so the cell itself carries no GC-visible references.
//!
//! Borrow discipline: nothing calls back into the VM while the cell is
//! borrowed — decide under the borrow, collect what to run, drop the
//! borrow, then call.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use rquickjs::class::Trace;
use rquickjs::prelude::Opt;
use rquickjs::function::Constructor;
use rquickjs::{
    Array, Class, Ctx, Exception, FromJs, Function, JsLifetime, Object, Persistent, Promise,
    Result, Value,
};

use super::writable::{self, WritableStream};
use super::{high_water_mark, iter_result};
use crate::web::support::{
    self, arg, bytes_to_js, call_method, caught_value, native_fn, type_error_value, undef,
};

type SavedFn = Persistent<Function<'static>>;
type SavedVal = Persistent<Value<'static>>;

pub(crate) struct Settler {
    pub resolve: SavedFn,
    pub reject: SavedFn,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RState {
    Readable,
    Closed,
    Errored,
}

pub struct ReadableInner {
    state: RState,
    stored_error: Option<SavedVal>,
    queue: VecDeque<SavedVal>,
    close_requested: bool,
    pull_fn: Option<SavedFn>,
    cancel_fn: Option<SavedFn>,
    started: bool,
    pulling: bool,
    pull_again: bool,
    pub locked: bool,
    hwm: f64,
    read_requests: VecDeque<Settler>,
    closed_watchers: Vec<Settler>,
}

pub type SharedReadable = Rc<RefCell<ReadableInner>>;

impl ReadableInner {
    fn new(hwm: f64) -> SharedReadable {
        Rc::new(RefCell::new(Self {
            state: RState::Readable,
            stored_error: None,
            queue: VecDeque::new(),
            close_requested: false,
            pull_fn: None,
            cancel_fn: None,
            started: true,
            pulling: false,
            pull_again: false,
            locked: false,
            hwm,
            read_requests: VecDeque::new(),
            closed_watchers: Vec::new(),
        }))
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

fn controller_value<'js>(ctx: &Ctx<'js>, shared: &SharedReadable) -> Result<Value<'js>> {
    let class = Class::instance(
        ctx.clone(),
        ReadableStreamDefaultController {
            inner: shared.clone(),
        },
    )?;
    Ok(class.into_value())
}

/// Deliver a chunk: hand it straight to a waiting read, else queue it.
pub(crate) fn enqueue_chunk<'js>(
    ctx: &Ctx<'js>,
    shared: &SharedReadable,
    chunk: Value<'js>,
) -> Result<()> {
    let waiter = {
        let mut st = shared.borrow_mut();
        if st.state != RState::Readable || st.close_requested {
            return Err(Exception::throw_type(
                ctx,
                "cannot enqueue on a closed or errored stream",
            ));
        }
        match st.read_requests.pop_front() {
            Some(req) => Some(req),
            None => {
                st.queue.push_back(Persistent::save(ctx, chunk.clone()));
                None
            }
        }
    };
    if let Some(req) = waiter {
        let result = iter_result(ctx, Some(chunk), false)?;
        settle_resolve(ctx, req, result.into_value());
    }
    Ok(())
}

/// Close once the queue drains; immediate when it is already empty.
pub(crate) fn request_close(ctx: &Ctx<'_>, shared: &SharedReadable) -> Result<()> {
    let finalize = {
        let mut st = shared.borrow_mut();
        if st.state != RState::Readable {
            return Ok(());
        }
        st.close_requested = true;
        st.queue.is_empty()
    };
    if finalize {
        finalize_close(ctx, shared)?;
    }
    Ok(())
}

fn finalize_close(ctx: &Ctx<'_>, shared: &SharedReadable) -> Result<()> {
    let (reads, watchers) = {
        let mut st = shared.borrow_mut();
        if st.state != RState::Readable {
            return Ok(());
        }
        st.state = RState::Closed;
        st.pull_fn = None;
        (
            std::mem::take(&mut st.read_requests),
            std::mem::take(&mut st.closed_watchers),
        )
    };
    for req in reads {
        let result = iter_result(ctx, None, true)?;
        settle_resolve(ctx, req, result.into_value());
    }
    for watcher in watchers {
        settle_resolve(ctx, watcher, undef(ctx));
    }
    Ok(())
}

pub(crate) fn error_stream<'js>(
    ctx: &Ctx<'js>,
    shared: &SharedReadable,
    err: Value<'js>,
) -> Result<()> {
    let (reads, watchers) = {
        let mut st = shared.borrow_mut();
        if st.state != RState::Readable {
            return Ok(());
        }
        st.state = RState::Errored;
        st.stored_error = Some(Persistent::save(ctx, err.clone()));
        st.queue.clear();
        st.pull_fn = None;
        (
            std::mem::take(&mut st.read_requests),
            std::mem::take(&mut st.closed_watchers),
        )
    };
    for req in reads {
        settle_reject(ctx, req, err.clone());
    }
    for watcher in watchers {
        settle_reject(ctx, watcher, err.clone());
    }
    Ok(())
}

/// Call the underlying source's `pull` if the queue wants more.
pub(crate) fn maybe_pull(ctx: &Ctx<'_>, shared: &SharedReadable) -> Result<()> {
    let pull = {
        let mut st = shared.borrow_mut();
        if st.state != RState::Readable || !st.started || st.close_requested {
            return Ok(());
        }
        if st.pulling {
            st.pull_again = true;
            return Ok(());
        }
        let wanted = !st.read_requests.is_empty() || (st.queue.len() as f64) < st.hwm;
        if !wanted {
            return Ok(());
        }
        let Some(p) = st.pull_fn.clone() else {
            return Ok(());
        };
        st.pulling = true;
        p
    };

    let pull = pull.restore(ctx)?;
    let controller = controller_value(ctx, shared)?;
    match pull.call::<_, Value>((controller,)) {
        Err(e) => {
            shared.borrow_mut().pulling = false;
            let err = caught_value(ctx, e);
            error_stream(ctx, shared, err)
        }
        Ok(result) => {
            let ok_shared = shared.clone();
            let on_ok = native_fn(ctx, move |ctx, _args| {
                let again = {
                    let mut st = ok_shared.borrow_mut();
                    st.pulling = false;
                    std::mem::take(&mut st.pull_again)
                };
                if again {
                    maybe_pull(&ctx, &ok_shared)?;
                }
                Ok(undef(&ctx))
            })?;
            let err_shared = shared.clone();
            let on_err = native_fn(ctx, move |ctx, args| {
                err_shared.borrow_mut().pulling = false;
                error_stream(&ctx, &err_shared, arg(&ctx, &args, 0))?;
                Ok(undef(&ctx))
            })?;
            support::then(ctx, result, on_ok, Some(on_err))
        }
    }
}

enum ReadNow {
    Chunk(SavedVal),
    Done,
    Failed(SavedVal),
    Wait,
}

pub(crate) fn read_internal<'js>(ctx: &Ctx<'js>, shared: &SharedReadable) -> Result<Promise<'js>> {
    let (promise, resolve, reject) = Promise::new(ctx)?;
    let now = {
        let mut st = shared.borrow_mut();
        if let Some(chunk) = st.queue.pop_front() {
            ReadNow::Chunk(chunk)
        } else {
            match st.state {
                RState::Closed => ReadNow::Done,
                RState::Errored => ReadNow::Failed(
                    st.stored_error
                        .clone()
                        .expect("errored stream always stores its error"),
                ),
                RState::Readable => {
                    st.read_requests.push_back(Settler {
                        resolve: Persistent::save(ctx, resolve.clone()),
                        reject: Persistent::save(ctx, reject.clone()),
                    });
                    ReadNow::Wait
                }
            }
        }
    };

    match now {
        ReadNow::Chunk(chunk) => {
            let chunk = chunk.restore(ctx)?;
            let result = iter_result(ctx, Some(chunk), false)?;
            resolve.call::<_, ()>((result,))?;
            let drained = {
                let st = shared.borrow();
                st.close_requested && st.queue.is_empty()
            };
            if drained {
                finalize_close(ctx, shared)?;
            } else {
                maybe_pull(ctx, shared)?;
            }
        }
        ReadNow::Done => {
            let result = iter_result(ctx, None, true)?;
            resolve.call::<_, ()>((result,))?;
        }
        ReadNow::Failed(err) => {
            let err = err.restore(ctx)?;
            reject.call::<_, ()>((err,))?;
        }
        ReadNow::Wait => {
            maybe_pull(ctx, shared)?;
        }
    }
    Ok(promise)
}

pub(crate) fn cancel_internal<'js>(
    ctx: &Ctx<'js>,
    shared: &SharedReadable,
    reason: Value<'js>,
) -> Result<Promise<'js>> {
    {
        let st = shared.borrow();
        match st.state {
            RState::Errored => {
                let err = st
                    .stored_error
                    .clone()
                    .expect("errored stream always stores its error");
                drop(st);
                let err = err.restore(ctx)?;
                return support::rejected_promise(ctx, err);
            }
            RState::Closed => {
                drop(st);
                return support::resolved_promise(ctx, undef(ctx));
            }
            RState::Readable => {}
        }
    }

    let cancel_fn = {
        let mut st = shared.borrow_mut();
        st.queue.clear();
        st.cancel_fn.take()
    };
    // A pending read observes {done: true} before the source learns of
    // the cancellation.
    finalize_close(ctx, shared)?;

    let (promise, resolve, reject) = Promise::new(ctx)?;
    match cancel_fn {
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

/// Swaps in a cancel callback after construction. Used by the
/// transform wiring, which only learns its writable half later.
pub(crate) fn set_cancel_fn<'js>(ctx: &Ctx<'js>, inner: &SharedReadable, cancel: Function<'js>) {
    inner.borrow_mut().cancel_fn = Some(Persistent::save(ctx, cancel));
}

/// Builds a stream driven by native or JS callbacks. `pull` receives
/// the controller; `cancel` receives the cancellation reason.
pub fn new_readable_with_source<'js>(
    ctx: &Ctx<'js>,
    pull: Option<Function<'js>>,
    cancel: Option<Function<'js>>,
    hwm: f64,
) -> Result<Class<'js, ReadableStream>> {
    let inner = ReadableInner::new(hwm);
    {
        let mut st = inner.borrow_mut();
        st.pull_fn = pull.map(|f| Persistent::save(ctx, f));
        st.cancel_fn = cancel.map(|f| Persistent::save(ctx, f));
    }
    Class::instance(ctx.clone(), ReadableStream { inner })
}

/// A stream that delivers `bytes` as a single `Uint8Array` chunk and
/// then closes. Backs buffered request/response bodies.
pub fn new_readable_from_bytes<'js>(
    ctx: &Ctx<'js>,
    bytes: &[u8],
) -> Result<Class<'js, ReadableStream>> {
    let inner = ReadableInner::new(1.0);
    {
        let mut st = inner.borrow_mut();
        if !bytes.is_empty() {
            let chunk = bytes_to_js(ctx, bytes)?;
            st.queue.push_back(Persistent::save(ctx, chunk));
        }
        st.close_requested = true;
    }
    let empty = inner.borrow().queue.is_empty();
    let class = Class::instance(ctx.clone(), ReadableStream {
        inner: inner.clone(),
    })?;
    if empty {
        finalize_close(ctx, &inner)?;
    }
    Ok(class)
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct ReadableStream {
    #[qjs(skip_trace)]
    pub(crate) inner: SharedReadable,
}

#[rquickjs::methods]
impl ReadableStream {
    #[qjs(constructor)]
    pub fn new<'js>(
        ctx: Ctx<'js>,
        source: Opt<Object<'js>>,
        strategy: Opt<Object<'js>>,
    ) -> Result<Self> {
        let hwm = high_water_mark(&strategy, 1.0);
        let inner = ReadableInner::new(hwm);
        let mut start_fn: Option<Function> = None;
        if let Some(src) = source.0 {
            let mut st = inner.borrow_mut();
            if let Ok(f) = src.get::<_, Function>("pull") {
                st.pull_fn = Some(Persistent::save(&ctx, f));
            }
            if let Ok(f) = src.get::<_, Function>("cancel") {
                st.cancel_fn = Some(Persistent::save(&ctx, f));
            }
            if let Ok(f) = src.get::<_, Function>("start") {
                start_fn = Some(f);
            }
        }

        let stream = Self {
            inner: inner.clone(),
        };

        if let Some(start) = start_fn {
            inner.borrow_mut().started = false;
            let controller = controller_value(&ctx, &inner)?;
            match start.call::<_, Value>((controller,)) {
                Err(e) => {
                    let err = caught_value(&ctx, e);
                    error_stream(&ctx, &inner, err)?;
                }
                Ok(result) => {
                    let ok_inner = inner.clone();
                    let on_ok = native_fn(&ctx, move |ctx, _args| {
                        ok_inner.borrow_mut().started = true;
                        maybe_pull(&ctx, &ok_inner)?;
                        Ok(undef(&ctx))
                    })?;
                    let err_inner = inner.clone();
                    let on_err = native_fn(&ctx, move |ctx, args| {
                        error_stream(&ctx, &err_inner, arg(&ctx, &args, 0))?;
                        Ok(undef(&ctx))
                    })?;
                    support::then(&ctx, result, on_ok, Some(on_err))?;
                }
            }
        }
        Ok(stream)
    }

    #[qjs(get)]
    pub fn locked(&self) -> bool {
        self.inner.borrow().locked
    }

    #[qjs(rename = "getReader")]
    pub fn get_reader<'js>(&self, ctx: Ctx<'js>, options: Opt<Object<'js>>) -> Result<Value<'js>> {
        {
            let mut st = self.inner.borrow_mut();
            if st.locked {
                return Err(Exception::throw_type(
                    &ctx,
                    "ReadableStream is already locked to a reader",
                ));
            }
            st.locked = true;
        }
        let byob = options
            .0
            .and_then(|o| o.get::<_, String>("mode").ok())
            .is_some_and(|mode| mode == "byob");
        if byob {
            let reader = ReadableStreamBYOBReader {
                inner: self.inner.clone(),
                released: Cell::new(false),
            };
            Ok(Class::instance(ctx, reader)?.into_value())
        } else {
            let reader = ReadableStreamDefaultReader {
                inner: self.inner.clone(),
                released: Cell::new(false),
            };
            Ok(Class::instance(ctx, reader)?.into_value())
        }
    }

    pub fn cancel<'js>(&self, ctx: Ctx<'js>, reason: Opt<Value<'js>>) -> Result<Promise<'js>> {
        if self.inner.borrow().locked {
            return support::rejected_type_error(&ctx, "cannot cancel a locked stream");
        }
        let reason = reason.0.unwrap_or_else(|| undef(&ctx));
        cancel_internal(&ctx, &self.inner, reason)
    }

    pub fn tee<'js>(&self, ctx: Ctx<'js>) -> Result<Array<'js>> {
        {
            let mut st = self.inner.borrow_mut();
            if st.locked {
                return Err(Exception::throw_type(&ctx, "ReadableStream is locked"));
            }
            st.locked = true;
        }
        let (first, second) = tee_branches(&ctx, &self.inner)?;
        let array = Array::new(ctx)?;
        array.set(0, first)?;
        array.set(1, second)?;
        Ok(array)
    }

    #[qjs(rename = "pipeTo")]
    pub fn pipe_to<'js>(
        &self,
        ctx: Ctx<'js>,
        destination: Value<'js>,
        options: Opt<Object<'js>>,
    ) -> Result<Promise<'js>> {
        let Ok(dest) = Class::<WritableStream>::from_js(&ctx, destination) else {
            return support::rejected_type_error(
                &ctx,
                "pipeTo destination must be a WritableStream",
            );
        };
        let dest_inner = dest.borrow().inner.clone();
        {
            let src_locked = self.inner.borrow().locked;
            let dst_locked = dest_inner.borrow().locked;
            if src_locked || dst_locked {
                return support::rejected_type_error(&ctx, "cannot pipe locked streams");
            }
        }
        let opts = PipeOptions::parse(&options);
        pipe_to_internal(&ctx, self.inner.clone(), dest_inner, opts)
    }

    #[qjs(rename = "pipeThrough")]
    pub fn pipe_through<'js>(
        &self,
        ctx: Ctx<'js>,
        transform: Object<'js>,
        options: Opt<Object<'js>>,
    ) -> Result<Value<'js>> {
        let readable: Value = transform.get("readable")?;
        let writable: Value = transform.get("writable")?;
        let pipe = self.pipe_to(ctx.clone(), writable, options)?;
        support::swallow_rejection(&ctx, pipe.into_value())?;
        Ok(readable)
    }

    pub fn values<'js>(&self, ctx: Ctx<'js>, options: Opt<Object<'js>>) -> Result<Object<'js>> {
        {
            let mut st = self.inner.borrow_mut();
            if st.locked {
                return Err(Exception::throw_type(&ctx, "ReadableStream is locked"));
            }
            st.locked = true;
        }
        let prevent_cancel = options
            .0
            .and_then(|o| o.get::<_, bool>("preventCancel").ok())
            .unwrap_or(false);
        async_iterator_object(&ctx, self.inner.clone(), prevent_cancel)
    }
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct ReadableStreamDefaultController {
    #[qjs(skip_trace)]
    pub(crate) inner: SharedReadable,
}

#[rquickjs::methods]
impl ReadableStreamDefaultController {
    #[qjs(get, rename = "desiredSize")]
    pub fn desired_size(&self) -> Option<f64> {
        let st = self.inner.borrow();
        match st.state {
            RState::Readable => Some(st.hwm - st.queue.len() as f64),
            RState::Closed => Some(0.0),
            RState::Errored => None,
        }
    }

    pub fn enqueue<'js>(&self, ctx: Ctx<'js>, chunk: Value<'js>) -> Result<()> {
        enqueue_chunk(&ctx, &self.inner, chunk)
    }

    pub fn close(&self, ctx: Ctx<'_>) -> Result<()> {
        request_close(&ctx, &self.inner)
    }

    pub fn error<'js>(&self, ctx: Ctx<'js>, reason: Opt<Value<'js>>) -> Result<()> {
        let reason = reason.0.unwrap_or_else(|| undef(&ctx));
        error_stream(&ctx, &self.inner, reason)
    }
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct ReadableStreamDefaultReader {
    #[qjs(skip_trace)]
    pub(crate) inner: SharedReadable,
    #[qjs(skip_trace)]
    released: Cell<bool>,
}

#[rquickjs::methods]
impl ReadableStreamDefaultReader {
    pub fn read<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        if self.released.get() {
            return support::rejected_type_error(&ctx, "reader has been released");
        }
        read_internal(&ctx, &self.inner)
    }

    #[qjs(rename = "releaseLock")]
    pub fn release_lock(&self, ctx: Ctx<'_>) -> Result<()> {
        release_reader(&ctx, &self.inner, &self.released)
    }

    pub fn cancel<'js>(&self, ctx: Ctx<'js>, reason: Opt<Value<'js>>) -> Result<Promise<'js>> {
        if self.released.get() {
            return support::rejected_type_error(&ctx, "reader has been released");
        }
        let reason = reason.0.unwrap_or_else(|| undef(&ctx));
        cancel_internal(&ctx, &self.inner, reason)
    }

    #[qjs(get)]
    pub fn closed<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        closed_promise(&ctx, &self.inner)
    }
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct ReadableStreamBYOBReader {
    #[qjs(skip_trace)]
    pub(crate) inner: SharedReadable,
    #[qjs(skip_trace)]
    released: Cell<bool>,
}

#[rquickjs::methods]
impl ReadableStreamBYOBReader {
    pub fn read<'js>(&self, ctx: Ctx<'js>, view: Value<'js>) -> Result<Promise<'js>> {
        if self.released.get() {
            return support::rejected_type_error(&ctx, "reader has been released");
        }
        let length: usize = view
            .as_object()
            .and_then(|o| o.get::<_, usize>("byteLength").ok())
            .ok_or_else(|| Exception::throw_type(&ctx, "read() expects an ArrayBuffer view"))?;
        if length == 0 {
            return Err(Exception::throw_type(
                &ctx,
                "read() called with a zero-length view",
            ));
        }
        byob_read(&ctx, &self.inner, view, length)
    }

    #[qjs(rename = "releaseLock")]
    pub fn release_lock(&self, ctx: Ctx<'_>) -> Result<()> {
        release_reader(&ctx, &self.inner, &self.released)
    }

    pub fn cancel<'js>(&self, ctx: Ctx<'js>, reason: Opt<Value<'js>>) -> Result<Promise<'js>> {
        let reason = reason.0.unwrap_or_else(|| undef(&ctx));
        cancel_internal(&ctx, &self.inner, reason)
    }

    #[qjs(get)]
    pub fn closed<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        closed_promise(&ctx, &self.inner)
    }
}

fn release_reader(ctx: &Ctx<'_>, shared: &SharedReadable, released: &Cell<bool>) -> Result<()> {
    if released.replace(true) {
        return Ok(());
    }
    let pending = {
        let mut st = shared.borrow_mut();
        st.locked = false;
        std::mem::take(&mut st.read_requests)
    };
    // Reads left pending at release time reject rather than hang.
    let err = type_error_value(ctx, "reader was released while a read was pending")?;
    for req in pending {
        settle_reject(ctx, req, err.clone());
    }
    Ok(())
}

fn closed_promise<'js>(ctx: &Ctx<'js>, shared: &SharedReadable) -> Result<Promise<'js>> {
    let now = {
        let st = shared.borrow();
        match st.state {
            RState::Closed => Some(Ok(())),
            RState::Errored => Some(Err(st
                .stored_error
                .clone()
                .expect("errored stream always stores its error"))),
            RState::Readable => None,
        }
    };
    match now {
        Some(Ok(())) => support::resolved_promise(ctx, undef(ctx)),
        Some(Err(err)) => {
            let err = err.restore(ctx)?;
            support::rejected_promise(ctx, err)
        }
        None => {
            let (promise, resolve, reject) = Promise::new(ctx)?;
            shared.borrow_mut().closed_watchers.push(Settler {
                resolve: Persistent::save(ctx, resolve),
                reject: Persistent::save(ctx, reject),
            });
            Ok(promise)
        }
    }
}

fn byob_read<'js>(
    ctx: &Ctx<'js>,
    shared: &SharedReadable,
    view: Value<'js>,
    capacity: usize,
) -> Result<Promise<'js>> {
    // Serve straight from the queue: a byte copy into the caller's view
    // plus a sub-view result. Falls back to a default read when nothing
    // is buffered.
    let chunk = shared.borrow_mut().queue.pop_front();
    match chunk {
        Some(chunk) => {
            let chunk = chunk.restore(ctx)?;
            let bytes = support::as_bytes(&chunk)?;
            let take = bytes.len().min(capacity);
            write_into_view(ctx, &view, &bytes[..take])?;
            if take < bytes.len() {
                let rest = bytes_to_js(ctx, &bytes[take..])?;
                shared
                    .borrow_mut()
                    .queue
                    .push_front(Persistent::save(ctx, rest));
            }
            let filled = subarray(ctx, &view, take)?;
            let result = iter_result(ctx, Some(filled), false)?;
            support::resolved_promise(ctx, result.into_value())
        }
        None => read_internal(ctx, shared),
    }
}

fn write_into_view<'js>(ctx: &Ctx<'js>, view: &Value<'js>, bytes: &[u8]) -> Result<()> {
    let obj = view
        .as_object()
        .ok_or_else(|| Exception::throw_type(ctx, "expected an ArrayBuffer view"))?;
    let buffer: rquickjs::ArrayBuffer = obj.get("buffer")?;
    let offset: usize = obj.get("byteOffset").unwrap_or(0);
    if let Some(raw) = buffer.as_raw() {
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                raw.ptr.as_ptr().add(offset),
                bytes.len(),
            );
        }
    }
    Ok(())
}

fn subarray<'js>(ctx: &Ctx<'js>, view: &Value<'js>, len: usize) -> Result<Value<'js>> {
    let obj = view
        .as_object()
        .ok_or_else(|| Exception::throw_type(ctx, "expected an ArrayBuffer view"))?;
    let buffer: Value = obj.get("buffer")?;
    let offset: usize = obj.get("byteOffset").unwrap_or(0);
    let ctor: Constructor = ctx.globals().get("Uint8Array")?;
    ctor.construct((buffer, offset, len))
}

// ---------------------------------------------------------------------------
// tee
// ---------------------------------------------------------------------------

struct TeeState {
    parent: SharedReadable,
    branches: [SharedReadable; 2],
    reading: Cell<bool>,
    canceled: [Cell<bool>; 2],
    reasons: RefCell<[Option<SavedVal>; 2]>,
}

fn tee_branches<'js>(
    ctx: &Ctx<'js>,
    parent: &SharedReadable,
) -> Result<(Class<'js, ReadableStream>, Class<'js, ReadableStream>)> {
    let b0 = ReadableInner::new(1.0);
    let b1 = ReadableInner::new(1.0);
    let tee = Rc::new(TeeState {
        parent: parent.clone(),
        branches: [b0.clone(), b1.clone()],
        reading: Cell::new(false),
        canceled: [Cell::new(false), Cell::new(false)],
        reasons: RefCell::new([None, None]),
    });

    for (index, branch) in [&b0, &b1].into_iter().enumerate() {
        let pull_tee = tee.clone();
        let pull = native_fn(ctx, move |ctx, _args| {
            tee_pump(&ctx, &pull_tee)?;
            Ok(undef(&ctx))
        })?;
        let cancel_tee = tee.clone();
        let cancel = native_fn(ctx, move |ctx, args| {
            tee_cancel_branch(&ctx, &cancel_tee, index, arg(&ctx, &args, 0))
        })?;
        let mut st = branch.borrow_mut();
        st.pull_fn = Some(Persistent::save(ctx, pull));
        st.cancel_fn = Some(Persistent::save(ctx, cancel));
    }

    Ok((
        Class::instance(ctx.clone(), ReadableStream { inner: b0 })?,
        Class::instance(ctx.clone(), ReadableStream { inner: b1 })?,
    ))
}

fn tee_pump(ctx: &Ctx<'_>, tee: &Rc<TeeState>) -> Result<()> {
    if tee.reading.replace(true) {
        return Ok(());
    }
    let read = read_internal(ctx, &tee.parent)?;
    let ok_tee = tee.clone();
    let on_ok = native_fn(ctx, move |ctx, args| {
        ok_tee.reading.set(false);
        let result = arg(&ctx, &args, 0);
        let result = result
            .as_object()
            .ok_or_else(|| Exception::throw_type(&ctx, "malformed read result"))?;
        let done: bool = result.get("done").unwrap_or(true);
        if done {
            for (i, branch) in ok_tee.branches.iter().enumerate() {
                if !ok_tee.canceled[i].get() {
                    request_close(&ctx, branch)?;
                }
            }
            return Ok(undef(&ctx));
        }
        let value: Value = result.get("value")?;
        for (i, branch) in ok_tee.branches.iter().enumerate() {
            if !ok_tee.canceled[i].get() {
                enqueue_chunk(&ctx, branch, value.clone())?;
            }
        }
        Ok(undef(&ctx))
    })?;
    let err_tee = tee.clone();
    let on_err = native_fn(ctx, move |ctx, args| {
        err_tee.reading.set(false);
        let err = arg(&ctx, &args, 0);
        for (i, branch) in err_tee.branches.iter().enumerate() {
            if !err_tee.canceled[i].get() {
                error_stream(&ctx, branch, err.clone())?;
            }
        }
        Ok(undef(&ctx))
    })?;
    support::then(ctx, read.into_value(), on_ok, Some(on_err))
}

fn tee_cancel_branch<'js>(
    ctx: &Ctx<'js>,
    tee: &Rc<TeeState>,
    index: usize,
    reason: Value<'js>,
) -> Result<Value<'js>> {
    tee.canceled[index].set(true);
    tee.reasons.borrow_mut()[index] = Some(Persistent::save(ctx, reason));
    if tee.canceled[0].get() && tee.canceled[1].get() {
        let reasons = Array::new(ctx.clone())?;
        {
            let saved = tee.reasons.borrow();
            for (i, entry) in saved.iter().enumerate() {
                let value = match entry {
                    Some(v) => v.clone().restore(ctx)?,
                    None => undef(ctx),
                };
                reasons.set(i, value)?;
            }
        }
        let promise = cancel_internal(ctx, &tee.parent, reasons.into_value())?;
        return Ok(promise.into_value());
    }
    Ok(undef(ctx))
}

// ---------------------------------------------------------------------------
// pipeTo
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Default)]
pub(crate) struct PipeOptions {
    prevent_close: bool,
    prevent_abort: bool,
    prevent_cancel: bool,
}

impl PipeOptions {
    fn parse(options: &Opt<Object<'_>>) -> Self {
        let get = |name: &str| {
            options
                .0
                .as_ref()
                .and_then(|o| o.get::<_, bool>(name).ok())
                .unwrap_or(false)
        };
        Self {
            prevent_close: get("preventClose"),
            prevent_abort: get("preventAbort"),
            prevent_cancel: get("preventCancel"),
        }
    }
}

struct PipeState {
    source: SharedReadable,
    dest: writable::SharedWritable,
    opts: PipeOptions,
    resolve: SavedFn,
    reject: SavedFn,
}

fn pipe_finish<'js>(ctx: &Ctx<'js>, pipe: &Rc<PipeState>, outcome: std::result::Result<(), Value<'js>>) {
    pipe.source.borrow_mut().locked = false;
    pipe.dest.borrow_mut().locked = false;
    match outcome {
        Ok(()) => {
            if let Ok(resolve) = pipe.resolve.clone().restore(ctx) {
                let _ = resolve.call::<_, ()>((undef(ctx),));
            }
        }
        Err(err) => {
            if let Ok(reject) = pipe.reject.clone().restore(ctx) {
                let _ = reject.call::<_, ()>((err,));
            }
        }
    }
}

pub(crate) fn pipe_to_internal<'js>(
    ctx: &Ctx<'js>,
    source: SharedReadable,
    dest: writable::SharedWritable,
    opts: PipeOptions,
) -> Result<Promise<'js>> {
    source.borrow_mut().locked = true;
    dest.borrow_mut().locked = true;
    let (promise, resolve, reject) = Promise::new(ctx)?;
    let pipe = Rc::new(PipeState {
        source,
        dest,
        opts,
        resolve: Persistent::save(ctx, resolve),
        reject: Persistent::save(ctx, reject),
    });
    pipe_step(ctx, &pipe)?;
    Ok(promise)
}

fn pipe_step(ctx: &Ctx<'_>, pipe: &Rc<PipeState>) -> Result<()> {
    let read = read_internal(ctx, &pipe.source)?;
    let ok_pipe = pipe.clone();
    let on_ok = native_fn(ctx, move |ctx, args| {
        let result = arg(&ctx, &args, 0);
        let result = result
            .as_object()
            .ok_or_else(|| Exception::throw_type(&ctx, "malformed read result"))?;
        let done: bool = result.get("done").unwrap_or(true);
        if done {
            if ok_pipe.opts.prevent_close {
                pipe_finish(&ctx, &ok_pipe, Ok(()));
                return Ok(undef(&ctx));
            }
            let close = writable::close_internal(&ctx, &ok_pipe.dest)?;
            let fin_pipe = ok_pipe.clone();
            let on_closed = native_fn(&ctx, move |ctx, _args| {
                pipe_finish(&ctx, &fin_pipe, Ok(()));
                Ok(undef(&ctx))
            })?;
            let fail_pipe = ok_pipe.clone();
            let on_close_err = native_fn(&ctx, move |ctx, args| {
                pipe_finish(&ctx, &fail_pipe, Err(arg(&ctx, &args, 0)));
                Ok(undef(&ctx))
            })?;
            support::then(&ctx, close.into_value(), on_closed, Some(on_close_err))?;
            return Ok(undef(&ctx));
        }

        let chunk: Value = result.get("value")?;
        let write = writable::write_internal(&ctx, &ok_pipe.dest, chunk)?;
        let next_pipe = ok_pipe.clone();
        let on_written = native_fn(&ctx, move |ctx, _args| {
            pipe_step(&ctx, &next_pipe)?;
            Ok(undef(&ctx))
        })?;
        let werr_pipe = ok_pipe.clone();
        let on_write_err = native_fn(&ctx, move |ctx, args| {
            let err = arg(&ctx, &args, 0);
            if !werr_pipe.opts.prevent_cancel {
                let cancel = cancel_internal(&ctx, &werr_pipe.source, err.clone())?;
                support::swallow_rejection(&ctx, cancel.into_value())?;
            }
            pipe_finish(&ctx, &werr_pipe, Err(err));
            Ok(undef(&ctx))
        })?;
        support::then(&ctx, write.into_value(), on_written, Some(on_write_err))?;
        Ok(undef(&ctx))
    })?;
    let rerr_pipe = pipe.clone();
    let on_err = native_fn(ctx, move |ctx, args| {
        let err = arg(&ctx, &args, 0);
        if !rerr_pipe.opts.prevent_abort {
            let abort = writable::abort_internal(&ctx, &rerr_pipe.dest, err.clone())?;
            support::swallow_rejection(&ctx, abort.into_value())?;
        }
        pipe_finish(&ctx, &rerr_pipe, Err(err));
        Ok(undef(&ctx))
    })?;
    support::then(ctx, read.into_value(), on_ok, Some(on_err))
}

// ---------------------------------------------------------------------------
// async iteration + ReadableStream.from
// ---------------------------------------------------------------------------

fn async_iterator_object<'js>(
    ctx: &Ctx<'js>,
    shared: SharedReadable,
    prevent_cancel: bool,
) -> Result<Object<'js>> {
    let iterator = Object::new(ctx.clone())?;

    let next_shared = shared.clone();
    let next = native_fn(ctx, move |ctx, _args| {
        let read = read_internal(&ctx, &next_shared)?;
        let unlock_shared = next_shared.clone();
        let (promise, resolve, reject) = Promise::new(&ctx)?;
        let resolve = Persistent::save(&ctx, resolve);
        let on_ok = native_fn(&ctx, move |ctx, args| {
            let result = arg(&ctx, &args, 0);
            if let Some(obj) = result.as_object() {
                if obj.get("done").unwrap_or(true) {
                    unlock_shared.borrow_mut().locked = false;
                }
            }
            let resolve = resolve.clone().restore(&ctx)?;
            resolve.call::<_, ()>((result,))?;
            Ok(undef(&ctx))
        })?;
        let reject = Persistent::save(&ctx, reject);
        let on_err = native_fn(&ctx, move |ctx, args| {
            let reject = reject.clone().restore(&ctx)?;
            reject.call::<_, ()>((arg(&ctx, &args, 0),))?;
            Ok(undef(&ctx))
        })?;
        support::then(&ctx, read.into_value(), on_ok, Some(on_err))?;
        Ok(promise.into_value())
    })?;
    iterator.set("next", next)?;

    let ret_shared = shared;
    let ret = native_fn(ctx, move |ctx, args| {
        ret_shared.borrow_mut().locked = false;
        let value = arg(&ctx, &args, 0);
        if !prevent_cancel {
            let cancel = cancel_internal(&ctx, &ret_shared, value.clone())?;
            support::swallow_rejection(&ctx, cancel.into_value())?;
        }
        let result = iter_result(&ctx, Some(value), true)?;
        Ok(support::resolved_promise(&ctx, result.into_value())?.into_value())
    })?;
    iterator.set("return", ret)?;

    let self_iter = Persistent::save(ctx, iterator.clone());
    let self_fn = native_fn(ctx, move |ctx, _args| {
        let self_iter = self_iter.clone().restore(&ctx)?;
        Ok(self_iter.into_value())
    })?;
    iterator.set(rquickjs::atom::PredefinedAtom::SymbolAsyncIterator, self_fn)?;
    Ok(iterator)
}

/// Installs `ReadableStream.from`.
pub(crate) fn define_statics(ctx: &Ctx<'_>) -> Result<()> {
    let globals = ctx.globals();
    let ctor: Object = globals.get("ReadableStream")?;
    let from = native_fn(ctx, |ctx, args| {
        let stream = readable_from(&ctx, arg(&ctx, &args, 0))?;
        Ok(stream.into_value())
    })?
    .with_name("from")?;
    ctor.set("from", from)?;
    Ok(())
}

fn readable_from<'js>(ctx: &Ctx<'js>, iterable: Value<'js>) -> Result<Class<'js, ReadableStream>> {
    let Some(obj) = iterable.as_object() else {
        return Err(Exception::throw_type(
            ctx,
            "ReadableStream.from expects an iterable",
        ));
    };

    let get_iter = |atom: rquickjs::atom::PredefinedAtom| -> Option<Object<'js>> {
        let f: Function = obj.get(atom).ok()?;
        let mut args = rquickjs::function::Args::new(ctx.clone(), 0);
        args.this(obj.clone()).ok()?;
        f.call_arg::<Object>(args).ok()
    };

    let iterator = get_iter(rquickjs::atom::PredefinedAtom::SymbolAsyncIterator)
        .or_else(|| get_iter(rquickjs::atom::PredefinedAtom::SymbolIterator))
        .ok_or_else(|| Exception::throw_type(ctx, "value is not iterable"))?;

    let iterator = Persistent::save(ctx, iterator);

    let pull_iter = iterator.clone();
    let pull = native_fn(ctx, move |ctx, args| {
        let controller = arg(&ctx, &args, 0);
        let controller = controller
            .as_object()
            .ok_or_else(|| Exception::throw_type(&ctx, "missing controller"))?
            .clone();
        let iterator = pull_iter.clone().restore(&ctx)?;
        let step = match call_method::<Value>(&ctx, &iterator, "next", []) {
            Ok(v) => v,
            Err(e) => {
                let err = caught_value(&ctx, e);
                call_method::<()>(&ctx, &controller, "error", [err])?;
                return Ok(undef(&ctx));
            }
        };
        let ctrl_ok = Persistent::save(&ctx, controller.clone());
        let on_ok = native_fn(&ctx, move |ctx, args| {
            let step = arg(&ctx, &args, 0);
            let step = step
                .as_object()
                .ok_or_else(|| Exception::throw_type(&ctx, "iterator result is not an object"))?;
            let controller = ctrl_ok.clone().restore(&ctx)?;
            let done: bool = step.get("done").unwrap_or(false);
            if done {
                call_method::<()>(&ctx, &controller, "close", [])?;
            } else {
                let value: Value = step.get("value")?;
                call_method::<()>(&ctx, &controller, "enqueue", [value])?;
            }
            Ok(undef(&ctx))
        })?;
        let ctrl_err = Persistent::save(&ctx, controller);
        let on_err = native_fn(&ctx, move |ctx, args| {
            let controller = ctrl_err.clone().restore(&ctx)?;
            call_method::<()>(&ctx, &controller, "error", [arg(&ctx, &args, 0)])?;
            Ok(undef(&ctx))
        })?;
        support::then(&ctx, step, on_ok, Some(on_err))?;
        Ok(undef(&ctx))
    })?;

    let cancel_iter = iterator;
    let cancel = native_fn(ctx, move |ctx, args| {
        let iterator = cancel_iter.clone().restore(&ctx)?;
        if iterator.get::<_, Function>("return").is_ok() {
            let _ = call_method::<Value>(&ctx, &iterator, "return", [arg(&ctx, &args, 0)]);
        }
        Ok(undef(&ctx))
    })?;

    new_readable_with_source(ctx, Some(pull), Some(cancel), 0.0)
}
