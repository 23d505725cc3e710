//! The per-isolate core cell shared by every binding closure.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use rquickjs::{Ctx, Function, Persistent};

use crate::host::Host;
use crate::ops::{OpCompletion, OpOutcome, OpTable};
use crate::state::RequestState;

/// Shared mutable heart of one isolate. Only the isolate thread ever
/// touches it; host threads communicate exclusively through the
/// completion channel.
///
/// Callbacks must never hold a borrow across a call back into the VM —
/// clone what you need, drop the borrow, then call.
pub struct Core {
    pub(crate) host: Arc<dyn Host>,
    pub(crate) ops: OpTable,
    pub(crate) timers: TimerQueue,
    pub(crate) tx: Sender<OpOutcome>,
    pub(crate) request: Option<RequestState>,
}

pub type SharedCore = Rc<RefCell<Core>>;

impl Core {
    pub(crate) fn new(host: Arc<dyn Host>, tx: Sender<OpOutcome>) -> SharedCore {
        Rc::new(RefCell::new(Self {
            host,
            ops: OpTable::default(),
            timers: TimerQueue::default(),
            tx,
            request: None,
        }))
    }

    /// Register a pending op for an already-created promise capability
    /// and hand back the completion to give to the host.
    pub(crate) fn begin_op<'js>(
        &mut self,
        ctx: &Ctx<'js>,
        resolve: Function<'js>,
        reject: Function<'js>,
    ) -> OpCompletion {
        let id = self.ops.register(ctx, resolve, reject);
        OpCompletion::new(id, self.tx.clone())
    }

    pub(crate) fn request(&self) -> anyhow::Result<&RequestState> {
        self.request
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no request is active on this isolate"))
    }

    pub(crate) fn request_mut(&mut self) -> anyhow::Result<&mut RequestState> {
        self.request
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("no request is active on this isolate"))
    }
}

/// Runs a blocking job on the host pool and resolves the JSON it
/// returns through the op queue. The standard shape for store-backed
/// bindings.
pub(crate) fn blocking_op<'js>(
    ctx: &Ctx<'js>,
    core: &SharedCore,
    job: impl FnOnce() -> Result<serde_json::Value, String> + Send + 'static,
) -> rquickjs::Result<rquickjs::Promise<'js>> {
    let (promise, resolve, reject) = rquickjs::Promise::new(ctx)?;
    let (completion, host) = {
        let mut core_ref = core.borrow_mut();
        let completion = core_ref.begin_op(ctx, resolve, reject);
        (completion, core_ref.host.clone())
    };
    host.run_blocking(Box::new(move || {
        completion.settle(job());
    }));
    Ok(promise)
}

/// Deadline cell read by the engine interrupt callback. The callback is
/// installed once per isolate and runs on whichever thread is currently
/// executing JS, so the cell is shared through an `Arc`.
#[derive(Default)]
pub struct Watchdog {
    deadline: Mutex<Option<Instant>>,
}

impl Watchdog {
    pub fn arm(&self, deadline: Instant) {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = Some(deadline);
    }

    pub fn disarm(&self) {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// True once the armed deadline has passed. Called from the engine
    /// interrupt hook at opcode boundaries.
    pub fn expired(&self) -> bool {
        self.deadline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some_and(|d| Instant::now() >= d)
    }
}

pub(crate) struct Timer {
    pub id: u64,
    pub func: Persistent<Function<'static>>,
    pub interval: Option<Duration>,
}

/// Monotonic-id timer wheel. Ordering is (due instant, insertion seq)
/// so same-time timers fire in insertion order.
#[derive(Default)]
pub(crate) struct TimerQueue {
    due: BTreeMap<(Instant, u64), Timer>,
    by_id: HashMap<u64, (Instant, u64)>,
    next_id: u64,
    next_seq: u64,
}

impl TimerQueue {
    pub fn schedule(
        &mut self,
        func: Persistent<Function<'static>>,
        delay: Duration,
        interval: Option<Duration>,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.insert(id, func, Instant::now() + delay, interval);
        id
    }

    fn insert(
        &mut self,
        id: u64,
        func: Persistent<Function<'static>>,
        when: Instant,
        interval: Option<Duration>,
    ) {
        self.next_seq += 1;
        let key = (when, self.next_seq);
        self.by_id.insert(id, key);
        self.due.insert(key, Timer { id, func, interval });
    }

    /// Removing an unknown id (including a timer currently being
    /// invoked) is a no-op.
    pub fn cancel(&mut self, id: u64) {
        if let Some(key) = self.by_id.remove(&id) {
            self.due.remove(&key);
        }
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.due.keys().next().map(|(when, _)| *when)
    }

    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }

    /// Pop every timer due at `now`. Interval timers are rescheduled
    /// before they are handed out so a `clearInterval` from inside the
    /// callback still finds them.
    pub fn take_due(&mut self, now: Instant) -> Vec<Timer> {
        let mut fired = Vec::new();
        while let Some((&key, _)) = self.due.iter().next() {
            if key.0 > now {
                break;
            }
            let timer = match self.due.remove(&key) {
                Some(t) => t,
                None => break,
            };
            self.by_id.remove(&timer.id);
            if let Some(every) = timer.interval {
                self.insert(timer.id, timer.func.clone(), now + every, Some(every));
            }
            fired.push(timer);
        }
        fired
    }

    pub fn clear(&mut self) {
        self.due.clear();
        self.by_id.clear();
    }
}
