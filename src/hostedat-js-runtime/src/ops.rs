//! Host-operation plumbing.
//!
//! Every async binding (fetch, KV, TCP reads, …) follows the same
//! shape: the binding creates a JS Promise, parks its resolve/reject
//! pair in the [`OpTable`], and hands an [`OpCompletion`] to the host.
//! Whichever host thread finishes the work posts an [`OpOutcome`] into
//! the isolate's crossbeam channel; the event loop delivers it on the
//! next tick, on the isolate thread, in arrival (FIFO) order.

use std::collections::HashMap;

use crossbeam_channel::Sender;
use rquickjs::{Ctx, Function, Persistent};

/// The result of one host operation, as posted from a host thread.
pub struct OpOutcome {
    pub op_id: u64,
    pub result: Result<serde_json::Value, String>,
}

/// Send half of an operation. Cheap to move into whatever thread ends
/// up finishing the work; resolving after the owning request has been
/// torn down is harmless (the outcome is dropped as unknown).
pub struct OpCompletion {
    op_id: u64,
    tx: Sender<OpOutcome>,
}

impl OpCompletion {
    pub(crate) fn new(op_id: u64, tx: Sender<OpOutcome>) -> Self {
        Self { op_id, tx }
    }

    pub fn resolve(self, value: serde_json::Value) {
        let _ = self.tx.send(OpOutcome {
            op_id: self.op_id,
            result: Ok(value),
        });
    }

    pub fn reject(self, message: impl Into<String>) {
        let _ = self.tx.send(OpOutcome {
            op_id: self.op_id,
            result: Err(message.into()),
        });
    }

    pub fn settle(self, result: Result<serde_json::Value, String>) {
        let _ = self.tx.send(OpOutcome {
            op_id: self.op_id,
            result,
        });
    }
}

pub(crate) struct PendingOp {
    pub resolve: Persistent<Function<'static>>,
    pub reject: Persistent<Function<'static>>,
}

/// Pending promise capabilities keyed by op id. Lives on the isolate;
/// only the isolate thread touches it.
#[derive(Default)]
pub(crate) struct OpTable {
    next_id: u64,
    pending: HashMap<u64, PendingOp>,
}

impl OpTable {
    pub fn register<'js>(
        &mut self,
        ctx: &Ctx<'js>,
        resolve: Function<'js>,
        reject: Function<'js>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(
            id,
            PendingOp {
                resolve: Persistent::save(ctx, resolve),
                reject: Persistent::save(ctx, reject),
            },
        );
        id
    }

    pub fn take(&mut self, op_id: u64) -> Option<PendingOp> {
        self.pending.remove(&op_id)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Drop every pending op. Called at request teardown so completions
    /// that race the teardown find nothing to resolve.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
