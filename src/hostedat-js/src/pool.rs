//! Per-deploy isolate pools.
//!
//! A pool owns up to `pool_size` isolates sharing one compiled
//! bytecode image. Checkout blocks (bounded) for an idle isolate and
//! instantiates lazily up to capacity; return pushes to the head so
//! hot VMs stay warm. A bootstrap failure fails the whole pool until
//! the host invalidates and recompiles; invalidation tombstones the
//! pool, letting outstanding checkouts finish and then discarding them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hostedat_js_runtime::host::{Host, ModuleProvider};
use hostedat_js_runtime::Isolate;
use parking_lot::{Condvar, Mutex};

use crate::error::{EngineError, Result};
use crate::metrics::{
    record_isolate_created, record_isolate_discarded, METRIC_POOL_CHECKOUTS,
    METRIC_POOL_EXHAUSTED,
};

/// One compiled deploy, shared read-only by every isolate in a pool.
#[derive(Clone)]
pub(crate) struct CompiledModule {
    pub bytecode: Arc<Vec<u8>>,
    /// Content-addressed fingerprint of the source (sha-256 hex).
    pub fingerprint: String,
}

struct PoolState {
    idle: VecDeque<Isolate>,
    created: usize,
    tombstoned: bool,
    failed: Option<String>,
    generation: u64,
}

pub(crate) struct Pool {
    module: CompiledModule,
    pool_size: usize,
    memory_limit_bytes: usize,
    host: Arc<dyn Host>,
    modules: Arc<dyn ModuleProvider>,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl Pool {
    pub fn new(
        module: CompiledModule,
        pool_size: usize,
        memory_limit_bytes: usize,
        host: Arc<dyn Host>,
        modules: Arc<dyn ModuleProvider>,
        generation: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            module,
            pool_size: pool_size.max(1),
            memory_limit_bytes,
            host,
            modules,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                created: 0,
                tombstoned: false,
                failed: None,
                generation,
            }),
            available: Condvar::new(),
        })
    }

    pub fn fingerprint(&self) -> &str {
        &self.module.fingerprint
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Blocks up to `timeout` for an isolate, instantiating lazily up
    /// to the pool's capacity.
    pub fn checkout(&self, timeout: Duration) -> Result<Isolate> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            if let Some(message) = &st.failed {
                return Err(EngineError::PoolBootstrap(message.clone()));
            }
            if st.tombstoned {
                return Err(EngineError::Internal(
                    "pool was invalidated during checkout".to_string(),
                ));
            }
            if let Some(isolate) = st.idle.pop_front() {
                metrics::counter!(METRIC_POOL_CHECKOUTS).increment(1);
                return Ok(isolate);
            }
            if st.created < self.pool_size {
                st.created += 1;
                drop(st);
                return match self.spawn_isolate() {
                    Ok(isolate) => {
                        metrics::counter!(METRIC_POOL_CHECKOUTS).increment(1);
                        Ok(isolate)
                    }
                    Err(e) => {
                        let message = e.to_string();
                        let mut st = self.state.lock();
                        st.created -= 1;
                        st.failed = Some(message.clone());
                        self.available.notify_all();
                        Err(EngineError::PoolBootstrap(message))
                    }
                };
            }
            if Instant::now() >= deadline {
                metrics::counter!(METRIC_POOL_EXHAUSTED).increment(1);
                return Err(EngineError::PoolExhausted(timeout.as_millis() as u64));
            }
            self.available.wait_until(&mut st, deadline);
        }
    }

    /// Hands an isolate back: poisoned or tombstoned ones are dropped
    /// (a replacement spawns on a later checkout), healthy ones go to
    /// the head of the idle queue.
    pub fn restore(&self, isolate: Isolate) {
        let discard_reason = if isolate.poisoned() {
            Some("poisoned")
        } else if self.state.lock().tombstoned {
            Some("tombstoned")
        } else {
            None
        };

        match discard_reason {
            Some(reason) => {
                record_isolate_discarded(reason);
                let mut st = self.state.lock();
                st.created = st.created.saturating_sub(1);
                drop(isolate);
                self.available.notify_all();
                drop(st);
            }
            None => {
                let mut st = self.state.lock();
                st.idle.push_front(isolate);
                drop(st);
                self.available.notify_one();
            }
        }
    }

    pub fn mark_tombstoned(&self) {
        let mut st = self.state.lock();
        st.tombstoned = true;
        // idle isolates can go right away; checked-out ones are
        // discarded on return
        let drained: Vec<Isolate> = st.idle.drain(..).collect();
        st.created = st.created.saturating_sub(drained.len());
        drop(st);
        for isolate in drained {
            record_isolate_discarded("tombstoned");
            drop(isolate);
        }
        self.available.notify_all();
    }

    pub fn is_dead(&self) -> bool {
        let st = self.state.lock();
        st.tombstoned || st.failed.is_some()
    }

    fn spawn_isolate(&self) -> anyhow::Result<Isolate> {
        let mut isolate = Isolate::new(
            self.host.clone(),
            self.modules.clone(),
            self.memory_limit_bytes,
        )?;
        isolate.instantiate(&self.module.bytecode)?;
        record_isolate_created();
        Ok(isolate)
    }
}

/// (site, deploy) -> pool and compiled-module caches. Lookups are
/// plain map operations; compilation happens outside these locks.
#[derive(Default)]
pub(crate) struct PoolRegistry {
    pools: Mutex<HashMap<(String, String), Arc<Pool>>>,
    compiled: Mutex<HashMap<(String, String), CompiledModule>>,
    next_generation: Mutex<u64>,
}

impl PoolRegistry {
    pub fn live_pool(&self, site_id: &str, deploy_key: &str) -> Option<Arc<Pool>> {
        let pools = self.pools.lock();
        pools
            .get(&(site_id.to_string(), deploy_key.to_string()))
            .filter(|p| !p.is_dead())
            .cloned()
    }

    pub fn compiled(&self, site_id: &str, deploy_key: &str) -> Option<CompiledModule> {
        self.compiled
            .lock()
            .get(&(site_id.to_string(), deploy_key.to_string()))
            .cloned()
    }

    pub fn store_compiled(&self, site_id: &str, deploy_key: &str, module: CompiledModule) {
        self.compiled
            .lock()
            .insert((site_id.to_string(), deploy_key.to_string()), module);
    }

    /// Inserts a pool unless a live one appeared in the meantime.
    pub fn install_pool(&self, site_id: &str, deploy_key: &str, pool: Arc<Pool>) -> Arc<Pool> {
        let mut pools = self.pools.lock();
        let key = (site_id.to_string(), deploy_key.to_string());
        match pools.get(&key) {
            Some(existing) if !existing.is_dead() => existing.clone(),
            _ => {
                pools.insert(key, pool.clone());
                pool
            }
        }
    }

    pub fn next_generation(&self) -> u64 {
        let mut gen = self.next_generation.lock();
        *gen += 1;
        *gen
    }

    /// Tombstones and forgets the pool plus its cached bytecode.
    pub fn invalidate(&self, site_id: &str, deploy_key: &str) {
        let key = (site_id.to_string(), deploy_key.to_string());
        let pool = self.pools.lock().remove(&key);
        if let Some(pool) = pool {
            pool.mark_tombstoned();
        }
        self.compiled.lock().remove(&key);
    }

    /// Tombstones everything; used at shutdown.
    pub fn clear(&self) {
        let pools: Vec<Arc<Pool>> = self.pools.lock().drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.mark_tombstoned();
        }
        self.compiled.lock().clear();
    }
}
