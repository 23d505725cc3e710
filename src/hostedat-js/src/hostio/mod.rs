//! The engine's implementation of the runtime's `Host` trait: outbound
//! fetch, TCP dialing, blocking store jobs, service-binding dispatch
//! and D1 bridges.

pub(crate) mod fetch;
pub(crate) mod runtime;
pub(crate) mod ssrf;
pub(crate) mod tcp;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hostedat_js_runtime::host::{
    CancelHandle, D1Database, Host, HttpRequest, ServiceTarget, TcpAddress, TcpConnection,
    TcpOptions, WorkerDispatcher,
};
use hostedat_js_runtime::ops::OpCompletion;
use parking_lot::RwLock;

use crate::d1::D1Bridge;
use runtime::get_io_runtime;

pub(crate) struct HostIo {
    max_fetch_body_bytes: usize,
    socket_buffer_bytes: usize,
    d1_data_dir: Option<PathBuf>,
    dispatcher: RwLock<Option<Arc<dyn WorkerDispatcher>>>,
}

impl HostIo {
    pub(crate) fn new(
        max_fetch_body_bytes: usize,
        socket_buffer_bytes: usize,
        d1_data_dir: Option<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            max_fetch_body_bytes,
            socket_buffer_bytes,
            d1_data_dir,
            dispatcher: RwLock::new(None),
        })
    }

    pub(crate) fn set_dispatcher(&self, dispatcher: Arc<dyn WorkerDispatcher>) {
        *self.dispatcher.write() = Some(dispatcher);
    }
}

impl Host for HostIo {
    fn run_blocking(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        match get_io_runtime() {
            Some(rt) => {
                rt.spawn_blocking(job);
            }
            None => {
                // degraded mode: still make progress, one thread per job
                std::thread::spawn(job);
            }
        }
    }

    fn fetch(&self, req: HttpRequest, done: OpCompletion) -> CancelHandle {
        let Some(rt) = get_io_runtime() else {
            done.reject("host I/O runtime is unavailable");
            return CancelHandle::noop();
        };
        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();
        let max_body = self.max_fetch_body_bytes;
        rt.spawn(async move {
            tokio::select! {
                _ = cancel_rx => {
                    done.reject("the fetch was aborted");
                }
                result = fetch::run_fetch(req, max_body) => {
                    done.settle(result);
                }
            }
        });
        CancelHandle::new(move || {
            let _ = cancel_tx.send(());
        })
    }

    fn tcp_connect(
        &self,
        addr: TcpAddress,
        opts: TcpOptions,
    ) -> Result<Arc<dyn TcpConnection>, String> {
        let conn = tcp::HostTcpConnection::connect(addr, opts, self.socket_buffer_bytes)?;
        Ok(conn)
    }

    fn dispatch_service(&self, target: ServiceTarget, req: hostedat_js_common::WorkerRequest, done: OpCompletion) {
        let Some(dispatcher) = self.dispatcher.read().clone() else {
            done.reject("no dispatcher is installed for service bindings");
            return;
        };
        self.run_blocking(Box::new(move || {
            let result = dispatcher.execute(
                &target.site_id,
                &target.deploy_key,
                hostedat_js_runtime::env::Env::default(),
                req,
            );
            if let Some(error) = result.error {
                done.reject(error);
                return;
            }
            let Some(response) = result.response else {
                done.reject("service binding returned no response");
                return;
            };
            let headers: HashMap<String, String> = response.headers;
            done.resolve(serde_json::json!({
                "status": response.status_code,
                "headers": headers,
                "body": STANDARD.encode(&response.body),
            }));
        }));
    }

    fn open_d1(&self, database_id: &str) -> Result<Arc<dyn D1Database>, String> {
        let bridge = D1Bridge::open(self.d1_data_dir.as_deref(), database_id)?;
        Ok(Arc::new(bridge))
    }
}
