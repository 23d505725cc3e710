//! Per-request host-side state.
//!
//! One `RequestState` exists per in-flight request and lives on the
//! isolate that is running it (isolates never run two requests at
//! once). Binding closures capture the shared core cell at
//! construction time and reach the state through it; there is no
//! process-wide registry and no request-id global on the VM.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use hostedat_js_common::{LogEntry, LogLevel, WebSocketHandle};
use rquickjs::{Persistent, Value};

use crate::env::Env;
use crate::host::{D1Database, TcpConnection};

/// Allocates monotonic request ids, never reused for the lifetime of
/// the process.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Resource limits the engine applies to one request.
#[derive(Debug, Clone, Copy)]
pub struct RequestLimits {
    pub max_fetch: u32,
    pub max_response_bytes: usize,
    pub fetch_timeout_ms: u64,
    pub max_sockets: u32,
    pub socket_buffer_bytes: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_fetch: 50,
            max_response_bytes: 10 * 1024 * 1024,
            fetch_timeout_ms: 30_000,
            max_sockets: 10,
            socket_buffer_bytes: 1024 * 1024,
        }
    }
}

pub struct RequestState {
    pub id: u64,
    pub site_id: String,
    pub deploy_key: String,
    pub env: Env,
    pub limits: RequestLimits,
    /// Absolute cut-off for handler execution.
    pub deadline: Instant,
    pub logs: Vec<LogEntry>,
    pub fetch_count: u32,
    pub socket_count: u32,
    /// Promises handed to `ctx.waitUntil`, drained after the response.
    pub wait_until: Vec<Persistent<Value<'static>>>,
    /// Open TCP connections, closed at teardown.
    pub sockets: Vec<Arc<dyn TcpConnection>>,
    /// Open D1 bridges, closed at teardown.
    pub d1_handles: Vec<Arc<dyn D1Database>>,
    /// Server end of an upgraded WebSocket pair, captured when the
    /// handler returns a 101 response with a `webSocket` field.
    pub web_socket: Option<Arc<WebSocketHandle>>,
    pub pass_through_on_exception: bool,
}

impl RequestState {
    pub fn new(
        site_id: impl Into<String>,
        deploy_key: impl Into<String>,
        env: Env,
        deadline: Instant,
        limits: RequestLimits,
    ) -> Self {
        Self {
            id: next_request_id(),
            site_id: site_id.into(),
            deploy_key: deploy_key.into(),
            env,
            limits,
            deadline,
            logs: Vec::new(),
            fetch_count: 0,
            socket_count: 0,
            wait_until: Vec::new(),
            sockets: Vec::new(),
            d1_handles: Vec::new(),
            web_socket: None,
            pass_through_on_exception: false,
        }
    }

    pub fn log(&mut self, level: LogLevel, message: String) {
        self.logs.push(LogEntry {
            level,
            message,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        });
    }

    /// Remaining time before the deadline, in milliseconds.
    pub fn remaining_ms(&self) -> u64 {
        self.deadline
            .saturating_duration_since(Instant::now())
            .as_millis() as u64
    }

    /// Releases every resource the request still owns. Idempotent.
    pub fn release_resources(&mut self) {
        for socket in self.sockets.drain(..) {
            socket.close();
        }
        for db in self.d1_handles.drain(..) {
            db.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_monotonic() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b > a);
    }
}
