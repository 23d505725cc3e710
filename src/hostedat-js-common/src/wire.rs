use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Severity of a single worker log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Log,
    Info,
    Warn,
    Error,
}

/// One `console.*` record emitted while a request was running.
///
/// `timestamp_ms` is milliseconds since the Unix epoch, captured on the
/// isolate thread when the console call happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp_ms: u64,
}

/// An inbound HTTP request at the host boundary.
///
/// Header names are lower-cased; multi-valued headers arrive pre-joined
/// with `", "` the way the dispatcher flattens them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    #[serde(with = "serde_bytes_b64", default)]
    pub body: Vec<u8>,
}

/// The serialised `Response` a handler produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    #[serde(with = "serde_bytes_b64", default)]
    pub body: Vec<u8>,
    /// True when the handler returned a 101 response carrying a
    /// WebSocket; the socket itself travels out of band on the result.
    pub has_web_socket: bool,
}

/// Outcome of one engine invocation.
///
/// Exactly one of `response` / `error` is set for `execute`;
/// `execute_scheduled` and `execute_tail` produce neither, and
/// `execute_function` carries its JSON return value in `data`.
#[derive(Debug, Clone, Default)]
pub struct WorkerResult {
    pub response: Option<WorkerResponse>,
    pub error: Option<String>,
    pub logs: Vec<LogEntry>,
    pub duration: Duration,
    /// The server end of an upgraded WebSocket pair, present when the
    /// response carried status 101 with a `webSocket` field.
    pub web_socket: Option<std::sync::Arc<crate::WebSocketHandle>>,
    /// JSON-serialised return value of the named export, for
    /// `execute_function` only.
    pub data: Option<serde_json::Value>,
}

impl WorkerResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Bodies are bytes; serde them as standard base64 so wire structs stay
/// JSON-representable for dispatchers that want to forward them.
mod serde_bytes_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_round_trips_through_json() {
        let req = WorkerRequest {
            method: "POST".into(),
            url: "http://localhost/".into(),
            headers: HashMap::from([("content-type".into(), "application/json".into())]),
            body: vec![0, 159, 146, 150],
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: WorkerRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.body, req.body);
        assert_eq!(back.method, "POST");
    }

    #[test]
    fn result_without_error_is_ok() {
        let res = WorkerResult::default();
        assert!(res.is_ok());
        let failed = WorkerResult {
            error: Some("boom".into()),
            ..Default::default()
        };
        assert!(!failed.is_ok());
    }
}
