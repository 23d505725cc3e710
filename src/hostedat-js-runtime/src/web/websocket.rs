//! `WebSocketPair` / `WebSocket`.
//!
//! A pair is two in-memory ends wired back to back: a message sent on
//! one end dispatches a `message` event on the other and is recorded on
//! the shared host handle, which the engine surfaces on a 101 response.
//! Wiring the handle to a real network connection is the host's job.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use hostedat_js_common::{WebSocketHandle, WsMessage};
use rquickjs::class::Trace;
use rquickjs::prelude::Opt;
use rquickjs::{Class, Ctx, Exception, FromJs, Function, JsLifetime, Object, Result, Value};

use super::events::{add_listener, dispatch_to, throw_dom, CloseEvent, ListenerStore, MessageEvent, SharedListeners};
use super::support::{as_bytes, bytes_to_js};

pub const CONNECTING: u8 = 0;
pub const OPEN: u8 = 1;
pub const CLOSING: u8 = 2;
pub const CLOSED: u8 = 3;

struct EndState {
    ready_state: Cell<u8>,
    accepted: Cell<bool>,
    listeners: SharedListeners,
}

impl EndState {
    fn new() -> Self {
        Self {
            ready_state: Cell::new(CONNECTING),
            accepted: Cell::new(false),
            listeners: ListenerStore::shared(),
        }
    }
}

struct PairState {
    handle: Arc<WebSocketHandle>,
    ends: [EndState; 2],
    closed: Cell<bool>,
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct WebSocket {
    #[qjs(skip_trace)]
    pair: Rc<PairState>,
    #[qjs(skip_trace)]
    end: usize,
    #[qjs(skip_trace)]
    protocol: String,
}

impl WebSocket {
    fn this_end(&self) -> &EndState {
        &self.pair.ends[self.end]
    }

    fn other_end(&self) -> &EndState {
        &self.pair.ends[1 - self.end]
    }

    /// The host handle behind a socket value, for 101 extraction.
    pub(crate) fn handle_of(value: &Value<'_>) -> Option<Arc<WebSocketHandle>> {
        let class = Class::<WebSocket>::from_js(value.ctx(), value.clone()).ok()?;
        let handle = class.borrow().pair.handle.clone();
        Some(handle)
    }
}

fn validate_protocols(ctx: &Ctx<'_>, protocols: &[String]) -> Result<()> {
    let mut seen = Vec::new();
    for protocol in protocols {
        if protocol.is_empty()
            || protocol.chars().any(|c| c.is_ascii_whitespace() || c.is_control())
        {
            return Err(throw_dom(
                ctx,
                "SyntaxError",
                &format!("invalid WebSocket subprotocol {protocol:?}"),
            ));
        }
        if seen.contains(protocol) {
            return Err(throw_dom(
                ctx,
                "SyntaxError",
                &format!("duplicate WebSocket subprotocol {protocol:?}"),
            ));
        }
        seen.push(protocol.clone());
    }
    Ok(())
}

#[rquickjs::methods]
impl WebSocket {
    /// Outbound client sockets are not wired by the core; constructing
    /// one validates its arguments and yields a socket that never
    /// leaves `CONNECTING`.
    #[qjs(constructor)]
    pub fn new<'js>(ctx: Ctx<'js>, url: String, protocols: Opt<Value<'js>>) -> Result<Self> {
        let parsed = url::Url::parse(&url)
            .map_err(|e| throw_dom(&ctx, "SyntaxError", &format!("invalid WebSocket URL: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(throw_dom(
                &ctx,
                "SyntaxError",
                "WebSocket URLs must use the ws: or wss: scheme",
            ));
        }
        let mut protocol = String::new();
        if let Some(protocols) = protocols.0 {
            let list: Vec<String> = if let Some(s) = protocols.as_string() {
                vec![s.to_string()?]
            } else if let Some(array) = protocols.as_object().and_then(|o| o.as_array()) {
                array.iter::<String>().collect::<Result<Vec<_>>>()?
            } else {
                Vec::new()
            };
            validate_protocols(&ctx, &list)?;
            protocol = list.first().cloned().unwrap_or_default();
        }
        let pair = Rc::new(PairState {
            handle: Arc::new(WebSocketHandle::new()),
            ends: [EndState::new(), EndState::new()],
            closed: Cell::new(false),
        });
        Ok(Self {
            pair,
            end: 0,
            protocol,
        })
    }

    #[qjs(get, rename = "readyState")]
    pub fn ready_state(&self) -> u8 {
        self.this_end().ready_state.get()
    }

    #[qjs(get)]
    pub fn protocol(&self) -> String {
        self.protocol.clone()
    }

    #[qjs(get)]
    pub fn extensions(&self) -> String {
        String::new()
    }

    pub fn accept(&self, ctx: Ctx<'_>) -> Result<()> {
        let end = self.this_end();
        if end.ready_state.get() != CONNECTING {
            return Err(throw_dom(
                &ctx,
                "InvalidStateError",
                "the WebSocket is not in the CONNECTING state",
            ));
        }
        end.ready_state.set(OPEN);
        end.accepted.set(true);
        self.pair.handle.mark_accepted();
        Ok(())
    }

    pub fn send<'js>(&self, ctx: Ctx<'js>, data: Value<'js>) -> Result<()> {
        let end = self.this_end();
        if !end.accepted.get() {
            return Err(Exception::throw_message(
                &ctx,
                "send() requires accept() to have been called",
            ));
        }
        if end.ready_state.get() != OPEN {
            return Err(throw_dom(
                &ctx,
                "InvalidStateError",
                "the WebSocket is not open",
            ));
        }

        let message = if let Some(text) = data.as_string() {
            WsMessage::Text(text.to_string()?)
        } else {
            WsMessage::Binary(as_bytes(&data)?)
        };
        self.pair.handle.push_outgoing(message.clone());

        // in-VM delivery to the other end
        let other = self.other_end();
        if other.ready_state.get() == OPEN {
            let event_data = match &message {
                WsMessage::Text(t) => rquickjs::String::from_str(ctx.clone(), t)?.into_value(),
                WsMessage::Binary(b) => bytes_to_js(&ctx, b)?,
            };
            let event = Class::instance(ctx.clone(), MessageEvent::with_data(&ctx, event_data))?;
            dispatch_to(&ctx, &other.listeners, "message", &event.into_value())?;
        }
        Ok(())
    }

    pub fn close(&self, ctx: Ctx<'_>, code: Opt<u16>, reason: Opt<String>) -> Result<()> {
        let code = code.0.unwrap_or(1000);
        if code != 1000 && !(3000..=4999).contains(&code) {
            return Err(throw_dom(
                &ctx,
                "InvalidAccessError",
                "close code must be 1000 or in the range 3000-4999",
            ));
        }
        let reason = reason.0.unwrap_or_default();
        if reason.len() > 123 {
            return Err(throw_dom(
                &ctx,
                "SyntaxError",
                "close reason must not exceed 123 bytes",
            ));
        }

        let end = self.this_end();
        if matches!(end.ready_state.get(), CLOSING | CLOSED) {
            return Ok(());
        }
        end.ready_state.set(CLOSED);
        let other = self.other_end();
        let other_was_open = other.ready_state.get() == OPEN;
        other.ready_state.set(CLOSED);

        // close/message ordering: once either side closes, no further
        // messages are delivered
        if !self.pair.closed.replace(true) {
            self.pair.handle.close(code, reason.clone());
            if other_was_open {
                let event =
                    Class::instance(ctx.clone(), CloseEvent::closing(code, reason, true))?;
                dispatch_to(&ctx, &other.listeners, "close", &event.into_value())?;
            }
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
        add_listener(&ctx, &self.this_end().listeners, event_type, callback, &options)
    }

    #[qjs(rename = "removeEventListener")]
    pub fn remove_event_listener<'js>(
        &self,
        ctx: Ctx<'js>,
        event_type: String,
        callback: Function<'js>,
    ) {
        self.this_end()
            .listeners
            .borrow_mut()
            .remove(&ctx, &event_type, &callback);
    }
}

#[rquickjs::class]
#[derive(Trace, JsLifetime)]
pub struct WebSocketPair {
    #[qjs(skip_trace)]
    client: rquickjs::Persistent<Value<'static>>,
    #[qjs(skip_trace)]
    server: rquickjs::Persistent<Value<'static>>,
}

#[rquickjs::methods]
impl WebSocketPair {
    /// Synchronous construction: both ends exist immediately, in the
    /// CONNECTING state.
    #[qjs(constructor)]
    pub fn new(ctx: Ctx<'_>) -> Result<Self> {
        let pair = Rc::new(PairState {
            handle: Arc::new(WebSocketHandle::new()),
            ends: [EndState::new(), EndState::new()],
            closed: Cell::new(false),
        });
        let client = Class::instance(
            ctx.clone(),
            WebSocket {
                pair: pair.clone(),
                end: 0,
                protocol: String::new(),
            },
        )?;
        let server = Class::instance(
            ctx.clone(),
            WebSocket {
                pair,
                end: 1,
                protocol: String::new(),
            },
        )?;
        Ok(Self {
            client: rquickjs::Persistent::save(&ctx, client.into_value()),
            server: rquickjs::Persistent::save(&ctx, server.into_value()),
        })
    }

    #[qjs(get, rename = "0")]
    pub fn zero<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        self.client.clone().restore(&ctx)
    }

    #[qjs(get, rename = "1")]
    pub fn one<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        self.server.clone().restore(&ctx)
    }
}

pub fn setup(ctx: &Ctx<'_>) -> Result<()> {
    let globals = ctx.globals();
    Class::<WebSocket>::define(&globals)?;
    Class::<WebSocketPair>::define(&globals)?;

    // readyState constants on both the constructor and the prototype
    let ctor: Object = globals.get("WebSocket")?;
    let proto: Object = ctor.get("prototype")?;
    for (name, value) in [
        ("CONNECTING", CONNECTING),
        ("OPEN", OPEN),
        ("CLOSING", CLOSING),
        ("CLOSED", CLOSED),
    ] {
        ctor.set(name, value)?;
        proto.set(name, value)?;
    }
    Ok(())
}
