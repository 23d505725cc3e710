//! `connect()` and the socket object it returns.
//!
//! The host owns the connection, its background reader and the SSRF
//! check; this module owns the JS surface: the readable/writable stream
//! pair, the `opened`/`closed` promises and `startTls`.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rquickjs::class::Trace;
use rquickjs::{Class, Ctx, Exception, JsLifetime, Persistent, Promise, Result, Value};

use super::streams::{new_readable_with_source, new_writable_with_sink};
use super::support::{self, arg, as_bytes, native_fn, undef};
use crate::core::SharedCore;
use crate::host::{TcpAddress, TcpConnection, TcpOptions};

const READ_CHUNK: usize = 64 * 1024;

type SavedVal = Persistent<Value<'static>>;

/// Starts a host op against the connection and returns its promise.
fn conn_op<'js>(
    ctx: &Ctx<'js>,
    core: &SharedCore,
    start: impl FnOnce(crate::ops::OpCompletion),
) -> Result<Promise<'js>> {
    let (promise, resolve, reject) = Promise::new(ctx)?;
    let completion = core.borrow_mut().begin_op(ctx, resolve, reject);
    start(completion);
    Ok(promise)
}

#[rquickjs::class(rename = "TCPSocket")]
#[derive(Clone, Trace, JsLifetime)]
pub struct TcpSocket {
    #[qjs(skip_trace)]
    conn: Arc<dyn TcpConnection>,
    #[qjs(skip_trace)]
    core: SharedCore,
    #[qjs(skip_trace)]
    readable_value: SavedVal,
    #[qjs(skip_trace)]
    writable_value: SavedVal,
    #[qjs(skip_trace)]
    secure_transport: String,
}

impl TcpSocket {
    pub(crate) fn wrap<'js>(
        ctx: &Ctx<'js>,
        core: &SharedCore,
        conn: Arc<dyn TcpConnection>,
        secure_transport: String,
    ) -> Result<Class<'js, TcpSocket>> {
        // readable: each pull runs one host read; EOF closes the stream
        let pull_core = core.clone();
        let pull_conn = conn.clone();
        let pull = native_fn(ctx, move |ctx, args| {
            let controller = arg(&ctx, &args, 0);
            let controller = controller
                .as_object()
                .ok_or_else(|| Exception::throw_type(&ctx, "missing stream controller"))?
                .clone();
            let read_conn = pull_conn.clone();
            let read = conn_op(&ctx, &pull_core, move |completion| {
                read_conn.read(READ_CHUNK, completion);
            })?;
            let ctrl_ok = Persistent::save(&ctx, controller.clone());
            let on_ok = native_fn(&ctx, move |ctx, args| {
                let payload = arg(&ctx, &args, 0);
                let controller = ctrl_ok.clone().restore(&ctx)?;
                let done = payload
                    .as_object()
                    .and_then(|o| o.get::<_, bool>("done").ok())
                    .unwrap_or(false);
                if done {
                    support::call_method::<()>(&ctx, &controller, "close", [])?;
                    return Ok(undef(&ctx));
                }
                let data = payload
                    .as_object()
                    .and_then(|o| o.get::<_, String>("data").ok())
                    .unwrap_or_default();
                let bytes = STANDARD.decode(data).unwrap_or_default();
                let chunk = support::bytes_to_js(&ctx, &bytes)?;
                support::call_method::<()>(&ctx, &controller, "enqueue", [chunk])?;
                Ok(undef(&ctx))
            })?;
            let ctrl_err = Persistent::save(&ctx, controller);
            let on_err = native_fn(&ctx, move |ctx, args| {
                let controller = ctrl_err.clone().restore(&ctx)?;
                support::call_method::<()>(&ctx, &controller, "error", [arg(&ctx, &args, 0)])?;
                Ok(undef(&ctx))
            })?;
            support::then(&ctx, read.into_value(), on_ok, Some(on_err))?;
            Ok(undef(&ctx))
        })?;
        let cancel_conn = conn.clone();
        let cancel = native_fn(ctx, move |ctx, _args| {
            cancel_conn.close();
            Ok(undef(&ctx))
        })?;
        let readable = new_readable_with_source(ctx, Some(pull), Some(cancel), 0.0)?;

        // writable: one in-flight host write at a time
        let write_core = core.clone();
        let write_conn = conn.clone();
        let sink_write = native_fn(ctx, move |ctx, args| {
            let chunk = arg(&ctx, &args, 0);
            let bytes = as_bytes(&chunk)?;
            let conn = write_conn.clone();
            let write = conn_op(&ctx, &write_core, move |completion| {
                conn.write(bytes, completion);
            })?;
            Ok(write.into_value())
        })?;
        let close_conn = conn.clone();
        let sink_close = native_fn(ctx, move |ctx, _args| {
            close_conn.close_write();
            Ok(undef(&ctx))
        })?;
        let abort_conn = conn.clone();
        let sink_abort = native_fn(ctx, move |ctx, _args| {
            abort_conn.close();
            Ok(undef(&ctx))
        })?;
        let writable =
            new_writable_with_sink(ctx, Some(sink_write), Some(sink_close), Some(sink_abort), 1.0)?;

        Class::instance(
            ctx.clone(),
            TcpSocket {
                conn,
                core: core.clone(),
                readable_value: Persistent::save(ctx, readable.into_value()),
                writable_value: Persistent::save(ctx, writable.into_value()),
                secure_transport,
            },
        )
    }
}

#[rquickjs::methods]
impl TcpSocket {
    #[qjs(get)]
    pub fn readable<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        self.readable_value.clone().restore(&ctx)
    }

    #[qjs(get)]
    pub fn writable<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        self.writable_value.clone().restore(&ctx)
    }

    #[qjs(get)]
    pub fn opened<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        let conn = self.conn.clone();
        conn_op(&ctx, &self.core, move |completion| {
            conn.opened(completion);
        })
    }

    #[qjs(get)]
    pub fn closed<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        let conn = self.conn.clone();
        conn_op(&ctx, &self.core, move |completion| {
            conn.closed(completion);
        })
    }

    pub fn close<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        self.conn.close();
        let conn = self.conn.clone();
        conn_op(&ctx, &self.core, move |completion| {
            conn.closed(completion);
        })
    }

    #[qjs(rename = "startTls")]
    pub fn start_tls<'js>(&self, ctx: Ctx<'js>) -> Result<Class<'js, TcpSocket>> {
        if self.secure_transport != "starttls" {
            return Err(Exception::throw_type(
                &ctx,
                "startTls requires the socket to be created with secureTransport: \"starttls\"",
            ));
        }
        let upgraded = self
            .conn
            .clone()
            .start_tls()
            .map_err(|e| Exception::throw_message(&ctx, &e))?;
        TcpSocket::wrap(&ctx, &self.core, upgraded, "on".to_string())
    }
}

fn parse_address<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Result<TcpAddress> {
    if let Some(s) = value.as_string() {
        let address = s.to_string()?;
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| Exception::throw_type(ctx, "address must be \"host:port\""))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Exception::throw_type(ctx, "invalid port"))?;
        return Ok(TcpAddress {
            hostname: host.to_string(),
            port,
        });
    }
    if let Some(obj) = value.as_object() {
        let hostname: String = obj
            .get("hostname")
            .map_err(|_| Exception::throw_type(ctx, "address requires a hostname"))?;
        let port: u16 = obj
            .get("port")
            .map_err(|_| Exception::throw_type(ctx, "address requires a port"))?;
        return Ok(TcpAddress { hostname, port });
    }
    Err(Exception::throw_type(
        ctx,
        "address must be \"host:port\" or {hostname, port}",
    ))
}

pub fn setup(ctx: &Ctx<'_>, core: &SharedCore) -> Result<()> {
    let connect_core = core.clone();
    ctx.globals().set(
        "connect",
        native_fn(ctx, move |ctx, args| {
            let address = parse_address(&ctx, &arg(&ctx, &args, 0))?;
            let options = args.0.get(1).and_then(|v| v.as_object().cloned());
            let secure_transport = options
                .as_ref()
                .and_then(|o| o.get::<_, String>("secureTransport").ok())
                .unwrap_or_else(|| "off".to_string());
            let allow_half_open = options
                .and_then(|o| o.get::<_, bool>("allowHalfOpen").ok())
                .unwrap_or(false);

            let (host, max_sockets) = {
                let mut core_ref = connect_core.borrow_mut();
                let host = core_ref.host.clone();
                let request = core_ref.request_mut().map_err(|_| {
                    Exception::throw_message(&ctx, "connect is unavailable outside a request")
                })?;
                (host, request.limits.max_sockets)
            };
            {
                let mut core_ref = connect_core.borrow_mut();
                let request = core_ref.request_mut().map_err(|_| {
                    Exception::throw_message(&ctx, "connect is unavailable outside a request")
                })?;
                if request.socket_count >= max_sockets {
                    return Err(Exception::throw_message(
                        &ctx,
                        &format!("too many open sockets: the limit is {max_sockets} per request"),
                    ));
                }
                request.socket_count += 1;
            }

            let conn = host
                .tcp_connect(
                    address,
                    TcpOptions {
                        secure_transport: secure_transport == "on",
                        allow_half_open,
                    },
                )
                .map_err(|e| Exception::throw_message(&ctx, &e))?;

            connect_core
                .borrow_mut()
                .request_mut()
                .map_err(|_| Exception::throw_message(&ctx, "request ended during connect"))?
                .sockets
                .push(conn.clone());

            Ok(TcpSocket::wrap(&ctx, &connect_core, conn, secure_transport)?.into_value())
        })?
        .with_name("connect")?,
    )?;
    Class::<TcpSocket>::define(&ctx.globals())?;
    Ok(())
}
