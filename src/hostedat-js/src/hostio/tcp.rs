//! Host side of the TCP socket binding.
//!
//! Each connection is one driver task on the I/O runtime that owns the
//! socket. The task keeps a bounded read buffer filled in the
//! background and answers read/write commands from the isolate; reads
//! are level-triggered — buffered bytes are drained immediately, an
//! empty buffer parks the completion until the reader signals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hostedat_js_runtime::host::{TcpAddress, TcpConnection, TcpOptions};
use hostedat_js_runtime::ops::OpCompletion;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use super::runtime::get_io_runtime;
use super::ssrf;

enum Cmd {
    Read { max: usize, done: OpCompletion },
    Write { data: Vec<u8>, done: OpCompletion },
    Opened { done: OpCompletion },
    Closed { done: OpCompletion },
    StartTls,
    CloseWrite,
    Close,
}

enum Io {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Io {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Io::Plain(s) => s.read(buf).await,
            Io::Tls(s) => s.read(buf).await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Io::Plain(s) => s.write_all(data).await,
            Io::Tls(s) => s.write_all(data).await,
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Io::Plain(s) => s.shutdown().await,
            Io::Tls(s) => s.shutdown().await,
        }
    }
}

pub(crate) struct HostTcpConnection {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    /// False once `start_tls` replaced this handle; a dead handle
    /// refuses further traffic.
    alive: AtomicBool,
    tls_started: Arc<AtomicBool>,
}

impl HostTcpConnection {
    /// Spawns the driver task. Dialing (and the SSRF check) happens on
    /// the task; failures surface through `opened`, `read` and `write`.
    pub(crate) fn connect(
        addr: TcpAddress,
        opts: TcpOptions,
        buffer_cap: usize,
    ) -> Result<Arc<Self>, String> {
        let runtime =
            get_io_runtime().ok_or_else(|| "host I/O runtime is unavailable".to_string())?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        runtime.spawn(drive_connection(addr, opts, buffer_cap, cmd_rx));
        Ok(Arc::new(Self {
            cmd_tx,
            alive: AtomicBool::new(true),
            tls_started: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn send(&self, cmd: Cmd) {
        if !self.alive.load(Ordering::Acquire) {
            reject_cmd(cmd, "socket was replaced by startTls");
            return;
        }
        if let Err(back) = self.cmd_tx.send(cmd) {
            reject_cmd(back.0, "connection is closed");
        }
    }
}

impl TcpConnection for HostTcpConnection {
    fn opened(&self, done: OpCompletion) {
        self.send(Cmd::Opened { done });
    }

    fn read(&self, max: usize, done: OpCompletion) {
        self.send(Cmd::Read { max, done });
    }

    fn write(&self, data: Vec<u8>, done: OpCompletion) {
        self.send(Cmd::Write { data, done });
    }

    fn close_write(&self) {
        self.send(Cmd::CloseWrite);
    }

    fn close(&self) {
        let _ = self.cmd_tx.send(Cmd::Close);
    }

    fn closed(&self, done: OpCompletion) {
        if self.cmd_tx.send(Cmd::Closed { done }).is_err() {
            // the driver is already gone, which is as closed as it gets
        }
    }

    fn start_tls(self: Arc<Self>) -> Result<Arc<dyn TcpConnection>, String> {
        if self.tls_started.swap(true, Ordering::AcqRel) {
            return Err("TLS has already been negotiated on this socket".to_string());
        }
        self.cmd_tx
            .send(Cmd::StartTls)
            .map_err(|_| "connection is closed".to_string())?;
        self.alive.store(false, Ordering::Release);
        Ok(Arc::new(Self {
            cmd_tx: self.cmd_tx.clone(),
            alive: AtomicBool::new(true),
            tls_started: self.tls_started.clone(),
        }))
    }
}

fn reject_cmd(cmd: Cmd, message: &str) {
    match cmd {
        Cmd::Read { done, .. } | Cmd::Write { done, .. } | Cmd::Opened { done } => {
            done.reject(message.to_string())
        }
        Cmd::Closed { done } => done.resolve(serde_json::json!({})),
        Cmd::StartTls | Cmd::CloseWrite | Cmd::Close => {}
    }
}

fn tls_connector() -> TlsConnector {
    let mut roots = tokio_rustls::rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = tokio_rustls::rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

struct Parked {
    max: usize,
    done: OpCompletion,
}

#[derive(Default)]
struct Driver {
    buffer: Vec<u8>,
    eof: bool,
    error: Option<String>,
    parked: Option<Parked>,
}

impl Driver {
    /// Serve a read from the buffer when possible (the drain step of
    /// the level-triggered contract); parks the completion otherwise.
    fn serve_read(&mut self, max: usize, done: OpCompletion) {
        if let Some(message) = &self.error {
            done.reject(message.clone());
            return;
        }
        if !self.buffer.is_empty() {
            let take = self.buffer.len().min(max);
            let chunk: Vec<u8> = self.buffer.drain(..take).collect();
            done.resolve(serde_json::json!({ "data": STANDARD.encode(&chunk) }));
            return;
        }
        if self.eof {
            done.resolve(serde_json::json!({ "done": true }));
            return;
        }
        if self.parked.is_some() {
            done.reject("a read is already pending");
            return;
        }
        self.parked = Some(Parked { max, done });
    }

    fn fail(&mut self, message: String) {
        if let Some(waiting) = self.parked.take() {
            waiting.done.reject(message.clone());
        }
        self.error = Some(message);
    }

    fn signal(&mut self) {
        if let Some(waiting) = self.parked.take() {
            self.serve_read(waiting.max, waiting.done);
        }
    }
}

enum Step {
    Cmd(Option<Cmd>),
    Read(std::io::Result<usize>),
}

async fn drive_connection(
    addr: TcpAddress,
    opts: TcpOptions,
    buffer_cap: usize,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
) {
    let mut closed_waiters: Vec<OpCompletion> = Vec::new();

    let dial = async {
        let socket_addr = ssrf::resolve_checked(&addr.hostname, addr.port).await?;
        let stream = TcpStream::connect(socket_addr)
            .await
            .map_err(|e| format!("connect to {}:{} failed: {e}", addr.hostname, addr.port))?;
        if opts.secure_transport {
            let server_name = ServerName::try_from(addr.hostname.clone())
                .map_err(|_| format!("invalid TLS server name {:?}", addr.hostname))?;
            let tls = tls_connector()
                .connect(server_name, stream)
                .await
                .map_err(|e| format!("TLS handshake failed: {e}"))?;
            Ok(Io::Tls(Box::new(tls)))
        } else {
            Ok(Io::Plain(stream))
        }
    };

    let mut io = match dial.await {
        Ok(io) => io,
        Err(message) => {
            // answer everything queued behind the failed dial
            while let Some(cmd) = cmd_rx.recv().await {
                reject_cmd(cmd, &message);
            }
            return;
        }
    };

    let mut state = Driver::default();
    let mut read_chunk = vec![0u8; 16 * 1024];

    loop {
        let want_read = !state.eof && state.error.is_none() && state.buffer.len() < buffer_cap;
        let step = {
            let read_fut = io.read(&mut read_chunk);
            tokio::pin!(read_fut);
            tokio::select! {
                cmd = cmd_rx.recv() => Step::Cmd(cmd),
                result = &mut read_fut, if want_read => Step::Read(result),
            }
        };

        match step {
            Step::Cmd(None) => break,
            Step::Cmd(Some(cmd)) => match cmd {
                Cmd::Opened { done } => done.resolve(serde_json::json!({})),
                Cmd::Closed { done } => closed_waiters.push(done),
                Cmd::Read { max, done } => state.serve_read(max, done),
                Cmd::Write { data, done } => match io.write_all(&data).await {
                    Ok(()) => done.resolve(serde_json::json!({})),
                    Err(e) => {
                        done.reject(format!("write failed: {e}"));
                        break;
                    }
                },
                Cmd::StartTls => match io {
                    Io::Plain(stream) => {
                        let Ok(server_name) = ServerName::try_from(addr.hostname.clone()) else {
                            break;
                        };
                        match tls_connector().connect(server_name, stream).await {
                            Ok(tls) => io = Io::Tls(Box::new(tls)),
                            Err(e) => {
                                state.fail(format!("TLS handshake failed: {e}"));
                                break;
                            }
                        }
                    }
                    tls @ Io::Tls(_) => io = tls,
                },
                Cmd::CloseWrite => {
                    let _ = io.shutdown().await;
                    if !opts.allow_half_open {
                        break;
                    }
                }
                Cmd::Close => break,
            },
            Step::Read(Ok(0)) => {
                state.eof = true;
                state.signal();
            }
            Step::Read(Ok(n)) => {
                state.buffer.extend_from_slice(&read_chunk[..n]);
                if state.buffer.len() > buffer_cap {
                    state.fail(format!("socket read buffer exceeded {buffer_cap} bytes"));
                    break;
                }
                state.signal();
            }
            Step::Read(Err(e)) => {
                state.fail(format!("read failed: {e}"));
                break;
            }
        }
    }

    if let Some(waiting) = state.parked.take() {
        match &state.error {
            Some(message) => waiting.done.reject(message.clone()),
            None => waiting.done.resolve(serde_json::json!({ "done": true })),
        }
    }
    for done in closed_waiters {
        done.resolve(serde_json::json!({}));
    }
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        reject_cmd(cmd, "connection is closed");
    }
}
