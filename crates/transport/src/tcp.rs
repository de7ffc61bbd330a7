//! Stream substrate over TCP.
//!
//! Each execution context owns a current-thread tokio runtime; `run_loop`
//! drives it until a callback stops the loop. A connection is a task on that
//! runtime which connects lazily, then serves queued messages one at a time:
//! write `header + body`, read the response header, shape the inbound
//! entries to the announced length and read the data into them.
//!
//! I/O failures are reported through `on_msg_error` followed by a
//! connection-teardown event, so a waiting loop always returns.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use corelib::proto::{ResponseHeader, SD_RSP_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::DEFAULT_MAX_IOVLEN;
use crate::error::TransportError;
use crate::substrate::{
    LoopStopper, LoopTimeout, MemRegion, Msg, MsgDirection, MsgError, RegMem, SessionEvent,
    SessionOps, SessionParams, Substrate, TransportOpt,
};

/// Execution context: a single-threaded runtime plus its stop signal.
pub struct TcpContext {
    rt: Runtime,
    stop: Arc<Notify>,
}

#[derive(Clone)]
pub struct TcpStopper {
    stop: Arc<Notify>,
}

impl LoopStopper for TcpStopper {
    fn stop_loop(&self) {
        // Stores a permit when the loop is not yet waiting.
        self.stop.notify_one();
    }
}

pub struct TcpSession {
    uri: String,
    addr: SocketAddr,
    ops: Arc<dyn SessionOps>,
}

pub struct TcpConnection {
    uri: String,
    tx: mpsc::UnboundedSender<Msg>,
    task: JoinHandle<()>,
}

/// TCP implementation of `Substrate`.
pub struct TcpSubstrate {
    initialized: AtomicBool,
    max_in_iovlen: AtomicUsize,
    max_out_iovlen: AtomicUsize,
    next_mr: AtomicU64,
}

impl Default for TcpSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpSubstrate {
    pub fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            max_in_iovlen: AtomicUsize::new(DEFAULT_MAX_IOVLEN),
            max_out_iovlen: AtomicUsize::new(DEFAULT_MAX_IOVLEN),
            next_mr: AtomicU64::new(1),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
}

impl Substrate for TcpSubstrate {
    type Context = TcpContext;
    type Session = TcpSession;
    type Connection = TcpConnection;
    type Stopper = TcpStopper;

    fn name(&self) -> &'static str {
        "tcp"
    }

    fn init(&self) -> Result<(), TransportError> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) {
        self.initialized.store(false, Ordering::SeqCst);
    }

    fn set_opt(&self, opt: TransportOpt) -> Result<(), TransportError> {
        match opt {
            TransportOpt::MaxInIovLen(n) if n >= 2 => self.max_in_iovlen.store(n, Ordering::SeqCst),
            TransportOpt::MaxOutIovLen(n) if n >= 2 => {
                self.max_out_iovlen.store(n, Ordering::SeqCst)
            }
            other => return Err(TransportError::InvalidOption(format!("{:?}", other))),
        }
        Ok(())
    }

    fn create_context(&self) -> Result<Self::Context, TransportError> {
        let rt = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TransportError::Context(e.to_string()))?;
        Ok(TcpContext {
            rt,
            stop: Arc::new(Notify::new()),
        })
    }

    fn stopper(&self, ctx: &Self::Context) -> Self::Stopper {
        TcpStopper {
            stop: Arc::clone(&ctx.stop),
        }
    }

    fn create_session(&self, params: SessionParams) -> Result<Self::Session, TransportError> {
        let addr = match params.uri.split_once("://") {
            Some(("tcp", addr)) => addr,
            Some(("rdma", _)) => {
                return Err(TransportError::Unsupported(format!(
                    "{}: RDMA is not available on the stream substrate",
                    params.uri
                )))
            }
            _ => return Err(TransportError::Unsupported(params.uri)),
        };
        let addr: SocketAddr = addr.parse().map_err(|e: std::net::AddrParseError| {
            TransportError::Session {
                uri: params.uri.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(TcpSession {
            uri: params.uri,
            addr,
            ops: params.ops,
        })
    }

    fn connect(
        &self,
        session: &Self::Session,
        ctx: &Self::Context,
    ) -> Result<Self::Connection, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let max_in = self.max_in_iovlen.load(Ordering::SeqCst);
        let task = ctx.rt.spawn(run_connection(
            session.addr,
            Arc::clone(&session.ops),
            rx,
            max_in,
        ));
        Ok(TcpConnection {
            uri: session.uri.clone(),
            tx,
            task,
        })
    }

    fn send_request(&self, conn: &Self::Connection, msg: Msg) -> Result<(), TransportError> {
        let max_out = self.max_out_iovlen.load(Ordering::SeqCst);
        if msg.out.sglist.len() + 1 > max_out {
            return Err(TransportError::Send(format!(
                "{} outbound entries exceed the limit of {}",
                msg.out.sglist.len() + 1,
                max_out
            )));
        }
        conn.tx
            .send(msg)
            .map_err(|_| TransportError::Send(format!("{}: connection task has exited", conn.uri)))
    }

    fn run_loop(&self, ctx: &Self::Context, timeout: LoopTimeout) -> Result<(), TransportError> {
        match timeout {
            LoopTimeout::Infinite => ctx.rt.block_on(ctx.stop.notified()),
            LoopTimeout::After(after) => ctx.rt.block_on(async {
                // Elapsing is a normal return.
                let _ = tokio::time::timeout(after, ctx.stop.notified()).await;
            }),
        }
        Ok(())
    }

    fn release_response(&self, msg: Msg) {
        debug!(sn = msg.sn, "release response");
    }

    fn mem_alloc(&self, len: usize) -> Result<RegMem, TransportError> {
        Ok(RegMem {
            buf: BytesMut::zeroed(len),
            mr: Some(MemRegion(self.next_mr.fetch_add(1, Ordering::Relaxed))),
        })
    }

    fn destroy_connection(&self, conn: Self::Connection) {
        conn.task.abort();
    }

    fn destroy_session(&self, _session: Self::Session) {}

    fn destroy_context(&self, ctx: Self::Context) {
        ctx.rt.shutdown_background();
    }
}

type Failure = (MsgError, MsgDirection, Msg);

async fn run_connection(
    addr: SocketAddr,
    ops: Arc<dyn SessionOps>,
    mut rx: mpsc::UnboundedReceiver<Msg>,
    max_in: usize,
) {
    let mut stream = match TcpStream::connect(addr).await {
        Ok(stream) => {
            let _ = stream.set_nodelay(true);
            ops.on_session_event(SessionEvent::ConnectionEstablished);
            stream
        }
        Err(err) => {
            warn!(%addr, error = %err, "connect failed");
            ops.on_session_event(SessionEvent::ConnectionError);
            while let Ok(msg) = rx.try_recv() {
                ops.on_msg_error(MsgError::Io(err.to_string()), MsgDirection::Out, msg);
            }
            ops.on_session_event(SessionEvent::ConnectionTeardown);
            return;
        }
    };

    while let Some(msg) = rx.recv().await {
        match round_trip(&mut stream, &*ops, msg, max_in).await {
            Ok(msg) => ops.on_msg(msg, true),
            Err((error, direction, msg)) => {
                ops.on_msg_error(error, direction, msg);
                ops.on_session_event(SessionEvent::ConnectionTeardown);
                return;
            }
        }
    }
}

async fn round_trip(
    stream: &mut TcpStream,
    ops: &dyn SessionOps,
    mut msg: Msg,
    max_in: usize,
) -> Result<Msg, Failure> {
    if let Err(err) = write_request(stream, &msg).await {
        return Err((io_error(err), MsgDirection::Out, msg));
    }
    match read_response(stream, ops, &mut msg, max_in).await {
        Ok(()) => Ok(msg),
        Err(err) => Err((err, MsgDirection::In, msg)),
    }
}

async fn write_request(stream: &mut TcpStream, msg: &Msg) -> io::Result<()> {
    stream.write_all(&msg.out.header).await?;
    for iov in &msg.out.sglist {
        stream.write_all(&iov.base).await?;
    }
    stream.flush().await
}

async fn read_response(
    stream: &mut TcpStream,
    ops: &dyn SessionOps,
    msg: &mut Msg,
    max_in: usize,
) -> Result<(), MsgError> {
    let mut header = [0u8; SD_RSP_SIZE];
    stream.read_exact(&mut header).await.map_err(io_error)?;
    let rsp = ResponseHeader::decode(&header).map_err(|e| MsgError::Protocol(e.to_string()))?;
    msg.inbound.header = BytesMut::from(&header[..]);

    msg.inbound.fit(rsp.data_length as usize, max_in)?;
    if msg.inbound.needs_buffers() {
        ops.assign_data_in_buf(msg)
            .map_err(|e| MsgError::Io(e.to_string()))?;
    }

    for iov in msg.inbound.sglist.iter_mut() {
        if iov.len == 0 {
            continue;
        }
        let base = iov.base.as_mut().ok_or(MsgError::NoBuffer)?;
        if base.len() < iov.len {
            return Err(MsgError::Overflow {
                got: iov.len,
                room: base.len(),
            });
        }
        stream
            .read_exact(&mut base[..iov.len])
            .await
            .map_err(io_error)?;
    }
    Ok(())
}

fn io_error(err: io::Error) -> MsgError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe => MsgError::Disconnected,
        _ => MsgError::Io(err.to_string()),
    }
}
