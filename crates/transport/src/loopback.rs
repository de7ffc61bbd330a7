//! In-memory substrate.
//!
//! A handler closure plays the storage node: for every request it decides
//! whether to respond, fail the send, fail the receive, or tear the
//! connection down. Events are queued on the context and dispatched from
//! `run_loop` on the calling thread, the same way a real event loop invokes
//! callbacks. The substrate keeps counters (`LoopbackStats`) for sends,
//! overlapping sends, releases per message and destroyed objects, so tests
//! can check resource discipline.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use corelib::{RequestHeader, ResponseHeader, ResultCode};
use parking_lot::{Condvar, Mutex};

use crate::config::DEFAULT_MAX_IOVLEN;
use crate::error::{TeardownScope, TransportError};
use crate::substrate::{
    LoopStopper, LoopTimeout, MemRegion, Msg, MsgDirection, MsgError, RegMem, SessionEvent,
    SessionOps, SessionParams, Substrate, TransportOpt,
};

/// What the simulated node does with one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Respond {
        header: ResponseHeader,
        data: Vec<Bytes>,
    },
    FailSend(MsgError),
    FailRecv(MsgError),
    Teardown(TeardownScope),
}

impl Reply {
    /// Successful response carrying `data` as separate segments.
    pub fn respond(req: &RequestHeader, data: Vec<Bytes>) -> Self {
        let len: usize = data.iter().map(Bytes::len).sum();
        Reply::Respond {
            header: ResponseHeader::reply_to(req, ResultCode::Success, len as u32),
            data,
        }
    }

    /// Data-less response with `result`.
    pub fn status(req: &RequestHeader, result: ResultCode) -> Self {
        Reply::Respond {
            header: ResponseHeader::reply_to(req, result, 0),
            data: Vec::new(),
        }
    }

    pub fn teardown() -> Self {
        Reply::Teardown(TeardownScope::Connection)
    }
}

type Handler = dyn Fn(&str, &RequestHeader, Option<&[u8]>) -> Reply + Send + Sync;
type Event = Box<dyn FnOnce() + Send>;

/// Counters kept by the loopback substrate.
#[derive(Debug, Clone, Default)]
pub struct LoopbackStats {
    pub initialized: bool,
    pub max_in_iovlen: usize,
    pub max_out_iovlen: usize,
    pub contexts_created: usize,
    pub contexts_destroyed: usize,
    pub sessions_created: usize,
    pub sessions_destroyed: usize,
    pub connections_created: usize,
    pub connections_destroyed: usize,
    pub sends: usize,
    /// Sends issued while the connection already had a request in flight.
    pub overlapping_sends: usize,
    /// Release count per message serial number.
    pub releases: HashMap<u64, u32>,
    pub mem_allocs: usize,
}

struct Shared {
    handler: Box<Handler>,
    stats: Mutex<LoopbackStats>,
    refuse_connections: AtomicBool,
    next_id: AtomicU64,
}

#[derive(Default)]
struct LoopState {
    queue: VecDeque<Event>,
    stop_requested: bool,
}

#[derive(Default)]
struct LoopInner {
    state: Mutex<LoopState>,
    cond: Condvar,
}

impl LoopInner {
    fn push(&self, event: Event) {
        self.state.lock().queue.push_back(event);
        self.cond.notify_one();
    }

    fn stop(&self) {
        self.state.lock().stop_requested = true;
        self.cond.notify_one();
    }
}

/// Execution context of the loopback substrate.
pub struct LoopbackContext {
    inner: Arc<LoopInner>,
}

#[derive(Clone)]
pub struct LoopbackStopper {
    inner: Arc<LoopInner>,
}

impl LoopStopper for LoopbackStopper {
    fn stop_loop(&self) {
        self.inner.stop();
    }
}

pub struct LoopbackSession {
    uri: String,
    ops: Arc<dyn SessionOps>,
}

pub struct LoopbackConnection {
    id: u64,
    uri: String,
    ops: Arc<dyn SessionOps>,
    ctx: Arc<LoopInner>,
    in_flight: Arc<AtomicBool>,
}

impl LoopbackConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

/// In-memory substrate driven by a node handler.
pub struct Loopback {
    shared: Arc<Shared>,
}

impl Loopback {
    /// `handler` receives the connection URI, the decoded request header
    /// and the request body, if any.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &RequestHeader, Option<&[u8]>) -> Reply + Send + Sync + 'static,
    {
        let stats = LoopbackStats {
            max_in_iovlen: DEFAULT_MAX_IOVLEN,
            max_out_iovlen: DEFAULT_MAX_IOVLEN,
            ..LoopbackStats::default()
        };
        Self {
            shared: Arc::new(Shared {
                handler: Box::new(handler),
                stats: Mutex::new(stats),
                refuse_connections: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Makes every later `connect` fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> LoopbackStats {
        self.shared.stats.lock().clone()
    }
}

impl Shared {
    fn deliver(&self, uri: &str, ops: &dyn SessionOps, mut msg: Msg, in_flight: &AtomicBool) {
        let reply = match RequestHeader::decode(&msg.out.header) {
            Ok(hdr) => {
                let body = msg.out.sglist.first().map(|iov| &iov.base[..]);
                (self.handler)(uri, &hdr, body)
            }
            Err(err) => Reply::FailSend(MsgError::Protocol(err.to_string())),
        };
        in_flight.store(false, Ordering::SeqCst);

        match reply {
            Reply::Respond { header, data } => {
                let max_in = self.stats.lock().max_in_iovlen;
                match fill_response(&mut msg, ops, &header, &data, max_in) {
                    Ok(()) => ops.on_msg(msg, true),
                    Err(err) => {
                        ops.on_msg_error(err, MsgDirection::In, msg);
                        ops.on_session_event(SessionEvent::ConnectionTeardown);
                    }
                }
            }
            Reply::FailSend(err) => {
                ops.on_msg_error(err, MsgDirection::Out, msg);
                ops.on_session_event(SessionEvent::ConnectionTeardown);
            }
            Reply::FailRecv(err) => {
                ops.on_msg_error(err, MsgDirection::In, msg);
                ops.on_session_event(SessionEvent::ConnectionTeardown);
            }
            Reply::Teardown(scope) => {
                drop(msg);
                ops.on_session_event(match scope {
                    TeardownScope::Connection => SessionEvent::ConnectionTeardown,
                    TeardownScope::Session => SessionEvent::SessionTeardown,
                });
            }
        }
    }
}

fn fill_response(
    msg: &mut Msg,
    ops: &dyn SessionOps,
    header: &ResponseHeader,
    data: &[Bytes],
    max_in: usize,
) -> Result<(), MsgError> {
    msg.inbound.header = BytesMut::from(&header.to_bytes()[..]);
    msg.inbound.fit(header.data_length as usize, max_in)?;
    if msg.inbound.needs_buffers() {
        ops.assign_data_in_buf(msg)
            .map_err(|err| MsgError::Io(err.to_string()))?;
    }
    msg.inbound.scatter(data)
}

impl Substrate for Loopback {
    type Context = LoopbackContext;
    type Session = LoopbackSession;
    type Connection = LoopbackConnection;
    type Stopper = LoopbackStopper;

    fn name(&self) -> &'static str {
        "loopback"
    }

    fn init(&self) -> Result<(), TransportError> {
        self.shared.stats.lock().initialized = true;
        Ok(())
    }

    fn shutdown(&self) {
        self.shared.stats.lock().initialized = false;
    }

    fn set_opt(&self, opt: TransportOpt) -> Result<(), TransportError> {
        let mut stats = self.shared.stats.lock();
        match opt {
            TransportOpt::MaxInIovLen(n) if n >= 2 => stats.max_in_iovlen = n,
            TransportOpt::MaxOutIovLen(n) if n >= 2 => stats.max_out_iovlen = n,
            other => return Err(TransportError::InvalidOption(format!("{:?}", other))),
        }
        Ok(())
    }

    fn create_context(&self) -> Result<Self::Context, TransportError> {
        self.shared.stats.lock().contexts_created += 1;
        Ok(LoopbackContext {
            inner: Arc::new(LoopInner::default()),
        })
    }

    fn stopper(&self, ctx: &Self::Context) -> Self::Stopper {
        LoopbackStopper {
            inner: Arc::clone(&ctx.inner),
        }
    }

    fn create_session(&self, params: SessionParams) -> Result<Self::Session, TransportError> {
        if !(params.uri.starts_with("tcp://") || params.uri.starts_with("rdma://")) {
            return Err(TransportError::Unsupported(params.uri));
        }
        self.shared.stats.lock().sessions_created += 1;
        Ok(LoopbackSession {
            uri: params.uri,
            ops: params.ops,
        })
    }

    fn connect(
        &self,
        session: &Self::Session,
        ctx: &Self::Context,
    ) -> Result<Self::Connection, TransportError> {
        if self.shared.refuse_connections.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                uri: session.uri.clone(),
                reason: "connection refused".to_string(),
            });
        }
        self.shared.stats.lock().connections_created += 1;

        let ops = Arc::clone(&session.ops);
        ctx.inner
            .push(Box::new(move || ops.on_session_event(SessionEvent::ConnectionEstablished)));

        Ok(LoopbackConnection {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
            uri: session.uri.clone(),
            ops: Arc::clone(&session.ops),
            ctx: Arc::clone(&ctx.inner),
            in_flight: Arc::new(AtomicBool::new(false)),
        })
    }

    fn send_request(&self, conn: &Self::Connection, msg: Msg) -> Result<(), TransportError> {
        {
            let mut stats = self.shared.stats.lock();
            stats.sends += 1;
            if msg.out.sglist.len() + 1 > stats.max_out_iovlen {
                return Err(TransportError::Send(format!(
                    "{} outbound entries exceed the limit of {}",
                    msg.out.sglist.len() + 1,
                    stats.max_out_iovlen
                )));
            }
            if conn.in_flight.swap(true, Ordering::SeqCst) {
                stats.overlapping_sends += 1;
                return Err(TransportError::Send(format!(
                    "connection {} already has a request in flight",
                    conn.id
                )));
            }
        }

        let shared = Arc::clone(&self.shared);
        let ops = Arc::clone(&conn.ops);
        let in_flight = Arc::clone(&conn.in_flight);
        let uri = conn.uri.clone();
        conn.ctx
            .push(Box::new(move || shared.deliver(&uri, &*ops, msg, &in_flight)));
        Ok(())
    }

    fn run_loop(&self, ctx: &Self::Context, timeout: LoopTimeout) -> Result<(), TransportError> {
        let deadline = match timeout {
            LoopTimeout::Infinite => None,
            LoopTimeout::After(after) => Some(Instant::now() + after),
        };

        loop {
            let event = {
                let mut state = ctx.inner.state.lock();
                loop {
                    if state.stop_requested {
                        state.stop_requested = false;
                        return Ok(());
                    }
                    if let Some(event) = state.queue.pop_front() {
                        break event;
                    }
                    match deadline {
                        None => ctx.inner.cond.wait(&mut state),
                        Some(deadline) => {
                            if ctx.inner.cond.wait_until(&mut state, deadline).timed_out() {
                                return Ok(());
                            }
                        }
                    }
                }
            };
            event();
        }
    }

    fn release_response(&self, msg: Msg) {
        *self
            .shared
            .stats
            .lock()
            .releases
            .entry(msg.sn)
            .or_insert(0) += 1;
    }

    fn mem_alloc(&self, len: usize) -> Result<RegMem, TransportError> {
        self.shared.stats.lock().mem_allocs += 1;
        Ok(RegMem {
            buf: BytesMut::zeroed(len),
            mr: Some(MemRegion(self.shared.next_id.fetch_add(1, Ordering::Relaxed))),
        })
    }

    fn destroy_connection(&self, _conn: Self::Connection) {
        self.shared.stats.lock().connections_destroyed += 1;
    }

    fn destroy_session(&self, _session: Self::Session) {
        self.shared.stats.lock().sessions_destroyed += 1;
    }

    fn destroy_context(&self, _ctx: Self::Context) {
        self.shared.stats.lock().contexts_destroyed += 1;
    }
}
