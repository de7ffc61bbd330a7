//! Messaging substrate abstraction.
//!
//! The substrate is the event-driven transport underneath a call: it owns
//! execution contexts (event loops), sessions and connections, and reports
//! progress through the `SessionOps` callbacks. Everything above this module
//! is written against these traits, so the same call path runs over the TCP
//! stream substrate or the in-memory loopback used by tests.
//!
//! ```text
//! ┌──────────────┐   create_session / connect / send_request
//! │   Executor   │ ─────────────────────────────────────────────▶ ┌───────────┐
//! └──────┬───────┘                                                │ Substrate │
//!        │ run_loop (blocks)                                      └─────┬─────┘
//!        ▼                                                              │
//! ┌──────────────┐   on_msg / on_msg_error / on_session_event           │
//! │    Router    │ ◀────────────────────────────────────────────────────┘
//! └──────────────┘
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::error::TransportError;

/// Handle of a registered memory region.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct MemRegion(pub u64);

/// Memory obtained from `Substrate::mem_alloc`.
#[derive(Debug)]
pub struct RegMem {
    pub buf: BytesMut,
    pub mr: Option<MemRegion>,
}

/// Outbound scatter/gather entry.
#[derive(Clone, Debug)]
pub struct OutIov {
    pub base: Bytes,
    pub mr: Option<MemRegion>,
}

impl OutIov {
    pub fn len(&self) -> usize {
        self.base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }
}

/// Inbound scatter/gather entry.
///
/// `base` may be `None` until the substrate asks the session ops to assign
/// a receive buffer.
#[derive(Debug, Default)]
pub struct InIov {
    pub base: Option<BytesMut>,
    pub len: usize,
    pub mr: Option<MemRegion>,
}

impl InIov {
    /// Entry backed by a zeroed buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            base: Some(BytesMut::zeroed(len)),
            len,
            mr: None,
        }
    }

    /// Entry whose backing store is assigned later.
    pub fn unassigned(len: usize) -> Self {
        Self {
            base: None,
            len,
            mr: None,
        }
    }

    pub fn needs_buffer(&self) -> bool {
        self.len > 0 && self.base.is_none()
    }

    /// The filled bytes of this entry.
    pub fn data(&self) -> &[u8] {
        match &self.base {
            Some(base) => &base[..self.len.min(base.len())],
            None => &[],
        }
    }
}

/// Outbound half of a message: fixed header slot plus data entries.
#[derive(Debug)]
pub struct OutMsg {
    pub header: Bytes,
    pub sglist: Vec<OutIov>,
}

/// Inbound half of a message: fixed header slot plus data entries.
#[derive(Debug)]
pub struct InMsg {
    pub header: BytesMut,
    pub sglist: Vec<InIov>,
}

impl InMsg {
    pub fn capacity(&self) -> usize {
        self.sglist.iter().map(|iov| iov.len).sum()
    }

    /// Shapes the data entries to hold exactly `data_length` bytes.
    ///
    /// Entries are trimmed in order. Bytes beyond the prepared entries get a
    /// new unassigned entry if the header slot plus entries stay within
    /// `max_nents`; otherwise the response does not fit.
    pub fn fit(&mut self, data_length: usize, max_nents: usize) -> Result<(), MsgError> {
        let room = self.capacity();
        let mut remaining = data_length;
        for iov in self.sglist.iter_mut() {
            let take = iov.len.min(remaining);
            iov.len = take;
            remaining -= take;
        }
        if remaining > 0 {
            if self.sglist.len() + 1 >= max_nents {
                return Err(MsgError::Overflow {
                    got: data_length,
                    room,
                });
            }
            self.sglist.push(InIov::unassigned(remaining));
        }
        Ok(())
    }

    pub fn needs_buffers(&self) -> bool {
        self.sglist.iter().any(InIov::needs_buffer)
    }

    /// Copies `segments` into the data entries, in entry order.
    pub fn scatter(&mut self, segments: &[Bytes]) -> Result<(), MsgError> {
        let mut src = segments.iter().flat_map(|s| s.iter().copied());
        for iov in self.sglist.iter_mut() {
            let len = iov.len;
            if len == 0 {
                continue;
            }
            let base = iov.base.as_mut().ok_or(MsgError::NoBuffer)?;
            if base.len() < len {
                return Err(MsgError::Overflow {
                    got: len,
                    room: base.len(),
                });
            }
            for slot in base[..len].iter_mut() {
                *slot = src.next().ok_or_else(|| {
                    MsgError::Protocol("response shorter than its header".to_string())
                })?;
            }
        }
        Ok(())
    }
}

/// One request/response pair as handed to the substrate.
#[derive(Debug)]
pub struct Msg {
    /// Serial number, unique per process.
    pub sn: u64,
    pub out: OutMsg,
    pub inbound: InMsg,
}

/// Direction of a failed message.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MsgDirection {
    In,
    Out,
}

impl fmt::Display for MsgDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MsgDirection::In => f.write_str("in"),
            MsgDirection::Out => f.write_str("out"),
        }
    }
}

/// Reason a message failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MsgError {
    /// Message flushed from the queue when its connection went away.
    #[error("message flushed")]
    Flushed,
    #[error("connection closed by peer")]
    Disconnected,
    #[error("IO error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("response of {got} bytes exceeds receive buffers of {room} bytes")]
    Overflow { got: usize, room: usize },
    #[error("no receive buffer assigned")]
    NoBuffer,
}

/// Session lifecycle events.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SessionEvent {
    ConnectionEstablished,
    ConnectionClosed,
    ConnectionError,
    ConnectionTeardown,
    SessionTeardown,
}

/// Role of a session.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SessionType {
    Client,
    Server,
}

/// Callbacks the substrate invokes while a context's loop runs.
///
/// The ops object doubles as the per-session user context.
pub trait SessionOps: Send + Sync + 'static {
    fn on_session_event(&self, event: SessionEvent);

    /// A response arrived; ownership of the message returns to the caller.
    fn on_msg(&self, rsp: Msg, last_in_rxq: bool);

    fn on_msg_error(&self, error: MsgError, direction: MsgDirection, msg: Msg);

    /// Attach backing memory to inbound entries that have none.
    fn assign_data_in_buf(&self, msg: &mut Msg) -> Result<(), TransportError>;
}

/// Parameters for `Substrate::create_session`.
#[derive(Clone)]
pub struct SessionParams {
    pub session_type: SessionType,
    pub uri: String,
    pub ops: Arc<dyn SessionOps>,
}

impl fmt::Debug for SessionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionParams")
            .field("session_type", &self.session_type)
            .field("uri", &self.uri)
            .finish()
    }
}

/// Substrate-wide options.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TransportOpt {
    /// Max inbound entries, header slot included.
    MaxInIovLen(usize),
    /// Max outbound entries, header slot included.
    MaxOutIovLen(usize),
}

/// How long `run_loop` may block.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LoopTimeout {
    Infinite,
    After(Duration),
}

/// Stops a running loop from inside a callback.
pub trait LoopStopper: Clone + Send + Sync + 'static {
    fn stop_loop(&self);
}

/// The event-driven transport a call runs on.
pub trait Substrate: Send + Sync + 'static {
    type Context: Send;
    type Session: Send;
    type Connection: Send;
    type Stopper: LoopStopper;

    /// Human-readable name (for logging).
    fn name(&self) -> &'static str;

    fn init(&self) -> Result<(), TransportError>;

    fn shutdown(&self);

    fn set_opt(&self, opt: TransportOpt) -> Result<(), TransportError>;

    fn create_context(&self) -> Result<Self::Context, TransportError>;

    fn stopper(&self, ctx: &Self::Context) -> Self::Stopper;

    fn create_session(&self, params: SessionParams) -> Result<Self::Session, TransportError>;

    fn connect(
        &self,
        session: &Self::Session,
        ctx: &Self::Context,
    ) -> Result<Self::Connection, TransportError>;

    /// Queues `msg`; completion is reported through the session ops.
    fn send_request(&self, conn: &Self::Connection, msg: Msg) -> Result<(), TransportError>;

    /// Runs the context's loop until stopped or `timeout` elapses.
    fn run_loop(&self, ctx: &Self::Context, timeout: LoopTimeout) -> Result<(), TransportError>;

    /// Hands a received message back to the substrate.
    fn release_response(&self, msg: Msg);

    fn mem_alloc(&self, len: usize) -> Result<RegMem, TransportError>;

    fn destroy_connection(&self, conn: Self::Connection);

    fn destroy_session(&self, session: Self::Session);

    fn destroy_context(&self, ctx: Self::Context);
}
