//! Blocking request execution.
//!
//! Each call owns a fresh execution context and connection for its whole
//! round trip:
//!
//! 1. Create the context, open a session and connect (`connection`)
//! 2. Build the envelope (`envelope`) and send it
//! 3. Run the loop with no timeout until a callback stops it (`router`)
//! 4. Read the posted outcome; finalize into the caller's buffers
//! 5. Destroy connection, session and context, on every path
//!
//! Retry is left to the caller: an `ExecError` carries enough to decide
//! (`ExecError::result_code`), and nothing here loops on failure.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use corelib::{NodeId, RequestHeader, ResponseHeader};
use crossbeam::channel::{bounded, Receiver};
use tracing::{debug, instrument, warn};

use crate::connection::create_connection;
use crate::envelope::{msg_finalize, msg_prep_for_send};
use crate::error::{ExecError, TransportError};
use crate::router::{CallOutcome, ClientSessionOps};
use crate::substrate::{LoopTimeout, Msg, Substrate};

/// Anything that can run one blocking request against a node.
pub trait RequestExecutor: Send + Sync + 'static {
    /// Sends `hdr` to `nid` and blocks until the call terminates.
    ///
    /// For writes `data` holds the body; otherwise it receives the response
    /// data, if any.
    fn exec_req(
        &self,
        nid: &NodeId,
        hdr: &RequestHeader,
        data: Option<&mut [u8]>,
    ) -> Result<ResponseHeader, ExecError>;
}

/// Lifecycle of one call context.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CallState {
    Idle,
    AwaitingResponse,
    Completed,
    Failed,
    TornDown,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Completed | CallState::Failed | CallState::TornDown)
    }
}

/// One execution context plus one connection, scoped to a single call.
pub struct CallContext<S: Substrate> {
    substrate: Arc<S>,
    ctx: S::Context,
    session: S::Session,
    conn: S::Connection,
    outcome: Receiver<CallOutcome>,
    state: CallState,
}

impl<S: Substrate> CallContext<S> {
    /// Creates a context and connects to `nid` within it.
    pub fn open(substrate: Arc<S>, nid: &NodeId) -> Result<Self, TransportError> {
        let ctx = substrate.create_context()?;
        let (tx, rx) = bounded(1);
        let ops = Arc::new(ClientSessionOps::new(
            Arc::clone(&substrate),
            substrate.stopper(&ctx),
            tx,
        ));

        match create_connection(&*substrate, &ctx, nid, ops) {
            Ok((session, conn)) => Ok(Self {
                substrate,
                ctx,
                session,
                conn,
                outcome: rx,
                state: CallState::Idle,
            }),
            Err(err) => {
                substrate.destroy_context(ctx);
                Err(err)
            }
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Sends `msg` and blocks in the loop until a terminal outcome.
    ///
    /// A context carries at most one request; later calls fail with
    /// `ExecError::InFlight`.
    pub fn round_trip(&mut self, msg: Msg) -> Result<Msg, ExecError> {
        if self.state != CallState::Idle {
            return Err(ExecError::InFlight);
        }

        let sn = msg.sn;
        if let Err(err) = self.substrate.send_request(&self.conn, msg) {
            self.state = CallState::Failed;
            return Err(err.into());
        }
        self.state = CallState::AwaitingResponse;
        metrics::counter!("xio.requests.sent").increment(1);

        if let Err(err) = self.substrate.run_loop(&self.ctx, LoopTimeout::Infinite) {
            self.state = CallState::Failed;
            return Err(err.into());
        }

        match self.outcome.try_recv() {
            Ok(CallOutcome::Completed(rsp)) => {
                self.state = CallState::Completed;
                metrics::counter!("xio.requests.completed").increment(1);
                Ok(rsp)
            }
            Ok(CallOutcome::Failed { direction, error }) => {
                self.state = CallState::Failed;
                metrics::counter!("xio.requests.failed").increment(1);
                Err(ExecError::Failed { direction, error })
            }
            Ok(CallOutcome::TornDown(scope)) => {
                self.state = CallState::TornDown;
                metrics::counter!("xio.requests.torn_down").increment(1);
                Err(ExecError::TornDown(scope))
            }
            Err(_) => {
                warn!(sn, "loop returned without an outcome");
                self.state = CallState::Failed;
                Err(ExecError::LoopStopped)
            }
        }
    }

    /// Destroys connection, session and context, in that order.
    pub fn close(self) {
        let substrate = self.substrate;
        substrate.destroy_connection(self.conn);
        substrate.destroy_session(self.session);
        substrate.destroy_context(self.ctx);
    }
}

/// Runs blocking requests over a substrate.
pub struct Executor<S: Substrate> {
    substrate: Arc<S>,
    main_thread: Option<ThreadId>,
}

impl<S: Substrate> Clone for Executor<S> {
    fn clone(&self) -> Self {
        Self {
            substrate: Arc::clone(&self.substrate),
            main_thread: self.main_thread,
        }
    }
}

impl<S: Substrate> Executor<S> {
    /// Executor with no main-thread guard.
    pub fn new(substrate: Arc<S>) -> Self {
        Self {
            substrate,
            main_thread: None,
        }
    }

    /// Executor that refuses to block `main_thread`.
    pub fn with_main_thread(substrate: Arc<S>, main_thread: ThreadId) -> Self {
        Self {
            substrate,
            main_thread: Some(main_thread),
        }
    }

    pub fn substrate(&self) -> &Arc<S> {
        &self.substrate
    }

    fn on_main_thread(&self) -> bool {
        self.main_thread == Some(thread::current().id())
    }
}

impl<S: Substrate> RequestExecutor for Executor<S> {
    #[instrument(skip_all, fields(nid = %nid, opcode = hdr.opcode, len = hdr.data_length))]
    fn exec_req(
        &self,
        nid: &NodeId,
        hdr: &RequestHeader,
        data: Option<&mut [u8]>,
    ) -> Result<ResponseHeader, ExecError> {
        if self.on_main_thread() {
            return Err(ExecError::MainThread);
        }

        let msg = msg_prep_for_send(hdr, data.as_deref())?;
        let mut call = CallContext::open(Arc::clone(&self.substrate), nid)?;
        let result = call.round_trip(msg).and_then(|rsp| {
            msg_finalize(&*self.substrate, rsp, data).map_err(ExecError::from)
        });
        call.close();

        let header = result?;
        debug!(result = %header.result, "request finished");
        Ok(header)
    }
}
