//! Session callbacks for a blocking client call.
//!
//! The substrate invokes these handlers while the calling thread sits in
//! `run_loop`. Each handler turns its event into a typed `CallOutcome`
//! posted on a single-slot channel; the executor reads that slot once the
//! loop returns. The first outcome wins. A response that loses the race is
//! released immediately so no substrate resources leak.

use std::sync::Arc;

use crossbeam::channel::{Sender, TrySendError};
use tracing::{debug, warn};

use crate::error::{TeardownScope, TransportError};
use crate::substrate::{LoopStopper, Msg, MsgDirection, MsgError, SessionEvent, SessionOps, Substrate};

/// Terminal result of one call, as observed by the callbacks.
#[derive(Debug)]
pub enum CallOutcome {
    /// The response arrived; the message still has to be released.
    Completed(Msg),
    Failed {
        direction: MsgDirection,
        error: MsgError,
    },
    TornDown(TeardownScope),
}

/// Callback router bound to one call context.
pub struct ClientSessionOps<S: Substrate> {
    substrate: Arc<S>,
    stopper: S::Stopper,
    outcome: Sender<CallOutcome>,
}

impl<S: Substrate> ClientSessionOps<S> {
    /// `outcome` should be a bounded(1) sender.
    pub fn new(substrate: Arc<S>, stopper: S::Stopper, outcome: Sender<CallOutcome>) -> Self {
        Self {
            substrate,
            stopper,
            outcome,
        }
    }

    fn post(&self, outcome: CallOutcome) {
        match self.outcome.try_send(outcome) {
            Ok(()) => {}
            Err(TrySendError::Full(late)) | Err(TrySendError::Disconnected(late)) => {
                debug!(?late, "call already has an outcome, dropping");
                if let CallOutcome::Completed(msg) = late {
                    self.substrate.release_response(msg);
                }
            }
        }
    }
}

impl<S: Substrate> SessionOps for ClientSessionOps<S> {
    fn on_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::ConnectionTeardown => {
                self.post(CallOutcome::TornDown(TeardownScope::Connection));
                self.stopper.stop_loop();
            }
            SessionEvent::SessionTeardown => {
                self.post(CallOutcome::TornDown(TeardownScope::Session));
                self.stopper.stop_loop();
            }
            other => debug!(event = ?other, "other event"),
        }
    }

    fn on_msg(&self, rsp: Msg, _last_in_rxq: bool) {
        debug!(sn = rsp.sn, "response on session");
        self.post(CallOutcome::Completed(rsp));
        self.stopper.stop_loop();
    }

    fn on_msg_error(&self, error: MsgError, direction: MsgDirection, msg: Msg) {
        warn!(sn = msg.sn, %direction, %error, "message failed");
        if direction == MsgDirection::In {
            self.substrate.release_response(msg);
        }
        // The loop keeps running; the substrate follows up with a teardown.
        self.post(CallOutcome::Failed { direction, error });
    }

    fn assign_data_in_buf(&self, msg: &mut Msg) -> Result<(), TransportError> {
        for iov in msg.inbound.sglist.iter_mut().filter(|iov| iov.needs_buffer()) {
            debug!(sn = msg.sn, len = iov.len, "assign buffer");
            let reg = self.substrate.mem_alloc(iov.len)?;
            iov.base = Some(reg.buf);
            iov.mr = reg.mr;
        }
        Ok(())
    }
}
