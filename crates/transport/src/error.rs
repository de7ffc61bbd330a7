//! Error types for the transport crate.

use std::fmt;
use std::io;

use corelib::ResultCode;
use thiserror::Error;

use crate::substrate::{MsgDirection, MsgError};

/// Failures reported synchronously by a substrate.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to create execution context: {0}")]
    Context(String),

    #[error("failed to create session for {uri}: {reason}")]
    Session { uri: String, reason: String },

    #[error("failed to connect to {uri}: {reason}")]
    Connect { uri: String, reason: String },

    #[error("send failed: {0}")]
    Send(String),

    #[error("failed to allocate {0} bytes of registered memory")]
    NoMem(usize),

    #[error("unsupported transport: {0}")]
    Unsupported(String),

    #[error("invalid transport option: {0}")]
    InvalidOption(String),

    #[error("transport not initialized")]
    NotInitialized,
}

/// Which substrate object went away before a response arrived.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TeardownScope {
    Connection,
    Session,
}

impl fmt::Display for TeardownScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownScope::Connection => f.write_str("connection"),
            TeardownScope::Session => f.write_str("session"),
        }
    }
}

/// Outcome of a failed blocking call.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The call would block the process's primary thread.
    #[error("blocking request issued from the main thread")]
    MainThread,

    /// Context, session, connection or memory setup failed.
    #[error("setup failed: {0}")]
    Setup(#[from] TransportError),

    /// The request or response did not fit the envelope.
    #[error("envelope error: {0}")]
    Envelope(#[from] corelib::Error),

    /// A second request was issued on a busy call context.
    #[error("call context already has a request in flight")]
    InFlight,

    /// The substrate reported the message as failed.
    #[error("message ({direction}) failed: {error}")]
    Failed {
        direction: MsgDirection,
        error: MsgError,
    },

    #[error("{0} torn down before a response arrived")]
    TornDown(TeardownScope),

    /// The loop returned without any callback reporting an outcome.
    #[error("event loop stopped without an outcome")]
    LoopStopped,
}

impl ExecError {
    /// Wire result code for this failure.
    pub fn result_code(&self) -> ResultCode {
        match self {
            ExecError::MainThread | ExecError::Setup(TransportError::Unsupported(_)) => {
                ResultCode::SystemError
            }
            ExecError::Setup(TransportError::NoMem(_)) => ResultCode::NoMem,
            ExecError::Setup(_) => ResultCode::SystemError,
            ExecError::Envelope(corelib::Error::ShortHeader { .. }) => ResultCode::NetworkError,
            ExecError::Envelope(_) | ExecError::InFlight => ResultCode::InvalidParms,
            ExecError::Failed { .. } | ExecError::TornDown(_) | ExecError::LoopStopped => {
                ResultCode::NetworkError
            }
        }
    }
}
