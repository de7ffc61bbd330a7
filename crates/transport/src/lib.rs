//! Blocking RPC client transport for storage nodes.
//!
//! This crate bridges an event-driven messaging substrate into a blocking,
//! one-call-per-thread API:
//! - Substrate abstraction (`substrate`) with TCP and loopback implementations
//! - Envelope construction and response de-scatter (`envelope`)
//! - Connection establishment (`connection`)
//! - Session callbacks posting typed call outcomes (`router`)
//! - The blocking executor (`executor`)
//! - Process-wide init/shutdown and the long-lived context (`runtime`)

pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod loopback;
pub mod router;
pub mod runtime;
pub mod substrate;
pub mod tcp;

pub use config::TransportConfig;
pub use error::{ExecError, TeardownScope, TransportError};
pub use executor::{CallContext, CallState, Executor, RequestExecutor};
pub use loopback::{Loopback, LoopbackStats, Reply};
pub use router::CallOutcome;
pub use runtime::TransportRuntime;
pub use substrate::{MsgDirection, MsgError, Substrate};
pub use tcp::TcpSubstrate;
