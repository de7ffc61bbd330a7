//! Core library shared by the storage client crates.
//!
//! This crate provides the fundamental types for talking to a storage node:
//! - Node identity and connection targets
//! - Request and response wire headers
//! - Result codes

pub mod error;
pub mod node;
pub mod proto;

pub use error::{Error, Result};
pub use node::{Node, NodeId, TransportType};
pub use proto::{Flags, ObjRequest, ObjResponse, RequestHeader, ResponseHeader, ResultCode};
