//! Command-line client for storage nodes.
//!
//! Provides commands for:
//! - Reading and writing a single object on one node
//! - Striped reads across several nodes through the fan-out dispatcher

pub mod commands;
pub mod config;

pub use commands::{Command, CommandResult};
pub use config::CliConfig;
