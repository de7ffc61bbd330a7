//! Error types for the fan-out dispatcher.

use corelib::ResultCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The completion signal could not be created.
    #[error("system error: {0}")]
    SystemError(String),

    #[error("failed to allocate {0} work items")]
    NoMem(usize),

    /// The item index no longer fits the header's `ec_index` field.
    #[error("{0} targets exceed the per-request limit of {max}", max = crate::dispatch::MAX_TARGETS)]
    TooManyTargets(usize),

    #[error("invalid parameters: {0}")]
    InvalidParms(String),

    /// A work item finished without producing a result.
    #[error("work item {0} finished without a result")]
    LostItem(usize),

    #[error("invalid gateway config: {0}")]
    Config(String),
}

impl GatewayError {
    /// Wire result code reported for this error.
    pub fn result_code(&self) -> ResultCode {
        match self {
            GatewayError::SystemError(_) | GatewayError::LostItem(_) => ResultCode::SystemError,
            GatewayError::NoMem(_) => ResultCode::NoMem,
            GatewayError::TooManyTargets(_)
            | GatewayError::InvalidParms(_)
            | GatewayError::Config(_) => ResultCode::InvalidParms,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
