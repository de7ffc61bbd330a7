//! Fan-out dispatcher.
//!
//! Splits one logical multi-target operation into independent sub-requests,
//! runs each through a blocking `RequestExecutor` on a worker pool and
//! blocks the caller until every item has signalled completion.

pub mod completion;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod work;

pub use completion::{CompletionSignal, Semaphore, SemaphoreSource, SignalSource};
pub use config::GatewayConfig;
pub use dispatch::{item_header, Gateway, ReqIter, RequestContext, MAX_TARGETS};
pub use error::GatewayError;
pub use work::{ThreadPoolQueue, Work, WorkQueue};
