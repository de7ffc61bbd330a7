//! Process-wide transport state.
//!
//! # Ordering
//!
//! Creating a substrate context may change the signal handlers of the
//! calling thread. Anything that depends on a stable signal configuration
//! (a local cluster driver waiting on a signal fd, for example) must be set
//! up after both phases here:
//!
//! 1. `TransportRuntime::init`: global substrate init and iovec limits
//! 2. `TransportRuntime::init_main_ctx`: the long-lived process context
//!
//! The main context is never used for a request; it exists so that those
//! one-time side effects happen first. Requests run on fresh contexts from
//! `Executor`, which refuses to block the thread that ran `init`.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use tracing::{debug, info};

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::executor::Executor;
use crate::substrate::{Substrate, TransportOpt};

/// Initialized substrate plus the long-lived process context.
pub struct TransportRuntime<S: Substrate> {
    substrate: Arc<S>,
    main_thread: ThreadId,
    main_ctx: Option<S::Context>,
    shut_down: bool,
}

impl<S: Substrate> TransportRuntime<S> {
    /// Initializes the substrate and applies the iovec limits.
    ///
    /// The calling thread becomes the main thread.
    pub fn init(substrate: Arc<S>, config: &TransportConfig) -> Result<Self, TransportError> {
        config.validate()?;
        substrate.init()?;
        substrate.set_opt(TransportOpt::MaxInIovLen(config.max_in_iovlen))?;
        substrate.set_opt(TransportOpt::MaxOutIovLen(config.max_out_iovlen))?;
        info!(
            substrate = substrate.name(),
            max_in_iovlen = config.max_in_iovlen,
            max_out_iovlen = config.max_out_iovlen,
            "transport initialized"
        );

        Ok(Self {
            substrate,
            main_thread: thread::current().id(),
            main_ctx: None,
            shut_down: false,
        })
    }

    /// Creates the process context. Later calls are no-ops.
    pub fn init_main_ctx(&mut self) -> Result<(), TransportError> {
        if self.main_ctx.is_none() {
            self.main_ctx = Some(self.substrate.create_context()?);
            debug!("main context created");
        }
        Ok(())
    }

    pub fn main_ctx(&self) -> Option<&S::Context> {
        self.main_ctx.as_ref()
    }

    pub fn main_thread(&self) -> ThreadId {
        self.main_thread
    }

    pub fn substrate(&self) -> &Arc<S> {
        &self.substrate
    }

    /// Executor guarded against blocking the main thread.
    pub fn executor(&self) -> Executor<S> {
        Executor::with_main_thread(Arc::clone(&self.substrate), self.main_thread)
    }

    /// Destroys the main context and shuts the substrate down.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.shut_down {
            return;
        }
        if let Some(ctx) = self.main_ctx.take() {
            self.substrate.destroy_context(ctx);
        }
        self.substrate.shutdown();
        self.shut_down = true;
        info!(substrate = self.substrate.name(), "transport shut down");
    }
}

impl<S: Substrate> Drop for TransportRuntime<S> {
    fn drop(&mut self) {
        self.teardown();
    }
}
