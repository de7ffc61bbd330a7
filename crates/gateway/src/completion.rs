//! Counting completion signal shared by the items of one fan-out.

use std::io;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Counting event: `post` adds one, `wait` blocks until it can take one.
pub trait CompletionSignal: Send + Sync {
    fn post(&self);
    fn wait(&self);
}

/// Creates one signal per fan-out.
///
/// Creation may fail (an event fd, for example), which the dispatcher
/// reports as a system error before submitting anything.
pub trait SignalSource: Send + Sync {
    fn create(&self) -> io::Result<Arc<dyn CompletionSignal>>;
}

/// In-process counting semaphore.
#[derive(Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts not yet taken by `wait`.
    pub fn available(&self) -> usize {
        *self.count.lock()
    }
}

impl CompletionSignal for Semaphore {
    fn post(&self) {
        *self.count.lock() += 1;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SemaphoreSource;

impl SignalSource for SemaphoreSource {
    fn create(&self) -> io::Result<Arc<dyn CompletionSignal>> {
        Ok(Arc::new(Semaphore::new()))
    }
}
