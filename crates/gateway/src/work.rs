//! Worker pool that runs fan-out items.
//!
//! # Design
//!
//! A work item has two phases. `run` executes on one of the worker threads
//! and may block for a full network round trip. `done` executes afterwards
//! on a single completion thread, in the order items finished.
//!
//! A panic in `run` is caught and logged; `done` still runs so that
//! whoever waits on the item is released.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, warn};

/// A unit of work submitted to a `WorkQueue`.
pub trait Work: Send + 'static {
    /// Runs on a worker thread.
    fn run(&mut self);

    /// Runs after `run`, exactly once, and consumes the item.
    fn done(self: Box<Self>);
}

/// Somewhere to run work.
///
/// Back-pressure is the queue's business: `queue_work` may block or buffer,
/// but every queued item must eventually have `done` called.
pub trait WorkQueue: Send + Sync {
    fn queue_work(&self, work: Box<dyn Work>);
}

/// Fixed-size pool of named worker threads plus one completion thread.
pub struct ThreadPoolQueue {
    name: String,
    jobs: Option<Sender<Box<dyn Work>>>,
    workers: Vec<JoinHandle<()>>,
    completer: Option<JoinHandle<()>>,
}

impl ThreadPoolQueue {
    /// Spawns `workers` threads named `{name}-{i}` and `{name}-done`.
    pub fn new(name: &str, workers: usize) -> io::Result<Self> {
        if workers == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "a work queue needs at least one worker",
            ));
        }

        let (job_tx, job_rx) = channel::unbounded::<Box<dyn Work>>();
        let (done_tx, done_rx) = channel::unbounded::<Box<dyn Work>>();

        let completer = thread::Builder::new()
            .name(format!("{}-done", name))
            .spawn(move || complete(done_rx))?;

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let jobs = job_rx.clone();
            let done = done_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || work(jobs, done))?;
            handles.push(handle);
        }

        debug!(name, workers, "work queue started");
        Ok(Self {
            name: name.to_string(),
            jobs: Some(job_tx),
            workers: handles,
            completer: Some(completer),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }
}

impl WorkQueue for ThreadPoolQueue {
    fn queue_work(&self, work: Box<dyn Work>) {
        let Some(jobs) = self.jobs.as_ref() else {
            error!(name = %self.name, "work queued after shutdown");
            work.done();
            return;
        };
        if let Err(channel::SendError(work)) = jobs.send(work) {
            error!(name = %self.name, "no worker left to run work");
            work.done();
        }
    }
}

impl Drop for ThreadPoolQueue {
    fn drop(&mut self) {
        // Workers exit once the job channel closes; the completion thread
        // exits once the last worker drops its sender.
        self.jobs.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.completer.take() {
            let _ = handle.join();
        }
    }
}

fn work(jobs: Receiver<Box<dyn Work>>, done: Sender<Box<dyn Work>>) {
    for mut job in jobs {
        if panic::catch_unwind(AssertUnwindSafe(|| job.run())).is_err() {
            let current = thread::current();
            warn!(thread = current.name().unwrap_or("worker"), "work item panicked");
        }
        if let Err(channel::SendError(job)) = done.send(job) {
            job.done();
        }
    }
}

fn complete(done: Receiver<Box<dyn Work>>) {
    for job in done {
        job.done();
    }
}
