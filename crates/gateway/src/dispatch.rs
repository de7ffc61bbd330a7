//! Fan-out of one logical request to many targets.
//!
//! # Flow
//!
//! ```text
//! send_gateway_reqs(base, targets, reqs, rctx)
//!   ├─ create completion signal      (fails → SystemError, nothing sent)
//!   ├─ reserve N work items          (fails → NoMem, nothing sent)
//!   ├─ for each target i:
//!   │    header_i = base + reqs[i].{dlen, off} + i + rctx.copy_policy
//!   │    queue_work(item_i)          worker: exec_req(target_i, header_i)
//!   │                                done:   report → post signal
//!   └─ wait on the signal N times, then hand buffers back to reqs
//! ```
//!
//! Each item owns a private copy of the header and the target's buffer
//! while it runs. The base header is never modified. Completions arrive in
//! no particular order; the call returns only after all N have posted.

use std::mem;
use std::sync::Arc;

use corelib::{Node, NodeId, RequestHeader, ResponseHeader};
use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, instrument, warn};
use transport::{ExecError, RequestExecutor};

use crate::completion::{CompletionSignal, SemaphoreSource, SignalSource};
use crate::error::{GatewayError, Result};
use crate::work::{Work, WorkQueue};

/// Items per fan-out; the item index travels in an 8-bit header field.
pub const MAX_TARGETS: usize = u8::MAX as usize + 1;

/// Per-target I/O: the buffer to send or fill, its length and offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReqIter {
    pub buf: Vec<u8>,
    pub dlen: u32,
    pub off: u64,
}

impl ReqIter {
    /// Write `buf` at `off`.
    pub fn write(buf: Vec<u8>, off: u64) -> Self {
        let dlen = buf.len() as u32;
        Self { buf, dlen, off }
    }

    /// Read `dlen` bytes at `off` into a zeroed buffer.
    pub fn read(dlen: u32, off: u64) -> Self {
        Self {
            buf: vec![0; dlen as usize],
            dlen,
            off,
        }
    }
}

/// Values shared by every item of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub epoch: u32,
    pub copy_policy: u8,
}

/// Copy of `base` with the per-item fields of target `index` filled in.
pub fn item_header(
    base: &RequestHeader,
    req: &ReqIter,
    index: usize,
    rctx: &RequestContext,
) -> Result<RequestHeader> {
    let ec_index = u8::try_from(index).map_err(|_| GatewayError::TooManyTargets(index + 1))?;
    let mut hdr = *base;
    hdr.data_length = req.dlen;
    hdr.obj.offset = req.off;
    hdr.obj.ec_index = ec_index;
    hdr.obj.copy_policy = rctx.copy_policy;
    Ok(hdr)
}

struct ItemReport {
    buf: Vec<u8>,
    result: Option<std::result::Result<ResponseHeader, ExecError>>,
}

struct GatewayWork<E: RequestExecutor> {
    executor: Arc<E>,
    nid: NodeId,
    hdr: RequestHeader,
    buf: Vec<u8>,
    epoch: u32,
    index: usize,
    result: Option<std::result::Result<ResponseHeader, ExecError>>,
    finish: Arc<dyn CompletionSignal>,
    report: Sender<ItemReport>,
}

impl<E: RequestExecutor> Work for GatewayWork<E> {
    fn run(&mut self) {
        let result = self
            .executor
            .exec_req(&self.nid, &self.hdr, Some(&mut self.buf[..]));
        if let Err(err) = &result {
            warn!(
                nid = %self.nid,
                index = self.index,
                epoch = self.epoch,
                error = %err,
                "gateway request failed"
            );
        }
        self.result = Some(result);
    }

    fn done(self: Box<Self>) {
        let GatewayWork {
            buf,
            result,
            finish,
            report,
            ..
        } = *self;
        // The receiver outlives every item; a failed send only drops the report.
        let _ = report.send(ItemReport { buf, result });
        finish.post();
    }
}

/// Issues per-target sub-requests through a work queue and waits for all.
pub struct Gateway<E: RequestExecutor, Q: WorkQueue> {
    executor: Arc<E>,
    queue: Q,
    signals: Arc<dyn SignalSource>,
}

impl<E: RequestExecutor, Q: WorkQueue> Gateway<E, Q> {
    pub fn new(executor: Arc<E>, queue: Q) -> Self {
        Self {
            executor,
            queue,
            signals: Arc::new(SemaphoreSource),
        }
    }

    /// Replaces the source of completion signals.
    pub fn with_signal_source(mut self, signals: Arc<dyn SignalSource>) -> Self {
        self.signals = signals;
        self
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Sends one sub-request per target and blocks until all finished.
    ///
    /// Only setup failures are reported; remote failures of individual
    /// targets are logged and otherwise ignored. Use
    /// [`send_gateway_reqs_detailed`](Self::send_gateway_reqs_detailed) to
    /// see them.
    pub fn send_gateway_reqs(
        &self,
        hdr: &RequestHeader,
        targets: &[Node],
        reqs: &mut [ReqIter],
        rctx: &RequestContext,
    ) -> Result<()> {
        self.send_gateway_reqs_detailed(hdr, targets, reqs, rctx)
            .map(|_| ())
    }

    /// Like `send_gateway_reqs`, returning each target's outcome in target
    /// order.
    ///
    /// Read data lands in `reqs[i].buf` once this returns.
    #[instrument(skip_all, fields(opcode = hdr.opcode, targets = targets.len()))]
    pub fn send_gateway_reqs_detailed(
        &self,
        hdr: &RequestHeader,
        targets: &[Node],
        reqs: &mut [ReqIter],
        rctx: &RequestContext,
    ) -> Result<Vec<std::result::Result<ResponseHeader, ExecError>>> {
        if targets.len() != reqs.len() {
            return Err(GatewayError::InvalidParms(format!(
                "{} targets but {} buffers",
                targets.len(),
                reqs.len()
            )));
        }
        let n = targets.len();
        if n > MAX_TARGETS {
            return Err(GatewayError::TooManyTargets(n));
        }

        let finish = self.signals.create().map_err(|err| {
            error!(error = %err, "failed to create completion signal");
            GatewayError::SystemError(err.to_string())
        })?;

        let mut pending: Vec<Receiver<ItemReport>> = Vec::new();
        pending.try_reserve_exact(n).map_err(|_| {
            error!(items = n, "failed to allocate work items");
            GatewayError::NoMem(n)
        })?;

        for (index, (target, req)) in targets.iter().zip(reqs.iter_mut()).enumerate() {
            let item_hdr = item_header(hdr, req, index, rctx)?;
            let (tx, rx) = channel::bounded(1);
            let work = GatewayWork {
                executor: Arc::clone(&self.executor),
                nid: target.nid,
                hdr: item_hdr,
                buf: mem::take(&mut req.buf),
                epoch: rctx.epoch,
                index,
                result: None,
                finish: Arc::clone(&finish),
                report: tx,
            };
            self.queue.queue_work(Box::new(work));
            metrics::counter!("xio.gateway.items").increment(1);
            pending.push(rx);
        }

        for _ in 0..n {
            finish.wait();
        }
        debug!(items = n, "fan-out complete");

        let mut results = Vec::with_capacity(n);
        let mut lost = None;
        for (index, (req, rx)) in reqs.iter_mut().zip(pending).enumerate() {
            match rx.try_recv() {
                Ok(ItemReport {
                    buf,
                    result: Some(result),
                }) => {
                    req.buf = buf;
                    results.push(result);
                }
                Ok(ItemReport { buf, result: None }) => {
                    req.buf = buf;
                    lost.get_or_insert(index);
                }
                Err(_) => {
                    lost.get_or_insert(index);
                }
            }
        }

        match lost {
            Some(index) => Err(GatewayError::LostItem(index)),
            None => Ok(results),
        }
    }
}
