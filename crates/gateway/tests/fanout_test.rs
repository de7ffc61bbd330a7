//! Fan-out dispatcher tests.
//!
//! # Test Strategy
//!
//! 1. **Per-item headers**: each target sees its own length, offset and index
//! 2. **Completion**: the caller returns only after all N items finished
//! 3. **Setup failures**: nothing is submitted when setup fails
//! 4. **Outcomes**: remote failures stay out of the aggregate result
//! 5. **End to end**: real executor over the loopback substrate

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use corelib::{Node, NodeId, RequestHeader, ResponseHeader, ResultCode};
use gateway::{
    CompletionSignal, Gateway, GatewayError, ReqIter, RequestContext, Semaphore, SignalSource,
    ThreadPoolQueue, Work, WorkQueue,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use transport::error::TeardownScope;
use transport::{ExecError, Executor, Loopback, Reply, RequestExecutor};

// ============================================================================
// Test Doubles
// ============================================================================

/// Executor that records every call, sleeps for a per-port latency and
/// fills read buffers with the item index.
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(NodeId, RequestHeader)>>,
    finished: AtomicUsize,
    latency_ms: Mutex<Vec<u64>>,
    failing_port: Option<u16>,
}

impl RequestExecutor for Recorder {
    fn exec_req(
        &self,
        nid: &NodeId,
        hdr: &RequestHeader,
        data: Option<&mut [u8]>,
    ) -> Result<ResponseHeader, ExecError> {
        self.calls.lock().push((*nid, *hdr));
        let latency = self
            .latency_ms
            .lock()
            .get(hdr.obj.ec_index as usize)
            .copied()
            .unwrap_or(0);
        thread::sleep(Duration::from_millis(latency));
        self.finished.fetch_add(1, Ordering::SeqCst);

        if Some(nid.io_port) == self.failing_port {
            return Err(ExecError::TornDown(TeardownScope::Connection));
        }
        if !hdr.is_write() {
            if let Some(data) = data {
                data.fill(hdr.obj.ec_index);
            }
        }
        Ok(ResponseHeader::reply_to(hdr, ResultCode::Success, 0))
    }
}

/// Signal source that keeps the semaphores it hands out.
#[derive(Default)]
struct Tracked {
    created: Mutex<Vec<Arc<Semaphore>>>,
}

impl SignalSource for Tracked {
    fn create(&self) -> io::Result<Arc<dyn CompletionSignal>> {
        let sem = Arc::new(Semaphore::new());
        self.created.lock().push(Arc::clone(&sem));
        Ok(sem)
    }
}

struct Broken;

impl SignalSource for Broken {
    fn create(&self) -> io::Result<Arc<dyn CompletionSignal>> {
        Err(io::Error::new(io::ErrorKind::Other, "eventfd: too many open files"))
    }
}

/// Queue wrapper that counts submissions.
struct Counting {
    inner: ThreadPoolQueue,
    queued: AtomicUsize,
}

impl WorkQueue for Counting {
    fn queue_work(&self, work: Box<dyn Work>) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.inner.queue_work(work);
    }
}

fn counting(workers: usize) -> Counting {
    Counting {
        inner: ThreadPoolQueue::new("test-gw", workers).unwrap(),
        queued: AtomicUsize::new(0),
    }
}

fn targets(n: usize) -> Vec<Node> {
    (0..n)
        .map(|i| {
            let addr = format!("10.0.0.{}:{}", i + 1, 7000 + i).parse().unwrap();
            Node::new(NodeId::tcp(addr), format!("node-{}", i))
        })
        .collect()
}

fn base_read() -> RequestHeader {
    let mut hdr = RequestHeader::read_obj(0x1234, 0, 0);
    hdr.epoch = 5;
    hdr.obj.copies = 3;
    hdr
}

// ============================================================================
// Per-Item Header Tests
// ============================================================================

#[test]
fn test_three_targets_get_distinct_headers() {
    let recorder = Arc::new(Recorder::default());
    let gateway = Gateway::new(Arc::clone(&recorder), counting(3));
    let targets = targets(3);
    let mut reqs: Vec<ReqIter> = (0..3).map(|i| ReqIter::read(4096, i * 4096)).collect();
    let base = base_read();
    let rctx = RequestContext {
        epoch: 5,
        copy_policy: 0x21,
    };

    gateway
        .send_gateway_reqs(&base, &targets, &mut reqs, &rctx)
        .unwrap();

    let mut calls = recorder.calls.lock().clone();
    calls.sort_by_key(|(_, hdr)| hdr.obj.ec_index);
    assert_eq!(calls.len(), 3);
    for (i, (nid, hdr)) in calls.iter().enumerate() {
        assert_eq!(*nid, targets[i].nid);
        assert_eq!(hdr.data_length, 4096);
        assert_eq!(hdr.obj.offset, i as u64 * 4096);
        assert_eq!(hdr.obj.ec_index, i as u8);
        assert_eq!(hdr.obj.copy_policy, 0x21);
        assert_eq!(hdr.obj.oid, 0x1234);
    }

    // Base untouched, buffers handed back with each item's data.
    assert_eq!(base, base_read());
    for (i, req) in reqs.iter().enumerate() {
        assert_eq!(req.buf.len(), 4096);
        assert!(req.buf.iter().all(|&b| b == i as u8));
    }
}

#[test]
fn test_mismatched_buffers_rejected() {
    let recorder = Arc::new(Recorder::default());
    let queue = counting(1);
    let gateway = Gateway::new(Arc::clone(&recorder), queue);
    let mut reqs = vec![ReqIter::read(8, 0)];

    let err = gateway
        .send_gateway_reqs(&base_read(), &targets(2), &mut reqs, &RequestContext::default())
        .unwrap_err();

    assert!(matches!(err, GatewayError::InvalidParms(_)));
    assert_eq!(err.result_code(), ResultCode::InvalidParms);
    assert_eq!(gateway.queue().queued.load(Ordering::SeqCst), 0);
}

#[test]
fn test_empty_fan_out_returns_immediately() {
    let gateway = Gateway::new(Arc::new(Recorder::default()), counting(1));
    let results = gateway
        .send_gateway_reqs_detailed(&base_read(), &[], &mut [], &RequestContext::default())
        .unwrap();
    assert!(results.is_empty());
}

// ============================================================================
// Setup Failure Tests
// ============================================================================

#[test]
fn test_signal_failure_submits_nothing() {
    let recorder = Arc::new(Recorder::default());
    let gateway =
        Gateway::new(Arc::clone(&recorder), counting(2)).with_signal_source(Arc::new(Broken));
    let mut reqs: Vec<ReqIter> = (0..4).map(|i| ReqIter::read(16, i)).collect();

    let err = gateway
        .send_gateway_reqs(&base_read(), &targets(4), &mut reqs, &RequestContext::default())
        .unwrap_err();

    assert!(matches!(err, GatewayError::SystemError(_)));
    assert_eq!(err.result_code(), ResultCode::SystemError);
    assert_eq!(gateway.queue().queued.load(Ordering::SeqCst), 0);
    assert!(recorder.calls.lock().is_empty());
    // Buffers stay with the caller.
    assert!(reqs.iter().all(|r| r.buf.len() == 16));
}

// ============================================================================
// Outcome Tests
// ============================================================================

#[test]
fn test_partial_failure_is_aggregate_success() {
    let recorder = Arc::new(Recorder {
        failing_port: Some(7001),
        ..Recorder::default()
    });
    let gateway = Gateway::new(Arc::clone(&recorder), counting(3));
    let targets = targets(3);
    let rctx = RequestContext::default();

    let mut reqs: Vec<ReqIter> = (0..3).map(|_| ReqIter::read(8, 0)).collect();
    assert!(gateway
        .send_gateway_reqs(&base_read(), &targets, &mut reqs, &rctx)
        .is_ok());

    let mut reqs: Vec<ReqIter> = (0..3).map(|_| ReqIter::read(8, 0)).collect();
    let results = gateway
        .send_gateway_reqs_detailed(&base_read(), &targets, &mut reqs, &rctx)
        .unwrap();

    assert!(results[0].is_ok());
    assert!(matches!(
        results[1],
        Err(ExecError::TornDown(TeardownScope::Connection))
    ));
    assert!(results[2].is_ok());
    assert_eq!(recorder.finished.load(Ordering::SeqCst), 6);
}

#[test]
fn test_writes_carry_each_buffer() {
    let recorder = Arc::new(Recorder::default());
    let gateway = Gateway::new(Arc::clone(&recorder), counting(2));
    let mut base = RequestHeader::write_obj(77, 0, 0);
    base.epoch = 1;
    let mut reqs = vec![
        ReqIter::write(b"first".to_vec(), 0),
        ReqIter::write(b"second!".to_vec(), 5),
    ];

    gateway
        .send_gateway_reqs(&base, &targets(2), &mut reqs, &RequestContext::default())
        .unwrap();

    let mut calls = recorder.calls.lock().clone();
    calls.sort_by_key(|(_, hdr)| hdr.obj.ec_index);
    assert_eq!(calls[0].1.data_length, 5);
    assert_eq!(calls[1].1.data_length, 7);
    assert_eq!(calls[1].1.obj.offset, 5);
    // Write buffers are returned unchanged.
    assert_eq!(reqs[0].buf, b"first");
    assert_eq!(reqs[1].buf, b"second!");
}

// ============================================================================
// Completion Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_returns_after_exactly_n_completions(
        latencies in prop::collection::vec(0u64..8, 1..12),
        workers in 1usize..5,
    ) {
        let n = latencies.len();
        let recorder = Arc::new(Recorder {
            latency_ms: Mutex::new(latencies),
            ..Recorder::default()
        });
        let signals = Arc::new(Tracked::default());
        let gateway = Gateway::new(Arc::clone(&recorder), counting(workers))
            .with_signal_source(Arc::clone(&signals) as Arc<dyn SignalSource>);
        let mut reqs: Vec<ReqIter> = (0..n).map(|_| ReqIter::read(4, 0)).collect();

        let results = gateway
            .send_gateway_reqs_detailed(&base_read(), &targets(n), &mut reqs, &RequestContext::default())
            .unwrap();

        // Never early: every item finished before the call returned.
        prop_assert_eq!(recorder.finished.load(Ordering::SeqCst), n);
        prop_assert_eq!(results.len(), n);
        prop_assert_eq!(gateway.queue().queued.load(Ordering::SeqCst), n);
        // Never double-counted: one signal, fully drained.
        let created = signals.created.lock();
        prop_assert_eq!(created.len(), 1);
        prop_assert_eq!(created[0].available(), 0);
    }

    #[test]
    fn prop_item_headers_are_isolated(
        items in prop::collection::vec((0u32..65536, 0u64..(1 << 30)), 1..10),
        copy_policy in any::<u8>(),
    ) {
        let recorder = Arc::new(Recorder::default());
        let gateway = Gateway::new(Arc::clone(&recorder), counting(4));
        let n = items.len();
        let mut reqs: Vec<ReqIter> = items
            .iter()
            .map(|&(dlen, off)| ReqIter { buf: Vec::new(), dlen, off })
            .collect();
        let mut base = RequestHeader::write_obj(9, 0, 0);
        base.obj.copies = 2;
        let rctx = RequestContext { epoch: 3, copy_policy };

        // Empty write bodies: the recorder does not check lengths.
        gateway
            .send_gateway_reqs(&base, &targets(n), &mut reqs, &rctx)
            .unwrap();

        let calls = recorder.calls.lock();
        prop_assert_eq!(calls.len(), n);
        for (_, hdr) in calls.iter() {
            let i = hdr.obj.ec_index as usize;
            prop_assert_eq!(hdr.data_length, items[i].0);
            prop_assert_eq!(hdr.obj.offset, items[i].1);
            prop_assert_eq!(hdr.obj.copy_policy, copy_policy);
            prop_assert_eq!(hdr.obj.copies, 2);
            prop_assert_eq!(hdr.opcode, base.opcode);
        }
    }
}

// ============================================================================
// End-to-End Tests
// ============================================================================

#[test]
fn test_fan_out_over_loopback() {
    // Each node answers with its own port number repeated.
    let loopback = Arc::new(Loopback::new(|uri, hdr, _| {
        let port: u16 = uri.rsplit(':').next().unwrap().parse().unwrap();
        let byte = (port % 256) as u8;
        Reply::respond(hdr, vec![Bytes::from(vec![byte; hdr.data_length as usize])])
    }));
    let executor = Arc::new(Executor::new(Arc::clone(&loopback)));
    let gateway = Gateway::new(executor, ThreadPoolQueue::new("e2e", 3).unwrap());
    let targets = targets(3);
    let mut reqs: Vec<ReqIter> = (0..3).map(|i| ReqIter::read(4096, i * 4096)).collect();

    let results = gateway
        .send_gateway_reqs_detailed(&base_read(), &targets, &mut reqs, &RequestContext::default())
        .unwrap();

    for (i, (result, req)) in results.iter().zip(&reqs).enumerate() {
        let rsp = result.as_ref().unwrap();
        assert_eq!(rsp.result, ResultCode::Success);
        assert_eq!(rsp.data_length, 4096);
        let expected = ((7000 + i) % 256) as u8;
        assert!(req.buf.iter().all(|&b| b == expected));
    }

    let stats = loopback.stats();
    assert_eq!(stats.sends, 3);
    assert_eq!(stats.releases.len(), 3);
    assert_eq!(stats.contexts_destroyed, 3);
    assert_eq!(stats.overlapping_sends, 0);
}
