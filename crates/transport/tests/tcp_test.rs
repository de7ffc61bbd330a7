//! Executor tests against a real socket.
//!
//! A std listener thread plays the storage node: it reads one request per
//! connection, stores written objects in memory and serves reads from them.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use corelib::proto::{opcode, SD_REQ_SIZE};
use corelib::{NodeId, RequestHeader, ResponseHeader, ResultCode};
use transport::error::{ExecError, TransportError};
use transport::executor::{Executor, RequestExecutor};
use transport::substrate::MsgDirection;
use transport::TcpSubstrate;

/// Serves `connections` connections, one request each, then exits.
fn spawn_node(connections: usize) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let mut objects: HashMap<u64, Vec<u8>> = HashMap::new();
        for _ in 0..connections {
            let (mut stream, _) = listener.accept().unwrap();
            serve_one(&mut stream, &mut objects);
        }
    });
    (addr, handle)
}

fn serve_one(stream: &mut TcpStream, objects: &mut HashMap<u64, Vec<u8>>) {
    let mut raw = [0u8; SD_REQ_SIZE];
    stream.read_exact(&mut raw).unwrap();
    let req = RequestHeader::decode(&raw).unwrap();

    let (rsp, data) = match req.opcode {
        opcode::WRITE_OBJ => {
            let mut body = vec![0u8; req.data_length as usize];
            stream.read_exact(&mut body).unwrap();
            objects.insert(req.obj.oid, body);
            (ResponseHeader::reply_to(&req, ResultCode::Success, 0), Vec::new())
        }
        opcode::READ_OBJ => match objects.get(&req.obj.oid) {
            Some(obj) => {
                let start = (req.obj.offset as usize).min(obj.len());
                let end = (start + req.data_length as usize).min(obj.len());
                let data = obj[start..end].to_vec();
                let len = data.len() as u32;
                (ResponseHeader::reply_to(&req, ResultCode::Success, len), data)
            }
            None => (ResponseHeader::reply_to(&req, ResultCode::NoObj, 0), Vec::new()),
        },
        _ => (
            ResponseHeader::reply_to(&req, ResultCode::InvalidParms, 0),
            Vec::new(),
        ),
    };

    stream.write_all(&rsp.to_bytes()).unwrap();
    stream.write_all(&data).unwrap();
    stream.flush().unwrap();
}

fn executor() -> Executor<TcpSubstrate> {
    Executor::new(Arc::new(TcpSubstrate::new()))
}

#[test]
fn test_write_then_read() {
    let (addr, node) = spawn_node(3);
    let nid = NodeId::tcp(addr);
    let executor = executor();

    let mut body: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
    let rsp = executor
        .exec_req(&nid, &RequestHeader::write_obj(9, 8192, 0), Some(&mut body))
        .unwrap();
    assert_eq!(rsp.result, ResultCode::Success);

    let mut buf = vec![0u8; 4096];
    let rsp = executor
        .exec_req(&nid, &RequestHeader::read_obj(9, 4096, 4096), Some(&mut buf))
        .unwrap();
    assert_eq!(rsp.result, ResultCode::Success);
    assert_eq!(rsp.data_length, 4096);
    assert_eq!(buf, body[4096..]);

    let rsp = executor
        .exec_req(&nid, &RequestHeader::read_obj(10, 16, 0), Some(&mut [0u8; 16]))
        .unwrap();
    assert_eq!(rsp.result, ResultCode::NoObj);

    node.join().unwrap();
}

#[test]
fn test_short_read_trims_entries() {
    let (addr, node) = spawn_node(2);
    let nid = NodeId::tcp(addr);
    let executor = executor();

    let mut body = *b"0123456789";
    executor
        .exec_req(&nid, &RequestHeader::write_obj(1, 10, 0), Some(&mut body))
        .unwrap();

    // Ask for more than exists; the node answers with what it has.
    let mut buf = [0xffu8; 32];
    let rsp = executor
        .exec_req(&nid, &RequestHeader::read_obj(1, 32, 4), Some(&mut buf))
        .unwrap();
    assert_eq!(rsp.data_length, 6);
    assert_eq!(&buf[..6], b"456789");
    assert!(buf[6..].iter().all(|&b| b == 0xff));

    node.join().unwrap();
}

#[test]
fn test_connection_refused_fails_send() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let executor = executor();

    let err = executor
        .exec_req(&NodeId::tcp(addr), &RequestHeader::read_obj(1, 8, 0), Some(&mut [0u8; 8]))
        .unwrap_err();

    assert!(matches!(
        err,
        ExecError::Failed {
            direction: MsgDirection::Out,
            ..
        }
    ));
}

#[test]
fn test_peer_hangup_fails_receive() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let node = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut raw = [0u8; SD_REQ_SIZE];
        stream.read_exact(&mut raw).unwrap();
        // Close without answering.
    });

    let err = executor()
        .exec_req(&NodeId::tcp(addr), &RequestHeader::read_obj(1, 8, 0), Some(&mut [0u8; 8]))
        .unwrap_err();

    assert!(matches!(
        err,
        ExecError::Failed {
            direction: MsgDirection::In,
            ..
        }
    ));
    node.join().unwrap();
}

#[test]
fn test_rdma_is_unsupported() {
    let nid = NodeId::rdma("127.0.0.1:7000".parse().unwrap());

    let err = executor()
        .exec_req(&nid, &RequestHeader::read_obj(1, 8, 0), Some(&mut [0u8; 8]))
        .unwrap_err();

    assert!(matches!(
        err,
        ExecError::Setup(TransportError::Unsupported(_))
    ));
    assert_eq!(err.result_code(), ResultCode::SystemError);
}
