//! Message envelope construction and response de-scatter.
//!
//! Outbound: the request header slot, plus one body entry when the write
//! flag is set. Inbound: a response header slot, plus one data entry when
//! the request expects data back. No memory registration happens here; the
//! substrate (or the router's buffer-assignment callback) registers memory
//! for entries that arrive without a backing store.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use corelib::proto::{RequestHeader, ResponseHeader, SD_RSP_SIZE};
use corelib::{Error, Result};

use crate::substrate::{InIov, InMsg, Msg, OutIov, OutMsg, Substrate};

static NEXT_SN: AtomicU64 = AtomicU64::new(1);

/// Builds the message for `hdr`.
///
/// `data` supplies the body for writes and must hold at least
/// `hdr.data_length` bytes in that case.
pub fn msg_prep_for_send(hdr: &RequestHeader, data: Option<&[u8]>) -> Result<Msg> {
    let mut sglist = Vec::with_capacity(1);
    if hdr.is_write() {
        let len = hdr.data_length as usize;
        let body = match data {
            Some(data) if data.len() >= len => Bytes::copy_from_slice(&data[..len]),
            Some(data) => {
                return Err(Error::InvalidBuffer(format!(
                    "write body of {} bytes is shorter than data_length {}",
                    data.len(),
                    len
                )))
            }
            None => return Err(Error::InvalidBuffer("write request without a body".to_string())),
        };
        sglist.push(OutIov { base: body, mr: None });
    }

    let mut in_sglist = Vec::with_capacity(1);
    let expected = hdr.expected_response_len() as usize;
    if expected > 0 {
        in_sglist.push(InIov::zeroed(expected));
    }

    Ok(Msg {
        sn: NEXT_SN.fetch_add(1, Ordering::Relaxed),
        out: OutMsg {
            header: hdr.to_bytes(),
            sglist,
        },
        inbound: InMsg {
            header: BytesMut::zeroed(SD_RSP_SIZE),
            sglist: in_sglist,
        },
    })
}

/// Extracts the response header and de-scatters the data entries into
/// `data`, then releases `rsp` back to the substrate.
///
/// The release happens exactly once, whether or not extraction succeeds.
pub fn msg_finalize<S: Substrate>(
    substrate: &S,
    rsp: Msg,
    data: Option<&mut [u8]>,
) -> Result<ResponseHeader> {
    let result = descatter(&rsp, data);
    substrate.release_response(rsp);
    result
}

fn descatter(rsp: &Msg, data: Option<&mut [u8]>) -> Result<ResponseHeader> {
    if rsp.inbound.header.len() != SD_RSP_SIZE {
        return Err(Error::ShortHeader {
            need: SD_RSP_SIZE,
            got: rsp.inbound.header.len(),
        });
    }
    let header = ResponseHeader::decode(&rsp.inbound.header)?;

    if let Some(data) = data {
        let mut total = 0;
        for iov in &rsp.inbound.sglist {
            let chunk = iov.data();
            let end = total + chunk.len();
            if end > data.len() {
                return Err(Error::InvalidBuffer(format!(
                    "response data of at least {} bytes exceeds buffer of {} bytes",
                    end,
                    data.len()
                )));
            }
            data[total..end].copy_from_slice(chunk);
            total = end;
        }
    }

    Ok(header)
}
