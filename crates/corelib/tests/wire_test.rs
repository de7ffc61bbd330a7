//! Byte-level tests for the request and response headers.
//!
//! # Test Strategy
//!
//! 1. **Layout**: fields land at fixed little-endian offsets
//! 2. **Decoding**: headers captured from the wire decode field by field
//! 3. **Edge cases**: short buffers, unknown result codes

use corelib::proto::{opcode, SD_PROTO_VER, SD_REQ_SIZE, SD_RSP_SIZE};
use corelib::{Error, Flags, RequestHeader, ResponseHeader, ResultCode};

// ============================================================================
// Layout Tests
// ============================================================================

#[test]
fn test_request_field_offsets() {
    let mut hdr = RequestHeader::write_obj(0x0102_0304_0506_0708, 0x1000, 0x2000);
    hdr.epoch = 0xaabb_ccdd;
    hdr.id = 7;
    hdr.obj.copies = 3;
    hdr.obj.copy_policy = 0x42;
    hdr.obj.ec_index = 5;
    hdr.obj.tgt_epoch = 9;

    let raw = hdr.to_bytes();
    assert_eq!(raw.len(), SD_REQ_SIZE);

    assert_eq!(raw[0], SD_PROTO_VER);
    assert_eq!(raw[1], opcode::WRITE_OBJ);
    assert_eq!(&raw[2..4], &Flags::WRITE.bits().to_le_bytes());
    assert_eq!(&raw[4..8], &0xaabb_ccddu32.to_le_bytes());
    assert_eq!(&raw[8..12], &7u32.to_le_bytes());
    assert_eq!(&raw[12..16], &0x1000u32.to_le_bytes());
    assert_eq!(&raw[16..24], &0x0102_0304_0506_0708u64.to_le_bytes());
    assert_eq!(&raw[24..32], &[0; 8]);
    assert_eq!(&raw[32..36], &[3, 0x42, 5, 0]);
    assert_eq!(&raw[36..40], &9u32.to_le_bytes());
    assert_eq!(&raw[40..48], &0x2000u64.to_le_bytes());
}

#[test]
fn test_response_field_offsets() {
    let req = RequestHeader::read_obj(1, 512, 0);
    let mut rsp = ResponseHeader::reply_to(&req, ResultCode::NoSpace, 512);
    rsp.obj.copies = 2;
    rsp.obj.offset = 4096;

    let raw = rsp.to_bytes();
    assert_eq!(raw.len(), SD_RSP_SIZE);
    assert_eq!(raw[1], opcode::READ_OBJ);
    assert_eq!(&raw[12..16], &512u32.to_le_bytes());
    assert_eq!(&raw[16..20], &0x15u32.to_le_bytes());
    assert_eq!(raw[20], 2);
    assert_eq!(&raw[24..32], &4096u64.to_le_bytes());
    assert!(raw[32..].iter().all(|&b| b == 0));
}

// ============================================================================
// Decoding Tests
// ============================================================================

#[test]
fn test_decode_captured_response() {
    let mut raw = [0u8; SD_RSP_SIZE];
    raw[0] = SD_PROTO_VER;
    raw[1] = opcode::READ_OBJ;
    raw[4..8].copy_from_slice(&3u32.to_le_bytes());
    raw[12..16].copy_from_slice(&100u32.to_le_bytes());
    raw[16..20].copy_from_slice(&0x86u32.to_le_bytes());

    let rsp = ResponseHeader::decode(&raw).unwrap();
    assert_eq!(rsp.epoch, 3);
    assert_eq!(rsp.data_length, 100);
    assert_eq!(rsp.result, ResultCode::NetworkError);
    assert!(!rsp.result.is_success());
}

#[test]
fn test_expected_response_length() {
    assert_eq!(RequestHeader::read_obj(1, 4096, 0).expected_response_len(), 4096);
    assert_eq!(RequestHeader::write_obj(1, 4096, 0).expected_response_len(), 0);
}

// ============================================================================
// Edge Case Tests
// ============================================================================

#[test]
fn test_short_buffers_rejected() {
    let raw = RequestHeader::read_obj(1, 1, 0).to_bytes();
    assert!(matches!(
        RequestHeader::decode(&raw[..SD_REQ_SIZE - 1]),
        Err(Error::ShortHeader { need: 48, got: 47 })
    ));
    assert!(matches!(
        ResponseHeader::decode(&[]),
        Err(Error::ShortHeader { need: 48, got: 0 })
    ));
}

#[test]
fn test_unknown_result_code_preserved() {
    let mut raw = [0u8; SD_RSP_SIZE];
    raw[16..20].copy_from_slice(&0x1234u32.to_le_bytes());

    let rsp = ResponseHeader::decode(&raw).unwrap();
    assert_eq!(rsp.result, ResultCode::Other(0x1234));
    assert_eq!(rsp.to_bytes()[16..20], 0x1234u32.to_le_bytes());
}
