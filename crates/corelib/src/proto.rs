//! Wire headers exchanged with a storage node.
//!
//! Every request is one 48-byte `RequestHeader` optionally followed by a
//! single body segment. Every response is one 48-byte `ResponseHeader`
//! followed by zero or more data segments whose total length equals the
//! request's expected response length. Integers are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::{Error, Result};

/// Protocol version carried in every header.
pub const SD_PROTO_VER: u8 = 0x02;

/// Encoded size of a request header.
pub const SD_REQ_SIZE: usize = 48;

/// Encoded size of a response header.
pub const SD_RSP_SIZE: usize = 48;

/// Object operation codes.
pub mod opcode {
    pub const CREATE_AND_WRITE_OBJ: u8 = 0x01;
    pub const READ_OBJ: u8 = 0x02;
    pub const WRITE_OBJ: u8 = 0x03;
    pub const REMOVE_OBJ: u8 = 0x04;
    pub const DISCARD_OBJ: u8 = 0x05;
}

/// Request flag bits.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Flags(pub u16);

impl Flags {
    /// A body segment follows the header.
    pub const WRITE: Flags = Flags(0x01);
    pub const COW: Flags = Flags(0x02);
    pub const CACHE: Flags = Flags(0x04);
    pub const DIRECT: Flags = Flags(0x08);
    pub const PIGGYBACK: Flags = Flags(0x10);
    /// Request forwarded by a gateway.
    pub const FWD: Flags = Flags(0x20);

    pub const fn empty() -> Self {
        Flags(0)
    }

    pub const fn bits(&self) -> u16 {
        self.0
    }

    pub const fn contains(&self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flags({:#06x})", self.0)
    }
}

/// Object section of a request header.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct ObjRequest {
    pub oid: u64,
    pub cow_oid: u64,
    pub copies: u8,
    pub copy_policy: u8,
    /// Position of this strip within an erasure-coded fan-out.
    pub ec_index: u8,
    pub tgt_epoch: u32,
    pub offset: u64,
}

/// Request header sent ahead of every request.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct RequestHeader {
    pub proto_ver: u8,
    pub opcode: u8,
    pub flags: Flags,
    pub epoch: u32,
    pub id: u32,
    /// Body length for writes, expected response length for reads.
    pub data_length: u32,
    pub obj: ObjRequest,
}

impl RequestHeader {
    pub fn new(opcode: u8) -> Self {
        Self {
            proto_ver: SD_PROTO_VER,
            opcode,
            flags: Flags::empty(),
            epoch: 0,
            id: 0,
            data_length: 0,
            obj: ObjRequest::default(),
        }
    }

    /// Read `len` bytes of `oid` at `offset`.
    pub fn read_obj(oid: u64, len: u32, offset: u64) -> Self {
        let mut hdr = Self::new(opcode::READ_OBJ);
        hdr.data_length = len;
        hdr.obj.oid = oid;
        hdr.obj.offset = offset;
        hdr
    }

    /// Write `len` bytes of `oid` at `offset`.
    pub fn write_obj(oid: u64, len: u32, offset: u64) -> Self {
        let mut hdr = Self::new(opcode::WRITE_OBJ);
        hdr.flags = Flags::WRITE;
        hdr.data_length = len;
        hdr.obj.oid = oid;
        hdr.obj.offset = offset;
        hdr
    }

    pub fn is_write(&self) -> bool {
        self.flags.contains(Flags::WRITE)
    }

    /// Bytes the node is expected to send back after the response header.
    ///
    /// Writes carry their payload outbound and get no data back.
    pub fn expected_response_len(&self) -> u32 {
        if self.is_write() {
            0
        } else {
            self.data_length
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.proto_ver);
        buf.put_u8(self.opcode);
        buf.put_u16_le(self.flags.bits());
        buf.put_u32_le(self.epoch);
        buf.put_u32_le(self.id);
        buf.put_u32_le(self.data_length);
        buf.put_u64_le(self.obj.oid);
        buf.put_u64_le(self.obj.cow_oid);
        buf.put_u8(self.obj.copies);
        buf.put_u8(self.obj.copy_policy);
        buf.put_u8(self.obj.ec_index);
        buf.put_u8(0);
        buf.put_u32_le(self.obj.tgt_epoch);
        buf.put_u64_le(self.obj.offset);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SD_REQ_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < SD_REQ_SIZE {
            return Err(Error::ShortHeader {
                need: SD_REQ_SIZE,
                got: buf.len(),
            });
        }
        let proto_ver = buf.get_u8();
        let opcode = buf.get_u8();
        let flags = Flags(buf.get_u16_le());
        let epoch = buf.get_u32_le();
        let id = buf.get_u32_le();
        let data_length = buf.get_u32_le();
        let oid = buf.get_u64_le();
        let cow_oid = buf.get_u64_le();
        let copies = buf.get_u8();
        let copy_policy = buf.get_u8();
        let ec_index = buf.get_u8();
        buf.advance(1);
        let tgt_epoch = buf.get_u32_le();
        let offset = buf.get_u64_le();

        Ok(Self {
            proto_ver,
            opcode,
            flags,
            epoch,
            id,
            data_length,
            obj: ObjRequest {
                oid,
                cow_oid,
                copies,
                copy_policy,
                ec_index,
                tgt_epoch,
                offset,
            },
        })
    }
}

/// Result code carried in a response header.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ResultCode {
    Success,
    Unknown,
    NoObj,
    Eio,
    VdiExist,
    InvalidParms,
    SystemError,
    VdiLocked,
    NoVdi,
    NoMem,
    NoSpace,
    OldNodeVer,
    NewNodeVer,
    /// Local-only code for transport failures; never sent by a node.
    NetworkError,
    Other(u32),
}

impl ResultCode {
    pub fn as_u32(&self) -> u32 {
        match self {
            ResultCode::Success => 0x00,
            ResultCode::Unknown => 0x01,
            ResultCode::NoObj => 0x02,
            ResultCode::Eio => 0x03,
            ResultCode::VdiExist => 0x04,
            ResultCode::InvalidParms => 0x05,
            ResultCode::SystemError => 0x06,
            ResultCode::VdiLocked => 0x07,
            ResultCode::NoVdi => 0x08,
            ResultCode::NoMem => 0x12,
            ResultCode::NoSpace => 0x15,
            ResultCode::OldNodeVer => 0x1d,
            ResultCode::NewNodeVer => 0x1e,
            ResultCode::NetworkError => 0x86,
            ResultCode::Other(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == ResultCode::Success
    }
}

impl From<u32> for ResultCode {
    fn from(code: u32) -> Self {
        match code {
            0x00 => ResultCode::Success,
            0x01 => ResultCode::Unknown,
            0x02 => ResultCode::NoObj,
            0x03 => ResultCode::Eio,
            0x04 => ResultCode::VdiExist,
            0x05 => ResultCode::InvalidParms,
            0x06 => ResultCode::SystemError,
            0x07 => ResultCode::VdiLocked,
            0x08 => ResultCode::NoVdi,
            0x12 => ResultCode::NoMem,
            0x15 => ResultCode::NoSpace,
            0x1d => ResultCode::OldNodeVer,
            0x1e => ResultCode::NewNodeVer,
            0x86 => ResultCode::NetworkError,
            other => ResultCode::Other(other),
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match self {
            ResultCode::Success => "Success",
            ResultCode::Unknown => "Unknown error",
            ResultCode::NoObj => "No object found",
            ResultCode::Eio => "I/O error",
            ResultCode::VdiExist => "VDI exists already",
            ResultCode::InvalidParms => "Invalid parameters",
            ResultCode::SystemError => "System error",
            ResultCode::VdiLocked => "VDI is already locked",
            ResultCode::NoVdi => "No VDI found",
            ResultCode::NoMem => "Failed to allocate memory",
            ResultCode::NoSpace => "Server has no space for new objects",
            ResultCode::OldNodeVer => "Request has an old epoch",
            ResultCode::NewNodeVer => "Request has a new epoch",
            ResultCode::NetworkError => "Network error between sheep",
            ResultCode::Other(code) => return write!(f, "Unknown result {:#x}", code),
        };
        f.write_str(desc)
    }
}

/// Object section of a response header.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct ObjResponse {
    pub copies: u8,
    pub offset: u64,
}

/// Response header returned by a storage node.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ResponseHeader {
    pub proto_ver: u8,
    pub opcode: u8,
    pub flags: Flags,
    pub epoch: u32,
    pub id: u32,
    /// Length of the data segments following this header.
    pub data_length: u32,
    pub result: ResultCode,
    pub obj: ObjResponse,
}

impl Default for ResponseHeader {
    fn default() -> Self {
        Self {
            proto_ver: SD_PROTO_VER,
            opcode: 0,
            flags: Flags::empty(),
            epoch: 0,
            id: 0,
            data_length: 0,
            result: ResultCode::Success,
            obj: ObjResponse::default(),
        }
    }
}

impl ResponseHeader {
    /// Response echoing `req`'s opcode, id and epoch.
    pub fn reply_to(req: &RequestHeader, result: ResultCode, data_length: u32) -> Self {
        Self {
            proto_ver: req.proto_ver,
            opcode: req.opcode,
            flags: Flags::empty(),
            epoch: req.epoch,
            id: req.id,
            data_length,
            result,
            obj: ObjResponse {
                copies: req.obj.copies,
                offset: req.obj.offset,
            },
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.proto_ver);
        buf.put_u8(self.opcode);
        buf.put_u16_le(self.flags.bits());
        buf.put_u32_le(self.epoch);
        buf.put_u32_le(self.id);
        buf.put_u32_le(self.data_length);
        buf.put_u32_le(self.result.as_u32());
        buf.put_u8(self.obj.copies);
        buf.put_bytes(0, 3);
        buf.put_u64_le(self.obj.offset);
        // 32 bytes written so far
        buf.put_bytes(0, SD_RSP_SIZE - 32);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SD_RSP_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < SD_RSP_SIZE {
            return Err(Error::ShortHeader {
                need: SD_RSP_SIZE,
                got: buf.len(),
            });
        }
        let proto_ver = buf.get_u8();
        let opcode = buf.get_u8();
        let flags = Flags(buf.get_u16_le());
        let epoch = buf.get_u32_le();
        let id = buf.get_u32_le();
        let data_length = buf.get_u32_le();
        let result = ResultCode::from(buf.get_u32_le());
        let copies = buf.get_u8();
        buf.advance(3);
        let offset = buf.get_u64_le();

        Ok(Self {
            proto_ver,
            opcode,
            flags,
            epoch,
            id,
            data_length,
            result,
            obj: ObjResponse { copies, offset },
        })
    }
}
