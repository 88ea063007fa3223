//! The fixed 24-byte packet header.

use super::{HEADER_LEN, REQUEST_MAGIC, RESPONSE_MAGIC};
use crate::error::ProtocolError;
use bytes::{BufMut, BytesMut};

/// Header shared by requests and responses.
///
/// The `field` slot is the vbucket id on requests and the status code on
/// responses. Everything on the wire is big-endian except `opaque`,
/// which the protocol treats as an uninterpreted echo; this client fixes
/// it as little-endian, matching what the reference implementation wrote
/// on its native platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Request or response magic
    pub magic: u8,
    /// Command opcode
    pub opcode: u8,
    /// Key length in bytes
    pub key_len: u16,
    /// Extras length in bytes
    pub extras_len: u8,
    /// Datatype, always raw bytes for this client
    pub datatype: u8,
    /// VBucket id (requests) or status code (responses)
    pub field: u16,
    /// Total body length: extras + key + value
    pub body_len: u32,
    /// Correlation tag echoed verbatim by the server
    pub opaque: u32,
    /// Version stamp for optimistic concurrency
    pub cas: u64,
}

impl PacketHeader {
    /// A request header with empty body and zero CAS.
    pub fn request(opcode: u8, vbucket: u16, opaque: u32) -> Self {
        PacketHeader {
            magic: REQUEST_MAGIC,
            opcode,
            key_len: 0,
            extras_len: 0,
            datatype: super::RAW_BYTES,
            field: vbucket,
            body_len: 0,
            opaque,
            cas: 0,
        }
    }

    /// Serialize into `buf`, appending exactly [`HEADER_LEN`] bytes.
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN);
        buf.put_u8(self.magic);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key_len);
        buf.put_u8(self.extras_len);
        buf.put_u8(self.datatype);
        buf.put_u16(self.field);
        buf.put_u32(self.body_len);
        buf.put_u32_le(self.opaque);
        buf.put_u64(self.cas);
    }

    /// Decode a header from the front of `src`.
    ///
    /// Fails on short input or an unknown magic byte.
    pub fn deserialize(src: &[u8]) -> Result<Self, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Err(ProtocolError::Incomplete);
        }
        let magic = src[0];
        if magic != REQUEST_MAGIC && magic != RESPONSE_MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }
        Ok(PacketHeader {
            magic,
            opcode: src[1],
            key_len: u16::from_be_bytes([src[2], src[3]]),
            extras_len: src[4],
            datatype: src[5],
            field: u16::from_be_bytes([src[6], src[7]]),
            body_len: u32::from_be_bytes([src[8], src[9], src[10], src[11]]),
            opaque: u32::from_le_bytes([src[12], src[13], src[14], src[15]]),
            cas: u64::from_be_bytes([
                src[16], src[17], src[18], src[19], src[20], src[21], src[22], src[23],
            ]),
        })
    }

    /// Header plus declared body, in bytes.
    #[inline]
    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.body_len as usize
    }

    /// Status code of a response header.
    #[inline]
    pub fn status(&self) -> u16 {
        self.field
    }

    /// Value length implied by the declared lengths.
    ///
    /// Fails when extras and key overrun the body.
    pub fn value_len(&self) -> Result<usize, ProtocolError> {
        let fixed = self.extras_len as usize + self.key_len as usize;
        (self.body_len as usize)
            .checked_sub(fixed)
            .ok_or(ProtocolError::InvalidBodyLayout)
    }
}
