//! Request encoders and the streaming response parser.
//!
//! Encoders append one complete packet to a caller-supplied buffer; the
//! caller decides whether that buffer is a server's live output queue or
//! its pre-connect staging area. The parser is the inverse: feed it raw
//! socket bytes and it yields complete [`Packet`]s, holding partial
//! trailing bytes for the next read.

use super::{opcode, PacketHeader, HEADER_LEN, RAW_BYTES, REQUEST_MAGIC};
use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Storage operation selector for [`encode_store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    /// Store only if the key is absent
    Add,
    /// Store only if the key is present
    Replace,
    /// Store unconditionally
    Set,
    /// Append to the existing value
    Append,
    /// Prepend to the existing value
    Prepend,
}

impl StoreOperation {
    /// Wire opcode for this operation.
    pub fn opcode(self) -> u8 {
        match self {
            StoreOperation::Add => opcode::ADD,
            StoreOperation::Replace => opcode::REPLACE,
            StoreOperation::Set => opcode::SET,
            StoreOperation::Append => opcode::APPEND,
            StoreOperation::Prepend => opcode::PREPEND,
        }
    }

    /// The SET family carries flags/expiration extras; APPEND and
    /// PREPEND operate on the stored item and carry none.
    fn has_extras(self) -> bool {
        !matches!(self, StoreOperation::Append | StoreOperation::Prepend)
    }
}

fn put_header(
    buf: &mut BytesMut,
    op: u8,
    vbucket: u16,
    opaque: u32,
    cas: u64,
    extras_len: u8,
    key: &[u8],
    value_len: usize,
) {
    let header = PacketHeader {
        magic: REQUEST_MAGIC,
        opcode: op,
        key_len: key.len() as u16,
        extras_len,
        datatype: RAW_BYTES,
        field: vbucket,
        body_len: (extras_len as usize + key.len() + value_len) as u32,
        opaque,
        cas,
    };
    buf.reserve(header.total_len());
    header.serialize(buf);
}

/// Encode a retrieval request. `op` selects the quiet/keyed variant
/// (GETQ for batch members, GETK for the terminator).
pub fn encode_get(buf: &mut BytesMut, op: u8, vbucket: u16, opaque: u32, key: &[u8]) {
    put_header(buf, op, vbucket, opaque, 0, 0, key, 0);
    buf.put_slice(key);
}

/// Encode a store-family request.
pub fn encode_store(
    buf: &mut BytesMut,
    op: StoreOperation,
    vbucket: u16,
    opaque: u32,
    key: &[u8],
    value: &[u8],
    flags: u32,
    expiration: u32,
    cas: u64,
) {
    let extras_len = if op.has_extras() { 8 } else { 0 };
    put_header(
        buf,
        op.opcode(),
        vbucket,
        opaque,
        cas,
        extras_len,
        key,
        value.len(),
    );
    if op.has_extras() {
        buf.put_u32(flags);
        buf.put_u32(expiration);
    }
    buf.put_slice(key);
    buf.put_slice(value);
}

/// Encode an INCREMENT/DECREMENT request.
///
/// An `expiration` of `0xffff_ffff` tells the server not to create the
/// counter when it is missing.
pub fn encode_arithmetic(
    buf: &mut BytesMut,
    op: u8,
    vbucket: u16,
    opaque: u32,
    key: &[u8],
    delta: u64,
    initial: u64,
    expiration: u32,
) {
    debug_assert!(op == opcode::INCREMENT || op == opcode::DECREMENT);
    put_header(buf, op, vbucket, opaque, 0, 20, key, 0);
    buf.put_u64(delta);
    buf.put_u64(initial);
    buf.put_u32(expiration);
    buf.put_slice(key);
}

/// Encode a DELETE request.
pub fn encode_remove(buf: &mut BytesMut, vbucket: u16, opaque: u32, key: &[u8], cas: u64) {
    put_header(buf, opcode::DELETE, vbucket, opaque, cas, 0, key, 0);
    buf.put_slice(key);
}

/// Encode a SASL LIST_MECHS request.
pub fn encode_sasl_list_mechs(buf: &mut BytesMut, opaque: u32) {
    put_header(buf, opcode::SASL_LIST_MECHS, 0, opaque, 0, 0, &[], 0);
}

/// Encode a SASL AUTH or STEP request: the mechanism name travels as the
/// key and the client response as the value.
pub fn encode_sasl_auth(buf: &mut BytesMut, op: u8, opaque: u32, mechanism: &str, data: &[u8]) {
    debug_assert!(op == opcode::SASL_AUTH || op == opcode::SASL_STEP);
    put_header(buf, op, 0, opaque, 0, 0, mechanism.as_bytes(), data.len());
    buf.put_slice(mechanism.as_bytes());
    buf.put_slice(data);
}

/// Encode a TAP_CONNECT request. `flags` select the stream options and
/// `filter` is the engine-specific filter blob.
pub fn encode_tap_connect(buf: &mut BytesMut, opaque: u32, flags: u32, filter: &[u8]) {
    put_header(buf, opcode::TAP_CONNECT, 0, opaque, 0, 4, &[], filter.len());
    buf.put_u32(flags);
    buf.put_slice(filter);
}

/// A complete packet lifted off the wire.
///
/// The body slices are zero-copy views into the read buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// The decoded header
    pub header: PacketHeader,
    /// Extras section
    pub extras: Bytes,
    /// Key section
    pub key: Bytes,
    /// Value section
    pub value: Bytes,
}

impl Packet {
    /// Status code of a response packet.
    #[inline]
    pub fn status(&self) -> u16 {
        self.header.status()
    }

    /// True when the node pushed this packet at us (TAP traffic carries
    /// request magic in the server-to-client direction).
    #[inline]
    pub fn is_server_push(&self) -> bool {
        self.header.magic == REQUEST_MAGIC
    }
}

/// Streaming packet parser.
///
/// # Usage
///
/// ```ignore
/// let mut parser = PacketParser::new();
/// parser.buffer_mut().extend_from_slice(data);
/// while let Some(packet) = parser.parse()? {
///     // dispatch packet
/// }
/// ```
#[derive(Debug, Default)]
pub struct PacketParser {
    buffer: BytesMut,
}

impl PacketParser {
    /// Create a new parser.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Add data to the parser buffer.
    #[inline]
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Mutable access to the buffer for direct socket reads.
    #[inline]
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Returns true if no bytes are buffered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Number of buffered bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Current buffer capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Drop all buffered bytes.
    #[inline]
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Shrink the buffer when its capacity has grown far past its
    /// contents, e.g. after one oversized value passed through.
    pub fn maybe_trim(&mut self) {
        const MIN_CAPACITY: usize = 4096;
        const SHRINK_RATIO: usize = 4;

        let capacity = self.buffer.capacity();
        let len = self.buffer.len();
        if capacity > MIN_CAPACITY && capacity > len.saturating_mul(SHRINK_RATIO) {
            let mut replacement = BytesMut::with_capacity(len.max(MIN_CAPACITY));
            replacement.extend_from_slice(&self.buffer);
            self.buffer = replacement;
        }
    }

    /// Try to lift one complete packet off the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(packet))` if a complete packet was parsed
    /// - `Ok(None)` if more data is needed
    /// - `Err(e)` if the stream is malformed
    pub fn parse(&mut self) -> Result<Option<Packet>, ProtocolError> {
        let header = match PacketHeader::deserialize(&self.buffer) {
            Ok(header) => header,
            Err(ProtocolError::Incomplete) => return Ok(None),
            Err(e) => return Err(e),
        };

        if header.body_len as usize > crate::MAX_BODY_SIZE {
            return Err(ProtocolError::BodyTooLarge {
                len: header.body_len as usize,
                max: crate::MAX_BODY_SIZE,
            });
        }
        let value_len = header.value_len()?;
        let total = header.total_len();
        if self.buffer.len() < total {
            return Ok(None);
        }

        let frame = self.buffer.split_to(total).freeze();
        let extras_end = HEADER_LEN + header.extras_len as usize;
        let key_end = extras_end + header.key_len as usize;
        Ok(Some(Packet {
            header,
            extras: frame.slice(HEADER_LEN..extras_end),
            key: frame.slice(extras_end..key_end),
            value: frame.slice(key_end..key_end + value_len),
        }))
    }
}
