// Record Framing
//
// On-disk layout of a single record, big-endian:
//
//   [ total_len   : u32 ]  length of everything below
//   [ offset      : u64 ]
//   [ payload_len : u32 ]
//   [ payload     : payload_len bytes ]

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the `total_len` prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of `offset` + `payload_len`.
pub const FRAME_HEADER_SIZE: usize = 12;

/// Bytes a record occupies on disk on top of its payload.
pub const RECORD_OVERHEAD: usize = LENGTH_PREFIX_SIZE + FRAME_HEADER_SIZE;

/// Largest payload whose `total_len` still fits in a u32.
pub const MAX_PAYLOAD_LEN: usize = u32::MAX as usize - FRAME_HEADER_SIZE;

/// Position of a record within one partition.
pub type Offset = u64;

/// A record as returned by reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: Offset,
    pub payload: Bytes,
}

impl Record {
    pub fn new(offset: Offset, payload: impl Into<Bytes>) -> Self {
        Self {
            offset,
            payload: payload.into(),
        }
    }

    /// Bytes this record occupies in a segment's log file.
    pub fn framed_len(&self) -> usize {
        RECORD_OVERHEAD + self.payload.len()
    }
}

/// Encode one record into its on-disk frame.
///
/// Callers must check `payload.len() <= MAX_PAYLOAD_LEN` first.
pub fn encode_frame(offset: Offset, payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= MAX_PAYLOAD_LEN);

    let total_len = (FRAME_HEADER_SIZE + payload.len()) as u32;
    let mut frame = BytesMut::with_capacity(RECORD_OVERHEAD + payload.len());
    frame.put_u32(total_len);
    frame.put_u64(offset);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);
    frame.freeze()
}

/// Decode the body of a frame (everything after `total_len`).
///
/// Returns `None` if the body is too short for its header or for the
/// payload length it declares.
pub fn decode_body(body: Bytes) -> Option<Record> {
    let mut buf = body;
    if buf.remaining() < FRAME_HEADER_SIZE {
        return None;
    }

    let offset = buf.get_u64();
    let payload_len = buf.get_u32() as usize;
    if buf.remaining() < payload_len {
        return None;
    }

    Some(Record {
        offset,
        payload: buf.split_to(payload_len),
    })
}
