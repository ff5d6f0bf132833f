//! Frame builders.
//!
//! A frame is one complete header-plus-body unit of the wire protocol,
//! built as a single contiguous `bytes::Bytes` buffer so it reaches the
//! socket in one write. Inbound frames never materialize as a type:
//! responses stream through the assembler into the arena.

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{Header, HEADER_SIZE};

/// Build a complete two-way request frame as a single contiguous buffer.
pub fn build_request_frame(sequence: u64, body: &[u8]) -> Bytes {
    let header = Header::request(sequence, body.len() as u32);
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    buf.put_slice(&header.encode());
    buf.put_slice(body);
    buf.freeze()
}

/// Build a response frame with the given status. Used by provider-side
/// test fixtures; real responses come off the wire.
pub fn build_response_frame(status: u8, sequence: u64, body: &[u8]) -> Bytes {
    let header = Header::response(status, sequence, body.len() as u32);
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    buf.put_slice(&header.encode());
    buf.put_slice(body);
    buf.freeze()
}
