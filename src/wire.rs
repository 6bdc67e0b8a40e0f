//! The guest/host wire protocol (§3, §4.2 of the design).
//!
//! Every item crossing the WASM linear-memory boundary is a *frame*: a
//! 1-byte type tag, optionally followed by a 4-byte little-endian length and
//! that many payload bytes. The byte order is fixed little-endian regardless
//! of host or guest endianness.

use crate::error::LensError;

/// Nil frame: no length, no payload.
pub const TAG_NIL: i8 = 0;
/// JSON frame: UTF-8 JSON document payload.
pub const TAG_JSON: i8 = 1;
/// Error frame: UTF-8 human-readable message payload. Any negative tag is
/// an error frame; `-1` is the canonical value this crate writes.
pub const TAG_ERROR: i8 = -1;
/// End-of-stream frame: no length, no payload.
pub const TAG_EOS: i8 = 127;

const TAG_SIZE: usize = 1;
const LEN_SIZE: usize = 4;

/// A decoded frame, independent of the memory it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// No value. Decodes to the "empty" value of whatever type is expected.
    Nil,
    /// A UTF-8 JSON document.
    Json(Vec<u8>),
    /// A human-readable error message, verbatim.
    Error(String),
    /// End of stream.
    EndOfStream,
}

impl Frame {
    /// Serializes this frame to its wire representation (tag, and length +
    /// payload where applicable).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Nil => vec![TAG_NIL as u8],
            Frame::EndOfStream => vec![TAG_EOS as u8],
            Frame::Json(payload) => encode_tagged(TAG_JSON, payload),
            Frame::Error(message) => encode_tagged(TAG_ERROR, message.as_bytes()),
        }
    }

    /// Decodes a frame starting at `address` within `memory`, returning the
    /// frame and the number of bytes it occupied on the wire.
    ///
    /// The tag byte fully determines how many subsequent bytes must be read
    /// (invariant 4, §3).
    pub fn decode(memory: &[u8], address: u32) -> Result<(Frame, u32), LensError> {
        let addr = address as usize;
        let tag = read_tag(memory, addr)?;
        match tag {
            TAG_NIL => Ok((Frame::Nil, TAG_SIZE as u32)),
            TAG_EOS => Ok((Frame::EndOfStream, TAG_SIZE as u32)),
            TAG_JSON => {
                let (payload, total) = read_length_prefixed(memory, addr)?;
                Ok((Frame::Json(payload), total))
            }
            t if t < 0 => {
                let (payload, total) = read_length_prefixed(memory, addr)?;
                let message = String::from_utf8(payload)
                    .map_err(|e| LensError::WireProtocol(format!("error frame was not valid UTF-8: {e}")))?;
                Ok((Frame::Error(message), total))
            }
            other => Err(LensError::WireProtocol(format!("unknown frame tag {other}"))),
        }
    }

    /// The tag byte this frame would be written with.
    pub fn tag(&self) -> i8 {
        match self {
            Frame::Nil => TAG_NIL,
            Frame::Json(_) => TAG_JSON,
            Frame::Error(_) => TAG_ERROR,
            Frame::EndOfStream => TAG_EOS,
        }
    }
}

fn encode_tagged(tag: i8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(TAG_SIZE + LEN_SIZE + payload.len());
    buf.push(tag as u8);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn read_tag(memory: &[u8], addr: usize) -> Result<i8, LensError> {
    memory
        .get(addr)
        .map(|b| *b as i8)
        .ok_or_else(|| LensError::WireProtocol(format!("read out of bounds at address {addr}")))
}

fn read_length_prefixed(memory: &[u8], addr: usize) -> Result<(Vec<u8>, u32), LensError> {
    let len_start = addr + TAG_SIZE;
    let len_end = len_start + LEN_SIZE;
    let len_bytes = memory
        .get(len_start..len_end)
        .ok_or_else(|| LensError::WireProtocol("length prefix out of bounds".into()))?;
    let len = u32::from_le_bytes(len_bytes.try_into().unwrap());

    let payload_start = len_end;
    let payload_end = payload_start
        .checked_add(len as usize)
        .ok_or_else(|| LensError::WireProtocol("frame length overflowed memory address space".into()))?;
    let payload = memory
        .get(payload_start..payload_end)
        .ok_or_else(|| LensError::WireProtocol("payload out of bounds".into()))?
        .to_vec();

    Ok((payload, (TAG_SIZE + LEN_SIZE + len as usize) as u32))
}

/// The number of bytes `frame.encode()` would occupy, without allocating.
pub fn encoded_len(frame: &Frame) -> u32 {
    match frame {
        Frame::Nil | Frame::EndOfStream => TAG_SIZE as u32,
        Frame::Json(payload) => (TAG_SIZE + LEN_SIZE + payload.len()) as u32,
        Frame::Error(message) => (TAG_SIZE + LEN_SIZE + message.len()) as u32,
    }
}
