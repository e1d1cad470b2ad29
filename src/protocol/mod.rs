//! Binary wire protocol.
//!
//! Every frame is a host-order `u32` payload length followed by the payload.
//!
//! ```text
//! Request:  len:u32 | nstr:u32 | (slen:u32 | bytes)*nstr
//! Response: len:u32 | tag:u8 | tag-specific payload
//! ```
//!
//! Response payloads are self-describing tagged values (see [`value`]).
//! Integers are written in host byte order, so peers must share endianness.

pub mod request;
pub mod value;

pub use request::{encode_request, parse_request};
pub use value::{parse_response, write_response, ErrorCode, Tag, Value};

use crate::error::ProtocolError;

/// Largest payload accepted in a request or produced in a response.
pub const MAX_MSG: usize = 32 << 20;

/// Size of the length prefix in front of every frame.
pub const HEADER_LEN: usize = 4;

/// Outcome of decoding from a byte buffer.
#[derive(Debug)]
pub enum ParseResult<T> {
    /// Decoded a value; the second field is the number of bytes consumed.
    Complete(T, usize),
    /// The buffer holds a prefix of a valid frame.
    Incomplete,
    /// The frame can never be decoded.
    Error(ProtocolError),
}

/// Bounds-checked cursor over a decoded payload.
pub(crate) struct Reader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    pub(crate) fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let bytes = self.input.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    pub(crate) fn read_u8(&mut self) -> Option<u8> {
        self.read_bytes(1).map(|b| b[0])
    }

    pub(crate) fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.read_bytes(4)?;
        Some(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }
}

/// Read the length prefix of a frame, if enough bytes are buffered.
pub(crate) fn frame_len(input: &[u8]) -> Option<usize> {
    Reader::new(input).read_u32().map(|len| len as usize)
}
