//! Request frames: a length-prefixed array of byte strings.

use super::{frame_len, ParseResult, Reader, HEADER_LEN, MAX_MSG};
use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Parse one request frame from the front of `input`.
///
/// Never reads past the end of `input`. Oversized and malformed frames are
/// reported as errors as soon as the offending field is visible.
pub fn parse_request(input: &[u8]) -> ParseResult<Vec<Bytes>> {
    let len = match frame_len(input) {
        Some(len) => len,
        None => return ParseResult::Incomplete,
    };

    if len > MAX_MSG {
        return ParseResult::Error(ProtocolError::FrameTooLong(len));
    }

    let total = HEADER_LEN + len;
    if input.len() < total {
        return ParseResult::Incomplete;
    }

    match parse_command(&input[HEADER_LEN..total]) {
        Ok(args) => ParseResult::Complete(args, total),
        Err(e) => ParseResult::Error(e),
    }
}

/// Decode a complete request payload into its strings.
fn parse_command(payload: &[u8]) -> Result<Vec<Bytes>, ProtocolError> {
    let mut reader = Reader::new(payload);

    let nstr = reader.read_u32().ok_or(ProtocolError::Truncated)?;
    if nstr as usize > MAX_MSG {
        return Err(ProtocolError::TooManyStrings(nstr));
    }

    // Each string needs at least its 4-byte length
    let mut args = Vec::with_capacity((nstr as usize).min(reader.remaining() / 4));
    for _ in 0..nstr {
        let len = reader.read_u32().ok_or(ProtocolError::Truncated)?;
        if len as usize > MAX_MSG {
            return Err(ProtocolError::StringTooLong(len));
        }
        let bytes = reader
            .read_bytes(len as usize)
            .ok_or(ProtocolError::Truncated)?;
        args.push(Bytes::copy_from_slice(bytes));
    }

    if reader.remaining() > 0 {
        return Err(ProtocolError::TrailingBytes(reader.remaining()));
    }

    debug_assert_eq!(reader.position(), payload.len());
    Ok(args)
}

/// Encode a request frame for `args`.
pub fn encode_request<A: AsRef<[u8]>>(args: &[A]) -> BytesMut {
    let payload_len: usize = 4 + args.iter().map(|a| 4 + a.as_ref().len()).sum::<usize>();

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
    buf.put_u32_ne(payload_len as u32);
    buf.put_u32_ne(args.len() as u32);
    for arg in args {
        let arg = arg.as_ref();
        buf.put_u32_ne(arg.len() as u32);
        buf.put_slice(arg);
    }
    buf
}
