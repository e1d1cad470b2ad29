//! Tagged response values.
//!
//! ```text
//! NIL: 0
//! ERR: 1 | code:u32 | len:u32 | msg
//! STR: 2 | len:u32 | bytes
//! INT: 3 | i64
//! DBL: 4 | f64
//! ARR: 5 | count:u32 | value*count
//! ```

use super::{frame_len, ParseResult, Reader, HEADER_LEN, MAX_MSG};
use crate::error::{BufferError, ProtocolError};
use crate::runtime::ElasticBuffer;
use bytes::Bytes;

/// Type discriminator written before every value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Nil = 0,
    Err = 1,
    Str = 2,
    Int = 3,
    Dbl = 4,
    Arr = 5,
}

impl TryFrom<u8> for Tag {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Tag::Nil),
            1 => Ok(Tag::Err),
            2 => Ok(Tag::Str),
            3 => Ok(Tag::Int),
            4 => Ok(Tag::Dbl),
            5 => Ok(Tag::Arr),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

/// Error codes carried by `ERR` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Unknown command or wrong argument count.
    Unknown = 1,
    /// The response would exceed the maximum message size.
    TooLong = 2,
}

/// A response value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Err { code: u32, msg: String },
    Str(Bytes),
    Int(i64),
    Dbl(f64),
    Arr(Vec<Value>),
}

impl Value {
    pub fn nil() -> Value {
        Value::Nil
    }

    pub fn error<S: Into<String>>(code: ErrorCode, msg: S) -> Value {
        Value::Err {
            code: code as u32,
            msg: msg.into(),
        }
    }

    pub fn str<B: Into<Bytes>>(data: B) -> Value {
        Value::Str(data.into())
    }

    pub fn int(n: i64) -> Value {
        Value::Int(n)
    }

    pub fn dbl(n: f64) -> Value {
        Value::Dbl(n)
    }

    pub fn array(values: Vec<Value>) -> Value {
        Value::Arr(values)
    }

    pub fn tag(&self) -> Tag {
        match self {
            Value::Nil => Tag::Nil,
            Value::Err { .. } => Tag::Err,
            Value::Str(_) => Tag::Str,
            Value::Int(_) => Tag::Int,
            Value::Dbl(_) => Tag::Dbl,
            Value::Arr(_) => Tag::Arr,
        }
    }

    /// Append the tagged encoding of this value to `out`.
    pub fn encode_into(&self, out: &mut ElasticBuffer) -> Result<(), BufferError> {
        out.append_u8(self.tag() as u8)?;
        match self {
            Value::Nil => {}
            Value::Err { code, msg } => {
                out.append_u32(*code)?;
                out.append_u32(msg.len() as u32)?;
                out.append(msg.as_bytes())?;
            }
            Value::Str(data) => {
                out.append_u32(data.len() as u32)?;
                out.append(data)?;
            }
            Value::Int(n) => out.append_i64(*n)?,
            Value::Dbl(n) => out.append_f64(*n)?,
            Value::Arr(values) => {
                out.append_u32(values.len() as u32)?;
                for value in values {
                    value.encode_into(out)?;
                }
            }
        }
        Ok(())
    }

    /// Parse one tagged value from the front of `input`.
    pub fn parse(input: &[u8]) -> ParseResult<Value> {
        let mut reader = Reader::new(input);
        match read_value(&mut reader) {
            Ok(Some(value)) => ParseResult::Complete(value, reader.position()),
            Ok(None) => ParseResult::Incomplete,
            Err(e) => ParseResult::Error(e),
        }
    }
}

/// `Ok(None)` means the input ends inside the value.
fn read_value(reader: &mut Reader<'_>) -> Result<Option<Value>, ProtocolError> {
    let tag = match reader.read_u8() {
        Some(tag) => Tag::try_from(tag)?,
        None => return Ok(None),
    };

    let value = match tag {
        Tag::Nil => Some(Value::Nil),
        Tag::Err => read_err(reader),
        Tag::Str => reader
            .read_u32()
            .and_then(|len| reader.read_bytes(len as usize))
            .map(|data| Value::Str(Bytes::copy_from_slice(data))),
        Tag::Int => reader.read_array::<8>().map(|b| Value::Int(i64::from_ne_bytes(b))),
        Tag::Dbl => reader.read_array::<8>().map(|b| Value::Dbl(f64::from_ne_bytes(b))),
        Tag::Arr => {
            let count = match reader.read_u32() {
                Some(count) => count,
                None => return Ok(None),
            };
            // Every element is at least one tag byte
            let mut values = Vec::with_capacity((count as usize).min(reader.remaining()));
            for _ in 0..count {
                match read_value(reader)? {
                    Some(value) => values.push(value),
                    None => return Ok(None),
                }
            }
            Some(Value::Arr(values))
        }
    };
    Ok(value)
}

fn read_err(reader: &mut Reader<'_>) -> Option<Value> {
    let code = reader.read_u32()?;
    let len = reader.read_u32()?;
    let msg = reader.read_bytes(len as usize)?;
    Some(Value::Err {
        code,
        msg: String::from_utf8_lossy(msg).into_owned(),
    })
}

/// Append a framed response for `value` to `out`.
///
/// Reserves the length prefix, encodes the value in place and backpatches
/// the length. A payload larger than `MAX_MSG` is discarded and replaced by
/// `ERR(TooLong)`. On allocation failure `out` is restored to its previous
/// contents.
pub fn write_response(out: &mut ElasticBuffer, value: &Value) -> Result<(), BufferError> {
    let header = out.len();
    out.append_u32(0)?;

    if let Err(e) = encode_bounded(out, header, value) {
        out.truncate(header);
        return Err(e);
    }

    let payload = out.len() - header - HEADER_LEN;
    out.patch_u32(header, payload as u32);
    Ok(())
}

fn encode_bounded(out: &mut ElasticBuffer, header: usize, value: &Value) -> Result<(), BufferError> {
    value.encode_into(out)?;
    if out.len() - header - HEADER_LEN > MAX_MSG {
        out.truncate(header + HEADER_LEN);
        Value::error(ErrorCode::TooLong, "response is too big").encode_into(out)?;
    }
    Ok(())
}

/// Parse one framed response from the front of `input`.
pub fn parse_response(input: &[u8]) -> ParseResult<Value> {
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

    match Value::parse(&input[HEADER_LEN..total]) {
        ParseResult::Complete(value, used) if used == len => ParseResult::Complete(value, total),
        ParseResult::Complete(_, used) => ParseResult::Error(ProtocolError::TrailingBytes(len - used)),
        // The frame is complete, so a short value is malformed
        ParseResult::Incomplete => ParseResult::Error(ProtocolError::Truncated),
        ParseResult::Error(e) => ParseResult::Error(e),
    }
}
