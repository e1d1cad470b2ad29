//! Request processing for one connection.
//!
//! Drains every complete frame buffered in a connection's incoming buffer,
//! runs each through the command engine and queues the framed responses in
//! arrival order. Works on buffers only; socket I/O stays in the event loop.

use crate::engine::CommandEngine;
use crate::error::{BufferError, ProtocolError};
use crate::protocol::{parse_request, write_response, ParseResult};
use crate::runtime::ElasticBuffer;

/// Result of draining a connection's incoming buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessResult {
    /// All complete frames were answered. Whatever is left in the incoming
    /// buffer is the prefix of a frame still in flight.
    Processed { frames: usize },
    /// A frame can never be decoded; the connection must be closed.
    Protocol(ProtocolError),
    /// A response could not be queued; the connection must be closed.
    Buffer(BufferError),
}

/// Answer every complete request frame in `incoming`.
///
/// Responses are appended to `outgoing` in the order the requests arrived.
/// A bad frame stops processing before anything is queued for it.
pub fn process_requests(
    incoming: &mut ElasticBuffer,
    outgoing: &mut ElasticBuffer,
    engine: &mut CommandEngine,
) -> ProcessResult {
    let mut frames = 0;
    loop {
        match parse_request(incoming.data()) {
            ParseResult::Complete(args, consumed) => {
                let response = engine.execute(&args);
                if let Err(e) = write_response(outgoing, &response) {
                    return ProcessResult::Buffer(e);
                }
                incoming.consume(consumed);
                frames += 1;
            }
            ParseResult::Incomplete => return ProcessResult::Processed { frames },
            ParseResult::Error(e) => return ProcessResult::Protocol(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_request, parse_response, Value};

    fn responses(out: &ElasticBuffer) -> Vec<Value> {
        let mut input = out.data();
        let mut values = Vec::new();
        while !input.is_empty() {
            match parse_response(input) {
                ParseResult::Complete(value, consumed) => {
                    values.push(value);
                    input = &input[consumed..];
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
        values
    }

    #[test]
    fn test_pipelined_frames_answered_in_order() {
        let mut engine = CommandEngine::default();
        let mut incoming = ElasticBuffer::new(64);
        let mut outgoing = ElasticBuffer::new(64);

        incoming.append(&encode_request(&["set", "a", "1"])).unwrap();
        incoming.append(&encode_request(&["get", "a"])).unwrap();
        incoming.append(&encode_request(&["del", "a"])).unwrap();

        let result = process_requests(&mut incoming, &mut outgoing, &mut engine);

        assert_eq!(result, ProcessResult::Processed { frames: 3 });
        assert!(incoming.is_empty());
        assert_eq!(
            responses(&outgoing),
            vec![Value::Nil, Value::str("1"), Value::Int(1)]
        );
    }

    #[test]
    fn test_partial_frame_left_buffered() {
        let mut engine = CommandEngine::default();
        let mut incoming = ElasticBuffer::new(64);
        let mut outgoing = ElasticBuffer::new(64);

        let first = encode_request(&["set", "k", "v"]);
        let second = encode_request(&["get", "k"]);
        incoming.append(&first).unwrap();
        incoming.append(&second[..5]).unwrap();

        let result = process_requests(&mut incoming, &mut outgoing, &mut engine);
        assert_eq!(result, ProcessResult::Processed { frames: 1 });
        assert_eq!(incoming.data(), &second[..5]);

        incoming.append(&second[5..]).unwrap();
        let result = process_requests(&mut incoming, &mut outgoing, &mut engine);
        assert_eq!(result, ProcessResult::Processed { frames: 1 });
        assert_eq!(responses(&outgoing), vec![Value::Nil, Value::str("v")]);
    }

    #[test]
    fn test_bad_frame_stops_processing() {
        let mut engine = CommandEngine::default();
        let mut incoming = ElasticBuffer::new(64);
        let mut outgoing = ElasticBuffer::new(64);

        incoming.append(&encode_request(&["set", "k", "v"])).unwrap();
        // Claims one string but carries none
        incoming.append(&4u32.to_ne_bytes()).unwrap();
        incoming.append(&1u32.to_ne_bytes()).unwrap();

        let result = process_requests(&mut incoming, &mut outgoing, &mut engine);
        assert_eq!(result, ProcessResult::Protocol(ProtocolError::Truncated));
        // The good frame before it was still answered
        assert_eq!(responses(&outgoing), vec![Value::Nil]);
    }

    #[test]
    fn test_oversized_frame_header() {
        let mut engine = CommandEngine::default();
        let mut incoming = ElasticBuffer::new(64);
        let mut outgoing = ElasticBuffer::new(64);

        incoming.append(&u32::MAX.to_ne_bytes()).unwrap();

        let result = process_requests(&mut incoming, &mut outgoing, &mut engine);
        assert!(matches!(
            result,
            ProcessResult::Protocol(ProtocolError::FrameTooLong(_))
        ));
        assert!(outgoing.is_empty());
    }

    #[test]
    fn test_unknown_command_is_answered() {
        let mut engine = CommandEngine::default();
        let mut incoming = ElasticBuffer::new(64);
        let mut outgoing = ElasticBuffer::new(64);

        incoming.append(&encode_request(&["flush"])).unwrap();
        incoming.append(&encode_request(&["get", "k"])).unwrap();

        let result = process_requests(&mut incoming, &mut outgoing, &mut engine);
        assert_eq!(result, ProcessResult::Processed { frames: 2 });

        let values = responses(&outgoing);
        assert!(matches!(values[0], Value::Err { code: 1, .. }));
        assert_eq!(values[1], Value::Nil);
    }
}
