//! Connection state for managing client sockets.
//!
//! Each connection carries three intent flags that the event loop turns into
//! readiness interest: `wants_read` and `wants_write` are mutually exclusive,
//! and `wants_close` asks for teardown at the end of the current cycle.
//! The socket type is generic so the state machine can be driven without a
//! real network peer.

use crate::engine::CommandEngine;
use crate::runtime::request::{process_requests, ProcessResult};
use crate::runtime::ElasticBuffer;
use mio::Interest;
use std::io::{self, Read, Write};
use tracing::{debug, warn};

/// Socket reads per readiness event before yielding to other connections.
pub const READS_PER_EVENT: usize = 16;

/// What a connection is currently waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for request bytes.
    Reading,
    /// Flushing queued responses; reads are paused.
    Writing,
    /// Will be torn down at the end of the cycle.
    Closing,
}

/// A single client connection.
pub struct Connection<S> {
    /// Socket file descriptor, also the connection's table slot.
    pub fd: usize,
    pub stream: S,
    pub wants_read: bool,
    pub wants_write: bool,
    pub wants_close: bool,
    /// Received bytes not yet parsed into complete frames.
    pub incoming: ElasticBuffer,
    /// Encoded responses not yet written to the socket.
    pub outgoing: ElasticBuffer,
    /// Interest currently registered with the poller.
    pub(crate) registered: Option<Interest>,
    /// Read budget ran out before the socket would block.
    backlogged: bool,
}

impl<S> Connection<S> {
    /// Create a new connection waiting for its first request.
    pub fn new(fd: usize, stream: S, buffer_size: usize) -> Self {
        Self {
            fd,
            stream,
            wants_read: true,
            wants_write: false,
            wants_close: false,
            incoming: ElasticBuffer::new(buffer_size),
            outgoing: ElasticBuffer::new(buffer_size),
            registered: None,
            backlogged: false,
        }
    }

    pub fn state(&self) -> ConnState {
        if self.wants_close {
            ConnState::Closing
        } else if self.wants_write {
            ConnState::Writing
        } else {
            ConnState::Reading
        }
    }

    /// Readiness interest matching the current intent flags.
    pub fn interest(&self) -> Interest {
        if self.wants_write {
            Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Pause reads until queued responses are flushed.
    pub fn start_writing(&mut self) {
        self.wants_read = false;
        self.wants_write = true;
    }

    /// Resume reading once the outgoing buffer is empty.
    pub fn start_reading(&mut self) {
        self.wants_read = true;
        self.wants_write = false;
    }

    /// Mark connection for closing.
    pub fn close(&mut self) {
        self.wants_close = true;
    }

    /// Whether unread input may remain that no readiness edge will report.
    pub fn needs_read(&self) -> bool {
        self.backlogged && self.wants_read && !self.wants_close
    }
}

impl<S: Read + Write> Connection<S> {
    /// Service read readiness.
    ///
    /// Reads until the socket would block, answering every complete frame
    /// after each chunk. As soon as responses are queued the connection
    /// switches to writing and flushes eagerly; reading resumes only if the
    /// flush completes. After `READS_PER_EVENT` reads the connection yields
    /// and reports `needs_read` until it is serviced again.
    pub fn handle_readable(&mut self, engine: &mut CommandEngine, scratch: &mut [u8]) {
        self.backlogged = false;
        let mut reads = 0;
        while self.wants_read && !self.wants_close {
            if reads == READS_PER_EVENT {
                self.backlogged = true;
                return;
            }
            reads += 1;

            let n = match self.stream.read(scratch) {
                Ok(0) => {
                    if self.incoming.is_empty() {
                        debug!(fd = self.fd, "Client closed");
                    } else {
                        warn!(fd = self.fd, buffered = self.incoming.len(), "Unexpected EOF");
                    }
                    self.close();
                    return;
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "Read error");
                    self.close();
                    return;
                }
            };

            if let Err(e) = self.incoming.append(&scratch[..n]) {
                warn!(fd = self.fd, error = %e, "Dropping connection");
                self.close();
                return;
            }

            match process_requests(&mut self.incoming, &mut self.outgoing, engine) {
                ProcessResult::Processed { .. } => {}
                ProcessResult::Protocol(e) => {
                    warn!(fd = self.fd, error = %e, "Protocol error");
                    // Replies to the frames ahead of the bad one still go out
                    self.handle_writable();
                    self.close();
                    return;
                }
                ProcessResult::Buffer(e) => {
                    warn!(fd = self.fd, error = %e, "Dropping connection");
                    self.close();
                    return;
                }
            }

            if !self.outgoing.is_empty() {
                self.start_writing();
                self.handle_writable();
            }
        }
    }

    /// Service write readiness.
    ///
    /// Writes until the outgoing buffer is empty or the socket would block.
    /// An empty buffer flips the connection back to reading.
    pub fn handle_writable(&mut self) {
        while !self.outgoing.is_empty() {
            match self.stream.write(self.outgoing.data()) {
                Ok(0) => {
                    debug!(fd = self.fd, "Write returned 0");
                    self.close();
                    return;
                }
                Ok(n) => self.outgoing.consume(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "Write error");
                    self.close();
                    return;
                }
            }
        }
        self.start_reading();
    }
}

/// Active connections indexed by file descriptor.
///
/// The kernel hands out the lowest free descriptor, so the table stays
/// dense and grows only as far as the highest open fd.
pub struct ConnectionTable<S> {
    slots: Vec<Option<Connection<S>>>,
    len: usize,
    max_connections: usize,
}

impl<S> ConnectionTable<S> {
    /// Create an empty table admitting at most `max_connections` entries.
    pub fn new(max_connections: usize) -> Self {
        Self {
            slots: Vec::new(),
            len: 0,
            max_connections,
        }
    }

    /// Insert a connection into the slot for its fd.
    ///
    /// Returns `false`, dropping the connection, if the table is full or
    /// the slot is taken.
    pub fn insert(&mut self, conn: Connection<S>) -> bool {
        if self.len >= self.max_connections {
            return false;
        }
        let fd = conn.fd;
        if self.slots.len() <= fd {
            self.slots.resize_with(fd + 1, || None);
        }
        if self.slots[fd].is_some() {
            return false;
        }
        self.slots[fd] = Some(conn);
        self.len += 1;
        true
    }

    pub fn get(&self, fd: usize) -> Option<&Connection<S>> {
        self.slots.get(fd).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, fd: usize) -> Option<&mut Connection<S>> {
        self.slots.get_mut(fd).and_then(Option::as_mut)
    }

    /// Remove a connection, leaving its slot empty.
    pub fn remove(&mut self, fd: usize) -> Option<Connection<S>> {
        let conn = self.slots.get_mut(fd)?.take()?;
        self.len -= 1;
        Some(conn)
    }

    pub fn contains(&self, fd: usize) -> bool {
        self.get(fd).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.max_connections
    }

    /// Iterate over live connections in ascending fd order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Connection<S>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(fd, slot)| slot.as_ref().map(|conn| (fd, conn)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Connection<S>)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(fd, slot)| slot.as_mut().map(|conn| (fd, conn)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_request, parse_response, ParseResult, Value};
    use std::collections::VecDeque;

    /// Scripted socket: serves queued reads, then would-block.
    #[derive(Default)]
    struct MockStream {
        reads: VecDeque<io::Result<Vec<u8>>>,
        written: Vec<u8>,
        write_budget: Option<usize>,
        write_error: Option<io::ErrorKind>,
        write_zero: bool,
    }

    impl MockStream {
        fn feed(&mut self, data: &[u8]) {
            self.reads.push_back(Ok(data.to_vec()));
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(kind) = self.write_error {
                return Err(kind.into());
            }
            if self.write_zero {
                return Ok(0);
            }
            let n = match self.write_budget {
                Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
                Some(budget) => budget.min(buf.len()),
                None => buf.len(),
            };
            if let Some(budget) = self.write_budget.as_mut() {
                *budget -= n;
            }
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn connection() -> Connection<MockStream> {
        Connection::new(7, MockStream::default(), 64)
    }

    fn decode_all(mut input: &[u8]) -> Vec<Value> {
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
    fn test_connection_state_transitions() {
        let mut conn = connection();
        assert_eq!(conn.state(), ConnState::Reading);
        assert_eq!(conn.interest(), Interest::READABLE);

        conn.start_writing();
        assert_eq!(conn.state(), ConnState::Writing);
        assert_eq!(conn.interest(), Interest::WRITABLE);
        assert!(!conn.wants_read);

        conn.start_reading();
        assert_eq!(conn.state(), ConnState::Reading);
        assert!(!conn.wants_write);

        conn.close();
        assert_eq!(conn.state(), ConnState::Closing);
    }

    #[test]
    fn test_pipelined_requests_in_one_read() {
        let mut engine = CommandEngine::default();
        let mut scratch = vec![0; 1024];
        let mut conn = connection();

        let mut batch = Vec::new();
        batch.extend_from_slice(&encode_request(&["set", "a", "1"]));
        batch.extend_from_slice(&encode_request(&["get", "a"]));
        batch.extend_from_slice(&encode_request(&["del", "a"]));
        conn.stream.feed(&batch);

        conn.handle_readable(&mut engine, &mut scratch);

        assert_eq!(conn.state(), ConnState::Reading);
        assert!(conn.outgoing.is_empty());
        assert_eq!(
            decode_all(&conn.stream.written),
            vec![Value::Nil, Value::str("1"), Value::Int(1)]
        );
    }

    #[test]
    fn test_frame_split_across_reads() {
        let mut engine = CommandEngine::default();
        let mut scratch = vec![0; 1024];
        let mut conn = connection();

        let frame = encode_request(&["get", "missing"]);
        conn.stream.feed(&frame[..3]);
        conn.handle_readable(&mut engine, &mut scratch);
        assert!(conn.stream.written.is_empty());
        assert_eq!(conn.incoming.len(), 3);

        conn.stream.feed(&frame[3..]);
        conn.handle_readable(&mut engine, &mut scratch);
        assert_eq!(decode_all(&conn.stream.written), vec![Value::Nil]);
        assert!(conn.incoming.is_empty());
    }

    #[test]
    fn test_blocked_write_pauses_reads() {
        let mut engine = CommandEngine::default();
        let mut scratch = vec![0; 1024];
        let mut conn = connection();
        conn.stream.write_budget = Some(3);

        conn.stream.feed(&encode_request(&["set", "k", "v"]));
        conn.stream.feed(&encode_request(&["get", "k"]));
        conn.handle_readable(&mut engine, &mut scratch);

        // Only the first frame was read before the write blocked
        assert_eq!(conn.state(), ConnState::Writing);
        assert_eq!(conn.stream.reads.len(), 1);
        assert_eq!(conn.stream.written.len(), 3);

        conn.stream.write_budget = None;
        conn.handle_writable();
        assert_eq!(conn.state(), ConnState::Reading);

        conn.handle_readable(&mut engine, &mut scratch);
        assert_eq!(
            decode_all(&conn.stream.written),
            vec![Value::Nil, Value::str("v")]
        );
    }

    #[test]
    fn test_malformed_frame_closes_without_reply() {
        let mut engine = CommandEngine::default();
        let mut scratch = vec![0; 1024];
        let mut conn = connection();

        let mut frame = 8u32.to_ne_bytes().to_vec();
        frame.extend_from_slice(&1u32.to_ne_bytes());
        frame.extend_from_slice(&100u32.to_ne_bytes());
        conn.stream.feed(&frame);

        conn.handle_readable(&mut engine, &mut scratch);
        assert_eq!(conn.state(), ConnState::Closing);
        assert!(conn.stream.written.is_empty());
    }

    #[test]
    fn test_bad_frame_after_valid_frames_flushes_earlier_replies() {
        let mut engine = CommandEngine::default();
        let mut scratch = vec![0; 1024];
        let mut conn = connection();

        let mut batch = Vec::new();
        batch.extend_from_slice(&encode_request(&["set", "a", "1"]));
        batch.extend_from_slice(&encode_request(&["get", "a"]));
        // Declared string runs past the end of its frame
        batch.extend_from_slice(&8u32.to_ne_bytes());
        batch.extend_from_slice(&1u32.to_ne_bytes());
        batch.extend_from_slice(&100u32.to_ne_bytes());
        conn.stream.feed(&batch);

        conn.handle_readable(&mut engine, &mut scratch);

        assert_eq!(conn.state(), ConnState::Closing);
        assert!(conn.outgoing.is_empty());
        assert_eq!(
            decode_all(&conn.stream.written),
            vec![Value::Nil, Value::str("1")]
        );
    }

    #[test]
    fn test_bad_frame_with_blocked_socket_still_closes() {
        let mut engine = CommandEngine::default();
        let mut scratch = vec![0; 1024];
        let mut conn = connection();
        conn.stream.write_budget = Some(0);

        let mut batch = encode_request(&["set", "a", "1"]).to_vec();
        batch.extend_from_slice(&u32::MAX.to_ne_bytes());
        conn.stream.feed(&batch);

        conn.handle_readable(&mut engine, &mut scratch);
        assert_eq!(conn.state(), ConnState::Closing);
        assert!(conn.stream.written.is_empty());
    }

    #[test]
    fn test_read_budget_yields_then_resumes() {
        let mut engine = CommandEngine::default();
        let mut scratch = vec![0; 1024];
        let mut conn = connection();

        let frame = encode_request(&["get", "k"]);
        let total = READS_PER_EVENT + 4;
        for _ in 0..total {
            conn.stream.feed(&frame);
        }

        conn.handle_readable(&mut engine, &mut scratch);
        assert!(conn.needs_read());
        assert_eq!(conn.stream.reads.len(), 4);
        assert_eq!(decode_all(&conn.stream.written).len(), READS_PER_EVENT);

        conn.handle_readable(&mut engine, &mut scratch);
        assert!(!conn.needs_read());
        assert!(conn.stream.reads.is_empty());
        assert_eq!(decode_all(&conn.stream.written).len(), total);
    }

    #[test]
    fn test_write_error_closes() {
        let mut engine = CommandEngine::default();
        let mut scratch = vec![0; 1024];
        let mut conn = connection();
        conn.stream.write_error = Some(io::ErrorKind::BrokenPipe);

        conn.stream.feed(&encode_request(&["get", "k"]));
        conn.handle_readable(&mut engine, &mut scratch);

        assert_eq!(conn.state(), ConnState::Closing);
        assert!(!conn.outgoing.is_empty());
    }

    #[test]
    fn test_zero_length_write_closes() {
        let mut conn = connection();
        conn.outgoing.append(b"pending").unwrap();
        conn.start_writing();
        conn.stream.write_zero = true;

        conn.handle_writable();
        assert_eq!(conn.state(), ConnState::Closing);
        assert_eq!(conn.outgoing.data(), b"pending");
    }

    #[test]
    fn test_unknown_command_keeps_connection_open() {
        let mut engine = CommandEngine::default();
        let mut scratch = vec![0; 1024];
        let mut conn = connection();

        conn.stream.feed(&encode_request(&["get"]));
        conn.handle_readable(&mut engine, &mut scratch);

        assert_eq!(conn.state(), ConnState::Reading);
        let values = decode_all(&conn.stream.written);
        assert!(matches!(values.as_slice(), [Value::Err { code: 1, .. }]));
    }

    #[test]
    fn test_eof_closes() {
        let mut engine = CommandEngine::default();
        let mut scratch = vec![0; 1024];

        let mut conn = connection();
        conn.stream.feed(b"");
        conn.handle_readable(&mut engine, &mut scratch);
        assert_eq!(conn.state(), ConnState::Closing);

        // EOF in the middle of a frame
        let mut conn = connection();
        conn.stream.feed(&encode_request(&["get", "k"])[..6]);
        conn.stream.feed(b"");
        conn.handle_readable(&mut engine, &mut scratch);
        assert_eq!(conn.state(), ConnState::Closing);
    }

    #[test]
    fn test_interrupted_read_is_retried() {
        let mut engine = CommandEngine::default();
        let mut scratch = vec![0; 1024];
        let mut conn = connection();

        conn.stream.reads.push_back(Err(io::ErrorKind::Interrupted.into()));
        conn.stream.feed(&encode_request(&["get", "k"]));
        conn.handle_readable(&mut engine, &mut scratch);

        assert_eq!(conn.state(), ConnState::Reading);
        assert_eq!(decode_all(&conn.stream.written), vec![Value::Nil]);
    }

    #[test]
    fn test_read_error_closes() {
        let mut engine = CommandEngine::default();
        let mut scratch = vec![0; 1024];
        let mut conn = connection();

        conn.stream
            .reads
            .push_back(Err(io::ErrorKind::ConnectionReset.into()));
        conn.handle_readable(&mut engine, &mut scratch);
        assert_eq!(conn.state(), ConnState::Closing);
    }

    #[test]
    fn test_connection_table() {
        let mut table = ConnectionTable::new(2);

        assert!(table.insert(Connection::new(10, (), 16)));
        assert!(table.insert(Connection::new(4, (), 16)));

        // At capacity
        assert!(table.is_full());
        assert!(!table.insert(Connection::new(5, (), 16)));

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(10).unwrap().fd, 10);
        let fds: Vec<usize> = table.iter().map(|(fd, _)| fd).collect();
        assert_eq!(fds, vec![4, 10]);

        assert!(table.remove(10).is_some());
        assert!(!table.contains(10));
        assert!(table.remove(10).is_none());
        assert_eq!(table.len(), 1);

        // Slot reuse after removal
        assert!(table.insert(Connection::new(10, (), 16)));
        assert!(!table.insert(Connection::new(10, (), 16)));
        assert_eq!(table.capacity(), 2);
    }
}
