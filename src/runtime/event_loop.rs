//! mio event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS. mio is edge-triggered, so every readiness notification is drained
//! until the socket would block.
//!
//! One cycle of the loop:
//! 1. apply interest changes requested by connections in the last cycle
//! 2. wait for readiness
//! 3. accept pending connections
//! 4. service ready connections in fd order, plus any that ran out of read
//!    budget last cycle
//! 5. close every connection that asked for it

use crate::config::Config;
use crate::engine::CommandEngine;
use crate::runtime::connection::{Connection, ConnectionTable};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tracing::{debug, error, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Bytes requested from the socket per read call.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
struct Readiness {
    readable: bool,
    writable: bool,
    error: bool,
}

/// Single-threaded connection reactor.
///
/// Owns the listener, every client connection and the command engine.
pub struct Reactor {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: ConnectionTable<TcpStream>,
    engine: CommandEngine,
    scratch: Vec<u8>,
    ready: Vec<(usize, Readiness)>,
    closing: Vec<usize>,
    buffer_size: usize,
}

impl Reactor {
    /// Take over a bound, listening socket.
    pub fn new(
        listener: std::net::TcpListener,
        engine: CommandEngine,
        config: &Config,
    ) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.batch_size.max(1)),
            listener,
            connections: ConnectionTable::new(config.max_connections),
            engine,
            scratch: vec![0; READ_CHUNK],
            ready: Vec::new(),
            closing: Vec::new(),
            buffer_size: config.buffer_size,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn engine(&self) -> &CommandEngine {
        &self.engine
    }

    /// Serve until a listener-level failure.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.poll_once(None)?;
        }
    }

    /// Run a single cycle, waiting at most `timeout` for readiness.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.sync_interest();

        // Backlogged input gets no new edge, so don't sleep on it
        let backlogged = self.connections.iter().any(|(_, conn)| conn.needs_read());
        let timeout = if backlogged {
            Some(Duration::ZERO)
        } else {
            timeout
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                debug!("Poll interrupted");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let mut accept = false;
        self.ready.clear();
        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => accept = true,
                Token(fd) => self.ready.push((
                    fd,
                    Readiness {
                        readable: event.is_readable() || event.is_read_closed(),
                        writable: event.is_writable() || event.is_write_closed(),
                        error: event.is_error(),
                    },
                )),
            }
        }

        if accept {
            self.accept_connections();
        }

        self.ready.sort_unstable_by_key(|&(fd, _)| fd);
        if backlogged {
            self.schedule_backlogged();
        }
        for i in 0..self.ready.len() {
            let (fd, readiness) = self.ready[i];
            self.handle_connection_event(fd, readiness);
        }

        self.close_connections();
        Ok(())
    }

    /// Queue a read for every connection with input left over from its
    /// budget. Expects `ready` sorted by fd and leaves it sorted.
    fn schedule_backlogged(&mut self) {
        let reported = self.ready.len();
        for (fd, conn) in self.connections.iter() {
            if !conn.needs_read() {
                continue;
            }
            match self.ready[..reported].binary_search_by_key(&fd, |&(ready_fd, _)| ready_fd) {
                Ok(i) => self.ready[i].1.readable = true,
                Err(_) => self.ready.push((
                    fd,
                    Readiness {
                        readable: true,
                        writable: false,
                        error: false,
                    },
                )),
            }
        }
        self.ready.sort_unstable_by_key(|&(fd, _)| fd);
    }

    /// Reregister every connection whose interest changed.
    fn sync_interest(&mut self) {
        for (fd, conn) in self.connections.iter_mut() {
            let desired = conn.interest();
            if conn.registered == Some(desired) {
                continue;
            }
            match self
                .poll
                .registry()
                .reregister(&mut conn.stream, Token(fd), desired)
            {
                Ok(()) => conn.registered = Some(desired),
                Err(e) => {
                    warn!(fd, error = %e, "Failed to update interest");
                    conn.close();
                }
            }
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => self.register_connection(stream, peer_addr),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn register_connection(&mut self, mut stream: TcpStream, peer_addr: SocketAddr) {
        if self.connections.is_full() {
            warn!(peer = %peer_addr, "Connection limit reached");
            return;
        }

        let fd = stream.as_raw_fd() as usize;
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, Token(fd), Interest::READABLE)
        {
            warn!(fd, error = %e, "Failed to register connection");
            return;
        }

        let mut conn = Connection::new(fd, stream, self.buffer_size);
        conn.registered = Some(Interest::READABLE);
        if !self.connections.insert(conn) {
            warn!(fd, "Connection slot already in use");
            return;
        }

        debug!(fd, peer = %peer_addr, "Accepted connection");
    }

    fn handle_connection_event(&mut self, fd: usize, readiness: Readiness) {
        let conn = match self.connections.get_mut(fd) {
            Some(conn) => conn,
            None => return,
        };

        if readiness.readable && conn.wants_read {
            conn.handle_readable(&mut self.engine, &mut self.scratch);
        }

        if readiness.writable && conn.wants_write && !conn.wants_close {
            conn.handle_writable();
            // Drained: pick up requests that arrived while writes were pending
            if conn.wants_read {
                conn.handle_readable(&mut self.engine, &mut self.scratch);
            }
        }

        if readiness.error {
            debug!(fd, "Socket error");
            conn.close();
        }
    }

    fn close_connections(&mut self) {
        self.closing.clear();
        self.closing.extend(
            self.connections
                .iter()
                .filter(|(_, conn)| conn.wants_close)
                .map(|(fd, _)| fd),
        );

        for i in 0..self.closing.len() {
            let fd = self.closing[i];
            if let Some(mut conn) = self.connections.remove(fd) {
                let _ = self.poll.registry().deregister(&mut conn.stream);
                debug!(fd, "Connection closed");
            }
        }
    }
}
