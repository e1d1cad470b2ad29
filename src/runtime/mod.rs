//! Networking runtime.
//!
//! A single-threaded mio reactor (epoll on Linux, kqueue on macOS) serving
//! every client connection:
//! - `ElasticBuffer`: per-connection incoming and outgoing bytes
//! - `Connection`: intent flags and readiness handlers
//! - `Reactor`: the poll loop

mod buffer;
mod connection;
mod event_loop;
mod request;

pub use buffer::ElasticBuffer;
pub use connection::{ConnState, Connection, ConnectionTable};
pub use event_loop::Reactor;
pub use request::{process_requests, ProcessResult};

use crate::config::Config;
use crate::engine::CommandEngine;
use crate::storage::Keyspace;
use std::io;
use std::net::SocketAddr;
use tracing::info;

/// Create a bound, listening, non-blocking TCP socket.
pub fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(libc::SOMAXCONN)?;

    Ok(socket.into())
}

/// Run the server until a listener-level failure.
pub fn run(config: Config) -> io::Result<()> {
    let addr = config
        .listen_addr()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let listener = bind_listener(addr)?;
    let engine = CommandEngine::new(Keyspace::new());
    let mut reactor = Reactor::new(listener, engine, &config)?;

    info!(
        addr = %reactor.local_addr()?,
        max_connections = config.max_connections,
        "Listening"
    );

    reactor.run()
}
