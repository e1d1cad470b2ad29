//! progkv: a single-threaded key-value server
//!
//! Clients speak a length-prefixed binary protocol over persistent TCP
//! connections. Requests are lists of binary strings; responses are
//! self-describing tagged values. Features:
//! - Non-blocking mio reactor serving every connection on one thread
//! - Request pipelining with growable per-connection buffers
//! - `get`, `set`, `del` and `keys` commands
//! - Hash table with incremental rehashing, bounding the cost of any insert
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod engine;
pub mod error;
pub mod hashtable;
pub mod protocol;
pub mod runtime;
pub mod storage;
