//! Error types for the server.
//!
//! Protocol and buffer errors are connection-level: the reactor closes the
//! offending connection and keeps serving the others. Configuration errors
//! abort startup.

use std::path::PathBuf;
use thiserror::Error;

/// A request frame that can never be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame length {0} exceeds the maximum message size")]
    FrameTooLong(usize),

    #[error("string count {0} exceeds the maximum message size")]
    TooManyStrings(u32),

    #[error("string length {0} exceeds the maximum message size")]
    StringTooLong(u32),

    #[error("declared length runs past the end of the payload")]
    Truncated,

    #[error("{0} trailing bytes after the last string")]
    TrailingBytes(usize),

    #[error("unknown value tag {0}")]
    UnknownTag(u8),
}

/// ElasticBuffer growth failure. The buffer is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("failed to grow buffer to {requested} bytes")]
    Alloc { requested: usize },
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid listen address '{0}'")]
    InvalidAddress(String),
}
