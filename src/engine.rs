//! Command dispatch.
//!
//! Maps a decoded request to a keyspace operation and produces the tagged
//! response value. Dispatch is keyed on the command name and the argument
//! count together; anything else is answered with `ERR(Unknown)` and the
//! connection stays open.
//!
//! | command | args | reply |
//! |---------|------|-------|
//! | `get k` | 2 | `STR(value)` or `NIL` |
//! | `set k v` | 3 | `NIL` |
//! | `del k` | 2 | `INT(1)` if removed, else `INT(0)` |
//! | `keys` | 1 | `ARR` of `STR` keys |

use crate::protocol::{ErrorCode, Value};
use crate::storage::Keyspace;
use bytes::Bytes;
use tracing::trace;

/// A recognised command, borrowing its arguments from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Get { key: &'a Bytes },
    Set { key: &'a Bytes, value: &'a Bytes },
    Del { key: &'a Bytes },
    Keys,
}

impl<'a> Command<'a> {
    /// Recognise a command by name and argument count.
    pub fn parse(args: &'a [Bytes]) -> Option<Self> {
        let name: &[u8] = args.first().map(|a| &a[..]).unwrap_or_default();
        match (name, args.len()) {
            (b"get", 2) => Some(Command::Get { key: &args[1] }),
            (b"set", 3) => Some(Command::Set {
                key: &args[1],
                value: &args[2],
            }),
            (b"del", 2) => Some(Command::Del { key: &args[1] }),
            (b"keys", 1) => Some(Command::Keys),
            _ => None,
        }
    }
}

/// Executes commands against the keyspace it owns.
pub struct CommandEngine {
    keyspace: Keyspace,
}

impl CommandEngine {
    pub fn new(keyspace: Keyspace) -> Self {
        Self { keyspace }
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    /// Run one request and return its response value.
    pub fn execute(&mut self, args: &[Bytes]) -> Value {
        let command = match Command::parse(args) {
            Some(command) => command,
            None => {
                trace!(argc = args.len(), "Unknown command");
                return Value::error(ErrorCode::Unknown, "unknown command.");
            }
        };

        trace!(?command, "Processing command");
        match command {
            Command::Get { key } => match self.keyspace.get(key) {
                Some(value) => Value::Str(value.clone()),
                None => Value::Nil,
            },
            Command::Set { key, value } => {
                self.keyspace.set(key.clone(), value.clone());
                Value::Nil
            }
            Command::Del { key } => Value::Int(self.keyspace.delete(key) as i64),
            Command::Keys => Value::Arr(self.keyspace.keys().cloned().map(Value::Str).collect()),
        }
    }
}

impl Default for CommandEngine {
    fn default() -> Self {
        Self::new(Keyspace::new())
    }
}
