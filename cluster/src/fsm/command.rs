use serde_derive::{Deserialize, Serialize};

use crate::error::Result;

/// Commands that flow through the raft log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Store `value` under `key`, replacing any previous value.
    Set { key: String, value: String },
    Delete { key: String },
    /// Store `value` only if the current value equals `expected`
    /// (`None` meaning the key must be absent).
    CompareAndSwap {
        key: String,
        expected: Option<String>,
        value: String,
    },
}

/// Outcome of applying a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResult {
    /// Value held before a `Set` or `Delete`.
    Previous(Option<String>),
    /// Whether a `CompareAndSwap` took effect, with the value now stored.
    Swapped { swapped: bool, current: Option<String> },
}

impl Command {
    pub fn key(&self) -> &str {
        match self {
            Command::Set { key, .. }
            | Command::Delete { key }
            | Command::CompareAndSwap { key, .. } => key,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
