//! Replicated state machine boundary.
//!
//! Committed raft entries are decoded into [`Command`]s and handed to a
//! [`StateMachine`] one at a time, in index order, from the raft node task.

use std::io::{Read, Write};

pub mod command;
pub mod kv;

pub use command::{Command, CommandResult};
pub use kv::KvStateMachine;

use crate::error::Result;

/// A committed command together with its position in the raft log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Command,
}

/// Application state driven by the raft log.
///
/// `apply` is called exactly once per committed command, never concurrently
/// and always in increasing index order. Implementations must be
/// deterministic: the same entries produce the same state on every node.
///
/// Any error returned here stops the node; it cannot keep applying entries
/// on top of a state it failed to produce.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, entry: &LogEntry) -> Result<CommandResult>;

    /// Captures the current state. The returned handle is persisted after
    /// this call returns, so only the capture itself delays `apply`.
    fn snapshot(&self) -> Result<Box<dyn StateSnapshot>>;

    /// Replaces the whole state with one previously written by a
    /// [`StateSnapshot`].
    fn restore(&mut self, reader: &mut dyn Read) -> Result<()>;
}

/// A point-in-time capture produced by [`StateMachine::snapshot`].
pub trait StateSnapshot: Send {
    fn persist(&self, sink: &mut dyn Write) -> Result<()>;
}
