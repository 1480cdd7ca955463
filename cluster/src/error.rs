use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to prepare {path}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("raft error: {0}")]
    Raft(#[from] raft::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("protobuf error: {0}")]
    Protobuf(#[from] protobuf::ProtobufError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Bootstrap was requested over a store that already holds raft state.
    #[error("cluster state already exists")]
    ExistingState,

    #[error("not the leader (leader: {})", .leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    #[error("proposal dropped, leadership changed before entry {index} was applied")]
    LeadershipLost { index: u64 },

    #[error("entry {got} applied out of order, expected {expected}")]
    ApplyGap { expected: u64, got: u64 },

    #[error("state machine failed: {0}")]
    StateMachine(String),

    #[error("membership change rejected: {0}")]
    Membership(String),

    #[error("timed out")]
    Timeout,

    #[error("consensus server stopped")]
    Stopped,
}

impl Error {
    /// Wraps any error so it can be handed back to raft-rs through `raft::Storage`.
    pub(crate) fn into_raft(self) -> raft::Error {
        match self {
            Error::Raft(e) => e,
            other => raft::Error::Store(raft::StorageError::Other(Box::new(other))),
        }
    }
}
