//! Raft node bootstrap and driving loop.
//!
//! The engine is tikv's raft-rs `RawNode`. This module provides everything it
//! leaves to the embedder: the apply path into a [`StateMachine`], bootstrap
//! of a fresh cluster, proposal tracking and the tokio task that ticks the
//! node and processes its `Ready`s.
//!
//! [`StateMachine`]: crate::fsm::StateMachine

use std::time::Duration;

use raft::Config;
use serde_derive::{Deserialize, Serialize};

pub mod apply;
pub mod bootstrap;
pub mod node;
pub mod proposal;
pub mod status;

pub use apply::{Applied, Applier};
pub use bootstrap::{bootstrap_cluster, has_existing_state};
pub use proposal::{Proposal, Response};
pub use status::{ClusterStatus, Role, ServerPhase, StartupMode};

pub const RETAIN_SNAPSHOT_COUNT: usize = 2;
pub const APPLY_TIMEOUT: Duration = Duration::from_secs(10);
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(120);
pub const LOG_CACHE_SIZE: usize = 512;
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const LEADER_WAIT_DELAY: Duration = Duration::from_millis(100);
pub const APPLIED_WAIT_DELAY: Duration = Duration::from_millis(100);
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);
/// Entries kept in the log behind the latest snapshot, so slightly lagging
/// followers catch up from the log instead of a full snapshot.
pub const TRAILING_LOGS: u64 = 1024;

const ELECTION_TICK: usize = 10;
const HEARTBEAT_TICK: usize = 3;

/// Servers are identified by their advertised raft address.
pub type ServerId = String;

/// A cluster member as recorded in configuration change entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    pub id: ServerId,
    pub address: String,
}

impl Member {
    pub fn new(id: impl Into<ServerId>, address: impl Into<String>) -> Self {
        Member {
            id: id.into(),
            address: address.into(),
        }
    }

    pub fn raft_id(&self) -> u64 {
        node_id(&self.id)
    }

    pub(crate) fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Numeric raft id for a server id. Stable across processes and restarts;
/// raft-rs reserves 0 for "no node".
pub fn node_id(id: &str) -> u64 {
    match fxhash::hash64(id) {
        0 => 1,
        n => n,
    }
}

fn raft_config(id: u64, applied: u64) -> Config {
    Config {
        id,
        election_tick: ELECTION_TICK,
        heartbeat_tick: HEARTBEAT_TICK,
        applied,
        pre_vote: true,
        ..Default::default()
    }
}
