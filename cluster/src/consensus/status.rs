use raft::StateRole;
use serde_derive::Serialize;

use super::Member;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

impl From<StateRole> for Role {
    fn from(role: StateRole) -> Self {
        match role {
            StateRole::Follower => Role::Follower,
            StateRole::PreCandidate => Role::PreCandidate,
            StateRole::Candidate => Role::Candidate,
            StateRole::Leader => Role::Leader,
        }
    }
}

/// Lifecycle of a consensus server.
///
/// Setup walks `Uninitialized -> StoresSelected -> TransportReady`, then one
/// of `Bootstrapped`, `Joined` or `Resumed`, and ends in `Running`. A running
/// node ends up `Stopped` on shutdown or `Failed` when applying, snapshotting
/// or restoring fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServerPhase {
    Uninitialized,
    StoresSelected,
    TransportReady,
    Bootstrapped,
    Joined,
    Resumed,
    Running,
    Failed,
    Stopped,
}

/// How the node came up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StartupMode {
    /// Wrote a fresh single member configuration.
    Bootstrapped,
    /// No local state; waiting for a leader to add it.
    Joined,
    /// Picked up existing log, stable state or snapshots.
    Resumed,
}

impl From<StartupMode> for ServerPhase {
    fn from(mode: StartupMode) -> Self {
        match mode {
            StartupMode::Bootstrapped => ServerPhase::Bootstrapped,
            StartupMode::Joined => ServerPhase::Joined,
            StartupMode::Resumed => ServerPhase::Resumed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    pub id: String,
    pub address: String,
    pub raft_id: u64,
    pub role: Role,
    /// Advertised address of the current leader, if known.
    pub leader: Option<String>,
    pub term: u64,
    pub commit_index: u64,
    pub applied_index: u64,
    pub last_log_index: u64,
    /// Voters of the applied configuration.
    pub members: Vec<Member>,
    pub phase: ServerPhase,
    pub startup: StartupMode,
}

impl ClusterStatus {
    pub fn new(me: &Member, startup: StartupMode) -> Self {
        ClusterStatus {
            id: me.id.clone(),
            address: me.address.clone(),
            raft_id: me.raft_id(),
            role: Role::Follower,
            leader: None,
            term: 0,
            commit_index: 0,
            applied_index: 0,
            last_log_index: 0,
            members: Vec::new(),
            phase: startup.into(),
            startup,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }
}
