//! Raft cluster bootstrap: storage selection, peer transport, cluster
//! formation and the replicated state machine boundary for one server.

pub mod config;
pub mod consensus;
pub mod error;
pub mod fsm;
pub mod http;
pub mod metrics;
pub mod server;
pub mod store;
pub mod transport;

pub use config::Configuration;
pub use consensus::{ClusterStatus, Member, Role, ServerId, ServerPhase, StartupMode};
pub use error::{Error, Result};
pub use fsm::{Command, CommandResult, KvStateMachine, LogEntry, StateMachine, StateSnapshot};
pub use server::ConsensusServer;
pub use transport::{NetworkListener, TcpNetworkListener};
