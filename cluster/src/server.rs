//! The consensus server: one raft node per process.
//!
//! [`ConsensusServer::setup`] picks the stores, opens the diagnostic logs,
//! wraps the caller's listener for the raft transport, decides between
//! bootstrapping, resuming and waiting to be joined, and finally starts the
//! node task. The returned handle is the only way in: proposals, membership
//! changes, status and leadership notifications all go through it.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{o, Drain, Logger};
use tokio::sync::{mpsc::Sender, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;

use raft::prelude::{ConfChange, ConfChangeType};

use crate::config::Configuration;
use crate::consensus::node::{Node, NodeConfig};
use crate::consensus::{
    bootstrap_cluster, has_existing_state, node_id, ClusterStatus, Member, Proposal, Response,
    ServerPhase, StartupMode, APPLIED_WAIT_DELAY, APPLY_TIMEOUT, LEADER_WAIT_DELAY,
    LOG_CACHE_SIZE, RETAIN_SNAPSHOT_COUNT,
};
use crate::error::{Error, Result};
use crate::fsm::{Command, CommandResult, StateMachine};
use crate::store::{
    self, FileSnapshotStore, LogStore, MemLogStore, MemSnapshotStore, MemStableStore, RaftStorage,
    SnapshotStore, StableStore,
};
use crate::transport::{NetworkListener, RaftTransport, TransportAdapter};

const TRANSPORT_LOG: &str = "transport.log";
const SNAPSHOTS_LOG: &str = "snapshots.log";
const LOGGER_CHANNEL_SIZE: usize = 4096; // Size of logger channel buffer

/// Append-only diagnostic log file.
fn file_logger(path: &Path) -> Result<Logger> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| Error::Path {
            path: path.to_path_buf(),
            source,
        })?;
    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(LOGGER_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    Ok(Logger::root(drain, o!()))
}

/// Logger whose records end up in the process' `log` pipeline.
fn process_logger() -> Logger {
    Logger::root(slog_stdlog::StdLog.fuse(), o!())
}

fn enter(phase: &mut ServerPhase, next: ServerPhase) {
    log::debug!("consensus server {:?} -> {:?}", phase, next);
    *phase = next;
}

pub struct ConsensusServer {
    me: Member,
    proposals: Sender<Proposal>,
    status: watch::Receiver<ClusterStatus>,
    leader: watch::Receiver<bool>,
    transport: Arc<RaftTransport>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    node: Mutex<Option<JoinHandle<Result<()>>>>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

impl ConsensusServer {
    /// Brings up the raft node and returns once its task is running.
    ///
    /// Everything opened along the way is dropped again if a later step
    /// fails. Bootstrapping over existing state resumes it instead.
    pub async fn setup<S: StateMachine>(
        config: &Configuration,
        listener: Arc<dyn NetworkListener>,
        state_machine: S,
    ) -> Result<Self> {
        config.validate()?;
        let mut phase = ServerPhase::Uninitialized;

        // Stores
        let (log_store, stable_store): (Box<dyn LogStore>, Box<dyn StableStore>) =
            if config.dev_mode {
                (
                    Box::new(MemLogStore::new()) as Box<dyn LogStore>,
                    Box::new(MemStableStore::new()) as Box<dyn StableStore>,
                )
            } else {
                let (log_store, stable_store) =
                    store::open_durable(&config.data_path, LOG_CACHE_SIZE)?;
                (
                    Box::new(log_store) as Box<dyn LogStore>,
                    Box::new(stable_store) as Box<dyn StableStore>,
                )
            };
        enter(&mut phase, ServerPhase::StoresSelected);

        // Diagnostics, then the snapshot store that reports into them
        let (transport_logger, snapshot_logger) = if config.dev_mode {
            let logger = process_logger();
            (
                logger.new(o!("log" => "transport")),
                logger.new(o!("log" => "snapshots")),
            )
        } else {
            (
                file_logger(&config.logs_path.join(TRANSPORT_LOG))?,
                file_logger(&config.logs_path.join(SNAPSHOTS_LOG))?,
            )
        };
        let snapshots: Box<dyn SnapshotStore> = if config.dev_mode {
            Box::new(MemSnapshotStore::new())
        } else {
            Box::new(FileSnapshotStore::open(
                &config.data_path,
                RETAIN_SNAPSHOT_COUNT,
                snapshot_logger.clone(),
            )?)
        };
        let mut storage = RaftStorage::new(log_store, stable_store, snapshots)?;

        // Transport
        let adapter = TransportAdapter::new(listener);
        let address = adapter.local_address();
        let me = Member::new(address.clone(), address);
        let transport = RaftTransport::new(adapter, transport_logger);
        enter(&mut phase, ServerPhase::TransportReady);

        let startup = if config.bootstrap || config.dev_mode {
            match bootstrap_cluster(&mut storage, &[me.clone()]) {
                Ok(()) => StartupMode::Bootstrapped,
                Err(Error::ExistingState) => {
                    log::info!("existing raft state found, skipping bootstrap");
                    StartupMode::Resumed
                }
                Err(e) => return Err(e),
            }
        } else if has_existing_state(&storage)? {
            StartupMode::Resumed
        } else {
            StartupMode::Joined
        };
        enter(&mut phase, startup.into());

        let raft_logger = process_logger().new(o!("raft_id" => me.raft_id()));
        let node_config = NodeConfig {
            me: me.clone(),
            startup,
            snapshot_threshold: config.snapshot_threshold,
            raft_logger,
            snapshot_logger,
        };
        let (node, handle) = Node::new(node_config, storage, state_machine, transport.clone())?;
        let accept = transport.start(handle.mailbox);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let node = tokio::spawn(node.run(shutdown_rx));
        enter(&mut phase, ServerPhase::Running);
        log::info!(
            "consensus server {} started ({:?}, raft id {})",
            me.id,
            startup,
            me.raft_id()
        );

        Ok(ConsensusServer {
            me,
            proposals: handle.proposals,
            status: handle.status,
            leader: handle.leader,
            transport,
            shutdown: Mutex::new(Some(shutdown_tx)),
            node: Mutex::new(Some(node)),
            accept: Mutex::new(Some(accept)),
        })
    }

    pub fn id(&self) -> &str {
        &self.me.id
    }

    pub fn address(&self) -> &str {
        &self.me.address
    }

    async fn propose(
        &self,
        proposal: Proposal,
        rx: oneshot::Receiver<Result<Response>>,
    ) -> Result<Response> {
        self.proposals
            .send(proposal)
            .await
            .map_err(|_| Error::Stopped)?;
        match time::timeout(APPLY_TIMEOUT, rx).await {
            Err(_) => Err(Error::Timeout),
            Ok(Err(_)) => Err(Error::Stopped),
            Ok(Ok(result)) => result,
        }
    }

    /// Replicates `command` and returns its result once this node applied
    /// it. Only the leader accepts commands.
    pub async fn apply(&self, command: Command) -> Result<CommandResult> {
        let (proposal, rx) = Proposal::normal(command.encode()?);
        match self.propose(proposal, rx).await? {
            Response::Applied(result) => Ok(result),
            Response::ConfChanged(_) => Err(Error::StateMachine(
                "command completed as a membership change".into(),
            )),
        }
    }

    async fn change_membership(&self, cc: ConfChange) -> Result<()> {
        let (proposal, rx) = Proposal::conf_change(&cc);
        self.propose(proposal, rx).await.map(|_| ())
    }

    /// Adds a voting member reachable at `address`. A member already present
    /// with the same address is left alone.
    pub async fn add_voter(&self, id: &str, address: &str) -> Result<()> {
        let member = Member::new(id, address);
        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::AddNode);
        cc.node_id = member.raft_id();
        cc.context = member.encode()?.into();
        self.change_membership(cc).await
    }

    pub async fn remove_server(&self, id: &str) -> Result<()> {
        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::RemoveNode);
        cc.node_id = node_id(id);
        self.change_membership(cc).await
    }

    pub fn cluster_status(&self) -> ClusterStatus {
        self.status.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        *self.leader.borrow()
    }

    /// Receiver of leadership changes. Holds only the latest value and never
    /// slows the node down, however late it is read.
    pub fn leader_notify(&self) -> watch::Receiver<bool> {
        self.leader.clone()
    }

    fn check_running(&self) -> Result<ClusterStatus> {
        let status = self.cluster_status();
        match status.phase {
            ServerPhase::Failed | ServerPhase::Stopped => Err(Error::Stopped),
            _ => Ok(status),
        }
    }

    /// Waits until a leader is known and returns its address.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<String> {
        let deadline = time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.check_running()?.leader {
                return Ok(leader);
            }
            if time::Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            time::sleep(LEADER_WAIT_DELAY).await;
        }
    }

    /// Waits until everything known to be committed has been applied.
    pub async fn wait_for_applied(&self, timeout: Duration) -> Result<()> {
        let deadline = time::Instant::now() + timeout;
        loop {
            let status = self.check_running()?;
            if status.applied_index >= status.commit_index {
                return Ok(());
            }
            if time::Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            time::sleep(APPLIED_WAIT_DELAY).await;
        }
    }

    /// Resolves once the node task has stopped, normally or not.
    pub async fn stopped(&self) {
        let mut status = self.status.clone();
        loop {
            if matches!(
                status.borrow().phase,
                ServerPhase::Failed | ServerPhase::Stopped
            ) {
                return;
            }
            if status.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stops the node, closes the listener and returns how the node task
    /// ended. Only the first call does anything; later ones get
    /// [`Error::Stopped`].
    pub async fn shutdown(&self) -> Result<()> {
        let Some(node) = take(&self.node) else {
            return Err(Error::Stopped);
        };
        if let Some(tx) = take(&self.shutdown) {
            let _ = tx.send(());
        }
        let result = match node.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e).into()),
        };
        self.transport.close()?;
        if let Some(accept) = take(&self.accept) {
            let _ = accept.await;
        }
        log::info!("consensus server {} stopped", self.me.id);
        result
    }
}
