//! Raft node driving loop
//!
//! One tokio task owns the `RawNode`, its storage and the state machine. It
//! steps inbound messages, proposes, ticks, and processes every `Ready`:
//! send, install snapshot, apply, persist, advance.

#![allow(clippy::field_reassign_with_default)]

use std::collections::VecDeque;
use std::sync::Arc;

use slog::{info, Logger};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{oneshot, watch};
use tokio::time::{self, MissedTickBehavior};

use raft::{prelude::*, StateRole, INVALID_ID};

use super::apply::{Applied, Applier};
use super::proposal::{Proposal, Response};
use super::status::{ClusterStatus, ServerPhase, StartupMode};
use super::{raft_config, Member, TICK_INTERVAL, TRAILING_LOGS};
use crate::error::{Error, Result};
use crate::fsm::StateMachine;
use crate::metrics;
use crate::store::RaftStorage;
use crate::transport::RaftTransport;

const MAILBOX_SIZE: usize = 4096;
const PROPOSAL_QUEUE_SIZE: usize = 1024;

pub struct NodeConfig {
    pub me: Member,
    pub startup: StartupMode,
    pub snapshot_threshold: u64,
    /// Logger handed to raft-rs
    pub raft_logger: Logger,
    /// Destination of snapshot diagnostics
    pub snapshot_logger: Logger,
}

/// The ends of the node's channels that stay with the server.
pub struct NodeHandle {
    pub proposals: Sender<Proposal>,
    pub mailbox: Sender<Message>,
    pub status: watch::Receiver<ClusterStatus>,
    pub leader: watch::Receiver<bool>,
}

/// Raft node implementation
pub struct Node<S: StateMachine> {
    raft_group: RawNode<RaftStorage>, // The core Raft node implementation
    applier: Applier<S>,              // Applies committed entries to the state machine
    transport: Arc<RaftTransport>,    // Outbound messages to other nodes
    my_mailbox: Receiver<Message>,    // Inbound messages from other nodes
    proposals: Receiver<Proposal>,    // Channel for receiving proposals
    proposed: VecDeque<Proposal>,     // Proposals in the log, waiting to be applied
    me: Member,
    startup: StartupMode,
    snapshot_threshold: u64,
    last_snapshot_index: u64,
    campaign_pending: bool,
    status: watch::Sender<ClusterStatus>,
    leader: watch::Sender<bool>,
    snapshot_logger: Logger,
}

impl<S: StateMachine> Node<S> {
    /// Builds the node over `storage`. The state machine is first restored
    /// from the latest snapshot, so only entries after it are replayed.
    pub fn new(
        config: NodeConfig,
        mut storage: RaftStorage,
        state_machine: S,
        transport: Arc<RaftTransport>,
    ) -> Result<(Self, NodeHandle)> {
        let mut applier = Applier::new(state_machine, 0);
        if let Some((meta, payload)) = storage.latest_snapshot()? {
            applier.restore(meta.index, &payload.state)?;
            if storage.stable_state().commit < meta.index {
                storage.set_commit(meta.index)?;
            }
            info!(config.snapshot_logger, "restored snapshot";
                "id" => &meta.id, "index" => meta.index, "term" => meta.term);
        }
        let applied = applier.applied_index();

        let raft_id = config.me.raft_id();
        for (id, address) in storage.peers() {
            if *id != raft_id {
                transport.add_peer(*id, address);
            }
        }

        let cfg = raft_config(raft_id, applied);
        cfg.validate()?;
        let raft_group = RawNode::new(&cfg, storage, &config.raft_logger)?;

        let (proposals_tx, proposals) = mpsc::channel(PROPOSAL_QUEUE_SIZE);
        let (mailbox_tx, my_mailbox) = mpsc::channel(MAILBOX_SIZE);
        let (status, status_rx) = watch::channel(ClusterStatus::new(&config.me, config.startup));
        let (leader, leader_rx) = watch::channel(false);

        let node = Node {
            raft_group,
            applier,
            transport,
            my_mailbox,
            proposals,
            proposed: VecDeque::new(),
            me: config.me,
            startup: config.startup,
            snapshot_threshold: config.snapshot_threshold,
            last_snapshot_index: applied,
            campaign_pending: config.startup == StartupMode::Bootstrapped,
            status,
            leader,
            snapshot_logger: config.snapshot_logger,
        };
        let handle = NodeHandle {
            proposals: proposals_tx,
            mailbox: mailbox_tx,
            status: status_rx,
            leader: leader_rx,
        };
        node.publish_status(ServerPhase::Running);
        Ok((node, handle))
    }

    /// Runs until `shutdown` fires (or its sender is dropped) or a fatal
    /// error occurs. Pending proposals are failed either way.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        let mut ticker = time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!(
            "raft node {} ({}) running, startup {:?}",
            self.me.id,
            self.me.raft_id(),
            self.startup
        );

        let result = loop {
            self.publish_status(ServerPhase::Running);
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                Some(msg) = self.my_mailbox.recv() => {
                    // Process incoming messages
                    self.step(msg);
                    while let Ok(msg) = self.my_mailbox.try_recv() {
                        self.step(msg);
                    }
                }
                Some(proposal) = self.proposals.recv() => {
                    self.propose(proposal);
                    while let Ok(proposal) = self.proposals.try_recv() {
                        self.propose(proposal);
                    }
                }
                _ = ticker.tick() => {
                    self.raft_group.tick();
                }
            }

            if let Err(e) = self.process() {
                break Err(e);
            }
            self.maybe_campaign();
        };

        let phase = match &result {
            Ok(()) => ServerPhase::Stopped,
            Err(e) => {
                log::error!("raft node {} failed: {}", self.me.id, e);
                ServerPhase::Failed
            }
        };
        let reason = result.as_ref().err().map(|e| e.to_string());
        let failure = || match &reason {
            Some(reason) => Error::StateMachine(reason.clone()),
            None => Error::Stopped,
        };
        self.proposals.close();
        while let Ok(mut proposal) = self.proposals.try_recv() {
            proposal.respond(Err(failure()));
        }
        for mut proposal in self.proposed.drain(..) {
            proposal.respond(Err(failure()));
        }
        self.publish_status(phase);
        result
    }

    fn process(&mut self) -> Result<()> {
        self.on_ready()?;
        self.maybe_snapshot()
    }

    fn step(&mut self, msg: Message) {
        if let Err(e) = self.raft_group.step(msg) {
            log::debug!("raft step failed: {}", e);
        }
    }

    fn is_leader(&self) -> bool {
        self.raft_group.raft.state == StateRole::Leader
    }

    fn leader_address(&self) -> Option<String> {
        match self.raft_group.raft.leader_id {
            INVALID_ID => None,
            id if id == self.me.raft_id() => Some(self.me.address.clone()),
            id => self
                .raft_group
                .raft
                .raft_log
                .store
                .peers()
                .get(&id)
                .cloned()
                .or_else(|| self.transport.peer_address(id)),
        }
    }

    /// A membership change that is already in effect completes right away.
    fn conf_change_in_effect(&self, cc: &ConfChange) -> Result<bool> {
        let store = &self.raft_group.raft.raft_log.store;
        let is_voter = store.stable_state().voters.contains(&cc.node_id);
        Ok(match cc.get_change_type() {
            ConfChangeType::AddNode if is_voter && !cc.get_context().is_empty() => {
                let member = Member::decode(cc.get_context())?;
                store.peers().get(&cc.node_id) == Some(&member.address)
            }
            ConfChangeType::RemoveNode => !is_voter,
            _ => false,
        })
    }

    /// Propose a new entry to the raft group
    fn propose(&mut self, mut proposal: Proposal) {
        if !self.is_leader() {
            metrics::proposal("not_leader");
            let leader = self.leader_address();
            proposal.respond(Err(Error::NotLeader { leader }));
            return;
        }

        if let Some(cc) = proposal.conf_change.clone() {
            match self.conf_change_in_effect(&cc) {
                Ok(true) => {
                    metrics::proposal("noop");
                    let cs = self.raft_group.raft.raft_log.store.conf_state();
                    proposal.respond(Ok(Response::ConfChanged(cs)));
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    metrics::proposal("rejected");
                    proposal.respond(Err(e));
                    return;
                }
            }
        }

        let last_index = self.raft_group.raft.raft_log.last_index() + 1;
        let result = if let Some(data) = proposal.normal.clone() {
            self.raft_group.propose(vec![], data)
        } else if let Some(cc) = proposal.conf_change.clone() {
            self.raft_group.propose_conf_change(vec![], cc)
        } else {
            Ok(())
        };

        let new_last_index = self.raft_group.raft.raft_log.last_index() + 1;
        match result {
            Err(e) => {
                metrics::proposal("rejected");
                proposal.respond(Err(e.into()));
            }
            Ok(()) if new_last_index == last_index => {
                metrics::proposal("dropped");
                proposal.respond(Err(raft::Error::ProposalDropped.into()));
            }
            Ok(()) => {
                metrics::proposal("accepted");
                proposal.proposed = last_index;
                proposal.term = self.raft_group.raft.term;
                self.proposed.push_back(proposal);
            }
        }
    }

    /// Process raft ready state
    fn on_ready(&mut self) -> Result<()> {
        if !self.raft_group.has_ready() {
            return Ok(());
        }
        let mut ready = self.raft_group.ready();

        // Step 1: Handle messages
        if !ready.messages().is_empty() {
            self.handle_out_messages(ready.take_messages());
        }

        // Step 2: Install snapshot if any
        if *ready.snapshot() != Snapshot::default() {
            self.handle_snapshot(ready.snapshot())?;
        }

        // Step 3: Apply committed entries
        self.handle_committed_entries(ready.take_committed_entries())?;

        // Step 4: Persist raft state
        let store = &mut self.raft_group.raft.raft_log.store;
        store.append(ready.entries())?;
        if let Some(hs) = ready.hs() {
            store.set_hardstate(hs)?;
        }
        if !ready.persisted_messages().is_empty() {
            self.handle_out_messages(ready.take_persisted_messages());
        }

        // Step 5: Advance raft state
        let mut light_rd = self.raft_group.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            self.raft_group.raft.raft_log.store.set_commit(commit)?;
        }
        self.handle_out_messages(light_rd.take_messages());
        self.handle_committed_entries(light_rd.take_committed_entries())?;
        self.raft_group.advance_apply();
        Ok(())
    }

    fn handle_out_messages(&self, messages: Vec<Message>) {
        for msg in messages {
            self.transport.send(msg);
        }
    }

    /// Installs a snapshot sent by the leader and restores the state machine
    /// from it.
    fn handle_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let metadata = snapshot.get_metadata();
        let store = &mut self.raft_group.raft.raft_log.store;
        let payload = store.apply_snapshot(snapshot)?;
        self.applier.restore(metadata.index, &payload.state)?;

        let raft_id = self.me.raft_id();
        for (id, address) in &payload.peers {
            if *id != raft_id {
                self.transport.add_peer(*id, address);
            }
        }
        self.last_snapshot_index = metadata.index;
        self.fail_proposed_through(metadata.index);

        metrics::snapshot("installed");
        info!(self.snapshot_logger, "installed snapshot from leader";
            "index" => metadata.index, "term" => metadata.term, "size" => snapshot.get_data().len());
        Ok(())
    }

    /// Process committed entries
    fn handle_committed_entries(&mut self, entries: Vec<Entry>) -> Result<()> {
        for entry in entries {
            let response = match self.applier.apply(&entry)? {
                Applied::Skipped => continue,
                Applied::Noop => None,
                Applied::Command(result) => Some(Ok(Response::Applied(result))),
                Applied::ConfChange(cc) => Some(self.apply_conf_change(&cc)?),
                Applied::ConfChangeV2(cc) => Some(self.apply_conf_change_v2(&cc)?),
            };
            self.notice_applied(&entry, response);
        }
        Ok(())
    }

    /// Applies a membership change to raft and records the member's address.
    /// The outer error is fatal, the inner one goes back to the proposer.
    fn apply_conf_change(&mut self, cc: &ConfChange) -> Result<Result<Response>> {
        let cs = match self.raft_group.apply_conf_change(cc) {
            Ok(cs) => cs,
            Err(e) => {
                log::warn!("membership change for {} rejected: {}", cc.node_id, e);
                return Ok(Err(Error::Membership(e.to_string())));
            }
        };

        let store = &mut self.raft_group.raft.raft_log.store;
        match cc.get_change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                if !cc.get_context().is_empty() {
                    let member = Member::decode(cc.get_context())?;
                    store.set_peer(cc.node_id, &member.address)?;
                    if cc.node_id != self.me.raft_id() {
                        self.transport.add_peer(cc.node_id, &member.address);
                    }
                    log::info!("member {} ({}) added", member.id, member.address);
                }
            }
            ConfChangeType::RemoveNode => {
                store.remove_peer(cc.node_id)?;
                self.transport.remove_peer(cc.node_id);
                log::info!("member {} removed", cc.node_id);
            }
        }
        store.set_conf_state(&cs)?;
        Ok(Ok(Response::ConfChanged(cs)))
    }

    fn apply_conf_change_v2(&mut self, cc: &ConfChangeV2) -> Result<Result<Response>> {
        let cs = match self.raft_group.apply_conf_change(cc) {
            Ok(cs) => cs,
            Err(e) => return Ok(Err(Error::Membership(e.to_string()))),
        };
        self.raft_group.raft.raft_log.store.set_conf_state(&cs)?;
        Ok(Ok(Response::ConfChanged(cs)))
    }

    /// Completes proposals up to `entry`. The one that produced `entry`
    /// gets `response`; any other at or below its index lost its place in
    /// the log to a new leader.
    fn notice_applied(&mut self, entry: &Entry, mut response: Option<Result<Response>>) {
        while let Some(front) = self.proposed.front() {
            if front.proposed > entry.index {
                break;
            }
            let Some(mut proposal) = self.proposed.pop_front() else {
                break;
            };
            if proposal.proposed == entry.index && proposal.term == entry.term {
                let result = match response.take() {
                    Some(result) => result,
                    // Raft replaces a conf change with an empty entry while
                    // another one is pending.
                    None if proposal.is_conf_change() => Err(Error::Membership(
                        "another membership change is in progress".into(),
                    )),
                    None => Err(Error::LeadershipLost {
                        index: proposal.proposed,
                    }),
                };
                proposal.respond(result);
            } else {
                proposal.respond(Err(Error::LeadershipLost {
                    index: proposal.proposed,
                }));
            }
        }
    }

    fn fail_proposed_through(&mut self, index: u64) {
        while self.proposed.front().map_or(false, |p| p.proposed <= index) {
            if let Some(mut proposal) = self.proposed.pop_front() {
                proposal.respond(Err(Error::LeadershipLost {
                    index: proposal.proposed,
                }));
            }
        }
    }

    /// Snapshots the state machine once enough entries were applied since
    /// the last one, or when raft needs one for a lagging follower, then
    /// compacts the log behind it.
    fn maybe_snapshot(&mut self) -> Result<()> {
        let applied = self.applier.applied_index();
        if applied <= self.last_snapshot_index {
            return Ok(());
        }
        let requested = self.raft_group.raft.raft_log.store.snapshot_requested();
        if applied - self.last_snapshot_index < self.snapshot_threshold && !requested {
            return Ok(());
        }

        let data = self.applier.snapshot()?;
        let store = &mut self.raft_group.raft.raft_log.store;
        let meta = store.create_snapshot(applied, data)?;
        let compact_to = applied.saturating_sub(TRAILING_LOGS);
        store.compact(compact_to)?;
        self.last_snapshot_index = applied;

        metrics::snapshot("taken");
        info!(self.snapshot_logger, "snapshot taken";
            "id" => &meta.id, "index" => meta.index, "term" => meta.term,
            "size" => meta.size, "requested" => requested, "compacted_to" => compact_to);
        Ok(())
    }

    /// A freshly bootstrapped node starts an election as soon as its initial
    /// configuration is applied instead of waiting out the election timeout.
    fn maybe_campaign(&mut self) {
        if !self.campaign_pending {
            return;
        }
        let raft_log = &self.raft_group.raft.raft_log;
        if raft_log.applied() < raft_log.committed {
            return;
        }
        self.campaign_pending = false;
        if self.is_leader() {
            return;
        }
        if let Err(e) = self.raft_group.campaign() {
            log::warn!("campaign failed: {}", e);
        }
    }

    fn publish_status(&self, phase: ServerPhase) {
        let raft = &self.raft_group.raft;
        let store = &raft.raft_log.store;
        let raft_id = self.me.raft_id();
        let members = store
            .stable_state()
            .voters
            .iter()
            .map(|id| {
                let address = if *id == raft_id {
                    self.me.address.clone()
                } else {
                    store.peers().get(id).cloned().unwrap_or_default()
                };
                Member::new(address.clone(), address)
            })
            .collect();

        let status = ClusterStatus {
            id: self.me.id.clone(),
            address: self.me.address.clone(),
            raft_id,
            role: raft.state.into(),
            leader: self.leader_address(),
            term: raft.term,
            commit_index: raft.raft_log.committed,
            applied_index: self.applier.applied_index(),
            last_log_index: raft.raft_log.last_index(),
            members,
            phase,
            startup: self.startup,
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });

        let is_leader = phase == ServerPhase::Running && self.is_leader();
        let id = &self.me.id;
        self.leader.send_if_modified(|current| {
            if *current == is_leader {
                return false;
            }
            *current = is_leader;
            metrics::LEADER_CHANGE_COUNTER.inc();
            log::info!("{} leadership: {}", id, is_leader);
            true
        });
    }
}
