#![allow(clippy::field_reassign_with_default)]

use tokio::sync::oneshot::{self, Receiver, Sender};

use raft::prelude::*;

use crate::error::Result;
use crate::fsm::CommandResult;

/// What a proposer gets back once its entry has been applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Applied(CommandResult),
    ConfChanged(ConfState),
}

pub struct Proposal {
    pub normal: Option<Vec<u8>>,
    pub conf_change: Option<ConfChange>,
    // Index and term of the entry once it is in the leader's log.
    pub proposed: u64,
    pub term: u64,
    responder: Option<Sender<Result<Response>>>,
}

impl Proposal {
    fn new(
        normal: Option<Vec<u8>>,
        conf_change: Option<ConfChange>,
    ) -> (Self, Receiver<Result<Response>>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            normal,
            conf_change,
            proposed: 0,
            term: 0,
            responder: Some(tx),
        };
        (proposal, rx)
    }

    pub fn conf_change(cc: &ConfChange) -> (Self, Receiver<Result<Response>>) {
        Proposal::new(None, Some(cc.clone()))
    }

    pub fn normal(data: Vec<u8>) -> (Self, Receiver<Result<Response>>) {
        Proposal::new(Some(data), None)
    }

    pub fn is_conf_change(&self) -> bool {
        self.conf_change.is_some()
    }

    /// Completes the proposal. Later calls are ignored, as is a proposer that
    /// stopped waiting.
    pub fn respond(&mut self, result: Result<Response>) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(result);
        }
    }
}
