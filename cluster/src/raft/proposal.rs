//! Proposals submitted to the consensus loop.
//!
//! A proposal carries an already-encoded command and a oneshot channel the
//! loop answers on: the committed index once the entry is applied, or an
//! error the caller can act on.

use tokio::sync::oneshot::{self, Receiver, Sender};

use crate::error::ClusterError;

pub struct Proposal {
    pub command: Vec<u8>,
    /// Index assigned when the leader appended the entry; 0 until then.
    pub proposed: u64,
    pub reply: Option<Sender<Result<u64, ClusterError>>>,
}

impl Proposal {
    pub fn new(command: Vec<u8>) -> (Self, Receiver<Result<u64, ClusterError>>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            command,
            proposed: 0,
            reply: Some(tx),
        };
        (proposal, rx)
    }

    pub fn resolve(&mut self, result: Result<u64, ClusterError>) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(result);
        }
    }
}
