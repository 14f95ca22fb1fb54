//! Wire protocol and outbound peer connections.
//!
//! Every connection carries length-prefixed bincode frames: consensus
//! envelopes between nodes, admin requests and responses between clients
//! and nodes. Outbound traffic runs over one long-lived connection per
//! peer; a failed connection is dropped and rebuilt on the next send, and
//! the consensus layer re-sends whatever was lost on its next heartbeat.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex;

use crate::error::ClusterError;
use crate::raft::message::Envelope;
use crate::raft::{NodeId, Role};
use crate::topology::{ClusterStateMachine, ClusterTopology, DatabaseTopology};

/// Upper bound on a single frame; snapshots are the largest payload.
const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;
const PEER_QUEUE_SIZE: usize = 1000;

/// Requests a client (or another node's supervisor report) may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AdminRequest {
    AddNode { addr: String, watcher: bool },
    RemoveNode { id: NodeId },
    CreateDatabase { name: String, replication_factor: usize },
    DeleteDatabase { name: String },
    GetClusterTopology,
    GetDatabaseTopology { name: String },
    GetLeader,
    WaitForRole { role: Role, timeout_ms: u64 },
    ReportDatabaseStatus { db: String, node: NodeId, etag: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AdminResponse {
    NodeAdded { id: NodeId },
    Done,
    ClusterTopology(ClusterTopology),
    DatabaseTopology(Option<DatabaseTopology>),
    Leader { leader: Option<NodeId>, term: u64 },
    RoleReached { role: Role, term: u64 },
    Error {
        message: String,
        retryable: bool,
        leader_hint: Option<NodeId>,
    },
}

impl AdminResponse {
    pub fn error(e: &ClusterError) -> Self {
        let leader_hint = match e {
            ClusterError::NotLeader { leader_hint } => *leader_hint,
            _ => None,
        };
        AdminResponse::Error {
            message: e.to_string(),
            retryable: e.is_retryable(),
            leader_hint,
        }
    }
}

/// Everything that travels on a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    Raft(Envelope),
    AdminRequest(AdminRequest),
    AdminResponse(AdminResponse),
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Frame> {
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    bincode::deserialize(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> std::io::Result<()> {
    let buf = bincode::serialize(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_u32(buf.len() as u32).await?;
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// One outbound connection, fed through a channel.
struct PeerConnection {
    sender: Sender<Envelope>,
    invalid: Arc<AtomicBool>,
}

impl PeerConnection {
    async fn new(addr: String) -> std::io::Result<Self> {
        let mut stream = TcpStream::connect(&addr).await?;
        let (sender, mut receiver): (Sender<Envelope>, Receiver<Envelope>) =
            mpsc::channel(PEER_QUEUE_SIZE);
        let invalid = Arc::new(AtomicBool::new(false));
        let invalid_clone = invalid.clone();

        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                if let Err(e) = write_frame(&mut stream, &Frame::Raft(envelope)).await {
                    log::warn!("peer connection to {} failed: {}", addr, e);
                    invalid_clone.store(true, Ordering::SeqCst);
                    return;
                }
            }
        });

        Ok(PeerConnection { sender, invalid })
    }
}

/// Outbound side of the node: resolves peer addresses from the replicated
/// topology (falling back to the static seed list) and keeps one connection
/// per peer.
pub struct Transport {
    self_id: NodeId,
    topology: ClusterStateMachine,
    /// Seed addresses from the config file, for peers the topology does not
    /// know yet (joining nodes, bootstrap).
    seeds: HashMap<NodeId, String>,
    peers: Mutex<HashMap<NodeId, PeerConnection>>,
}

impl Transport {
    pub fn new(
        self_id: NodeId,
        topology: ClusterStateMachine,
        seeds: HashMap<NodeId, String>,
    ) -> Arc<Self> {
        Arc::new(Transport {
            self_id,
            topology,
            seeds,
            peers: Mutex::new(HashMap::new()),
        })
    }

    fn resolve(&self, id: NodeId) -> Option<String> {
        self.topology
            .node_addr(id)
            .or_else(|| self.seeds.get(&id).cloned())
    }

    pub async fn send(&self, envelope: Envelope) {
        if envelope.to == self.self_id {
            return;
        }
        let mut peers = self.peers.lock().await;

        if let Some(peer) = peers.get(&envelope.to) {
            if peer.invalid.load(Ordering::SeqCst) {
                peers.remove(&envelope.to);
            }
        }

        let to = envelope.to;
        if !peers.contains_key(&to) {
            let Some(addr) = self.resolve(to) else {
                log::warn!("no known address for node {}", to);
                return;
            };
            match PeerConnection::new(addr).await {
                Ok(peer) => {
                    peers.insert(to, peer);
                }
                Err(e) => {
                    // The consensus layer retries on its next heartbeat.
                    log::debug!("cannot reach node {}: {}", to, e);
                    return;
                }
            }
        }

        let peer = peers.get(&to).unwrap();
        if peer.sender.try_send(envelope).is_err() {
            peers.remove(&to);
        }
    }

    /// Drains the consensus loop's outbound mailbox into peer connections.
    pub fn start_drain(self: Arc<Self>, mut out_mailbox: Receiver<Envelope>) {
        tokio::spawn(async move {
            while let Some(envelope) = out_mailbox.recv().await {
                self.send(envelope).await;
            }
        });
    }
}
