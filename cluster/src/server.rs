//! Process wiring: consensus loop, transport, admin endpoint, metrics,
//! maintenance supervisor.
//!
//! One TCP listener serves both kinds of traffic: consensus envelopes from
//! peers are forwarded into the consensus loop's mailbox, admin requests
//! are answered in place. Writes go through the proposal channel and only
//! succeed on the leader; reads are answered from the local applied state
//! on any node.

use std::collections::HashMap;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, TextEncoder};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Sender};
use tokio::sync::{watch, Mutex};
use tokio::time::Duration;

use crate::config;
use crate::error::{ClusterError, ClusterResult};
use crate::health::{HealthThresholds, HealthTracker};
use crate::metrics;
use crate::raft::core::RaftCore;
use crate::raft::log::LogStore;
use crate::raft::message::Envelope;
use crate::raft::node::{Node, RoleInfo, Timing};
use crate::raft::proposal::Proposal;
use crate::raft::{NodeId, Role};
use crate::supervisor::{self, SupervisorConfig};
use crate::topology::{ClusterStateMachine, TopologyCommand};
use crate::transport::{
    read_frame, write_frame, AdminRequest, AdminResponse, Frame, Transport,
};

static INSTANCE: OnceCell<Mutex<Server>> = OnceCell::new();
pub fn instance() -> &'static Mutex<Server> {
    INSTANCE.get_or_init(|| Mutex::new(Server::builder()))
}

/// Everything a connection handler needs, cheap to clone into tasks.
#[derive(Clone)]
struct Handles {
    self_id: NodeId,
    state: ClusterStateMachine,
    health: Arc<HealthTracker>,
    in_mailbox: Sender<Envelope>,
    proposals: Sender<Proposal>,
    role_rx: watch::Receiver<RoleInfo>,
}

pub struct Server {
    handles: Handles,
}

impl Server {
    fn builder() -> Self {
        let cfg = config::instance().lock().unwrap().clone();

        let state = ClusterStateMachine::new();
        let store = LogStore::open(&cfg.base_path, cfg.entries_per_segment)
            .expect("cannot open log store");
        let mut core =
            RaftCore::new(cfg.id, store, state.clone()).expect("cannot restore consensus state");

        if cfg.bootstrap {
            match core.bootstrap() {
                Ok(()) => log::info!("bootstrapping new cluster as node {}", cfg.id),
                Err(e) => log::info!("bootstrap skipped: {}", e),
            }
        }

        let health = Arc::new(HealthTracker::new(HealthThresholds {
            suspect_after: Duration::from_millis(cfg.suspect_after_ms),
            unreachable_after: Duration::from_millis(cfg.demote_after_ms),
            startup_grace: Duration::from_millis(cfg.startup_grace_ms),
        }));

        let (in_mailbox, in_rx) = mpsc::channel(1024);
        let (proposals, prop_rx) = mpsc::channel(256);

        let timing = Timing {
            election_timeout_min: Duration::from_millis(cfg.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(cfg.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(cfg.heartbeat_interval_ms),
            snapshot_interval: Duration::from_millis(cfg.snapshot_interval_ms),
        };
        let (out_mailbox, role_rx) = Node::start(core, in_rx, prop_rx, health.clone(), timing);

        let seeds: HashMap<NodeId, String> = cfg
            .node_list
            .iter()
            .map(|n| (n.id, n.addr.clone()))
            .collect();
        Transport::new(cfg.id, state.clone(), seeds).start_drain(out_mailbox);

        Server {
            handles: Handles {
                self_id: cfg.id,
                state,
                health,
                in_mailbox,
                proposals,
                role_rx,
            },
        }
    }

    pub async fn start(&mut self) {
        self.start_tcp_server().await;
        self.start_metrics_server().await;
        self.start_supervisor();
        self.register_self_if_bootstrap();
    }

    pub fn stop(&mut self) {
        log::info!("server stop");
    }

    async fn start_tcp_server(&mut self) {
        let addr = config::instance().lock().unwrap().addr.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .expect("cannot bind cluster listener");
        log::info!("cluster server started on {}", addr);

        let handles = self.handles.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        log::debug!("connection from {}", peer);
                        let handles = handles.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, handles).await {
                                log::debug!("connection from {} closed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => log::error!("accept failed: {}", e),
                }
            }
        });
    }

    async fn start_metrics_server(&mut self) {
        let addr = config::instance()
            .lock()
            .unwrap()
            .metrics_addr
            .as_str()
            .parse()
            .unwrap();
        let state = self.handles.state.clone();
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            let state = state.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| {
                    let registry = registry.clone();
                    let state = state.clone();
                    async move {
                        // /topology is a read-only debugging view of the
                        // applied cluster state; everything else is metrics.
                        if req.uri().path() == "/topology" {
                            let body = serde_json::json!({
                                "cluster": state.cluster_topology(),
                                "databases": state.databases(),
                            });
                            return Ok::<_, hyper::Error>(Response::new(Body::from(
                                body.to_string(),
                            )));
                        }
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        encoder.encode(&metric_families, &mut buffer).unwrap();
                        Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                    }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::bind(&addr).serve(make_svc);
        tokio::spawn(async move {
            tokio::pin!(server);
            server.await.unwrap()
        });
        log::info!("metrics server started on {}", addr);
    }

    fn start_supervisor(&self) {
        let cfg = config::instance().lock().unwrap().clone();
        supervisor::start(
            self.handles.self_id,
            self.handles.role_rx.clone(),
            self.handles.state.clone(),
            self.handles.health.clone(),
            self.handles.proposals.clone(),
            SupervisorConfig {
                interval: Duration::from_millis(cfg.supervisor_interval_ms),
                promotion_etag_tolerance: cfg.promotion_etag_tolerance,
                demote_after: Duration::from_millis(cfg.demote_after_ms),
                remove_after: Duration::from_millis(cfg.remove_after_ms),
            },
        );
    }

    /// A bootstrapping node records itself in the replicated topology, so
    /// the cluster state is fully reconstructible from the log.
    fn register_self_if_bootstrap(&self) {
        let cfg = config::instance().lock().unwrap().clone();
        if !cfg.bootstrap {
            return;
        }
        let handles = self.handles.clone();
        tokio::spawn(async move {
            if !handles.state.cluster_topology().contains(handles.self_id) {
                let command = TopologyCommand::AddNode {
                    id: handles.self_id,
                    addr: cfg.addr.clone(),
                    watcher: false,
                };
                match propose_and_wait(&handles, command).await {
                    Ok(index) => log::info!("registered self in topology at index {}", index),
                    Err(e) => log::error!("failed to register self in topology: {}", e),
                }
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, handles: Handles) -> std::io::Result<()> {
    loop {
        match read_frame(&mut stream).await? {
            Frame::Raft(envelope) => {
                if handles.in_mailbox.send(envelope).await.is_err() {
                    return Ok(());
                }
            }
            Frame::AdminRequest(request) => {
                let response = handle_admin(&handles, request).await;
                write_frame(&mut stream, &Frame::AdminResponse(response)).await?;
            }
            Frame::AdminResponse(_) => {
                // Responses only travel on connections we initiated.
            }
        }
    }
}

async fn propose_and_wait(handles: &Handles, command: TopologyCommand) -> ClusterResult<u64> {
    let info = *handles.role_rx.borrow();
    if info.role != Role::Leader {
        return Err(ClusterError::NotLeader {
            leader_hint: info.leader,
        });
    }
    let (proposal, rx) = Proposal::new(command.encode());
    handles
        .proposals
        .send(proposal)
        .await
        .map_err(|_| ClusterError::LeadershipLost)?;
    rx.await.map_err(|_| ClusterError::LeadershipLost)?
}

async fn handle_admin(handles: &Handles, request: AdminRequest) -> AdminResponse {
    match request {
        AdminRequest::AddNode { addr, watcher } => {
            let topology = handles.state.cluster_topology();
            if let Some((&existing, _)) = topology
                .members
                .iter()
                .chain(topology.promotables.iter())
                .chain(topology.watchers.iter())
                .find(|(_, a)| **a == addr)
            {
                return AdminResponse::error(&ClusterError::AlreadyInCluster(existing));
            }
            let id = handles.state.max_node_id() + 1;
            let command = TopologyCommand::AddNode {
                id,
                addr: addr.clone(),
                watcher,
            };
            match propose_and_wait(handles, command).await {
                Ok(_) => {
                    // The id came from locally applied state, so a
                    // concurrent AddNode can claim it first; the state
                    // machine ignores the loser. Only report success once
                    // the applied topology maps the id to this address.
                    if handles.state.node_addr(id).as_deref() == Some(addr.as_str()) {
                        AdminResponse::NodeAdded { id }
                    } else {
                        AdminResponse::error(&ClusterError::NodeIdTaken(id))
                    }
                }
                Err(e) => AdminResponse::error(&e),
            }
        }
        AdminRequest::RemoveNode { id } => {
            if !handles.state.cluster_topology().contains(id) {
                return AdminResponse::error(&ClusterError::NodeNotFound(id));
            }
            match propose_and_wait(handles, TopologyCommand::RemoveNode { id }).await {
                Ok(_) => AdminResponse::Done,
                Err(e) => AdminResponse::error(&e),
            }
        }
        AdminRequest::CreateDatabase {
            name,
            replication_factor,
        } => {
            match propose_and_wait(
                handles,
                TopologyCommand::CreateDatabase {
                    name,
                    replication_factor,
                },
            )
            .await
            {
                Ok(_) => AdminResponse::Done,
                Err(e) => AdminResponse::error(&e),
            }
        }
        AdminRequest::DeleteDatabase { name } => {
            if handles.state.database(&name).is_none() {
                return AdminResponse::error(&ClusterError::DatabaseNotFound(name));
            }
            match propose_and_wait(handles, TopologyCommand::DeleteDatabase { name }).await {
                Ok(_) => AdminResponse::Done,
                Err(e) => AdminResponse::error(&e),
            }
        }
        AdminRequest::GetClusterTopology => {
            AdminResponse::ClusterTopology(handles.state.cluster_topology())
        }
        AdminRequest::GetDatabaseTopology { name } => {
            AdminResponse::DatabaseTopology(handles.state.database(&name))
        }
        AdminRequest::GetLeader => {
            let info = *handles.role_rx.borrow();
            AdminResponse::Leader {
                leader: info.leader,
                term: info.term,
            }
        }
        AdminRequest::WaitForRole { role, timeout_ms } => {
            let mut role_rx = handles.role_rx.clone();
            let wait = async {
                loop {
                    let info = *role_rx.borrow();
                    if info.role == role {
                        return info;
                    }
                    if role_rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                        unreachable!();
                    }
                }
            };
            match tokio::time::timeout(Duration::from_millis(timeout_ms), wait).await {
                Ok(info) => AdminResponse::RoleReached {
                    role: info.role,
                    term: info.term,
                },
                Err(_) => AdminResponse::error(&ClusterError::Timeout),
            }
        }
        AdminRequest::ReportDatabaseStatus { db, node, etag } => {
            handles.health.record_contact(node);
            handles.health.record_database_status(&db, node, etag);
            AdminResponse::Done
        }
    }
}
