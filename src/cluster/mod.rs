//! Cluster control plane.
//!
//! - [`mesh`] - authenticated peer links and node-ready tracking
//! - [`election`] - bully leader election and liveness
//! - [`replication`] - sync/async mutation fanout and follower apply
//!
//! [`ClusterNode`] wires the three together: it serves the inbound side of
//! the mesh (election traffic, replicated writes, sync snapshots), runs the
//! election tasks, and signals cluster-ready once this node is either the
//! leader or a follower that finished its resync.

pub mod election;
pub mod mesh;
pub mod replication;

pub use election::{Election, ElectionTiming};
pub use mesh::{PeerLink, PeerMesh};
pub use replication::{Replicator, WriteOp};

use crate::cache::{Cache, SnapshotEntry, Value};
use crate::core::config::ClusterConfig;
use crate::core::error::{StrataError, StrataResult};
use crate::protocol::{ClusterOperation, PacketBuffer, Status};
use anyhow::Context;
use bytes::BytesMut;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Deadline for a follower's full-state sync round-trip.
const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between follower resync attempts.
const RESYNC_RETRY: Duration = Duration::from_millis(300);

/// One clustered node: mesh, election, and replication state.
pub struct ClusterNode {
    config: ClusterConfig,
    mesh: Arc<PeerMesh>,
    election: Arc<Election>,
    replicator: Replicator,
    cache: Arc<Cache>,
    /// Last applied replicate request id per peer, for duplicate
    /// suppression on redelivery.
    applied: DashMap<u32, u32>,
    cluster_ready_tx: watch::Sender<bool>,
}

impl ClusterNode {
    pub fn new(config: ClusterConfig, cache: Arc<Cache>) -> Arc<Self> {
        let mesh = PeerMesh::new(&config);
        let timing = ElectionTiming::from(&config.election);
        let election = Election::new(config.id, Arc::clone(&mesh), timing);
        let replicator = match config.replication.kind {
            crate::core::config::ReplicationKind::Sync => Replicator::sync(Arc::clone(&mesh)),
            crate::core::config::ReplicationKind::Async => Replicator::asynchronous(
                Arc::clone(&mesh),
                config.replication.interval_milliseconds.unwrap_or(100),
            ),
        };
        let (cluster_ready_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            mesh,
            election,
            replicator,
            cache,
            applied: DashMap::new(),
            cluster_ready_tx,
        })
    }

    pub fn node_id(&self) -> u32 {
        self.config.id
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn leader_id(&self) -> Option<u32> {
        self.election.leader_id()
    }

    pub fn replicator(&self) -> &Replicator {
        &self.replicator
    }

    /// One-shot cluster-ready signal receiver.
    pub fn cluster_ready(&self) -> watch::Receiver<bool> {
        self.cluster_ready_tx.subscribe()
    }

    /// Bring the cluster side up: listen, dial, elect. Returns once this
    /// node is cluster-ready.
    pub async fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let bind_addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind cluster listener {bind_addr}"))?;
        tracing::info!(node_id = self.config.id, %bind_addr, "cluster listener started");

        let node = Arc::clone(self);
        let accept_shutdown = shutdown.clone();
        tokio::spawn(node.run_listener(listener, accept_shutdown));

        self.mesh.start(shutdown.clone());
        let mut node_ready = self.mesh.node_ready();
        while !*node_ready.borrow() {
            node_ready
                .changed()
                .await
                .context("mesh stopped before node-ready")?;
        }
        tracing::info!(node_id = self.config.id, "node ready, mesh established");

        self.spawn_ready_watcher();
        Arc::clone(&self.election).spawn_heartbeat(shutdown.clone());
        Arc::clone(&self.election).spawn_watchdog(shutdown.clone());
        self.replicator.start(shutdown);

        tokio::spawn(Arc::clone(&self.election).start_election());

        let mut cluster_ready = self.cluster_ready_tx.subscribe();
        while !*cluster_ready.borrow() {
            cluster_ready
                .changed()
                .await
                .context("election stopped before cluster-ready")?;
        }
        tracing::info!(
            node_id = self.config.id,
            leader_id = ?self.leader_id(),
            "cluster ready"
        );
        Ok(())
    }

    /// Signal cluster-ready once: immediately when this node wins, after a
    /// completed sync with the leader when it follows.
    fn spawn_ready_watcher(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut leader_rx = node.election.leader_watch();
            loop {
                let leader = *leader_rx.borrow_and_update();
                match leader {
                    Some(leader_id) if leader_id == node.config.id => {
                        node.cluster_ready_tx.send_replace(true);
                        return;
                    }
                    Some(leader_id) => match node.resync(leader_id).await {
                        Ok(()) => {
                            node.cluster_ready_tx.send_replace(true);
                            return;
                        }
                        Err(e) => {
                            tracing::warn!(leader_id, error = %e, "resync failed, retrying");
                            tokio::time::sleep(RESYNC_RETRY).await;
                        }
                    },
                    None => {
                        if leader_rx.changed().await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Pull the leader's full snapshot and replace the local cache.
    async fn resync(&self, leader_id: u32) -> StrataResult<()> {
        let link = self
            .mesh
            .link(leader_id)
            .filter(|link| link.is_connected())
            .ok_or_else(|| StrataError::transient_peer(leader_id, "leader link not connected"))?;

        let mut response = link
            .request(ClusterOperation::Sync, SYNC_TIMEOUT, |_| {})
            .await?;
        let _op = response.read_u8()?;
        let _request_id = response.read_u32()?;
        if response.read_u8()? != Status::Ok as u8 {
            let message = response.read_string().unwrap_or_default();
            return Err(StrataError::transient_peer(
                leader_id,
                format!("sync rejected: {message}"),
            ));
        }

        let count = response.read_var_uint()? as usize;
        let mut snapshot = Vec::with_capacity(count.min(64 * 1024));
        for _ in 0..count {
            let key = response.read_string()?;
            let value = Value::decode(&mut response)?;
            let ttl_ms = response.read_u64()?;
            snapshot.push(SnapshotEntry { key, value, ttl_ms });
        }
        self.cache.apply_snapshot(snapshot);
        tracing::info!(leader_id, keys = count, "resynced from leader");
        Ok(())
    }

    /// Accept loop for the cluster listener.
    async fn run_listener(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, remote_addr)) => {
                        tracing::debug!(%remote_addr, "inbound peer connection");
                        let node = Arc::clone(&self);
                        tokio::spawn(node.handle_inbound(stream, shutdown.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "cluster accept failed");
                    }
                },
                _ = shutdown.changed() => {
                    tracing::debug!("cluster listener stopping");
                    return;
                }
            }
        }
    }

    /// Serve one inbound peer: verify its handshake, then answer requests
    /// serially, which preserves per-link FIFO for replicated writes.
    async fn handle_inbound(
        self: Arc<Self>,
        mut stream: TcpStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let _ = stream.set_nodelay(true);

        let handshake =
            tokio::time::timeout(mesh::HANDSHAKE_TIMEOUT, mesh::read_frame(&mut stream)).await;
        let payload = match handshake {
            Ok(Ok(payload)) => payload,
            _ => {
                tracing::debug!("inbound peer closed before handshake");
                return;
            }
        };

        let peer_id = match self.verify_handshake(payload, &mut stream).await {
            Some(peer_id) => peer_id,
            None => return,
        };
        // A fresh handshake may follow a peer restart, which resets its
        // request-id counter; the duplicate watermark starts over with it.
        self.applied.remove(&peer_id);
        self.mesh.mark_inbound(peer_id);
        tracing::info!(peer_id, "peer handshake accepted");

        loop {
            let payload = tokio::select! {
                result = mesh::read_frame(&mut stream) => match result {
                    Ok(payload) => payload,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };
            let mut response = self.handle_peer_request(peer_id, payload).await;
            response.finalize();
            if stream.write_all(response.frame()).await.is_err() {
                break;
            }
        }

        self.mesh.drop_inbound(peer_id);
        tracing::info!(peer_id, "peer disconnected");
    }

    /// Check the opening handshake; answers with our password on success
    /// so the dialer can verify us back. Returns the peer id.
    async fn verify_handshake(&self, payload: BytesMut, stream: &mut TcpStream) -> Option<u32> {
        let mut packet = PacketBuffer::from_payload(payload);
        let parsed: StrataResult<(u8, u32, u32, String)> = (|| {
            let op = packet.read_u8()?;
            let request_id = packet.read_u32()?;
            let peer_id = packet.read_u32()?;
            let password = packet.read_string()?;
            Ok((op, request_id, peer_id, password))
        })();

        let (op, request_id, peer_id, password) = match parsed {
            Ok(fields) => fields,
            Err(e) => {
                tracing::warn!(error = %e, "malformed peer handshake");
                return None;
            }
        };
        if op != ClusterOperation::Handshake as u8 {
            tracing::warn!(op, "inbound peer sent non-handshake first");
            return None;
        }
        if password != self.mesh.password() {
            tracing::warn!(peer_id, "peer handshake failed: bad password");
            let mut response =
                PacketBuffer::cluster_response(ClusterOperation::Handshake, request_id, Status::Error);
            response.write_string("handshake rejected");
            response.finalize();
            let _ = stream.write_all(response.frame()).await;
            return None;
        }

        let mut response =
            PacketBuffer::cluster_response(ClusterOperation::Handshake, request_id, Status::Ok);
        response.write_string(self.mesh.password());
        response.finalize();
        if stream.write_all(response.frame()).await.is_err() {
            return None;
        }
        Some(peer_id)
    }

    /// Handle one peer request and build its response.
    async fn handle_peer_request(&self, peer_id: u32, payload: BytesMut) -> PacketBuffer {
        let mut packet = PacketBuffer::from_payload(payload);
        let op_byte = packet.read_u8().unwrap_or(u8::MAX);
        let request_id = packet.read_u32().unwrap_or(0);

        let op = match ClusterOperation::try_from(op_byte) {
            Ok(op) => op,
            Err(unknown) => {
                let mut response = PacketBuffer::response_raw(unknown, request_id, Status::Error);
                response.write_string(&format!("unknown cluster operation: {unknown}"));
                return response;
            }
        };

        match self.peer_request(peer_id, op, request_id, &mut packet).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(peer_id, operation = ?op, error = %e, "peer request failed");
                let mut response = PacketBuffer::cluster_response(op, request_id, Status::Error);
                response.write_string(&e.to_string());
                response
            }
        }
    }

    async fn peer_request(
        &self,
        peer_id: u32,
        op: ClusterOperation,
        request_id: u32,
        packet: &mut PacketBuffer,
    ) -> StrataResult<PacketBuffer> {
        match op {
            ClusterOperation::Alive => {
                let leader_id = packet.read_u32()?;
                self.election.handle_alive(leader_id);
                Ok(PacketBuffer::cluster_response(op, request_id, Status::Ok))
            }
            ClusterOperation::Election => {
                let candidate_id = packet.read_u32()?;
                self.election.handle_election(candidate_id);
                Ok(PacketBuffer::cluster_response(op, request_id, Status::Ok))
            }
            ClusterOperation::Victory => {
                let leader_id = packet.read_u32()?;
                self.election.handle_victory(leader_id);
                Ok(PacketBuffer::cluster_response(op, request_id, Status::Ok))
            }
            ClusterOperation::Sync => {
                let snapshot = self.cache.snapshot();
                let mut response = PacketBuffer::cluster_response(op, request_id, Status::Ok);
                response.write_var_uint(snapshot.len() as u64);
                for entry in &snapshot {
                    response.write_string(&entry.key);
                    entry.value.encode(&mut response);
                    response.write_u64(entry.ttl_ms);
                }
                tracing::debug!(peer_id, keys = snapshot.len(), "served sync snapshot");
                Ok(response)
            }
            ClusterOperation::Replicate => {
                if self.already_applied(peer_id, request_id) {
                    return Ok(PacketBuffer::cluster_response(op, request_id, Status::Ok));
                }
                let write = WriteOp::decode(packet)?;
                write.apply(&self.cache).await?;
                self.record_applied(peer_id, request_id);
                Ok(PacketBuffer::cluster_response(op, request_id, Status::Ok))
            }
            ClusterOperation::ReplicateBatch => {
                if self.already_applied(peer_id, request_id) {
                    return Ok(PacketBuffer::cluster_response(op, request_id, Status::Ok));
                }
                let count = packet.read_var_uint()?;
                for _ in 0..count {
                    let write = WriteOp::decode(packet)?;
                    write.apply(&self.cache).await?;
                }
                self.record_applied(peer_id, request_id);
                Ok(PacketBuffer::cluster_response(op, request_id, Status::Ok))
            }
            ClusterOperation::Handshake => Err(StrataError::invalid(
                "unexpected handshake on established peer link",
            )),
        }
    }

    /// Replicate request ids are monotonic per peer for the lifetime of the
    /// leader process; a non-increasing id is a redelivery.
    fn already_applied(&self, peer_id: u32, request_id: u32) -> bool {
        self.applied
            .get(&peer_id)
            .is_some_and(|last| request_id <= *last.value())
    }

    fn record_applied(&self, peer_id: u32, request_id: u32) {
        self.applied.insert(peer_id, request_id);
    }
}
