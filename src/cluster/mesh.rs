//! Cluster peer mesh.
//!
//! Each node listens on its cluster address and dials every configured
//! peer. Both directions complete a mutual password handshake before any
//! other traffic. Outbound links carry requests (election, replication,
//! sync) with request-id correlation; the inbound side of each peer serves
//! them. Once every outbound dial has handshaked and every expected peer
//! has handshaked inbound, the mesh signals node-ready exactly once.

use crate::core::config::{ClusterConfig, NodeSpec};
use crate::core::error::{StrataError, StrataResult};
use crate::protocol::{
    ClusterOperation, PacketBuffer, Status, MAX_PAYLOAD_LEN, MIN_PAYLOAD_LEN,
};
use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};

/// Delay between outbound dial attempts.
const DIAL_RETRY: Duration = Duration::from_millis(500);

/// Deadline for a peer handshake round-trip.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Read one length-prefixed frame from a peer stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> StrataResult<BytesMut> {
    let mut header = [0u8; 4];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| StrataError::internal(format!("peer read failed: {e}")))?;
    let declared = u32::from_be_bytes(header) as usize;
    if !(MIN_PAYLOAD_LEN..=MAX_PAYLOAD_LEN).contains(&declared) {
        return Err(StrataError::malformed(format!(
            "peer declared payload length {declared} out of bounds"
        )));
    }
    let mut payload = vec![0u8; declared];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| StrataError::internal(format!("peer read failed: {e}")))?;
    Ok(BytesMut::from(&payload[..]))
}

/// The outbound side of one peer connection.
///
/// The link outlives reconnects: its request-id counter stays monotonic for
/// the lifetime of this process, which is what the follower's duplicate
/// suppression keys on.
pub struct PeerLink {
    pub peer_id: u32,
    writer: RwLock<Option<mpsc::UnboundedSender<PacketBuffer>>>,
    pending: DashMap<u32, oneshot::Sender<BytesMut>>,
    next_request_id: AtomicU32,
}

impl PeerLink {
    fn new(peer_id: u32) -> Self {
        Self {
            peer_id,
            writer: RwLock::new(None),
            pending: DashMap::new(),
            next_request_id: AtomicU32::new(0),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.writer.read().is_some()
    }

    fn attach(&self, sender: mpsc::UnboundedSender<PacketBuffer>) {
        *self.writer.write() = Some(sender);
    }

    /// Drop the current socket. Pending requests observe their oneshot
    /// senders being dropped and fail as transient.
    fn detach(&self) {
        *self.writer.write() = None;
        self.pending.clear();
    }

    /// Allocate the next request id on this link.
    pub fn next_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Queue a finalized frame, failing fast when the link is down.
    pub fn send(&self, mut frame: PacketBuffer) -> StrataResult<()> {
        frame.finalize();
        match self.writer.read().as_ref() {
            Some(sender) => sender
                .send(frame)
                .map_err(|_| StrataError::transient_peer(self.peer_id, "link closed")),
            None => Err(StrataError::transient_peer(self.peer_id, "not connected")),
        }
    }

    /// Send a request and await its correlated response.
    pub async fn request(
        &self,
        op: ClusterOperation,
        timeout: Duration,
        build: impl FnOnce(&mut PacketBuffer),
    ) -> StrataResult<PacketBuffer> {
        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        let mut frame = PacketBuffer::cluster_request(op, request_id);
        build(&mut frame);
        if let Err(e) = self.send(frame) {
            self.pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(PacketBuffer::from_payload(payload)),
            Ok(Err(_)) => Err(StrataError::transient_peer(
                self.peer_id,
                "link dropped while awaiting response",
            )),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(StrataError::transient_peer(self.peer_id, "request timed out"))
            }
        }
    }

    fn complete(&self, request_id: u32, payload: BytesMut) {
        if let Some((_, tx)) = self.pending.remove(&request_id) {
            let _ = tx.send(payload);
        }
        // Responses to fire-and-forget broadcasts have no pending entry
        // and are dropped here.
    }
}

/// The full set of peer links plus node-ready tracking.
pub struct PeerMesh {
    local_id: u32,
    password: String,
    peers: Vec<NodeSpec>,
    links: DashMap<u32, Arc<PeerLink>>,
    inbound: DashMap<u32, ()>,
    ready_tx: watch::Sender<bool>,
}

impl PeerMesh {
    pub fn new(config: &ClusterConfig) -> Arc<Self> {
        let links = DashMap::new();
        for peer in &config.nodes {
            links.insert(peer.id, Arc::new(PeerLink::new(peer.id)));
        }
        let (ready_tx, _) = watch::channel(false);
        Arc::new(Self {
            local_id: config.id,
            password: config.password.clone(),
            peers: config.nodes.clone(),
            links,
            inbound: DashMap::new(),
            ready_tx,
        })
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Expected cluster password for inbound handshakes.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// One-shot node-ready signal receiver.
    pub fn node_ready(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    pub fn link(&self, peer_id: u32) -> Option<Arc<PeerLink>> {
        self.links.get(&peer_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Links whose outbound side is currently connected.
    pub fn connected_links(&self) -> Vec<Arc<PeerLink>> {
        self.links
            .iter()
            .filter(|entry| entry.value().is_connected())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Connected links to peers with a higher id than `id`.
    pub fn links_with_higher_id(&self, id: u32) -> Vec<Arc<PeerLink>> {
        self.connected_links()
            .into_iter()
            .filter(|link| link.peer_id > id)
            .collect()
    }

    /// Fire-and-forget broadcast to every connected peer.
    pub fn broadcast(&self, op: ClusterOperation, build: impl Fn(&mut PacketBuffer)) {
        for link in self.connected_links() {
            let mut frame = PacketBuffer::cluster_request(op, link.next_request_id());
            build(&mut frame);
            if let Err(e) = link.send(frame) {
                tracing::debug!(peer_id = link.peer_id, error = %e, "broadcast skipped peer");
            }
        }
    }

    /// Record a handshaked inbound peer.
    pub fn mark_inbound(&self, peer_id: u32) {
        self.inbound.insert(peer_id, ());
        self.check_ready();
    }

    pub fn drop_inbound(&self, peer_id: u32) {
        self.inbound.remove(&peer_id);
    }

    fn check_ready(&self) {
        let outbound_done = self
            .peers
            .iter()
            .all(|peer| self.link(peer.id).is_some_and(|link| link.is_connected()));
        if outbound_done && self.inbound.len() >= self.peers.len() {
            self.ready_tx.send_replace(true);
        }
    }

    /// Start the outbound dial tasks. With no configured peers the mesh is
    /// ready immediately.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        if self.peers.is_empty() {
            self.ready_tx.send_replace(true);
            return;
        }
        for peer in self.peers.clone() {
            let mesh = Arc::clone(self);
            tokio::spawn(run_outbound(mesh, peer, shutdown.clone()));
        }
    }
}

/// Dial loop for one peer: connect, handshake, pump responses, reconnect.
async fn run_outbound(mesh: Arc<PeerMesh>, peer: NodeSpec, mut shutdown: watch::Receiver<bool>) {
    let Some(link) = mesh.link(peer.id) else {
        return;
    };

    loop {
        if *shutdown.borrow() {
            return;
        }

        let connect = TcpStream::connect((peer.host.as_str(), peer.port));
        let stream = tokio::select! {
            result = connect => match result {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::trace!(peer_id = peer.id, error = %e, "dial failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(DIAL_RETRY) => continue,
                        _ = shutdown.changed() => return,
                    }
                }
            },
            _ = shutdown.changed() => return,
        };
        let _ = stream.set_nodelay(true);

        let stream = match dial_handshake(stream, &mesh, peer.id).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(peer_id = peer.id, error = %e, "peer handshake failed");
                tokio::select! {
                    _ = tokio::time::sleep(DIAL_RETRY) => continue,
                    _ = shutdown.changed() => return,
                }
            }
        };
        tracing::info!(peer_id = peer.id, "peer link established");

        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut outbound) = mpsc::unbounded_channel::<PacketBuffer>();
        link.attach(tx);
        mesh.check_ready();

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                if writer.write_all(frame.frame()).await.is_err() {
                    break;
                }
            }
        });

        // Correlate responses until the socket fails or shutdown.
        loop {
            tokio::select! {
                result = read_frame(&mut reader) => match result {
                    Ok(payload) => {
                        if payload.len() >= 5 {
                            let request_id = u32::from_be_bytes([
                                payload[1], payload[2], payload[3], payload[4],
                            ]);
                            link.complete(request_id, payload);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(peer_id = peer.id, error = %e, "peer link lost");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    link.detach();
                    writer_task.abort();
                    return;
                }
            }
        }

        link.detach();
        writer_task.abort();
        tracing::info!(peer_id = peer.id, "peer link down, reconnecting");
    }
}

/// Dialer half of the mutual handshake: send our id and password, verify
/// the password the peer answers with.
async fn dial_handshake(
    mut stream: TcpStream,
    mesh: &PeerMesh,
    peer_id: u32,
) -> StrataResult<TcpStream> {
    let mut frame = PacketBuffer::cluster_request(ClusterOperation::Handshake, 0);
    frame.write_u32(mesh.local_id);
    frame.write_string(&mesh.password);
    frame.finalize();
    stream
        .write_all(frame.frame())
        .await
        .map_err(|e| StrataError::transient_peer(peer_id, format!("handshake send failed: {e}")))?;

    let payload = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream))
        .await
        .map_err(|_| StrataError::PeerHandshakeFailed { peer_id })??;

    let mut response = PacketBuffer::from_payload(payload);
    let op = response.read_u8()?;
    let _request_id = response.read_u32()?;
    let status = response.read_u8()?;
    if op != ClusterOperation::Handshake as u8 || status != Status::Ok as u8 {
        return Err(StrataError::PeerHandshakeFailed { peer_id });
    }
    let their_password = response.read_string()?;
    if their_password != mesh.password {
        return Err(StrataError::PeerHandshakeFailed { peer_id });
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ReplicationConfig, ReplicationKind};

    fn mesh_config(id: u32, nodes: Vec<NodeSpec>) -> ClusterConfig {
        ClusterConfig {
            id,
            ip: "127.0.0.1".to_string(),
            port: 0,
            password: "secret".to_string(),
            nodes,
            election: Default::default(),
            replication: ReplicationConfig {
                kind: ReplicationKind::Sync,
                interval_milliseconds: None,
            },
        }
    }

    #[tokio::test]
    async fn test_empty_mesh_is_ready_immediately() {
        let mesh = PeerMesh::new(&mesh_config(1, Vec::new()));
        let (_tx, rx) = watch::channel(false);
        mesh.start(rx);
        assert!(*mesh.node_ready().borrow());
    }

    #[tokio::test]
    async fn test_disconnected_link_fails_fast() {
        let mesh = PeerMesh::new(&mesh_config(
            1,
            vec![NodeSpec {
                id: 2,
                host: "127.0.0.1".to_string(),
                port: 1,
            }],
        ));
        let link = mesh.link(2).unwrap();
        assert!(!link.is_connected());
        let result = link
            .request(ClusterOperation::Alive, Duration::from_millis(50), |p| {
                p.write_u32(1)
            })
            .await;
        assert!(matches!(result, Err(StrataError::TransientPeer { .. })));
    }

    #[tokio::test]
    async fn test_higher_id_filter() {
        let nodes = vec![
            NodeSpec {
                id: 2,
                host: "h".into(),
                port: 1,
            },
            NodeSpec {
                id: 9,
                host: "h".into(),
                port: 1,
            },
        ];
        let mesh = PeerMesh::new(&mesh_config(5, nodes));
        // Nothing connected yet, so both filters are empty.
        assert!(mesh.links_with_higher_id(5).is_empty());
        assert!(mesh.connected_links().is_empty());
        assert_eq!(mesh.link(9).unwrap().peer_id, 9);
    }

    #[test]
    fn test_request_ids_are_monotonic() {
        let link = PeerLink::new(7);
        assert_eq!(link.next_request_id(), 1);
        assert_eq!(link.next_request_id(), 2);
        assert_eq!(link.next_request_id(), 3);
    }
}
