//! Request dispatch.
//!
//! Each packet begins with an operation byte and a request id. The
//! dispatcher enforces authentication, routes to the operation's handler,
//! and converts handler errors into `Error` responses for the originating
//! request without affecting other in-flight requests.

use super::connection::ClientConnection;
use super::handlers;
use super::listener::ListenerMetrics;
use crate::cache::Cache;
use crate::cluster::replication::WriteOp;
use crate::cluster::ClusterNode;
use crate::core::config::Config;
use crate::core::error::StrataError;
use crate::protocol::{Operation, PacketBuffer, Status};
use crate::pubsub::PubSub;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Instant;

/// Shared state handed to every handler.
pub struct ServerState {
    pub config: Arc<Config>,
    pub cache: Arc<Cache>,
    pub pubsub: Arc<PubSub>,
    pub metrics: Arc<ListenerMetrics>,
    pub started_at: Instant,
    pub cluster: Option<Arc<ClusterNode>>,
}

impl ServerState {
    /// Cluster id reported on login, `0` when standalone.
    pub fn cluster_id(&self) -> i32 {
        self.cluster
            .as_ref()
            .map(|cluster| cluster.node_id() as i32)
            .unwrap_or(0)
    }

    /// Leadership reported on login. A standalone node accepts writes, so
    /// it reports itself leader.
    pub fn is_leader(&self) -> bool {
        match &self.cluster {
            Some(cluster) => cluster.is_leader(),
            None => true,
        }
    }

    /// Forward a committed mutation to the replicator when this node is the
    /// elected leader. For sync replication this awaits all follower
    /// acknowledgements before the handler builds its response.
    pub async fn replicate(&self, op: WriteOp) {
        if let Some(cluster) = &self.cluster {
            if cluster.is_leader() {
                cluster.replicator().replicate(op).await;
            }
        }
    }
}

/// Dispatch one complete packet from a connection.
pub async fn dispatch(state: Arc<ServerState>, conn: Arc<ClientConnection>, payload: BytesMut) {
    let mut packet = PacketBuffer::from_payload(payload);

    // The accumulator guarantees at least op byte + request id.
    let Ok(op_byte) = packet.read_u8() else { return };
    let Ok(request_id) = packet.read_u32() else {
        return;
    };

    let op = match Operation::try_from(op_byte) {
        Ok(op) => op,
        Err(unknown) => {
            tracing::debug!(connection_id = conn.id, op = unknown, "unknown operation");
            conn.send(error_response_raw(
                unknown,
                request_id,
                &format!("unknown operation code: {unknown}"),
            ));
            return;
        }
    };

    if !conn.is_authenticated() && op != Operation::Login {
        conn.send(error_response(
            op,
            request_id,
            &StrataError::Unauthenticated.to_string(),
        ));
        return;
    }

    match handlers::handle(&state, &conn, op, request_id, &mut packet).await {
        Ok(response) => conn.send(response),
        Err(err) => {
            tracing::debug!(
                connection_id = conn.id,
                operation = ?op,
                error = %err,
                "request failed"
            );
            conn.send(error_response(op, request_id, &err.to_string()));
        }
    }
}

/// Build an `Error` response with a descriptive text body.
pub fn error_response(op: Operation, request_id: u32, message: &str) -> PacketBuffer {
    error_response_raw(op as u8, request_id, message)
}

fn error_response_raw(op: u8, request_id: u32, message: &str) -> PacketBuffer {
    let mut response = PacketBuffer::response_raw(op, request_id, Status::Error);
    response.write_string(message);
    response
}
