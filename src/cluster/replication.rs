//! Write replication.
//!
//! The elected leader forwards every committed mutation to its followers.
//! Sync replication broadcasts each mutation and awaits every connected
//! follower's acknowledgement before the client handler responds; a
//! follower that drops mid-wait counts as success and resyncs on
//! reconnect. Async replication queues mutations in order and ships the
//! accumulated batch on a timer.
//!
//! Followers apply mutations with the keyed lock bypassed (the leader
//! already serialized them) and without touching hit/miss statistics.

use super::mesh::PeerMesh;
use crate::cache::Cache;
use crate::core::error::{StrataError, StrataResult};
use crate::protocol::{ClusterOperation, PacketBuffer, TaggedValue};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Deadline for one follower acknowledgement.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

mod op_kind {
    pub const SET_STRING: u8 = 0;
    pub const SET_BYTES: u8 = 1;
    pub const ADD_LIST: u8 = 2;
    pub const REMOVE_LIST: u8 = 3;
    pub const SET_COUNTER: u8 = 4;
    pub const INCREMENT_COUNTER: u8 = 5;
    pub const SET_MAP_VALUE: u8 = 6;
    pub const SET_MAP: u8 = 7;
    pub const DELETE: u8 = 8;
}

/// A replicated mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    SetString {
        key: String,
        value: Option<String>,
        ttl_ms: u64,
    },
    SetBytes {
        key: String,
        value: Option<Vec<u8>>,
        ttl_ms: u64,
    },
    AddList {
        key: String,
        value: String,
        ttl_ms: u64,
    },
    RemoveList {
        key: String,
        value: String,
    },
    SetCounter {
        key: String,
        value: i64,
    },
    IncrementCounter {
        key: String,
        delta: i64,
    },
    SetMapValue {
        key: String,
        sub_key: String,
        value: TaggedValue,
    },
    SetMap {
        key: String,
        entries: HashMap<String, TaggedValue>,
        ttl_ms: u64,
    },
    Delete {
        key: String,
    },
}

impl WriteOp {
    /// The key this mutation targets.
    pub fn key(&self) -> &str {
        match self {
            Self::SetString { key, .. }
            | Self::SetBytes { key, .. }
            | Self::AddList { key, .. }
            | Self::RemoveList { key, .. }
            | Self::SetCounter { key, .. }
            | Self::IncrementCounter { key, .. }
            | Self::SetMapValue { key, .. }
            | Self::SetMap { key, .. }
            | Self::Delete { key } => key,
        }
    }

    pub fn encode(&self, packet: &mut PacketBuffer) {
        match self {
            Self::SetString { key, value, ttl_ms } => {
                packet.write_u8(op_kind::SET_STRING);
                packet.write_string(key);
                packet.write_opt_string(value.as_deref());
                packet.write_var_uint(*ttl_ms);
            }
            Self::SetBytes { key, value, ttl_ms } => {
                packet.write_u8(op_kind::SET_BYTES);
                packet.write_string(key);
                packet.write_opt_bytes(value.as_deref());
                packet.write_var_uint(*ttl_ms);
            }
            Self::AddList { key, value, ttl_ms } => {
                packet.write_u8(op_kind::ADD_LIST);
                packet.write_string(key);
                packet.write_string(value);
                packet.write_var_uint(*ttl_ms);
            }
            Self::RemoveList { key, value } => {
                packet.write_u8(op_kind::REMOVE_LIST);
                packet.write_string(key);
                packet.write_string(value);
            }
            Self::SetCounter { key, value } => {
                packet.write_u8(op_kind::SET_COUNTER);
                packet.write_string(key);
                packet.write_i64(*value);
            }
            Self::IncrementCounter { key, delta } => {
                packet.write_u8(op_kind::INCREMENT_COUNTER);
                packet.write_string(key);
                packet.write_i64(*delta);
            }
            Self::SetMapValue {
                key,
                sub_key,
                value,
            } => {
                packet.write_u8(op_kind::SET_MAP_VALUE);
                packet.write_string(key);
                packet.write_string(sub_key);
                packet.write_tagged(value);
            }
            Self::SetMap {
                key,
                entries,
                ttl_ms,
            } => {
                packet.write_u8(op_kind::SET_MAP);
                packet.write_string(key);
                packet.write_tagged_map(entries);
                packet.write_var_uint(*ttl_ms);
            }
            Self::Delete { key } => {
                packet.write_u8(op_kind::DELETE);
                packet.write_string(key);
            }
        }
    }

    pub fn decode(packet: &mut PacketBuffer) -> StrataResult<Self> {
        match packet.read_u8()? {
            op_kind::SET_STRING => Ok(Self::SetString {
                key: packet.read_string()?,
                value: packet.read_opt_string()?,
                ttl_ms: packet.read_var_uint()?,
            }),
            op_kind::SET_BYTES => Ok(Self::SetBytes {
                key: packet.read_string()?,
                value: packet.read_opt_bytes()?,
                ttl_ms: packet.read_var_uint()?,
            }),
            op_kind::ADD_LIST => Ok(Self::AddList {
                key: packet.read_string()?,
                value: packet.read_string()?,
                ttl_ms: packet.read_var_uint()?,
            }),
            op_kind::REMOVE_LIST => Ok(Self::RemoveList {
                key: packet.read_string()?,
                value: packet.read_string()?,
            }),
            op_kind::SET_COUNTER => Ok(Self::SetCounter {
                key: packet.read_string()?,
                value: packet.read_i64()?,
            }),
            op_kind::INCREMENT_COUNTER => Ok(Self::IncrementCounter {
                key: packet.read_string()?,
                delta: packet.read_i64()?,
            }),
            op_kind::SET_MAP_VALUE => Ok(Self::SetMapValue {
                key: packet.read_string()?,
                sub_key: packet.read_string()?,
                value: packet.read_tagged()?,
            }),
            op_kind::SET_MAP => Ok(Self::SetMap {
                key: packet.read_string()?,
                entries: packet.read_tagged_map()?,
                ttl_ms: packet.read_var_uint()?,
            }),
            op_kind::DELETE => Ok(Self::Delete {
                key: packet.read_string()?,
            }),
            other => Err(StrataError::malformed(format!(
                "unknown replicated operation kind: {other}"
            ))),
        }
    }

    /// Apply on a follower: lock bypassed, statistics untouched.
    pub async fn apply(&self, cache: &Cache) -> StrataResult<()> {
        match self {
            Self::SetString { key, value, ttl_ms } => {
                cache.set_string(key, value.clone(), *ttl_ms, false).await
            }
            Self::SetBytes { key, value, ttl_ms } => {
                cache.set_bytes(key, value.clone(), *ttl_ms, false).await
            }
            Self::AddList { key, value, ttl_ms } => {
                cache.add_list(key, value.clone(), *ttl_ms, false).await
            }
            Self::RemoveList { key, value } => cache.remove_list(key, value, false).await,
            Self::SetCounter { key, value } => cache.set_counter(key, *value, false).await,
            Self::IncrementCounter { key, delta } => cache.apply_increment(key, *delta).await,
            Self::SetMapValue {
                key,
                sub_key,
                value,
            } => {
                cache
                    .set_map_value(key, sub_key.clone(), value.clone(), false)
                    .await
            }
            Self::SetMap {
                key,
                entries,
                ttl_ms,
            } => cache.set_map(key, entries.clone(), *ttl_ms, false).await,
            Self::Delete { key } => cache.delete(key, false).await,
        }
    }
}

/// Leader-side replication strategy.
pub enum Replicator {
    Sync(SyncReplicator),
    Async(AsyncReplicator),
}

impl Replicator {
    pub fn sync(mesh: Arc<PeerMesh>) -> Self {
        Self::Sync(SyncReplicator { mesh })
    }

    pub fn asynchronous(mesh: Arc<PeerMesh>, interval_ms: u64) -> Self {
        Self::Async(AsyncReplicator {
            mesh,
            interval: Duration::from_millis(interval_ms),
            queue: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Forward one committed mutation.
    ///
    /// Sync mode returns once every currently connected follower has
    /// acknowledged (or dropped). Async mode only enqueues.
    pub async fn replicate(&self, op: WriteOp) {
        match self {
            Self::Sync(replicator) => replicator.replicate(&op).await,
            Self::Async(replicator) => replicator.enqueue(op),
        }
    }

    /// Start background tasks (the async drain timer).
    pub fn start(&self, shutdown: watch::Receiver<bool>) {
        if let Self::Async(replicator) = self {
            replicator.spawn_drain(shutdown);
        }
    }
}

/// Broadcast-and-await-acknowledgements replication.
pub struct SyncReplicator {
    mesh: Arc<PeerMesh>,
}

impl SyncReplicator {
    pub async fn replicate(&self, op: &WriteOp) {
        let links = self.mesh.connected_links();
        if links.is_empty() {
            return;
        }
        let sends = links.iter().map(|link| {
            let link = Arc::clone(link);
            async move {
                let result = link
                    .request(ClusterOperation::Replicate, ACK_TIMEOUT, |packet| {
                        op.encode(packet)
                    })
                    .await;
                if let Err(e) = result {
                    // Follower absence is success; it resyncs on reconnect.
                    tracing::debug!(
                        peer_id = link.peer_id,
                        key = op.key(),
                        error = %e,
                        "follower absent during sync replication"
                    );
                }
            }
        });
        join_all(sends).await;
    }
}

/// Timer-batched replication.
pub struct AsyncReplicator {
    mesh: Arc<PeerMesh>,
    interval: Duration,
    queue: Arc<Mutex<Vec<WriteOp>>>,
}

impl AsyncReplicator {
    /// Queue a mutation; order is preserved.
    pub fn enqueue(&self, op: WriteOp) {
        self.queue.lock().push(op);
    }

    /// Mutations waiting for the next drain.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    fn spawn_drain(&self, mut shutdown: watch::Receiver<bool>) {
        let mesh = Arc::clone(&self.mesh);
        let queue = Arc::clone(&self.queue);
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let batch: Vec<WriteOp> = std::mem::take(&mut *queue.lock());
                        if batch.is_empty() {
                            continue;
                        }
                        for link in mesh.connected_links() {
                            let result = link
                                .request(ClusterOperation::ReplicateBatch, ACK_TIMEOUT, |packet| {
                                    packet.write_var_uint(batch.len() as u64);
                                    for op in &batch {
                                        op.encode(packet);
                                    }
                                })
                                .await;
                            if let Err(e) = result {
                                tracing::debug!(
                                    peer_id = link.peer_id,
                                    batch = batch.len(),
                                    error = %e,
                                    "follower absent during batch replication"
                                );
                            }
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }
}
