//! Operation handlers.
//!
//! Each handler reads its payload fields, performs the cache or pub/sub
//! work, and builds the response packet tagged with the same operation and
//! request id. Mutations on an elected leader are handed to the replicator
//! after local commit.

use super::connection::ClientConnection;
use super::dispatcher::ServerState;
use crate::cluster::replication::WriteOp;
use crate::core::error::{StrataError, StrataResult};
use crate::protocol::{Operation, PacketBuffer, Status, PROTOCOL_VERSION};
use std::sync::Arc;

/// Route one authenticated request (or a login) to its handler.
pub async fn handle(
    state: &Arc<ServerState>,
    conn: &Arc<ClientConnection>,
    op: Operation,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    match op {
        Operation::Login => login(state, conn, request_id, packet).await,
        Operation::GetString => get_string(state, request_id, packet).await,
        Operation::SetString => set_string(state, request_id, packet).await,
        Operation::GetList => get_list(state, request_id, packet).await,
        Operation::AddList => add_list(state, request_id, packet).await,
        Operation::RemoveList => remove_list(state, request_id, packet).await,
        Operation::ContainsList => contains_list(state, request_id, packet).await,
        Operation::Exists => exists(state, request_id, packet).await,
        Operation::Delete => delete(state, request_id, packet).await,
        Operation::GetObjectBinary | Operation::GetBytes => {
            get_bytes(state, op, request_id, packet).await
        }
        Operation::SetObjectBinary | Operation::SetBytes => {
            set_bytes(state, op, request_id, packet).await
        }
        Operation::GetStats => get_stats(state, request_id),
        Operation::SetCounter => set_counter(state, request_id, packet).await,
        Operation::IncrementCounter => increment_counter(state, request_id, packet).await,
        Operation::Bulk => bulk(state, request_id, packet).await,
        Operation::GetMapValue => get_map_value(state, request_id, packet).await,
        Operation::SetMapValue => set_map_value(state, request_id, packet).await,
        Operation::GetMap => get_map(state, request_id, packet).await,
        Operation::SetMap => set_map(state, request_id, packet).await,
        Operation::Subscribe => subscribe(state, conn, request_id, packet),
        Operation::Unsubscribe => unsubscribe(state, conn, request_id, packet),
        Operation::Publish => publish(state, request_id, packet),
    }
}

fn ok(op: Operation, request_id: u32) -> PacketBuffer {
    PacketBuffer::response(op, request_id, Status::Ok)
}

fn read_key(packet: &mut PacketBuffer) -> StrataResult<String> {
    let key = packet.read_string()?;
    if key.is_empty() {
        return Err(StrataError::invalid("key must not be empty"));
    }
    Ok(key)
}

fn read_list_element(packet: &mut PacketBuffer) -> StrataResult<String> {
    packet
        .read_opt_string()?
        .ok_or_else(|| StrataError::invalid("list element must not be null"))
}

// ----------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------

async fn login(
    state: &Arc<ServerState>,
    conn: &Arc<ClientConnection>,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let version = packet.read_u8()?;
    let password = packet.read_string()?;

    if version != PROTOCOL_VERSION {
        return Err(StrataError::ProtocolVersionMismatch {
            expected: PROTOCOL_VERSION,
            got: version,
        });
    }

    let authenticated = password == state.config.password;
    conn.set_authenticated(authenticated);
    if !authenticated {
        tracing::debug!(connection_id = conn.id, "login rejected: bad password");
    }

    let mut response = ok(Operation::Login, request_id);
    response.write_bool(authenticated);
    if authenticated {
        response.write_i32(state.cluster_id());
        response.write_bool(state.is_leader());
    } else {
        response.write_i32(0);
        response.write_bool(false);
    }
    Ok(response)
}

fn get_stats(state: &Arc<ServerState>, request_id: u32) -> StrataResult<PacketBuffer> {
    let stats = state.cache.stats().snapshot();
    let mut response = ok(Operation::GetStats, request_id);
    response.write_var_uint(state.started_at.elapsed().as_secs());
    response.write_u64(state.metrics.active_connections());
    response.write_u64(state.cache.size() as u64);
    response.write_u64(stats.hits);
    response.write_u64(stats.misses);
    response.write_f32(stats.hit_ratio);
    Ok(response)
}

// ----------------------------------------------------------------------
// Strings and bytes
// ----------------------------------------------------------------------

async fn get_string(
    state: &Arc<ServerState>,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let key = read_key(packet)?;
    let value = state.cache.get_string(&key, true).await?;
    let mut response = ok(Operation::GetString, request_id);
    response.write_opt_string(value.as_deref());
    Ok(response)
}

async fn set_string(
    state: &Arc<ServerState>,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let key = read_key(packet)?;
    let value = packet.read_opt_string()?;
    let ttl_ms = packet.read_var_uint()?;
    state
        .cache
        .set_string(&key, value.clone(), ttl_ms, true)
        .await?;
    state
        .replicate(WriteOp::SetString { key, value, ttl_ms })
        .await;
    Ok(ok(Operation::SetString, request_id))
}

async fn get_bytes(
    state: &Arc<ServerState>,
    op: Operation,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let key = read_key(packet)?;
    let value = state.cache.get_bytes(&key, true).await?;
    let mut response = ok(op, request_id);
    response.write_opt_bytes(value.as_deref());
    Ok(response)
}

async fn set_bytes(
    state: &Arc<ServerState>,
    op: Operation,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let key = read_key(packet)?;
    let value = packet.read_opt_bytes()?;
    let ttl_ms = packet.read_var_uint()?;
    state
        .cache
        .set_bytes(&key, value.clone(), ttl_ms, true)
        .await?;
    state
        .replicate(WriteOp::SetBytes { key, value, ttl_ms })
        .await;
    Ok(ok(op, request_id))
}

// ----------------------------------------------------------------------
// Lists
// ----------------------------------------------------------------------

async fn get_list(
    state: &Arc<ServerState>,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let key = read_key(packet)?;
    let items = state.cache.get_list(&key, true).await?;
    let mut response = ok(Operation::GetList, request_id);
    response.write_var_uint(items.len() as u64);
    for item in &items {
        response.write_string(item);
    }
    Ok(response)
}

async fn add_list(
    state: &Arc<ServerState>,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let key = read_key(packet)?;
    let value = read_list_element(packet)?;
    let ttl_ms = packet.read_var_uint()?;
    state
        .cache
        .add_list(&key, value.clone(), ttl_ms, true)
        .await?;
    state
        .replicate(WriteOp::AddList { key, value, ttl_ms })
        .await;
    Ok(ok(Operation::AddList, request_id))
}

async fn remove_list(
    state: &Arc<ServerState>,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let key = read_key(packet)?;
    let value = read_list_element(packet)?;
    state.cache.remove_list(&key, &value, true).await?;
    state.replicate(WriteOp::RemoveList { key, value }).await;
    Ok(ok(Operation::RemoveList, request_id))
}

async fn contains_list(
    state: &Arc<ServerState>,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let key = read_key(packet)?;
    let value = read_list_element(packet)?;
    let found = state.cache.contains_list(&key, &value, true).await?;
    let mut response = ok(Operation::ContainsList, request_id);
    response.write_bool(found);
    Ok(response)
}

// ----------------------------------------------------------------------
// Presence
// ----------------------------------------------------------------------

async fn exists(
    state: &Arc<ServerState>,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let key = read_key(packet)?;
    let present = state.cache.exists(&key, true).await?;
    let mut response = ok(Operation::Exists, request_id);
    response.write_bool(present);
    Ok(response)
}

async fn delete(
    state: &Arc<ServerState>,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let key = read_key(packet)?;
    state.cache.delete(&key, true).await?;
    state.replicate(WriteOp::Delete { key }).await;
    Ok(ok(Operation::Delete, request_id))
}

// ----------------------------------------------------------------------
// Counters
// ----------------------------------------------------------------------

async fn set_counter(
    state: &Arc<ServerState>,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let key = read_key(packet)?;
    let value = packet.read_i64()?;
    state.cache.set_counter(&key, value, true).await?;
    state.replicate(WriteOp::SetCounter { key, value }).await;
    Ok(ok(Operation::SetCounter, request_id))
}

async fn increment_counter(
    state: &Arc<ServerState>,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let key = read_key(packet)?;
    let delta = packet.read_i64()?;
    let updated = state.cache.increment_counter(&key, delta, true).await?;
    state
        .replicate(WriteOp::IncrementCounter { key, delta })
        .await;
    let mut response = ok(Operation::IncrementCounter, request_id);
    response.write_i64(updated);
    Ok(response)
}

// ----------------------------------------------------------------------
// Maps
// ----------------------------------------------------------------------

async fn get_map_value(
    state: &Arc<ServerState>,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let key = read_key(packet)?;
    let sub_key = packet.read_string()?;
    let value = state.cache.get_map_value(&key, &sub_key, true).await?;
    let mut response = ok(Operation::GetMapValue, request_id);
    response.write_tagged(&value);
    Ok(response)
}

async fn set_map_value(
    state: &Arc<ServerState>,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let key = read_key(packet)?;
    let sub_key = packet.read_string()?;
    let value = packet.read_tagged()?;
    // The trailing TTL only applies to whole-map set operations; sub-key
    // mutation never touches the container's TTL.
    let _ttl_ms = packet.read_var_uint()?;
    state
        .cache
        .set_map_value(&key, sub_key.clone(), value.clone(), true)
        .await?;
    state
        .replicate(WriteOp::SetMapValue {
            key,
            sub_key,
            value,
        })
        .await;
    Ok(ok(Operation::SetMapValue, request_id))
}

async fn get_map(
    state: &Arc<ServerState>,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let key = read_key(packet)?;
    let entries = state.cache.get_map(&key, true).await?;
    let mut response = ok(Operation::GetMap, request_id);
    response.write_tagged_map(&entries);
    Ok(response)
}

async fn set_map(
    state: &Arc<ServerState>,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let key = read_key(packet)?;
    let entries = packet.read_tagged_map()?;
    let ttl_ms = packet.read_var_uint()?;
    state
        .cache
        .set_map(&key, entries.clone(), ttl_ms, true)
        .await?;
    state
        .replicate(WriteOp::SetMap {
            key,
            entries,
            ttl_ms,
        })
        .await;
    Ok(ok(Operation::SetMap, request_id))
}

// ----------------------------------------------------------------------
// Pub/Sub
// ----------------------------------------------------------------------

fn subscribe(
    state: &Arc<ServerState>,
    conn: &Arc<ClientConnection>,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let channel = packet.read_string()?;
    state.pubsub.subscribe(&channel, conn.id, conn.writer());
    conn.track_subscription(&channel);
    Ok(ok(Operation::Subscribe, request_id))
}

fn unsubscribe(
    state: &Arc<ServerState>,
    conn: &Arc<ClientConnection>,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let channel = packet.read_string()?;
    state.pubsub.unsubscribe(&channel, conn.id);
    conn.untrack_subscription(&channel);
    Ok(ok(Operation::Unsubscribe, request_id))
}

fn publish(
    state: &Arc<ServerState>,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let channel = packet.read_string()?;
    let payload = packet.read_tagged()?;
    state.pubsub.publish(&channel, &payload);
    Ok(ok(Operation::Publish, request_id))
}

// ----------------------------------------------------------------------
// Bulk
// ----------------------------------------------------------------------

/// Execute an envelope of inlined sub-requests.
///
/// Only get/set string, exists, and delete are valid inside a bulk; any
/// other operation code fails the whole envelope with an `Error` response.
async fn bulk(
    state: &Arc<ServerState>,
    request_id: u32,
    packet: &mut PacketBuffer,
) -> StrataResult<PacketBuffer> {
    let count = packet.read_var_uint()?;
    let mut response = ok(Operation::Bulk, request_id);
    response.write_var_uint(count);

    for _ in 0..count {
        let sub_op_byte = packet.read_u8()?;
        let sub_op = Operation::try_from(sub_op_byte).map_err(|unknown| {
            StrataError::invalid(format!("unknown operation code {unknown} in bulk"))
        })?;
        match sub_op {
            Operation::GetString => {
                let key = read_key(packet)?;
                let value = state.cache.get_string(&key, true).await?;
                response.write_u8(sub_op as u8);
                response.write_u8(Status::Ok as u8);
                response.write_opt_string(value.as_deref());
            }
            Operation::SetString => {
                let key = read_key(packet)?;
                let value = packet.read_opt_string()?;
                let ttl_ms = packet.read_var_uint()?;
                state
                    .cache
                    .set_string(&key, value.clone(), ttl_ms, true)
                    .await?;
                state
                    .replicate(WriteOp::SetString { key, value, ttl_ms })
                    .await;
                response.write_u8(sub_op as u8);
                response.write_u8(Status::Ok as u8);
            }
            Operation::Exists => {
                let key = read_key(packet)?;
                let present = state.cache.exists(&key, true).await?;
                response.write_u8(sub_op as u8);
                response.write_u8(Status::Ok as u8);
                response.write_bool(present);
            }
            Operation::Delete => {
                let key = read_key(packet)?;
                state.cache.delete(&key, true).await?;
                state.replicate(WriteOp::Delete { key }).await;
                response.write_u8(sub_op as u8);
                response.write_u8(Status::Ok as u8);
            }
            other => {
                return Err(StrataError::invalid(format!(
                    "operation {other:?} not supported in bulk"
                )));
            }
        }
    }
    Ok(response)
}
