//! Cache entries and value shapes.
//!
//! A key holds exactly one [`Value`] shape at a time together with its
//! insertion time and TTL. `ttl_ms == 0` means the entry never expires.

use crate::core::error::{StrataError, StrataResult};
use crate::protocol::{PacketBuffer, TaggedValue};
use std::collections::HashMap;
use std::time::Instant;

/// Wire tag for each value shape, used by snapshots.
mod shape_tag {
    pub const STRING: u8 = 0;
    pub const BYTES: u8 = 1;
    pub const LIST: u8 = 2;
    pub const MAP: u8 = 3;
    pub const COUNTER: u8 = 4;
}

/// The value shape stored under a key.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Text, possibly null under a present key.
    String(Option<String>),
    /// Raw bytes, possibly null under a present key.
    Bytes(Option<Vec<u8>>),
    /// Ordered list of text items; duplicates permitted.
    List(Vec<String>),
    /// Sub-key to tagged value mapping.
    Map(HashMap<String, TaggedValue>),
    /// Signed 64-bit counter; always has infinite TTL.
    Counter(i64),
}

impl Value {
    /// Shape name for mismatch errors.
    pub fn shape(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Counter(_) => "counter",
        }
    }

    /// Encode shape tag and payload for snapshot transfer.
    pub fn encode(&self, packet: &mut PacketBuffer) {
        match self {
            Self::String(text) => {
                packet.write_u8(shape_tag::STRING);
                packet.write_opt_string(text.as_deref());
            }
            Self::Bytes(bytes) => {
                packet.write_u8(shape_tag::BYTES);
                packet.write_opt_bytes(bytes.as_deref());
            }
            Self::List(items) => {
                packet.write_u8(shape_tag::LIST);
                packet.write_var_uint(items.len() as u64);
                for item in items {
                    packet.write_string(item);
                }
            }
            Self::Map(entries) => {
                packet.write_u8(shape_tag::MAP);
                packet.write_tagged_map(entries);
            }
            Self::Counter(value) => {
                packet.write_u8(shape_tag::COUNTER);
                packet.write_i64(*value);
            }
        }
    }

    /// Decode a shape tag and payload.
    pub fn decode(packet: &mut PacketBuffer) -> StrataResult<Self> {
        match packet.read_u8()? {
            shape_tag::STRING => Ok(Self::String(packet.read_opt_string()?)),
            shape_tag::BYTES => Ok(Self::Bytes(packet.read_opt_bytes()?)),
            shape_tag::LIST => {
                let count = packet.read_var_uint()? as usize;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(packet.read_string()?);
                }
                Ok(Self::List(items))
            }
            shape_tag::MAP => Ok(Self::Map(packet.read_tagged_map()?)),
            shape_tag::COUNTER => Ok(Self::Counter(packet.read_i64()?)),
            other => Err(StrataError::malformed(format!(
                "unknown value shape tag: {other}"
            ))),
        }
    }
}

/// A stored value with its insertion time and TTL.
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Value,
    pub inserted_at: Instant,
    pub ttl_ms: u64,
}

impl Entry {
    /// Create an entry inserted now.
    pub fn new(value: Value, ttl_ms: u64) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
            ttl_ms,
        }
    }

    /// Whether the TTL has elapsed. Zero TTL never expires.
    pub fn is_expired(&self) -> bool {
        self.ttl_ms != 0 && self.inserted_at.elapsed().as_millis() as u64 >= self.ttl_ms
    }

    /// Milliseconds of TTL left, `0` meaning infinite.
    ///
    /// Callers shipping snapshots must skip already-expired entries so the
    /// zero-means-infinite convention survives the transfer.
    pub fn remaining_ttl_ms(&self) -> u64 {
        if self.ttl_ms == 0 {
            return 0;
        }
        self.ttl_ms
            .saturating_sub(self.inserted_at.elapsed().as_millis() as u64)
    }
}
