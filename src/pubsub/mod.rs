//! Channel publish/subscribe service.
//!
//! Maps channel names to subscriber lists. Lists are copy-on-write: publish
//! clones the current `Arc` under the map's shard lock and iterates without
//! holding it, so a slow subscriber never blocks subscribe/unsubscribe.
//!
//! Delivery is best-effort; a subscriber whose connection has gone away is
//! logged at debug and skipped. The reserved [`KEY_EXPIRATION_CHANNEL`]
//! carries the cache's key-expiration events.

use crate::protocol::{Operation, PacketBuffer, Status, TaggedValue};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Internal channel carrying expired key names as string payloads.
pub const KEY_EXPIRATION_CHANNEL: &str = "__key_expiration";

/// A subscribed connection: its id and its outbound frame queue.
#[derive(Clone)]
pub struct Subscriber {
    pub connection_id: u64,
    sender: mpsc::UnboundedSender<PacketBuffer>,
}

impl Subscriber {
    pub fn new(connection_id: u64, sender: mpsc::UnboundedSender<PacketBuffer>) -> Self {
        Self {
            connection_id,
            sender,
        }
    }
}

/// Channel → subscriber fanout.
#[derive(Default)]
pub struct PubSub {
    channels: DashMap<String, Arc<Vec<Subscriber>>>,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to a channel. Idempotent: re-subscribing
    /// replaces the connection's previous registration.
    ///
    /// Returns the channel's subscriber count after the update.
    pub fn subscribe(
        &self,
        channel: &str,
        connection_id: u64,
        sender: mpsc::UnboundedSender<PacketBuffer>,
    ) -> usize {
        let mut entry = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(Vec::new()));
        let mut subscribers = entry.value().as_ref().clone();
        subscribers.retain(|s| s.connection_id != connection_id);
        subscribers.push(Subscriber::new(connection_id, sender));
        let count = subscribers.len();
        *entry.value_mut() = Arc::new(subscribers);
        count
    }

    /// Unsubscribe a connection from a channel. Idempotent.
    pub fn unsubscribe(&self, channel: &str, connection_id: u64) {
        let now_empty = match self.channels.get_mut(channel) {
            Some(mut entry) => {
                let mut subscribers = entry.value().as_ref().clone();
                subscribers.retain(|s| s.connection_id != connection_id);
                let now_empty = subscribers.is_empty();
                *entry.value_mut() = Arc::new(subscribers);
                now_empty
            }
            None => return,
        };
        if now_empty {
            self.channels.remove_if(channel, |_, subs| subs.is_empty());
        }
    }

    /// Remove a closed connection from every channel it subscribed to.
    pub fn drop_connection(&self, connection_id: u64) {
        self.channels.retain(|_, subscribers| {
            if subscribers
                .iter()
                .any(|s| s.connection_id == connection_id)
            {
                let mut filtered = subscribers.as_ref().clone();
                filtered.retain(|s| s.connection_id != connection_id);
                if filtered.is_empty() {
                    return false;
                }
                *subscribers = Arc::new(filtered);
            }
            true
        });
    }

    /// Publish a payload to every current subscriber of a channel.
    ///
    /// Returns the number of subscribers the frame was queued for.
    pub fn publish(&self, channel: &str, payload: &TaggedValue) -> usize {
        let subscribers = match self.channels.get(channel) {
            Some(entry) => Arc::clone(entry.value()),
            None => return 0,
        };

        let mut template = PacketBuffer::response(Operation::Publish, 0, Status::Ok);
        template.write_string(channel);
        template.write_tagged(payload);
        template.finalize();

        let mut delivered = 0;
        for subscriber in subscribers.iter() {
            let frame = PacketBuffer::copy_of(&template);
            if subscriber.sender.send(frame).is_err() {
                tracing::debug!(
                    channel,
                    connection_id = subscriber.connection_id,
                    "dropping publish to closed subscriber"
                );
            } else {
                delivered += 1;
            }
        }
        delivered
    }

    /// Publish a key-expiration event on the reserved channel.
    pub fn publish_key_expiration(&self, key: &str) {
        self.publish(
            KEY_EXPIRATION_CHANNEL,
            &TaggedValue::String(key.to_string()),
        );
    }

    /// Subscriber count for a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|entry| entry.value().len())
            .unwrap_or(0)
    }

    /// Number of channels with at least one subscriber.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
