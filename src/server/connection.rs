//! Client connection state and framing.
//!
//! Each accepted socket gets a [`ClientConnection`]: an id, an
//! authentication flag, the set of channels it subscribed to, and the
//! outbound frame queue drained by its writer task. Responses and pub/sub
//! pushes from concurrent handlers interleave at packet granularity, never
//! at byte granularity.

use crate::core::error::{StrataError, StrataResult};
use crate::protocol::{PacketBuffer, FRAME_HEADER_SIZE, MAX_PAYLOAD_LEN, MIN_PAYLOAD_LEN};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Length-prefix framing state machine.
///
/// The first 4 bytes of a receive are the big-endian expected payload
/// length; subsequent reads accumulate until that many bytes are buffered,
/// at which point one complete payload is handed out and the accumulator
/// resets for the next frame.
#[derive(Default)]
pub struct FrameAccumulator {
    expected: Option<usize>,
    buf: BytesMut,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes; returns every payload completed by them.
    ///
    /// A declared length outside the protocol bounds is a malformed frame
    /// and must terminate the connection.
    pub fn push(&mut self, data: &[u8]) -> StrataResult<Vec<BytesMut>> {
        self.buf.extend_from_slice(data);
        let mut complete = Vec::new();
        loop {
            match self.expected {
                None => {
                    if self.buf.len() < FRAME_HEADER_SIZE {
                        break;
                    }
                    let header = self.buf.split_to(FRAME_HEADER_SIZE);
                    let declared =
                        u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
                    if !(MIN_PAYLOAD_LEN..=MAX_PAYLOAD_LEN).contains(&declared) {
                        return Err(StrataError::malformed(format!(
                            "declared payload length {declared} out of bounds"
                        )));
                    }
                    self.expected = Some(declared);
                }
                Some(expected) => {
                    if self.buf.len() < expected {
                        break;
                    }
                    complete.push(self.buf.split_to(expected));
                    self.expected = None;
                }
            }
        }
        Ok(complete)
    }

    /// Bytes buffered but not yet forming a complete payload.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Per-connection shared state.
pub struct ClientConnection {
    /// Monotonic connection id.
    pub id: u64,

    /// Remote peer address.
    pub remote_addr: SocketAddr,

    authenticated: AtomicBool,
    writer: mpsc::UnboundedSender<PacketBuffer>,
    subscriptions: Mutex<HashSet<String>>,
}

impl ClientConnection {
    /// Create the connection state and the receiver its writer task drains.
    pub fn new(
        id: u64,
        remote_addr: SocketAddr,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PacketBuffer>) {
        let (writer, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                id,
                remote_addr,
                authenticated: AtomicBool::new(false),
                writer,
                subscriptions: Mutex::new(HashSet::new()),
            }),
            rx,
        )
    }

    /// Queue a frame for transmission. The frame is finalized here so every
    /// enqueued packet carries a correct length prefix.
    pub fn send(&self, mut frame: PacketBuffer) {
        frame.finalize();
        if self.writer.send(frame).is_err() {
            tracing::trace!(connection_id = self.id, "dropping frame for closed connection");
        }
    }

    /// Clone of the outbound queue sender, for pub/sub registration.
    pub fn writer(&self) -> mpsc::UnboundedSender<PacketBuffer> {
        self.writer.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn set_authenticated(&self, value: bool) {
        self.authenticated.store(value, Ordering::Release);
    }

    /// Remember a channel subscription for disconnect cleanup.
    pub fn track_subscription(&self, channel: &str) {
        self.subscriptions.lock().insert(channel.to_string());
    }

    pub fn untrack_subscription(&self, channel: &str) {
        self.subscriptions.lock().remove(channel);
    }

    /// Number of channels this connection subscribed to.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(payload: &[u8]) -> Vec<u8> {
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_accumulator_single_frame() {
        let mut acc = FrameAccumulator::new();
        let payload = [1u8, 0, 0, 0, 9];
        let complete = acc.push(&frame_bytes(&payload)).unwrap();
        assert_eq!(complete.len(), 1);
        assert_eq!(&complete[0][..], &payload);
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn test_accumulator_byte_by_byte() {
        let mut acc = FrameAccumulator::new();
        let payload = [2u8, 0, 0, 0, 7, 42];
        let wire = frame_bytes(&payload);

        for byte in &wire[..wire.len() - 1] {
            assert!(acc.push(std::slice::from_ref(byte)).unwrap().is_empty());
        }
        let complete = acc.push(&wire[wire.len() - 1..]).unwrap();
        assert_eq!(complete.len(), 1);
        assert_eq!(&complete[0][..], &payload);
    }

    #[test]
    fn test_accumulator_two_frames_in_one_read() {
        let mut acc = FrameAccumulator::new();
        let first = frame_bytes(&[1, 0, 0, 0, 1]);
        let second = frame_bytes(&[2, 0, 0, 0, 2]);
        let mut wire = first;
        wire.extend_from_slice(&second);

        let complete = acc.push(&wire).unwrap();
        assert_eq!(complete.len(), 2);
        assert_eq!(complete[0][0], 1);
        assert_eq!(complete[1][0], 2);
    }

    #[test]
    fn test_accumulator_rejects_short_declared_length() {
        let mut acc = FrameAccumulator::new();
        let wire = frame_bytes(&[1, 2]);
        assert!(acc.push(&wire).is_err());
    }

    #[test]
    fn test_accumulator_rejects_oversized_declared_length() {
        let mut acc = FrameAccumulator::new();
        let header = ((MAX_PAYLOAD_LEN + 1) as u32).to_be_bytes();
        assert!(acc.push(&header).is_err());
    }

    #[test]
    fn test_connection_auth_flag() {
        let (conn, _rx) = ClientConnection::new(1, "127.0.0.1:9999".parse().unwrap());
        assert!(!conn.is_authenticated());
        conn.set_authenticated(true);
        assert!(conn.is_authenticated());
    }

    #[test]
    fn test_subscription_tracking() {
        let (conn, _rx) = ClientConnection::new(1, "127.0.0.1:9999".parse().unwrap());
        conn.track_subscription("a");
        conn.track_subscription("a");
        conn.track_subscription("b");
        assert_eq!(conn.subscription_count(), 2);
        conn.untrack_subscription("a");
        assert_eq!(conn.subscription_count(), 1);
    }
}
