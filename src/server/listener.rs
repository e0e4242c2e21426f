//! Client socket server.
//!
//! One task accepts TCP connections and spawns a receive loop per
//! connection. Connection ids increase monotonically; accepted sockets get
//! TCP_NODELAY. A zero-byte read, an I/O error, or a malformed frame
//! terminates the connection and removes its subscriptions.

use super::connection::{ClientConnection, FrameAccumulator};
use super::dispatcher::{self, ServerState};
use crate::core::error::{StrataError, StrataResult};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Read chunk size for the receive loop.
const READ_CHUNK: usize = 16 * 1024;

/// Client listener metrics.
#[derive(Debug, Default)]
pub struct ListenerMetrics {
    /// Total connections accepted.
    pub connections_total: AtomicU64,

    /// Currently active connections.
    pub connections_active: AtomicU64,
}

impl ListenerMetrics {
    pub fn connection_accepted(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }
}

/// Client-facing TCP listener.
pub struct ClientListener {
    bind_addr: SocketAddr,
    next_conn_id: AtomicU64,
    shutdown_rx: watch::Receiver<bool>,
}

impl ClientListener {
    pub fn new(bind_addr: SocketAddr, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            next_conn_id: AtomicU64::new(1),
            shutdown_rx,
        }
    }

    /// Bind the listener socket.
    pub async fn bind(&self) -> StrataResult<TcpListener> {
        TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| StrataError::internal(format!("failed to bind {}: {e}", self.bind_addr)))
    }

    /// Accept connections until shutdown, spawning a receive loop for each.
    pub async fn serve(self, listener: TcpListener, state: Arc<ServerState>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote_addr)) => {
                            let _ = stream.set_nodelay(true);
                            let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                            state.metrics.connection_accepted();
                            tracing::debug!(connection_id = id, %remote_addr, "client connected");

                            let state = Arc::clone(&state);
                            let conn_shutdown = self.shutdown_rx.clone();
                            tokio::spawn(async move {
                                run_connection(state, stream, remote_addr, id, conn_shutdown).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    tracing::debug!("client listener stopping");
                    return;
                }
            }
        }
    }
}

/// Per-connection receive loop.
///
/// Complete packets are dispatched on their own tasks, so slow handlers do
/// not stall the read side; the writer task serializes their responses.
async fn run_connection(
    state: Arc<ServerState>,
    stream: TcpStream,
    remote_addr: SocketAddr,
    id: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (conn, mut outbound) = ClientConnection::new(id, remote_addr);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if writer.write_all(frame.frame()).await.is_err() {
                break;
            }
            // Dropping the frame returns its buffer to the pool after
            // transmission completes.
        }
    });

    let mut accumulator = FrameAccumulator::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let read = tokio::select! {
            read = reader.read(&mut chunk) => read,
            _ = shutdown.changed() => break,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(connection_id = id, error = %e, "read failed");
                break;
            }
        };
        match accumulator.push(&chunk[..n]) {
            Ok(payloads) => {
                for payload in payloads {
                    let state = Arc::clone(&state);
                    let conn = Arc::clone(&conn);
                    tokio::spawn(async move {
                        dispatcher::dispatch(state, conn, payload).await;
                    });
                }
            }
            Err(e) => {
                tracing::warn!(connection_id = id, error = %e, "closing on malformed frame");
                break;
            }
        }
    }

    state.pubsub.drop_connection(id);
    state.metrics.connection_closed();
    writer_task.abort();
    tracing::debug!(connection_id = id, "client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_track_active_connections() {
        let metrics = ListenerMetrics::default();
        metrics.connection_accepted();
        metrics.connection_accepted();
        metrics.connection_closed();
        assert_eq!(metrics.active_connections(), 1);
        assert_eq!(metrics.connections_total.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_listener_binds_ephemeral_port() {
        let (_tx, rx) = watch::channel(false);
        let listener = ClientListener::new("127.0.0.1:0".parse().unwrap(), rx);
        let socket = listener.bind().await.unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
    }
}
