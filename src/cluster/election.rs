//! Bully leader election.
//!
//! The node with the highest live id wins. An election round sends
//! `Election` to every peer with a higher id; if none acknowledges within
//! the election timeout the node declares itself leader and broadcasts
//! `Victory`. If a higher peer acknowledges, the node waits for that peer's
//! `Victory` and restarts the round when it never arrives.
//!
//! The elected leader broadcasts `Alive` every heartbeat interval; a
//! follower that misses heartbeats for longer than the missing-leader
//! timeout restarts the election. Ids are unique, so ties are impossible.

use super::mesh::PeerMesh;
use crate::core::config::ElectionConfig;
use crate::protocol::ClusterOperation;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Election timing derived from configuration.
#[derive(Debug, Clone, Copy)]
pub struct ElectionTiming {
    pub heartbeat_interval: Duration,
    pub missing_timeout: Duration,
    pub election_timeout: Duration,
}

impl From<&ElectionConfig> for ElectionTiming {
    fn from(config: &ElectionConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(config.leader_heartbeat_interval_ms),
            missing_timeout: Duration::from_millis(config.leader_missing_timeout_ms),
            election_timeout: Duration::from_millis(config.election_timeout_ms),
        }
    }
}

/// Per-node election state.
pub struct Election {
    node_id: u32,
    mesh: Arc<PeerMesh>,
    timing: ElectionTiming,
    leader_tx: watch::Sender<Option<u32>>,
    in_election: AtomicBool,
    last_alive_at: Mutex<Instant>,
}

impl Election {
    pub fn new(node_id: u32, mesh: Arc<PeerMesh>, timing: ElectionTiming) -> Arc<Self> {
        let (leader_tx, _) = watch::channel(None);
        Arc::new(Self {
            node_id,
            mesh,
            timing,
            leader_tx,
            in_election: AtomicBool::new(false),
            last_alive_at: Mutex::new(Instant::now()),
        })
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// The currently known leader, if any.
    pub fn leader_id(&self) -> Option<u32> {
        *self.leader_tx.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.leader_id() == Some(self.node_id)
    }

    /// Watch channel following leader changes.
    pub fn leader_watch(&self) -> watch::Receiver<Option<u32>> {
        self.leader_tx.subscribe()
    }

    /// Run one election, restarting on timeout, until a leader is known.
    ///
    /// Re-entrant calls while a round is in flight return immediately.
    pub async fn start_election(self: Arc<Self>) {
        if self.in_election.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(node_id = self.node_id, "starting election");
        let mut leader_rx = self.leader_tx.subscribe();

        loop {
            let higher = self.mesh.links_with_higher_id(self.node_id);
            let acknowledgements = join_all(higher.iter().map(|link| {
                link.request(
                    ClusterOperation::Election,
                    self.timing.election_timeout,
                    |packet| packet.write_u32(self.node_id),
                )
            }))
            .await;

            let any_higher_alive = acknowledgements.iter().any(|result| result.is_ok());

            if !any_higher_alive {
                self.become_leader();
                return;
            }

            // A higher peer answered; wait for its victory broadcast.
            let wait = tokio::time::timeout(self.timing.election_timeout, async {
                loop {
                    if leader_rx.borrow_and_update().is_some() {
                        return;
                    }
                    if leader_rx.changed().await.is_err() {
                        return;
                    }
                }
            })
            .await;

            match wait {
                Ok(()) if self.leader_id().is_some() => {
                    self.in_election.store(false, Ordering::SeqCst);
                    return;
                }
                _ => {
                    tracing::debug!(node_id = self.node_id, "no victory received, restarting election");
                }
            }
        }
    }

    fn become_leader(&self) {
        tracing::info!(node_id = self.node_id, "elected leader");
        self.leader_tx.send_replace(Some(self.node_id));
        self.in_election.store(false, Ordering::SeqCst);
        let node_id = self.node_id;
        self.mesh
            .broadcast(ClusterOperation::Victory, |packet| packet.write_u32(node_id));
    }

    /// An `Election` arrived from a candidate. The acknowledgement is
    /// written by the peer server; a candidate with a lower id additionally
    /// triggers our own election round.
    pub fn handle_election(self: &Arc<Self>, candidate_id: u32) {
        tracing::debug!(
            node_id = self.node_id,
            candidate_id,
            "election request received"
        );
        if candidate_id < self.node_id && !self.in_election.load(Ordering::SeqCst) {
            let election = Arc::clone(self);
            tokio::spawn(election.start_election());
        }
    }

    /// A `Victory` broadcast arrived.
    pub fn handle_victory(&self, leader_id: u32) {
        tracing::info!(node_id = self.node_id, leader_id, "leader announced");
        *self.last_alive_at.lock() = Instant::now();
        self.leader_tx.send_replace(Some(leader_id));
        self.in_election.store(false, Ordering::SeqCst);
    }

    /// A leader heartbeat arrived.
    pub fn handle_alive(&self, leader_id: u32) {
        tracing::trace!(node_id = self.node_id, leader_id, "leader alive");
        *self.last_alive_at.lock() = Instant::now();
    }

    /// Milliseconds since the last leader heartbeat.
    fn since_last_alive(&self) -> Duration {
        self.last_alive_at.lock().elapsed()
    }

    /// Leader-side heartbeat task: broadcast `Alive` on every interval
    /// while this node holds leadership.
    pub fn spawn_heartbeat(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.timing.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.is_leader() {
                            let node_id = self.node_id;
                            self.mesh.broadcast(ClusterOperation::Alive, |packet| {
                                packet.write_u32(node_id)
                            });
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    /// Follower-side watchdog: restart the election when the leader has
    /// been silent past the missing-leader timeout.
    pub fn spawn_watchdog(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.timing.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.is_leader() || self.in_election.load(Ordering::SeqCst) {
                            continue;
                        }
                        if self.leader_id().is_some()
                            && self.since_last_alive() > self.timing.missing_timeout
                        {
                            tracing::warn!(
                                node_id = self.node_id,
                                "leader missing, restarting election"
                            );
                            self.leader_tx.send_replace(None);
                            let election = Arc::clone(&self);
                            tokio::spawn(election.start_election());
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }
}
