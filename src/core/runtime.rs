//! Main runtime orchestration.
//!
//! Start order: cache and pub/sub → cluster (node-ready, election,
//! cluster-ready) → client listener → expiration sweeper. The client
//! listener only starts accepting once the cluster side is ready, so a
//! rejoining follower never serves stale state. Shutdown reverses the
//! order through a shared watch channel.

use crate::cache::{sweeper, Cache};
use crate::cluster::ClusterNode;
use crate::core::config::Config;
use crate::pubsub::PubSub;
use crate::server::{ClientListener, ListenerMetrics, ServerState};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Strata runtime holding all component handles.
pub struct Runtime {
    config: Arc<Config>,
    cache: Arc<Cache>,
    pubsub: Arc<PubSub>,
    metrics: Arc<ListenerMetrics>,
    cluster: Option<Arc<ClusterNode>>,
    started_at: Instant,
    client_addr: Option<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    listener_handle: Option<JoinHandle<()>>,
    sweeper_handle: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Create a runtime from a validated configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pubsub = Arc::new(PubSub::new());
        let cache = Arc::new(Cache::new(Arc::clone(&pubsub)));

        Ok(Self {
            config: Arc::new(config),
            cache,
            pubsub,
            metrics: Arc::new(ListenerMetrics::default()),
            cluster: None,
            started_at: Instant::now(),
            client_addr: None,
            shutdown_tx,
            shutdown_rx,
            listener_handle: None,
            sweeper_handle: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Actual client listener address, available after [`start`].
    ///
    /// [`start`]: Runtime::start
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    /// Whether this node currently holds cluster leadership (standalone
    /// nodes always do).
    pub fn is_leader(&self) -> bool {
        self.cluster
            .as_ref()
            .map(|cluster| cluster.is_leader())
            .unwrap_or(true)
    }

    /// Start all components. Returns once the client listener accepts.
    pub async fn start(&mut self) -> Result<()> {
        self.started_at = Instant::now();
        tracing::info!(
            ip = %self.config.ip,
            port = self.config.port,
            clustered = self.config.cluster.is_some(),
            "starting strata runtime"
        );

        if let Some(cluster_config) = self.config.cluster.clone() {
            let cluster = ClusterNode::new(cluster_config, Arc::clone(&self.cache));
            cluster.start(self.shutdown_rx.clone()).await?;
            self.cluster = Some(cluster);
        }

        let state = Arc::new(ServerState {
            config: Arc::clone(&self.config),
            cache: Arc::clone(&self.cache),
            pubsub: Arc::clone(&self.pubsub),
            metrics: Arc::clone(&self.metrics),
            started_at: self.started_at,
            cluster: self.cluster.clone(),
        });

        let listener = ClientListener::new(self.config.client_bind_addr()?, self.shutdown_rx.clone());
        let socket = listener
            .bind()
            .await
            .context("failed to bind client listener")?;
        let local_addr = socket
            .local_addr()
            .context("client listener has no local address")?;
        self.client_addr = Some(local_addr);
        tracing::info!(%local_addr, "client listener started");

        self.listener_handle = Some(tokio::spawn(listener.serve(socket, state)));
        self.sweeper_handle = sweeper::spawn(
            Arc::clone(&self.cache),
            self.config.expire_check_interval,
            self.shutdown_rx.clone(),
        );

        tracing::info!("strata runtime started");
        Ok(())
    }

    /// Run until ctrl-c or a shutdown signal, then stop.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop().await
    }

    /// Trigger graceful shutdown without waiting.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop all components in reverse start order.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping strata runtime");
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.listener_handle.take() {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
        }
        if let Some(handle) = self.sweeper_handle.take() {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
        }
        self.cluster = None;

        tracing::info!("strata runtime stopped");
        Ok(())
    }
}
