//! Configuration parsing and validation.
//!
//! Strata configuration is loaded from TOML files. The top level describes
//! the client listener; the optional `[cluster]` block enables the peer
//! mesh, election, and replication.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Top-level Strata configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Client listener bind address.
    #[serde(default = "default_ip")]
    pub ip: String,

    /// Client listener port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client listener backlog hint.
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Shared client password.
    pub password: String,

    /// Cache sweep interval in milliseconds. Zero disables the sweeper;
    /// lazy expiry still runs.
    #[serde(default = "default_expire_check_interval")]
    pub expire_check_interval: u64,

    /// Cluster membership, election, and replication.
    #[serde(default)]
    pub cluster: Option<ClusterConfig>,
}

/// Cluster configuration block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// This node's unique id.
    pub id: u32,

    /// Cluster listener bind address.
    pub ip: String,

    /// Cluster listener port.
    pub port: u16,

    /// Shared cluster password for the peer handshake.
    pub password: String,

    /// Static peer list, excluding this node.
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,

    /// Election timing.
    #[serde(default)]
    pub election: ElectionConfig,

    /// Replication strategy.
    pub replication: ReplicationConfig,
}

/// A peer node address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: u32,
    pub host: String,
    pub port: u16,
}

/// Election timing in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// How often the leader broadcasts `Alive`.
    #[serde(default = "default_leader_heartbeat_interval_ms")]
    pub leader_heartbeat_interval_ms: u64,

    /// How long a follower waits without `Alive` before re-electing.
    #[serde(default = "default_leader_missing_timeout_ms")]
    pub leader_missing_timeout_ms: u64,

    /// How long an election round waits for higher peers.
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            leader_heartbeat_interval_ms: default_leader_heartbeat_interval_ms(),
            leader_missing_timeout_ms: default_leader_missing_timeout_ms(),
            election_timeout_ms: default_election_timeout_ms(),
        }
    }
}

/// Replication strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// "sync" or "async".
    #[serde(rename = "type")]
    pub kind: ReplicationKind,

    /// Batch interval for async replication. Required when `kind` is async.
    #[serde(default)]
    pub interval_milliseconds: Option<u64>,
}

/// Replication strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationKind {
    /// The leader awaits follower acknowledgements before answering.
    Sync,
    /// Mutations are batched and shipped on an interval.
    Async,
}

// Default value functions

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6565
}

fn default_backlog() -> u32 {
    128
}

fn default_expire_check_interval() -> u64 {
    1_000
}

fn default_leader_heartbeat_interval_ms() -> u64 {
    1_000
}

fn default_leader_missing_timeout_ms() -> u64 {
    3_000
}

fn default_election_timeout_ms() -> u64 {
    1_000
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Client listener bind address.
    pub fn client_bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.ip, self.port)
            .parse()
            .with_context(|| format!("invalid client bind address {}:{}", self.ip, self.port))
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        if self.password.is_empty() {
            anyhow::bail!("password must not be empty");
        }
        self.client_bind_addr()?;

        if let Some(ref cluster) = self.cluster {
            cluster.validate()?;
        }
        Ok(())
    }
}

impl ClusterConfig {
    /// Cluster listener bind address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.ip, self.port)
            .parse()
            .with_context(|| format!("invalid cluster bind address {}:{}", self.ip, self.port))
    }

    fn validate(&self) -> Result<()> {
        if self.password.is_empty() {
            anyhow::bail!("cluster.password must not be empty");
        }
        self.bind_addr()?;

        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if node.id == self.id {
                anyhow::bail!("cluster.nodes must not contain this node's id ({})", self.id);
            }
            if !seen.insert(node.id) {
                anyhow::bail!("cluster.nodes contains duplicate id {}", node.id);
            }
            if node.host.is_empty() {
                anyhow::bail!("cluster.nodes entry {} has an empty host", node.id);
            }
        }

        let election = &self.election;
        if election.leader_heartbeat_interval_ms == 0
            || election.leader_missing_timeout_ms == 0
            || election.election_timeout_ms == 0
        {
            anyhow::bail!("cluster.election intervals must be > 0");
        }
        if election.leader_missing_timeout_ms <= election.leader_heartbeat_interval_ms {
            anyhow::bail!(
                "cluster.election.leader_missing_timeout_ms ({}) must exceed the heartbeat interval ({})",
                election.leader_missing_timeout_ms,
                election.leader_heartbeat_interval_ms
            );
        }

        match self.replication.kind {
            ReplicationKind::Sync => {}
            ReplicationKind::Async => match self.replication.interval_milliseconds {
                Some(interval) if interval > 0 => {}
                _ => anyhow::bail!(
                    "cluster.replication.interval_milliseconds required and > 0 for async replication"
                ),
            },
        }
        Ok(())
    }
}
