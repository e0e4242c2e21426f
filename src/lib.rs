//! Strata - in-memory networked key-value cache with optional
//! active-active clustering.
//!
//! Clients connect over a framed TCP protocol and manipulate typed keys
//! (string, bytes, list, map, counter), each with an optional TTL. A
//! publish/subscribe facility rides alongside the cache and carries the
//! internal key-expiration event stream. In cluster mode, nodes form an
//! authenticated peer mesh, elect a leader by highest id, and replicate
//! writes either synchronously or in timed batches; rejoining followers
//! pull a full snapshot from the leader before serving.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Client Protocol                       │
//! │        length-prefixed frames, op + request id + body       │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Server + Dispatcher                      │
//! │      accept loop │ framing │ auth gate │ op handlers        │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Cache Engine                          │
//! │   keyed locks │ typed entries │ TTL │ stats │ sweeper       │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Cluster Control Plane                   │
//! │    peer mesh │ bully election │ sync/async replication      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - [`core::config`] - configuration parsing and validation
//! - [`core::runtime`] - startup/shutdown orchestration
//! - [`core::error`] - error types
//! - [`protocol`] - framing, packet buffers, tagged values
//! - [`cache`] - keyed lock table, typed entry store, sweeper
//! - [`pubsub`] - channel fanout and key-expiration events
//! - [`server`] - client listener, dispatcher, operation handlers
//! - [`cluster`] - peer mesh, leader election, replication

pub mod cache;
pub mod cli;
pub mod cluster;
pub mod core;
pub mod protocol;
pub mod pubsub;
pub mod server;
