//! Client-facing socket server.
//!
//! - [`listener`] - accept loop and per-connection receive loops
//! - [`connection`] - framing state and connection-shared state
//! - [`dispatcher`] - authentication gate and operation routing
//! - [`handlers`] - one handler per client operation

pub mod connection;
pub mod dispatcher;
pub mod handlers;
pub mod listener;

pub use connection::{ClientConnection, FrameAccumulator};
pub use dispatcher::ServerState;
pub use listener::{ClientListener, ListenerMetrics};
