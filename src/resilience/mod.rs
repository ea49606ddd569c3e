//! Resilience layer: offline queue, degraded delivery and replay
//!
//! - `queue`: durable FIFO of operations awaiting replay
//! - `client`: wraps the service, falls back to the queue on outages
//! - `daemon`: tokio loop that replays and reconciles in the background

mod client;
mod daemon;
mod queue;

pub use client::{ClientError, Delivery, ReplayHandler, ReplayReport, ResilientClient};
pub use daemon::{DaemonConfig, ReplayDaemon};
pub use queue::{OfflineQueue, OperationKind, QueueError, QueuedOp, QueuedOperation};
