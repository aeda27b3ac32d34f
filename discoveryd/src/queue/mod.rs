pub mod memory;
pub mod spool;

use std::time::Duration;
use anyhow::Result;
use async_trait::async_trait;

pub use memory::MemoryBroker;
pub use spool::SpoolBroker;

/// Visibility window used when a transport is not told otherwise
pub const DEFAULT_VISIBILITY: Duration = Duration::from_secs(30);

/// A message pulled from a queue. It stays on the queue until deleted
/// through its `handle`, hidden from other receives until its visibility
/// window lapses.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub handle: String,
    pub body: Vec<u8>,
}

/// Poll-based, at-least-once message queue with per-message delete.
/// Delivery order is whatever the transport gives.
#[async_trait]
pub trait QueueService: Send + Sync {
    async fn send(&self, destination: &str, body: Vec<u8>) -> Result<()>;

    /// Up to `max` visible messages from `queue`. Each one returned is
    /// hidden for the transport's visibility window.
    async fn receive_batch(&self, queue: &str, max: usize) -> Result<Vec<ReceivedMessage>>;

    async fn delete(&self, queue: &str, handle: &str) -> Result<()>;

    /// Messages still on the queue, hidden or not. For diagnostics and tests
    async fn size(&self, queue: &str) -> Result<usize>;
}
