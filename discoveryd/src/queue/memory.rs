use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use super::{QueueService, ReceivedMessage, DEFAULT_VISIBILITY};

struct Stored {
    id: u64,
    body: Vec<u8>,
    hidden_until: Option<Instant>,
}

impl Stored {
    fn visible(&self, now: Instant) -> bool {
        self.hidden_until.map_or(true, |until| until <= now)
    }
}

/// In-process broker holding any number of named queues
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<Stored>>>,
    next_id: AtomicU64,
    visibility: Duration,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::with_visibility(DEFAULT_VISIBILITY)
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_visibility(visibility: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            visibility,
        }
    }

    /// Remove and return every body on `queue`, hidden or not
    pub async fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        let mut queues = self.queues.lock().await;
        queues
            .get_mut(queue)
            .map(|q| q.drain(..).map(|stored| stored.body).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueService for MemoryBroker {
    async fn send(&self, destination: &str, body: Vec<u8>) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut queues = self.queues.lock().await;
        queues
            .entry(destination.to_string())
            .or_default()
            .push_back(Stored {
                id,
                body,
                hidden_until: None,
            });
        Ok(())
    }

    async fn receive_batch(&self, queue: &str, max: usize) -> Result<Vec<ReceivedMessage>> {
        let now = Instant::now();
        let mut queues = self.queues.lock().await;
        let Some(q) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let batch = q
            .iter_mut()
            .filter(|stored| stored.visible(now))
            .take(max)
            .map(|stored| {
                stored.hidden_until = Some(now + self.visibility);
                ReceivedMessage {
                    handle: stored.id.to_string(),
                    body: stored.body.clone(),
                }
            })
            .collect();
        Ok(batch)
    }

    async fn delete(&self, queue: &str, handle: &str) -> Result<()> {
        let mut queues = self.queues.lock().await;
        if let Some(q) = queues.get_mut(queue) {
            q.retain(|stored| stored.id.to_string() != handle);
        }
        Ok(())
    }

    async fn size(&self, queue: &str) -> Result<usize> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map(VecDeque::len).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_receive_hides_messages_until_deleted_or_lapsed() {
        let broker = MemoryBroker::new();
        broker.send("q", b"one".to_vec()).await.unwrap();
        broker.send("q", b"two".to_vec()).await.unwrap();
        broker.send("other", b"three".to_vec()).await.unwrap();

        let batch = broker.receive_batch("q", 10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(broker.size("q").await.unwrap(), 2);
        assert!(broker.receive_batch("q", 10).await.unwrap().is_empty());

        broker.delete("q", &batch[0].handle).await.unwrap();
        tokio::time::advance(DEFAULT_VISIBILITY).await;

        let batch = broker.receive_batch("q", 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, b"two");

        assert_eq!(broker.receive_batch("q", 0).await.unwrap().len(), 0);
        assert_eq!(broker.size("missing").await.unwrap(), 0);
        assert_eq!(broker.drain("other").await, vec![b"three".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_messages_do_not_block_later_ones() {
        let broker = MemoryBroker::with_visibility(Duration::from_secs(5));
        for body in ["a", "b", "c"] {
            broker.send("q", body.as_bytes().to_vec()).await.unwrap();
        }

        let first = broker.receive_batch("q", 2).await.unwrap();
        let second = broker.receive_batch("q", 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].body, b"c");

        tokio::time::advance(Duration::from_secs(5)).await;
        let again = broker.receive_batch("q", 10).await.unwrap();
        assert_eq!(again.len(), 3);
        assert_eq!(again[0].handle, first[0].handle);
    }
}
