use std::collections::HashMap;
use std::sync::Arc;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use anyhow::Result;
use shared::message::{Envelope, MessageKind};
use crate::config::ListenerConfig;
use crate::processor::{Accepts, MessageProcessor};
use crate::queue::QueueService;

/// Polls one queue and hands decoded envelopes to processors.
///
/// Processors registered for an envelope's kind run first, then those
/// registered for any kind. Processor failures are logged and never stop
/// the loop or keep a message on the queue.
pub struct QueueListener {
    queue: Arc<dyn QueueService>,
    name: String,
    config: ListenerConfig,
    by_kind: HashMap<MessageKind, Vec<Arc<dyn MessageProcessor>>>,
    any: Vec<Arc<dyn MessageProcessor>>,
    cancel: CancellationToken,
}

impl QueueListener {
    pub fn new(
        queue: Arc<dyn QueueService>,
        name: impl Into<String>,
        config: ListenerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            name: name.into(),
            config,
            by_kind: HashMap::new(),
            any: Vec::new(),
            cancel,
        }
    }

    pub fn add_processor(&mut self, processor: Arc<dyn MessageProcessor>) {
        match processor.accepts() {
            Accepts::Kind(kind) => self.by_kind.entry(kind).or_default().push(processor),
            Accepts::Any => self.any.push(processor),
        }
    }

    /// Ask the loop to finish. Takes effect at the top of the next
    /// iteration or during the idle wait.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn dispatch(&self, envelope: &Envelope) {
        let specific = self.by_kind.get(&envelope.kind()).into_iter().flatten();
        for processor in specific.chain(self.any.iter()) {
            if let Err(e) = processor.process(envelope) {
                tracing::error!(
                    "Failed to process {} message from {}: {:#}",
                    envelope.kind().as_str(),
                    self.name,
                    e
                );
            }
        }
    }

    fn is_stale(&self, envelope: &Envelope) -> bool {
        // a timestamp from the future is never stale
        Utc::now()
            .signed_duration_since(envelope.timestamp())
            .to_std()
            .map(|age| age > self.config.max_age())
            .unwrap_or(false)
    }

    /// One receive/dispatch/delete cycle. Returns how many messages were
    /// consumed, which excludes any that failed to decode.
    pub async fn poll_once(&self) -> Result<usize> {
        let batch = self
            .queue
            .receive_batch(&self.name, self.config.batch_size)
            .await?;

        let mut handled = Vec::with_capacity(batch.len());
        for received in &batch {
            let envelope = match Envelope::decode(&received.body) {
                Ok(envelope) => envelope,
                Err(e) => {
                    // left on the queue for the transport to expire
                    tracing::error!("Failed to decode message {} on {}: {}", received.handle, self.name, e);
                    continue;
                }
            };

            if self.is_stale(&envelope) {
                tracing::debug!(
                    "Dropping stale {} message from {}",
                    envelope.kind().as_str(),
                    envelope.timestamp()
                );
            } else {
                self.dispatch(&envelope);
            }
            handled.push(received.handle.as_str());
        }

        for handle in &handled {
            if let Err(e) = self.queue.delete(&self.name, handle).await {
                tracing::error!("Failed to delete message {} on {}: {:#}", handle, self.name, e);
            }
        }

        Ok(handled.len())
    }

    pub async fn run(&self) {
        tracing::info!("Listening on queue {}", self.name);

        while !self.cancel.is_cancelled() {
            let handled = match self.poll_once().await {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("Failed to receive from {}: {:#}", self.name, e);
                    0
                }
            };

            // an all-undecodable batch counts as idle
            if handled == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.wait()) => {}
                    _ = self.cancel.cancelled() => break,
                }
            }
        }

        tracing::info!("Listener on {} shutting down", self.name);
    }
}
