use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use shared::message::SubscriptionMessage;
use crate::config::Cadence;
use crate::processor::AvailabilityProcessor;
use super::{heartbeat, Membership, Outbox};

/// A node that learns about other services from the monitor. Its view
/// holds only what it subscribed to and never expires on its own; the
/// monitor reports expiries.
pub struct Participant {
    pub availability: Arc<AvailabilityProcessor>,
    subscription: Option<SubscriptionMessage>,
}

impl Participant {
    pub fn new(membership: &Membership, inbox: &str) -> Self {
        let subscription = (!membership.subscribes.is_empty())
            .then(|| SubscriptionMessage::subscribe(membership.subscribes.clone(), inbox));

        Self {
            availability: Arc::new(AvailabilityProcessor::new(false)),
            subscription,
        }
    }

    /// Keep the monitor's subscription table fresh. Nodes without
    /// subscriptions run nothing.
    pub fn spawn_subscribe_heartbeat(
        &self,
        outbox: Outbox,
        monitor_queue: &str,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let subscription = self.subscription.clone()?;
        tracing::info!(
            "Subscribing to {} every {:?}",
            subscription.services.join(", "),
            interval
        );

        Some(tokio::spawn(heartbeat::run(
            outbox,
            monitor_queue.to_string(),
            subscription.into(),
            Cadence::Every(interval),
            cancel,
        )))
    }
}
