use std::sync::Mutex;
use anyhow::Result;
use shared::message::{Envelope, Message, MessageKind, SubscriptionMessage};
use super::{lock, Accepts, Hooks, MessageProcessor};

/// Which destinations want updates for which services
pub struct SubscriptionProcessor {
    subscribers: Mutex<Vec<(String, Vec<String>)>>,
    hooks: Hooks<()>,
}

impl SubscriptionProcessor {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            hooks: Hooks::default(),
        }
    }

    pub fn hooks(&self) -> &Hooks<()> {
        &self.hooks
    }

    fn apply(&self, msg: &SubscriptionMessage) {
        let mut subscribers = lock(&self.subscribers);
        let destination = &msg.response_destination;

        for service in &msg.services {
            let idx = subscribers.iter().position(|(s, _)| s == service);
            match (idx, msg.subscribe) {
                (Some(idx), true) => {
                    let queues = &mut subscribers[idx].1;
                    if !queues.contains(destination) {
                        queues.push(destination.clone());
                    }
                }
                (None, true) => subscribers.push((service.clone(), vec![destination.clone()])),
                (Some(idx), false) => {
                    subscribers[idx].1.retain(|q| q != destination);
                    if subscribers[idx].1.is_empty() {
                        subscribers.remove(idx);
                    }
                }
                (None, false) => {}
            }
        }
    }

    /// Destinations subscribed to `service`, in order of subscription
    pub fn response_queues(&self, service: &str) -> Vec<String> {
        lock(&self.subscribers)
            .iter()
            .find(|(s, _)| s == service)
            .map(|(_, queues)| queues.clone())
            .unwrap_or_default()
    }
}

impl Default for SubscriptionProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageProcessor for SubscriptionProcessor {
    fn accepts(&self) -> Accepts {
        Accepts::Kind(MessageKind::Subscription)
    }

    fn process(&self, envelope: &Envelope) -> Result<()> {
        match envelope.message() {
            Message::Subscription(msg) => self.hooks.run(envelope, || {
                self.apply(msg);
                Ok(())
            }),
            other => anyhow::bail!("subscription processor cannot handle {:?} messages", other.kind()),
        }
    }
}
