use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use tokio_util::sync::CancellationToken;
use shared::message::{AvailabilityMessage, Message};
use crate::processor::{AvailabilityProcessor, SubscriptionProcessor, Transition};
use super::{post, Outbox};

/// Coordinator state: the complete availability view with expiry, and who
/// wants to hear about which service.
///
/// Subscribing seeds the subscriber with one message per host serving any
/// of the requested services. After that each real change to a
/// `(service, address)` pair is forwarded to the service's subscribers.
pub struct Monitor {
    pub availability: Arc<AvailabilityProcessor>,
    pub subscriptions: Arc<SubscriptionProcessor>,
    outbox: Outbox,
}

impl Monitor {
    /// `seed_ttl` goes on seeding messages, which carry no TTL of their own
    pub fn new(outbox: Outbox, seed_ttl: u32) -> Self {
        let availability = Arc::new(AvailabilityProcessor::new(true));
        let subscriptions = Arc::new(SubscriptionProcessor::new());

        let view = Arc::downgrade(&availability);
        let tx = outbox.clone();
        subscriptions.hooks().set_post_process(move |envelope, _| {
            let (Message::Subscription(msg), Some(view)) = (envelope.message(), view.upgrade()) else {
                return Ok(());
            };
            if !msg.subscribe {
                return Ok(());
            }

            for seed in seed_messages(&view, &msg.services, seed_ttl) {
                post(&tx, &msg.response_destination, seed)?;
            }
            Ok(())
        });

        let subscribers = Arc::downgrade(&subscriptions);
        let tx = outbox.clone();
        availability.hooks().set_post_process(move |envelope, transitions| {
            let (Message::Availability(msg), Some(subscribers)) = (envelope.message(), subscribers.upgrade()) else {
                return Ok(());
            };
            forward(&subscribers, &tx, transitions, msg.ttl)
        });

        Self {
            availability,
            subscriptions,
            outbox,
        }
    }

    /// Drop expired claims and tell their subscribers. Returns how many
    /// claims expired.
    pub fn sweep(&self) -> usize {
        let expired = self.availability.expired();

        let mut count = 0;
        for (service, addresses) in &expired {
            let destinations = self.subscriptions.response_queues(service);
            for address in addresses {
                tracing::info!("{}{} at {} expired", service, address.port(), address.host());
                let label = format!("{}{}", service, address.port());
                for destination in &destinations {
                    let msg = AvailabilityMessage::unavailable(vec![label.clone()], address.host());
                    if let Err(e) = post(&self.outbox, destination, msg) {
                        tracing::error!("Failed to send expiry: {}", e);
                    }
                }
                count += 1;
            }
        }

        if count > 0 {
            self.availability.mark_changed();
        }
        count
    }

    pub async fn run_sweep(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Expiry sweep shutting down");
                    break;
                }
            }
        }
    }
}

/// One availability message per host currently serving any of `services`
pub fn seed_messages(
    availability: &AvailabilityProcessor,
    services: &[String],
    ttl: u32,
) -> Vec<AvailabilityMessage> {
    let mut by_host: Vec<(String, Vec<String>)> = Vec::new();
    for service in services {
        for address in availability.available(service) {
            let label = format!("{}{}", service, address.port());
            match by_host.iter_mut().find(|(host, _)| host == address.host()) {
                Some((_, labels)) => labels.push(label),
                None => by_host.push((address.host().to_string(), vec![label])),
            }
        }
    }

    by_host
        .into_iter()
        .map(|(host, labels)| AvailabilityMessage::available(labels, host, ttl))
        .collect()
}

/// Tell each interested destination about each transition
fn forward(
    subscriptions: &SubscriptionProcessor,
    outbox: &Outbox,
    transitions: &[Transition],
    ttl: u32,
) -> Result<()> {
    for transition in transitions {
        for destination in subscriptions.response_queues(&transition.service) {
            let host = transition.address.host();
            let msg = if transition.available {
                AvailabilityMessage::available(vec![transition.label()], host, ttl)
            } else {
                AvailabilityMessage::unavailable(vec![transition.label()], host)
            };
            post(outbox, &destination, msg)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use shared::message::{Envelope, SubscriptionMessage};
    use crate::node::Outbound;
    use crate::processor::MessageProcessor;

    fn monitor() -> (Monitor, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Monitor::new(tx, 30), rx)
    }

    fn names(services: &[&str]) -> Vec<String> {
        services.iter().map(|s| s.to_string()).collect()
    }

    fn announce(m: &Monitor, services: &[&str], address: &str, ttl: u32) {
        m.availability
            .process(&Envelope::new(AvailabilityMessage::available(names(services), address, ttl)))
            .unwrap();
    }

    fn withdraw(m: &Monitor, services: &[&str], address: &str) {
        m.availability
            .process(&Envelope::new(AvailabilityMessage::unavailable(names(services), address)))
            .unwrap();
    }

    fn subscribe(m: &Monitor, services: &[&str], queue: &str) {
        m.subscriptions
            .process(&Envelope::new(SubscriptionMessage::subscribe(names(services), queue)))
            .unwrap();
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<(String, AvailabilityMessage)> {
        let mut sent = Vec::new();
        while let Ok(out) = rx.try_recv() {
            match out.envelope.message() {
                Message::Availability(msg) => sent.push((out.destination, msg.clone())),
                other => panic!("unexpected {:?}", other),
            }
        }
        sent
    }

    #[test]
    fn test_seed_grouped_by_host() {
        let (m, mut rx) = monitor();
        announce(&m, &["web:80", "web:81", "db"], "1.1.1.1", 10);
        announce(&m, &["web:80"], "2.2.2.2", 10);
        announce(&m, &["cache"], "3.3.3.3", 10);

        subscribe(&m, &["web", "db"], "q1");
        let sent = drain(&mut rx);
        assert_eq!(
            sent,
            vec![
                (
                    "q1".to_string(),
                    AvailabilityMessage::available(names(&["web:80", "web:81", "db"]), "1.1.1.1", 30)
                ),
                ("q1".to_string(), AvailabilityMessage::available(names(&["web:80"]), "2.2.2.2", 30)),
            ]
        );
    }

    #[test]
    fn test_resubscribe_reseeds() {
        let (m, mut rx) = monitor();
        announce(&m, &["web"], "1.1.1.1", 10);

        subscribe(&m, &["web"], "q1");
        subscribe(&m, &["web"], "q1");
        assert_eq!(drain(&mut rx).len(), 2);

        m.subscriptions
            .process(&Envelope::new(SubscriptionMessage::unsubscribe(names(&["web"]), "q1")))
            .unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_repeated_announcement_forwarded_once() {
        let (m, mut rx) = monitor();
        subscribe(&m, &["svc"], "Q1");
        assert!(drain(&mut rx).is_empty());

        announce(&m, &["svc"], "1.2.3.4", 10);
        announce(&m, &["svc"], "1.2.3.4", 10);

        let sent = drain(&mut rx);
        assert_eq!(
            sent,
            vec![("Q1".to_string(), AvailabilityMessage::available(names(&["svc"]), "1.2.3.4", 10))]
        );
    }

    #[test]
    fn test_deltas_scoped_to_service_and_port() {
        let (m, mut rx) = monitor();
        subscribe(&m, &["web"], "q1");
        subscribe(&m, &["web", "db"], "q2");

        announce(&m, &["web:80", "db", "cache"], "1.1.1.1", 10);
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 3);
        assert!(sent.contains(&("q1".to_string(), AvailabilityMessage::available(names(&["web:80"]), "1.1.1.1", 10))));
        assert!(sent.contains(&("q2".to_string(), AvailabilityMessage::available(names(&["web:80"]), "1.1.1.1", 10))));
        assert!(sent.contains(&("q2".to_string(), AvailabilityMessage::available(names(&["db"]), "1.1.1.1", 10))));

        withdraw(&m, &["web:80"], "1.1.1.1");
        withdraw(&m, &["web:80"], "1.1.1.1");
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, msg)| !msg.available));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_announces_expiry() {
        let (m, mut rx) = monitor();
        subscribe(&m, &["web"], "q1");
        announce(&m, &["web:80"], "1.1.1.1", 5);
        announce(&m, &["db"], "1.1.1.1", 5);
        drain(&mut rx);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(m.sweep(), 0);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(m.sweep(), 2);
        assert_eq!(
            drain(&mut rx),
            vec![("q1".to_string(), AvailabilityMessage::unavailable(names(&["web:80"]), "1.1.1.1"))]
        );
        assert!(m.availability.available("web").is_empty());
        assert_eq!(m.sweep(), 0);
    }
}
