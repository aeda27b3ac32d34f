//! Node roles and the tasks that drive them.
//!
//! Every node announces what it provides to the monitor queue. A node that
//! provides `monitor` runs the coordinator; every other node is a
//! participant listening on a queue named after its instance id.
//!
//! Hooks never send directly. They push [`Outbound`] records into the
//! outbox, and a single task delivers them.

pub mod heartbeat;
pub mod monitor;
pub mod participant;

use std::sync::Arc;
use anyhow::Result;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use shared::message::{AvailabilityMessage, Envelope, Message};
use shared::protocol::MONITOR_SERVICE;
use shared::types::split_service;
use crate::actions::{run_actions, ActionSet};
use crate::config::{Config, QueueConfig};
use crate::listener::QueueListener;
use crate::metadata::NodeIdentity;
use crate::processor::{AvailabilityProcessor, SubscriptionProcessor};
use crate::queue::QueueService;
use crate::user_data::UserData;

pub use monitor::Monitor;
pub use participant::Participant;

pub struct Outbound {
    pub destination: String,
    pub envelope: Envelope,
}

pub type Outbox = mpsc::UnboundedSender<Outbound>;

/// Stamp `message` now and queue it for `destination`
pub fn post(outbox: &Outbox, destination: &str, message: impl Into<Message>) -> Result<()> {
    outbox
        .send(Outbound {
            destination: destination.to_string(),
            envelope: Envelope::new(message),
        })
        .map_err(|_| anyhow::anyhow!("outbox closed, dropping message for {}", destination))
}

/// Deliver outbound messages until cancelled
pub async fn run_outbox(
    queue: Arc<dyn QueueService>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            Some(out) = rx.recv() => {
                let body = match out.envelope.encode() {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::error!("Failed to encode message for {}: {}", out.destination, e);
                        continue;
                    }
                };
                if let Err(e) = queue.send(&out.destination, body).await {
                    tracing::error!("Failed to send to {}: {:#}", out.destination, e);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Outbox shutting down");
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Monitor,
    Participant,
}

/// What this node provides and wants, from its user data
#[derive(Debug, Clone)]
pub struct Membership {
    pub identity: NodeIdentity,
    /// Service identifiers, possibly with ports
    pub provides: Vec<String>,
    /// Bare service names
    pub subscribes: Vec<String>,
    pub actions: Vec<String>,
}

impl Membership {
    pub fn new(identity: NodeIdentity, user_data: &UserData) -> Self {
        let subscribes = user_data
            .list("subscribe")
            .iter()
            .map(|s| split_service(s).0.to_string())
            .collect();

        Self {
            identity,
            provides: user_data.list("provide"),
            subscribes,
            actions: user_data.list("action"),
        }
    }

    pub fn role(&self) -> Role {
        if self.provides.iter().any(|s| split_service(s).0 == MONITOR_SERVICE) {
            Role::Monitor
        } else {
            Role::Participant
        }
    }

    /// Queue this node listens on
    pub fn inbox(&self, queue: &QueueConfig) -> String {
        match self.role() {
            Role::Monitor => queue.monitor_queue.clone(),
            Role::Participant => self.identity.instance_id.clone(),
        }
    }
}

/// A started node
pub struct Node {
    pub role: Role,
    pub inbox: String,
    pub availability: Arc<AvailabilityProcessor>,
    /// Monitor only
    pub subscriptions: Option<Arc<SubscriptionProcessor>>,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Spawn every task for `membership`'s role. All of them stop when
/// `cancel` fires.
pub fn start(
    membership: &Membership,
    config: &Config,
    queue: Arc<dyn QueueService>,
    actions: ActionSet,
    cancel: CancellationToken,
) -> Node {
    let role = membership.role();
    let inbox = membership.inbox(&config.queue);
    let monitor_queue = config.queue.monitor_queue.clone();
    tracing::info!("Starting as {:?} on queue {}", role, inbox);

    let (outbox, rx) = mpsc::unbounded_channel();
    let mut tasks = vec![tokio::spawn(run_outbox(queue.clone(), rx, cancel.clone()))];
    let mut listener = QueueListener::new(queue, inbox.clone(), config.listener.clone(), cancel.clone());

    let (availability, subscriptions) = match role {
        Role::Monitor => {
            let monitor = Arc::new(Monitor::new(outbox.clone(), config.timing.announce_ttl()));
            listener.add_processor(monitor.subscriptions.clone());
            listener.add_processor(monitor.availability.clone());

            if !membership.subscribes.is_empty() {
                tracing::warn!("The monitor sees every service, ignoring subscriptions");
            }

            let sweeper = monitor.clone();
            let interval = config.timing.sweep_interval();
            let sweep_cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                sweeper.run_sweep(interval, sweep_cancel).await
            }));

            (monitor.availability.clone(), Some(monitor.subscriptions.clone()))
        }
        Role::Participant => {
            let participant = Participant::new(membership, &inbox);
            listener.add_processor(participant.availability.clone());
            tasks.extend(participant.spawn_subscribe_heartbeat(
                outbox.clone(),
                &monitor_queue,
                config.timing.subscribe_interval(),
                cancel.clone(),
            ));
            (participant.availability, None)
        }
    };

    if !actions.is_empty() {
        let notifier = availability.change_notifier(config.timing.debounce());
        tasks.push(tokio::spawn(notifier.run(
            move |view| run_actions(actions.clone(), view),
            cancel.clone(),
        )));
    }

    if !membership.provides.is_empty() {
        let announcement = AvailabilityMessage::available(
            membership.provides.clone(),
            membership.identity.local_address.clone(),
            config.timing.announce_ttl(),
        );
        tasks.push(tokio::spawn(heartbeat::run(
            outbox,
            monitor_queue,
            announcement.into(),
            config.timing.announce_cadence(),
            cancel.clone(),
        )));
    }

    let listener = Arc::new(listener);
    tasks.push(tokio::spawn(async move { listener.run().await }));

    Node {
        role,
        inbox,
        availability,
        subscriptions,
        tasks,
    }
}
