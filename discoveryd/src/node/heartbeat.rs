use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use shared::message::Message;
use crate::config::Cadence;
use super::{post, Outbox};

/// Send `message` to `destination` on `cadence`, restamped each time.
/// The first beat goes out immediately.
pub async fn run(
    outbox: Outbox,
    destination: String,
    message: Message,
    cadence: Cadence,
    cancel: CancellationToken,
) {
    let period = match cadence {
        Cadence::Once => {
            if let Err(e) = post(&outbox, &destination, message) {
                tracing::error!("Failed to queue heartbeat: {}", e);
            }
            return;
        }
        Cadence::Every(period) => period,
    };

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = post(&outbox, &destination, message.clone()) {
                    tracing::error!("Failed to queue heartbeat: {}", e);
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("{} heartbeat to {} shutting down", message.kind().as_str(), destination);
                break;
            }
        }
    }
}
