mod actions;
mod api;
mod config;
mod listener;
mod metadata;
mod node;
mod processor;
mod queue;
mod script;
mod user_data;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::config::{Cadence, Config};
use crate::metadata::{NodeIdentity, NodeMetadata, StaticMetadata};
use crate::node::Membership;
use crate::queue::SpoolBroker;
use crate::user_data::UserData;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/ec2-discovery/discoveryd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level))
        )
        .init();

    tracing::info!("Starting discoveryd with config from {}", config_path);

    let metadata = StaticMetadata::from_config(&config.node)?;
    let user_data = UserData::parse(&metadata.user_data()?);

    if user_data.is_set("disable") {
        tracing::info!("Discovery disabled by user data, exiting");
        return Ok(());
    }

    let identity = NodeIdentity::resolve(&metadata, &user_data);
    let membership = Membership::new(identity, &user_data);
    tracing::info!(
        "Node {} provides [{}], subscribes to [{}]",
        membership.identity.instance_id,
        membership.provides.join(", "),
        membership.subscribes.join(", ")
    );

    if let Some(pre) = user_data.get("pre_script") {
        script::run("pre_script", pre).await;
    }

    // bad action tags stop us before any message goes out
    let actions = Arc::new(actions::build_actions(
        &membership.actions,
        &config.actions,
        &membership.identity,
    )?);

    let queue = Arc::new(SpoolBroker::open(&config.queue.spool_dir)?.with_visibility(config.queue.visibility()));
    tracing::info!("Using spool queues under {}", config.queue.spool_dir.display());

    let cancel = CancellationToken::new();
    let node = node::start(&membership, &config, queue, actions, cancel.clone());
    let mut tasks = Vec::new();

    if config.api.enabled {
        let state = api::routes::AppState {
            availability: node.availability.clone(),
            node: Arc::new(api::routes::NodeInfo::new(&membership, &node.inbox)),
        };
        let listen = config.api.listen.clone();
        let api_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = api::serve(&listen, state, api_cancel).await {
                tracing::error!("API error: {:#}", e);
            }
        }));
    }

    if let Some(post) = user_data.get("post_script") {
        let settle = match config.timing.announce_cadence() {
            Cadence::Every(interval) => interval,
            Cadence::Once => Duration::from_secs(1),
        };
        let post = post.to_string();
        let post_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(settle) => {
                    script::run("post_script", &post).await;
                }
                _ = post_cancel.cancelled() => {}
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");
    cancel.cancel();

    tasks.extend(node.tasks);
    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            tracing::error!("Task failed: {}", e);
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
