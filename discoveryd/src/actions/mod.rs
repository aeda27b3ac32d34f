//! Local side effects driven by availability changes

pub mod haproxy;
pub mod hosts;

use std::sync::Arc;
use anyhow::Result;
use crate::config::ActionsConfig;
use crate::metadata::NodeIdentity;
use crate::processor::AvailabilityProcessor;
use crate::user_data::ConfigParseError;

pub use haproxy::{Reload, ShellReload, UpdateHaproxy};
pub use hosts::UpdateHosts;

/// Invoked with the current view whenever availability changes. Errors go
/// back to the caller, which logs them.
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    fn invoke(&self, availability: &AvailabilityProcessor) -> Result<()>;
}

pub type ActionSet = Arc<Vec<Box<dyn Action>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Hosts,
    Haproxy,
}

impl ActionKind {
    pub fn from_tag(tag: &str) -> Result<Self, ConfigParseError> {
        match tag.trim() {
            "hosts" | "update_hosts" | "UpdateHosts" => Ok(ActionKind::Hosts),
            "haproxy" | "update_haproxy" | "UpdateHAProxy" => Ok(ActionKind::Haproxy),
            other => Err(ConfigParseError::UnknownAction {
                tag: other.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Hosts => "hosts",
            ActionKind::Haproxy => "haproxy",
        }
    }
}

/// Build every action named in `tags`. Any unknown tag fails the whole set.
pub fn build_actions(
    tags: &[String],
    config: &ActionsConfig,
    identity: &NodeIdentity,
) -> Result<Vec<Box<dyn Action>>> {
    let kinds = tags
        .iter()
        .map(|tag| ActionKind::from_tag(tag))
        .collect::<Result<Vec<_>, _>>()?;

    let mut actions: Vec<Box<dyn Action>> = Vec::with_capacity(kinds.len());
    for kind in kinds {
        match kind {
            ActionKind::Hosts => actions.push(Box::new(UpdateHosts::new(&config.hosts, identity))),
            ActionKind::Haproxy => actions.push(Box::new(UpdateHaproxy::new(
                &config.haproxy,
                Box::new(ShellReload::new(config.haproxy.reload_command.clone())),
            )?)),
        }
        tracing::info!("Configured action {}", kind.as_str());
    }
    Ok(actions)
}

/// Run every action in order; one failing action does not stop the rest
pub fn invoke_all(actions: &[Box<dyn Action>], availability: &AvailabilityProcessor) {
    for action in actions {
        match action.invoke(availability) {
            Ok(()) => tracing::debug!("Action {} complete", action.name()),
            Err(e) => tracing::error!("Action {} failed: {:#}", action.name(), e),
        }
    }
}

/// Run the actions on the blocking pool, they touch files and spawn commands
pub async fn run_actions(actions: ActionSet, availability: Arc<AvailabilityProcessor>) {
    let result = tokio::task::spawn_blocking(move || invoke_all(&actions, &availability)).await;
    if let Err(e) = result {
        tracing::error!("Action task failed: {}", e);
    }
}
