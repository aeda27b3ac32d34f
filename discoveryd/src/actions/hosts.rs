use std::io::ErrorKind;
use std::path::PathBuf;
use anyhow::{Context, Result};
use shared::protocol::{is_begin_marker, is_end_marker, MARKER_BEGIN, MARKER_END};
use crate::config::HostsActionConfig;
use crate::metadata::NodeIdentity;
use crate::processor::AvailabilityProcessor;
use super::Action;

/// Maintains a managed block of `address alias...` lines in a hosts file,
/// one alias per service instance (`web01`, `web02`, ...) plus the node's
/// own local and public names.
pub struct UpdateHosts {
    path: PathBuf,
    local_address: String,
    local_names: Vec<String>,
    public_address: String,
    public_names: Vec<String>,
}

impl UpdateHosts {
    pub fn new(config: &HostsActionConfig, identity: &NodeIdentity) -> Self {
        Self {
            path: config.path.clone(),
            local_address: identity.local_address.clone(),
            local_names: identity.local_names.clone(),
            public_address: identity.public_address.clone(),
            public_names: identity.public_names.clone(),
        }
    }

    /// `current` with its managed block replaced by the present view
    pub fn render(&self, current: &str, availability: &AvailabilityProcessor) -> String {
        let mut lines: Vec<String> = Vec::new();
        let mut stripping = false;
        // split on '\n' alone so unmanaged lines keep any '\r'
        for line in current.split_inclusive('\n').map(|l| l.strip_suffix('\n').unwrap_or(l)) {
            if stripping {
                stripping = !is_end_marker(line);
            } else if is_begin_marker(line) {
                stripping = true;
            } else {
                lines.push(line.to_string());
            }
        }

        let mut table = availability.all_available(true, false);
        for name in &self.local_names {
            table.add(&self.local_address, name.clone());
        }
        for name in &self.public_names {
            table.add(&self.public_address, name.clone());
        }

        lines.push(MARKER_BEGIN.to_string());
        for (address, labels) in table.iter() {
            lines.push(format!("{} {}", address, labels.join(" ")));
        }
        lines.push(MARKER_END.to_string());

        let mut doc = lines.join("\n");
        doc.push('\n');
        doc
    }
}

impl Action for UpdateHosts {
    fn name(&self) -> &str {
        "hosts"
    }

    fn invoke(&self, availability: &AvailabilityProcessor) -> Result<()> {
        let current = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };

        let updated = self.render(&current, availability);
        if updated == current {
            tracing::debug!("{} already up to date", self.path.display());
            return Ok(());
        }

        std::fs::write(&self.path, updated)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        tracing::info!("Updated {}", self.path.display());
        Ok(())
    }
}
