use std::collections::HashMap;
use std::path::PathBuf;
use anyhow::{Context, Result};
use regex::Regex;
use shared::protocol::{is_begin_marker, MARKER_BEGIN};
use crate::config::HaproxyActionConfig;
use crate::processor::availability::Endpoint;
use crate::processor::AvailabilityProcessor;
use super::Action;

/// Applies a rewritten load-balancer config
pub trait Reload: Send + Sync {
    fn reload(&self);
}

/// Runs a shell command. Failures are logged, never raised.
pub struct ShellReload {
    command: String,
}

impl ShellReload {
    pub fn new(command: String) -> Self {
        Self { command }
    }
}

impl Reload for ShellReload {
    fn reload(&self) {
        tracing::info!("Reloading haproxy: '{}'", self.command);
        match std::process::Command::new("sh").arg("-c").arg(&self.command).output() {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if !stdout.trim().is_empty() {
                    tracing::info!("{}", stdout.trim_end());
                }
                if !output.status.success() {
                    tracing::error!(
                        "Reload command exited with {}: {}",
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim_end()
                    );
                }
            }
            Err(e) => tracing::error!("Failed to run reload command '{}': {}", self.command, e),
        }
    }
}

enum Scan {
    Outside,
    /// In a section for an available service, block not yet written
    Pending(String),
    /// Block written, dropping the rest of the old block
    Injected,
    /// Dropping a managed block whose section is gone
    Stale,
}

/// Injects `server` lines into the `listen`/`backend` sections named after
/// available services, then reloads.
///
/// The managed block opens with the begin marker and runs to the next
/// blank line. It replaces the previous block if there is one, otherwise it
/// goes at the first blank line of the section.
pub struct UpdateHaproxy {
    config_path: PathBuf,
    server_args: String,
    service_args: HashMap<String, String>,
    header: Regex,
    reload: Box<dyn Reload>,
}

impl UpdateHaproxy {
    pub fn new(config: &HaproxyActionConfig, reload: Box<dyn Reload>) -> Result<Self> {
        let header = Regex::new(r"^\s*(listen|backend)\s+([A-Za-z0-9_-]+)")
            .context("Failed to compile section header pattern")?;

        Ok(Self {
            config_path: config.config_path.clone(),
            server_args: config.server_args.clone(),
            service_args: config.service_args.clone(),
            header,
            reload,
        })
    }

    fn block(&self, service: &str, services: &HashMap<String, Vec<Endpoint>>, out: &mut Vec<String>) {
        let endpoints = services.get(service).map(Vec::as_slice).unwrap_or(&[]);
        let args = self
            .service_args
            .get(service)
            .unwrap_or(&self.server_args);

        out.push(MARKER_BEGIN.to_string());
        for endpoint in endpoints {
            let line = format!("  server {} {} {}", endpoint.hostname, endpoint.address, args);
            out.push(line.trim_end().to_string());
        }
        out.push(String::new());
    }

    pub fn render(&self, current: &str, availability: &AvailabilityProcessor) -> String {
        let mut services: HashMap<String, Vec<Endpoint>> = HashMap::new();
        for endpoint in availability.endpoints() {
            services.entry(endpoint.service.clone()).or_default().push(endpoint);
        }

        let mut input: Vec<&str> = current.lines().collect();
        // sentinel, so the last section always meets a blank line
        if input.last().map_or(true, |line| !line.trim().is_empty()) {
            input.push("");
        }

        let mut out = Vec::with_capacity(input.len());
        let mut state = Scan::Outside;

        for line in input {
            let blank = line.trim().is_empty();

            if let Some(caps) = self.header.captures(line) {
                if let Scan::Pending(service) = &state {
                    self.block(service, &services, &mut out);
                }
                state = if services.contains_key(&caps[2]) {
                    Scan::Pending(caps[2].to_string())
                } else {
                    Scan::Outside
                };
                out.push(line.to_string());
                continue;
            }

            state = match state {
                Scan::Pending(service) if blank || is_begin_marker(line) => {
                    self.block(&service, &services, &mut out);
                    if blank {
                        Scan::Outside
                    } else {
                        Scan::Injected
                    }
                }
                Scan::Injected if blank => Scan::Outside,
                Scan::Stale if blank => {
                    out.push(String::new());
                    Scan::Outside
                }
                Scan::Injected => Scan::Injected,
                Scan::Stale => Scan::Stale,
                Scan::Outside if is_begin_marker(line) => Scan::Stale,
                other => {
                    out.push(line.to_string());
                    other
                }
            };
        }

        if let Scan::Pending(service) = &state {
            self.block(service, &services, &mut out);
        }

        let mut doc = out.join("\n");
        doc.push('\n');
        doc
    }
}

impl Action for UpdateHaproxy {
    fn name(&self) -> &str {
        "haproxy"
    }

    fn invoke(&self, availability: &AvailabilityProcessor) -> Result<()> {
        let current = std::fs::read_to_string(&self.config_path)
            .with_context(|| format!("Failed to read {}", self.config_path.display()))?;

        let updated = self.render(&current, availability);
        std::fs::write(&self.config_path, updated)
            .with_context(|| format!("Failed to write {}", self.config_path.display()))?;
        tracing::info!("Updated {}", self.config_path.display());

        self.reload.reload();
        Ok(())
    }
}
