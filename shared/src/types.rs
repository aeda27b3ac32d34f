use std::fmt;
use serde::{Deserialize, Serialize};

/// A network endpoint serving a service: a bare host plus an optional port
/// specifier such as `:80` or `:8000-8080`.
///
/// Hosts are kept verbatim. Empty or placeholder hosts are legal, they are
/// used for local aliasing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceAddress {
    host: String,
    port: String,
}

impl ServiceAddress {
    /// Build an address, prefixing a non-empty port with `:` when missing
    pub fn new(host: impl Into<String>, port: impl AsRef<str>) -> Self {
        let port = port.as_ref().trim();
        let port = if port.is_empty() || port.starts_with(':') {
            port.to_string()
        } else {
            format!(":{}", port)
        };

        Self {
            host: host.into(),
            port,
        }
    }

    /// An address without a port specifier
    pub fn host_only(host: impl Into<String>) -> Self {
        Self::new(host, "")
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port specifier, empty or starting with `:`
    pub fn port(&self) -> &str {
        &self.port
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.host, self.port)
    }
}

/// Split a service identifier into its name and port specifier.
///
/// `"web:80"` gives `("web", ":80")`, `"web"` gives `("web", "")`.
pub fn split_service(service: &str) -> (&str, &str) {
    match service.find(':') {
        Some(idx) => service.split_at(idx),
        None => (service, ""),
    }
}
