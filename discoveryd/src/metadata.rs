use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use anyhow::{Context, Result};
use crate::config::NodeConfig;
use crate::user_data::UserData;

pub const INSTANCE_ID: &str = "instance-id";
pub const LOCAL_IPV4: &str = "local-ipv4";
pub const PUBLIC_IPV4: &str = "public-ipv4";

/// Source of node identity and user-supplied configuration
pub trait NodeMetadata: Send + Sync {
    fn get(&self, key: &str, default: &str) -> String;

    /// Raw `key=value` user data
    fn user_data(&self) -> Result<String>;
}

/// Metadata taken from the daemon config plus a user-data file on disk
pub struct StaticMetadata {
    values: HashMap<String, String>,
    user_data_path: PathBuf,
}

impl StaticMetadata {
    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        let instance_id = match &config.instance_id {
            Some(id) => id.clone(),
            None => hostname::get()
                .context("Failed to get system hostname")?
                .to_string_lossy()
                .to_string(),
        };

        let values = HashMap::from([
            (INSTANCE_ID.to_string(), instance_id),
            (LOCAL_IPV4.to_string(), config.local_address.clone()),
            (PUBLIC_IPV4.to_string(), config.public_address.clone()),
        ]);

        Ok(Self {
            values,
            user_data_path: config.user_data.clone(),
        })
    }
}

impl NodeMetadata for StaticMetadata {
    fn get(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn user_data(&self) -> Result<String> {
        match std::fs::read_to_string(&self.user_data_path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!("No user data at {}", self.user_data_path.display());
                Ok(String::new())
            }
            Err(e) => Err(e).with_context(|| {
                format!("Failed to read user data: {}", self.user_data_path.display())
            }),
        }
    }
}

/// Who this node is and what it is called locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub instance_id: String,
    pub local_address: String,
    pub public_address: String,
    pub local_names: Vec<String>,
    pub public_names: Vec<String>,
}

impl NodeIdentity {
    pub fn resolve(metadata: &dyn NodeMetadata, user_data: &UserData) -> Self {
        let names = |key: &str| {
            let names = user_data.list(key);
            if names.is_empty() {
                vec![key.to_string()]
            } else {
                names
            }
        };

        Self {
            instance_id: metadata.get(INSTANCE_ID, ""),
            local_address: metadata.get(LOCAL_IPV4, "127.0.0.1"),
            public_address: metadata.get(PUBLIC_IPV4, "0.0.0.0"),
            local_names: names("local_name"),
            public_names: names("public_name"),
        }
    }
}
