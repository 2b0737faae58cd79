use serde::{Deserialize, Serialize};

/// Address of the `/health` and `/metrics` http endpoints.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthServerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl HealthServerConfig {
    pub const DEFAULT_PORT: u16 = 8000;

    pub fn address(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    HealthServerConfig::DEFAULT_PORT
}
