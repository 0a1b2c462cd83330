use anyhow::Context;
use callcore::types::IceServer;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Runtime settings for the call engine and its adapters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// WebSocket endpoint of the call signaling namespace.
    pub signaling_url: String,
    /// Base URL of the REST API serving `/call/{id}/status`.
    pub api_base_url: String,
    pub ice_servers: Vec<IceServer>,
    /// How long an accepted call waits for the caller's offer.
    pub offer_timeout_secs: u64,
    /// How long an outgoing call rings before giving up. `None` leaves it
    /// to the server's missed-call notice.
    pub ring_timeout_secs: Option<u64>,
    /// Capacity of the coordinator's command queue.
    pub command_buffer: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:3000/call".to_string(),
            api_base_url: "http://localhost:3000".to_string(),
            ice_servers: IceServer::default_servers(),
            offer_timeout_secs: 30,
            ring_timeout_secs: Some(45),
            command_buffer: 32,
        }
    }
}

impl CallConfig {
    pub fn offer_timeout(&self) -> Duration {
        Duration::from_secs(self.offer_timeout_secs)
    }

    pub fn ring_timeout(&self) -> Option<Duration> {
        self.ring_timeout_secs.map(Duration::from_secs)
    }

    /// Load settings from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
