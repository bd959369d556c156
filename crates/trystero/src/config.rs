//! Room configuration
//!
//! Every field except `app_id` has a default, so a minimal TOML file is just:
//!
//! ```toml
//! app_id = "my-app"
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default Nostr relays, rotated by app id when no relays are configured
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://black.nostrcity.club",
    "wss://eu.purplerelay.com",
    "wss://ftp.halifax.rwth-aachen.de/nostr",
    "wss://nostr.cool110.xyz",
    "wss://nostr.data.haus",
    "wss://nostr.grooveix.com",
    "wss://nostr.huszonegy.world",
    "wss://nostr.mom",
    "wss://nostr.sathoarder.com",
    "wss://nostr.vulpem.com",
    "wss://relay.fountain.fm",
    "wss://relay.nostraddress.com",
    "wss://relay.nostromo.social",
    "wss://relay.snort.social",
    "wss://relay.verified-nostr.com",
    "wss://yabu.me",
];

/// Default STUN servers
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun.cloudflare.com:3478",
    "stun:stun.iris.to:3478",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Application namespace; part of every topic hash
    pub app_id: String,
    /// Explicit relay endpoints; empty selects from `DEFAULT_RELAYS`
    #[serde(default)]
    pub relay_urls: Vec<String>,
    #[serde(default = "default_relay_redundancy")]
    pub relay_redundancy: usize,
    /// Encrypts offers and answers. `Some("")` is a valid password.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,
    /// Upper bound of the random delay before the first announcement
    #[serde(default = "default_announce_jitter_ms")]
    pub announce_jitter_ms: u64,
    /// Peers that have not connected within this window are dropped
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Nostr secret key (hex or nsec); a fresh key is generated when absent
    #[serde(default)]
    pub secret_key: Option<String>,
}

fn default_relay_redundancy() -> usize {
    5
}

fn default_ice_servers() -> Vec<String> {
    DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect()
}

fn default_announce_interval_ms() -> u64 {
    33_333
}

fn default_announce_jitter_ms() -> u64 {
    2_000
}

fn default_connect_timeout_ms() -> u64 {
    20_000
}

impl RoomConfig {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            relay_urls: Vec::new(),
            relay_redundancy: default_relay_redundancy(),
            password: None,
            ice_servers: default_ice_servers(),
            announce_interval_ms: default_announce_interval_ms(),
            announce_jitter_ms: default_announce_jitter_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            secret_key: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_relays(mut self, relays: Vec<String>) -> Self {
        self.relay_urls = relays;
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: RoomConfig = toml::from_str(content).context("Failed to parse room config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_id.is_empty() {
            bail!("app_id must not be empty");
        }
        if self.announce_interval_ms == 0 {
            bail!("announce_interval_ms must be positive");
        }
        Ok(())
    }
}
