//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use qrlink_core::SessionConfig;
use tracing::{debug, warn};

use crate::transport::LanConfig;

/// CLI configuration. File: ~/.config/qrlink/config.toml or /etc/qrlink/config.toml.
/// Env overrides: QRLINK_DISCOVERY_PORT, QRLINK_TRANSPORT_PORT,
/// QRLINK_DISCOVERY_INTERVAL_SECS, QRLINK_PAIRING_TIMEOUT_SECS, QRLINK_PAIRING_RETRIES.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Back-channel TCP port the sender listens on (default 45681).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Seconds between discovery restarts (default 10).
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
    /// Seconds before a pairing attempt is abandoned (default 10).
    #[serde(default = "default_pairing_timeout_secs")]
    pub pairing_timeout_secs: u64,
    /// Pairing retries after the first failure (default 1).
    #[serde(default = "default_pairing_retries")]
    pub pairing_retries: u32,
}

fn default_discovery_port() -> u16 {
    45680
}
fn default_transport_port() -> u16 {
    45681
}
fn default_discovery_interval_secs() -> u64 {
    10
}
fn default_pairing_timeout_secs() -> u64 {
    10
}
fn default_pairing_retries() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            discovery_interval_secs: default_discovery_interval_secs(),
            pairing_timeout_secs: default_pairing_timeout_secs(),
            pairing_retries: default_pairing_retries(),
        }
    }
}

impl Config {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            pairing_timeout: Duration::from_secs(self.pairing_timeout_secs),
            discovery_interval: Duration::from_secs(self.discovery_interval_secs),
            pairing_retries: self.pairing_retries,
        }
    }

    pub fn lan_config(&self) -> LanConfig {
        LanConfig {
            discovery_port: self.discovery_port,
            transport_port: self.transport_port,
            ..LanConfig::default()
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        override_from(&var, "QRLINK_DISCOVERY_PORT", &mut self.discovery_port);
        override_from(&var, "QRLINK_TRANSPORT_PORT", &mut self.transport_port);
        override_from(
            &var,
            "QRLINK_DISCOVERY_INTERVAL_SECS",
            &mut self.discovery_interval_secs,
        );
        override_from(
            &var,
            "QRLINK_PAIRING_TIMEOUT_SECS",
            &mut self.pairing_timeout_secs,
        );
        override_from(&var, "QRLINK_PAIRING_RETRIES", &mut self.pairing_retries);
    }
}

fn override_from<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut T,
) {
    if let Some(s) = var(name) {
        match s.parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => warn!(var = name, value = %s, "ignoring unparsable override"),
        }
    }
}

/// Load config: merge default, then config file (explicit path or the first one present), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => parse_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    c.apply_env(|name| std::env::var(name).ok());
    Ok(c)
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    use anyhow::Context;
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str::<Config>(&s).with_context(|| format!("parsing config {}", path.display()))
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/qrlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/qrlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match parse_file(&p) {
                Ok(c) => {
                    debug!(path = %p.display(), "loaded config");
                    return Some(c);
                }
                Err(e) => warn!(error = %format!("{e:#}"), "using defaults"),
            }
            break;
        }
    }
    None
}
