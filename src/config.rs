//! Configuration loading.
//!
//! Reads `config.json` from the carddeck config directory and applies
//! environment overrides on top. Every field has a default, and a missing
//! or malformed file never stops a command from running: the wrapped
//! command must still start, so problems are logged and defaults used.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_FAIR_SHARE_BYTES, DEFAULT_MAX_HOLD, DEFAULT_POLL_INTERVAL, DEFAULT_SHORT_HOLD,
};
use crate::naming::NamingMode;

/// Tunables for the device-ownership fairness policy.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct FairnessConfig {
    /// Relinquish this long after the last successful write.
    pub max_hold_ms: u64,
    /// Hold window once another card is waiting and we have a backlog.
    pub short_hold_ms: u64,
    /// Bytes written since gaining ownership after which a waiting card
    /// takes over immediately.
    pub fair_share_bytes: usize,
}

impl Default for FairnessConfig {
    fn default() -> Self {
        Self {
            max_hold_ms: DEFAULT_MAX_HOLD.as_millis() as u64,
            short_hold_ms: DEFAULT_SHORT_HOLD.as_millis() as u64,
            fair_share_bytes: DEFAULT_FAIR_SHARE_BYTES,
        }
    }
}

impl FairnessConfig {
    /// Maximum hold as a [`Duration`].
    pub fn max_hold(&self) -> Duration {
        Duration::from_millis(self.max_hold_ms)
    }

    /// Short hold as a [`Duration`].
    pub fn short_hold(&self) -> Duration {
        Duration::from_millis(self.short_hold_ms)
    }
}

/// Configuration for the deck and launcher.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// How card identities are assigned.
    pub naming: NamingMode,
    /// Device ownership thresholds.
    pub fairness: FairnessConfig,
    /// Upper bound on any single readiness wait, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            naming: NamingMode::default(),
            fairness: FairnessConfig::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl Config {
    /// Returns the configuration directory path.
    ///
    /// `CARDDECK_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("CARDDECK_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("carddeck"))
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Self {
        let mut config = match Self::load_from_file() {
            Ok(Some(config)) => config,
            Ok(None) => Self::default(),
            Err(e) => {
                log::warn!("[config] {e:#}; using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides();
        config
    }

    fn load_from_file() -> Result<Option<Self>> {
        let path = Self::config_dir()?.join("config.json");
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(config))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(naming) = std::env::var("CARDDECK_NAMING") {
            match NamingMode::parse(&naming) {
                Some(mode) => self.naming = mode,
                None => log::warn!("[config] ignoring unknown CARDDECK_NAMING={naming}"),
            }
        }
        if let Some(ms) = env_number("CARDDECK_MAX_HOLD_MS") {
            self.fairness.max_hold_ms = ms;
        }
        if let Some(ms) = env_number("CARDDECK_SHORT_HOLD_MS") {
            self.fairness.short_hold_ms = ms;
        }
        if let Some(bytes) = env_number("CARDDECK_FAIR_SHARE_BYTES") {
            self.fairness.fair_share_bytes = bytes as usize;
        }
    }

    /// Poll interval as a [`Duration`], never zero.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn env_number(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            log::warn!("[config] ignoring non-numeric {name}={raw}");
            None
        }
    }
}
