//! Layered configuration: serde defaults, then an optional TOML file, then
//! `AGENTCACHE_`-prefixed environment variables.

use crate::cache::{DEFAULT_ENTRY_FETCH_MAX_BURST, DEFAULT_LAST_GET_TTL, Options};
use anyhow::Context;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use fundu::DurationParser;
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "agentcache.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Fetches per second per cache entry. Unset means unlimited.
    #[serde(default)]
    pub entry_fetch_rate: Option<f64>,

    #[serde(default = "default_entry_fetch_max_burst")]
    pub entry_fetch_max_burst: u32,

    /// Idle lifetime for registered types, e.g. `72h` or `30m`.
    #[serde(
        default = "default_last_get_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub default_last_get_ttl: Duration,

    #[serde(default)]
    pub demo: DemoConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub services: Vec<String>,
    /// Watchers per service.
    pub watchers: usize,
    /// Events published per service before the demo exits.
    pub events: u64,
    #[serde(deserialize_with = "deserialize_duration")]
    pub event_interval: Duration,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            services: vec!["web".to_string(), "db".to_string()],
            watchers: 3,
            events: 20,
            event_interval: Duration::from_millis(250),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_entry_fetch_max_burst() -> u32 {
    DEFAULT_ENTRY_FETCH_MAX_BURST
}

fn default_last_get_ttl() -> Duration {
    DEFAULT_LAST_GET_TTL
}

impl Config {
    /// Loads configuration from `path` (or `agentcache.toml` if present) and
    /// the environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();
        match path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("config file {} does not exist", path.display());
                }
                figment = figment.merge(Toml::file(path));
            }
            None => figment = figment.merge(Toml::file(DEFAULT_CONFIG_FILE)),
        }

        figment
            .merge(Env::prefixed("AGENTCACHE_").split("__"))
            .extract()
            .context("Failed to load config")
    }

    pub fn cache_options(&self) -> Options {
        Options {
            entry_fetch_rate: self.entry_fetch_rate,
            entry_fetch_max_burst: self.entry_fetch_max_burst,
        }
    }
}

/// Parses a human duration such as `250ms`, `1.5s` or `72h`.
pub fn parse_duration(raw: &str) -> anyhow::Result<Duration> {
    let parsed = DurationParser::with_all_time_units()
        .parse(raw.trim())
        .with_context(|| format!("invalid duration {raw:?}"))?;
    Duration::try_from(parsed).with_context(|| format!("duration {raw:?} out of range"))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
        RawDuration::Text(raw) => parse_duration(&raw).map_err(serde::de::Error::custom),
    }
}
