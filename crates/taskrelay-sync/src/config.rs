//! Environment-driven configuration.

use std::path::PathBuf;
use std::time::Duration;
use taskrelay_relay::RelayConfig;

use crate::error::{Result, SyncError};
use crate::publisher::{PublisherConfig, RetryPolicy};

/// Relays used when neither the environment nor the store names any.
pub const DEFAULT_RELAYS: [&str; 2] = ["wss://relay.damus.io", "wss://nos.lol"];

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Default relay set for boards without their own.
    pub relays: Vec<String>,

    /// Directory for the file-backed store.
    pub data_dir: PathBuf,

    /// Hex identity secret; loaded from or generated into the store if unset.
    pub secret_key: Option<String>,

    /// Root secret mixed into scope keys.
    pub root_secret: String,

    pub publish_spacing: Duration,

    pub reconnect_delay: Duration,

    /// Total send attempts per publish.
    pub publish_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            relays: DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect(),
            data_dir: PathBuf::from("./taskrelay-data"),
            secret_key: None,
            root_secret: String::new(),
            publish_spacing: Duration::from_millis(200),
            reconnect_delay: Duration::from_millis(2500),
            publish_retries: 3,
        }
    }
}

impl SyncConfig {
    /// Read `TASKRELAY_*` variables over the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(relays) = lookup("TASKRELAY_RELAYS") {
            config.relays = parse_list(&relays);
        }
        if let Some(dir) = lookup("TASKRELAY_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.secret_key = lookup("TASKRELAY_SECRET_KEY").filter(|s| !s.trim().is_empty());
        if let Some(secret) = lookup("TASKRELAY_ROOT_SECRET") {
            config.root_secret = secret;
        }
        if let Some(ms) = lookup("TASKRELAY_PUBLISH_SPACING_MS") {
            config.publish_spacing = Duration::from_millis(parse_number("TASKRELAY_PUBLISH_SPACING_MS", &ms)?);
        }
        if let Some(ms) = lookup("TASKRELAY_RECONNECT_MS") {
            config.reconnect_delay = Duration::from_millis(parse_number("TASKRELAY_RECONNECT_MS", &ms)?);
        }
        if let Some(n) = lookup("TASKRELAY_PUBLISH_RETRIES") {
            let retries = parse_number("TASKRELAY_PUBLISH_RETRIES", &n)?;
            config.publish_retries = u32::try_from(retries)
                .ok()
                .filter(|r| *r > 0)
                .ok_or_else(|| SyncError::Config("TASKRELAY_PUBLISH_RETRIES must be at least 1".into()))?;
        }

        Ok(config)
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            reconnect_delay: self.reconnect_delay,
            ..RelayConfig::default()
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            spacing: self.publish_spacing,
            retry: RetryPolicy {
                max_attempts: self.publish_retries,
                ..RetryPolicy::default()
            },
        }
    }
}

/// Split a comma-separated list, dropping blanks.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| SyncError::Config(format!("{} is not a number: {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.relays.len(), 2);
        assert_eq!(config.data_dir, PathBuf::from("./taskrelay-data"));
        assert_eq!(config.publish_spacing, Duration::from_millis(200));
        assert_eq!(config.reconnect_delay, Duration::from_millis(2500));
        assert_eq!(config.publish_retries, 3);
        assert!(config.secret_key.is_none());
        assert!(config.root_secret.is_empty());
    }

    #[test]
    fn overrides() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("TASKRELAY_RELAYS", "wss://a.example, ,wss://b.example"),
            ("TASKRELAY_DATA_DIR", "/tmp/tr"),
            ("TASKRELAY_SECRET_KEY", "  "),
            ("TASKRELAY_ROOT_SECRET", "family"),
            ("TASKRELAY_PUBLISH_SPACING_MS", "50"),
            ("TASKRELAY_RECONNECT_MS", "100"),
            ("TASKRELAY_PUBLISH_RETRIES", "5"),
        ]))
        .unwrap();
        assert_eq!(config.relays, vec!["wss://a.example", "wss://b.example"]);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/tr"));
        assert!(config.secret_key.is_none());
        assert_eq!(config.root_secret, "family");
        assert_eq!(config.publisher_config().spacing, Duration::from_millis(50));
        assert_eq!(config.publisher_config().retry.max_attempts, 5);
        assert_eq!(config.relay_config().reconnect_delay, Duration::from_millis(100));
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let err = SyncConfig::from_lookup(lookup(&[("TASKRELAY_RECONNECT_MS", "soon")])).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
        let err = SyncConfig::from_lookup(lookup(&[("TASKRELAY_PUBLISH_RETRIES", "0")])).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
