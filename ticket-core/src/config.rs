//! Process configuration.
//!
//! Keys are read once at startup and then passed around explicitly as a
//! [`KeyRing`]; nothing else in the crate looks at the environment.

use crate::crypto::{KeyError, KeyRing, SigningKey};
use thiserror::Error;

/// Active signing key, base64url.
pub const ENV_SIGNING_KEY: &str = "TICKET_SIGNING_KEY";
/// Extra verification-only keys, comma-separated base64url.
pub const ENV_TRUSTED_KEYS: &str = "TICKET_TRUSTED_KEYS";
/// Base URL used to build ticket share links.
pub const ENV_SHARE_BASE_URL: &str = "TICKET_SHARE_BASE_URL";

pub const DEFAULT_SHARE_BASE_URL: &str = "http://localhost:3000";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{var}: {source}")]
    InvalidKey {
        var: &'static str,
        #[source]
        source: KeyError,
    },
}

/// Configuration for [`TicketService`](crate::service::TicketService).
#[derive(Debug, Clone)]
pub struct TicketConfig {
    /// Signing and verification keys
    pub keys: KeyRing,
    /// Prefix for share links (`{base}/ticket/{registration_id}`)
    pub share_base_url: String,
}

impl TicketConfig {
    pub fn new(keys: KeyRing) -> Self {
        Self {
            keys,
            share_base_url: DEFAULT_SHARE_BASE_URL.to_string(),
        }
    }

    pub fn with_share_base_url(mut self, url: impl Into<String>) -> Self {
        self.share_base_url = url.into();
        self
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let active = lookup(ENV_SIGNING_KEY)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing(ENV_SIGNING_KEY))?;
        let active = SigningKey::from_base64(&active).map_err(|source| ConfigError::InvalidKey {
            var: ENV_SIGNING_KEY,
            source,
        })?;

        let mut keys = KeyRing::new(active);
        if let Some(trusted) = lookup(ENV_TRUSTED_KEYS) {
            for encoded in trusted.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let key = SigningKey::from_base64(encoded).map_err(|source| ConfigError::InvalidKey {
                    var: ENV_TRUSTED_KEYS,
                    source,
                })?;
                keys = keys.with_trusted(key);
            }
        }

        let share_base_url = lookup(ENV_SHARE_BASE_URL)
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_SHARE_BASE_URL.to_string());

        tracing::debug!(
            active_key = %keys.active().key_id(),
            trusted_keys = keys.iter().count(),
            %share_base_url,
            "loaded ticket configuration"
        );

        Ok(Self { keys, share_base_url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, String)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_missing_signing_key() {
        let err = TicketConfig::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(err, ConfigError::Missing(ENV_SIGNING_KEY));
    }

    #[test]
    fn test_blank_signing_key_is_missing() {
        let err = TicketConfig::from_lookup(lookup(&[(ENV_SIGNING_KEY, "  ".to_string())])).unwrap_err();
        assert_eq!(err, ConfigError::Missing(ENV_SIGNING_KEY));
    }

    #[test]
    fn test_short_signing_key() {
        let short = SigningKey::generate().to_base64()[..20].to_string();
        let err = TicketConfig::from_lookup(lookup(&[(ENV_SIGNING_KEY, short)])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidKey { var: ENV_SIGNING_KEY, source: KeyError::TooShort(_) }
        ));
    }

    #[test]
    fn test_full_config() {
        let active = SigningKey::generate();
        let old = SigningKey::generate();
        let config = TicketConfig::from_lookup(lookup(&[
            (ENV_SIGNING_KEY, active.to_base64()),
            (ENV_TRUSTED_KEYS, format!(" {} ,", old.to_base64())),
            (ENV_SHARE_BASE_URL, "https://tickets.example".to_string()),
        ]))
        .unwrap();

        assert_eq!(config.keys.active().key_id(), active.key_id());
        let ids: Vec<String> = config.keys.iter().map(|k| k.key_id()).collect();
        assert_eq!(ids, vec![active.key_id(), old.key_id()]);
        assert_eq!(config.share_base_url, "https://tickets.example");
    }

    #[test]
    fn test_default_share_url() {
        let config = TicketConfig::from_lookup(lookup(&[(ENV_SIGNING_KEY, SigningKey::generate().to_base64())])).unwrap();
        assert_eq!(config.share_base_url, DEFAULT_SHARE_BASE_URL);
    }
}
