//! Configuration - instance identity and header naming.
//!
//! Threaded explicitly into the runtime and the client. Nothing reads it from
//! global state.

use ulid::Ulid;

/// Default prefix for every envelope header key.
pub const DEFAULT_HEADERS_PREFIX: &str = "ntrpc-";

const ENV_HEADERS_PREFIX: &str = "NTRPC_HEADERS_PREFIX";
const ENV_INSTANCE_ID: &str = "NTRPC_INSTANCE_ID";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    /// Prepended to every header key (`ntrpc-id`, `ntrpc-type`, ...).
    pub headers_prefix: String,
    /// Stamped as `source` on every outbound envelope.
    pub instance_id: String,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            headers_prefix: DEFAULT_HEADERS_PREFIX.to_owned(),
            instance_id: Ulid::new().to_string(),
        }
    }
}

impl Configuration {
    /// Load from environment variables.
    ///
    /// Optional (with defaults):
    /// - `NTRPC_HEADERS_PREFIX`: header key prefix (default: `ntrpc-`)
    /// - `NTRPC_INSTANCE_ID`: instance id (default: fresh ULID)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(prefix) = lookup(ENV_HEADERS_PREFIX) {
            if prefix.chars().any(|c| c.is_whitespace() || c == ':') {
                return Err(ConfigError::Invalid(
                    ENV_HEADERS_PREFIX,
                    "must not contain whitespace or ':'",
                ));
            }
            config.headers_prefix = prefix;
        }

        if let Some(instance_id) = lookup(ENV_INSTANCE_ID) {
            if instance_id.trim().is_empty() {
                return Err(ConfigError::Invalid(ENV_INSTANCE_ID, "must not be empty"));
            }
            config.instance_id = instance_id;
        }

        Ok(config)
    }

    pub fn with_headers_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.headers_prefix = prefix.into();
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Full header key for `name` (`id`, `parent-id`, ...).
    pub fn header(&self, name: &str) -> String {
        format!("{}{}", self.headers_prefix, name)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Configuration::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.headers_prefix, "ntrpc-");
        assert!(config.instance_id.parse::<Ulid>().is_ok());
        assert_eq!(config.header("id"), "ntrpc-id");
    }

    #[test]
    fn reads_overrides() {
        let config = Configuration::from_lookup(lookup(&[
            ("NTRPC_HEADERS_PREFIX", "x-rpc-"),
            ("NTRPC_INSTANCE_ID", "worker-1"),
        ]))
        .unwrap();
        assert_eq!(config.header("type"), "x-rpc-type");
        assert_eq!(config.instance_id, "worker-1");
    }

    #[test]
    fn rejects_bad_values() {
        let err = Configuration::from_lookup(lookup(&[("NTRPC_HEADERS_PREFIX", "bad prefix")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("NTRPC_HEADERS_PREFIX", _)));

        let err = Configuration::from_lookup(lookup(&[("NTRPC_INSTANCE_ID", "  ")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("NTRPC_INSTANCE_ID", _)));
    }
}
