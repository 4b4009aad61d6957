//! Client configuration.
//!
//! # Design
//! One plain struct deserialized with serde. Every field has a default, so a
//! JSON document only names what it overrides. `from_env` reads the same
//! fields from `AUTHLINK_*` variables for hosts that configure through the
//! environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    /// Accept a lone certificate on its validity window alone.
    pub accept_single_self_signed: bool,
    pub call_timeout_ms: u64,
    /// Challenges answered per logical request before the 401 is handed back.
    pub max_challenge_retries: u32,
    /// Subjects of trusted root certificates for chain validation.
    pub trusted_roots: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            accept_single_self_signed: false,
            call_timeout_ms: 30_000,
            max_challenge_retries: 2,
            trusted_roots: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| TransportError::Config(e.to_string()))
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes `std::env::var`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(url) = lookup("AUTHLINK_BASE_URL") {
            config.base_url = url;
        }
        if let Some(raw) = lookup("AUTHLINK_ACCEPT_SELF_SIGNED") {
            config.accept_single_self_signed = parse_bool(&raw).ok_or_else(|| {
                TransportError::Config(format!("AUTHLINK_ACCEPT_SELF_SIGNED: {raw}"))
            })?;
        }
        if let Some(raw) = lookup("AUTHLINK_CALL_TIMEOUT_MS") {
            config.call_timeout_ms = raw
                .parse()
                .map_err(|_| TransportError::Config(format!("AUTHLINK_CALL_TIMEOUT_MS: {raw}")))?;
        }
        if let Some(raw) = lookup("AUTHLINK_MAX_CHALLENGE_RETRIES") {
            config.max_challenge_retries = raw.parse().map_err(|_| {
                TransportError::Config(format!("AUTHLINK_MAX_CHALLENGE_RETRIES: {raw}"))
            })?;
        }
        if let Some(raw) = lookup("AUTHLINK_TRUSTED_ROOTS") {
            config.trusted_roots = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(config)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let raw = r#"{"base_url":"https://mail.example.com","accept_single_self_signed":true}"#;
        let config = ClientConfig::from_json(raw).unwrap();
        assert_eq!(config.base_url, "https://mail.example.com");
        assert!(config.accept_single_self_signed);
        assert_eq!(config.max_challenge_retries, 2);
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn bad_json_is_a_config_error() {
        let err = ClientConfig::from_json(r#"{"call_timeout_ms":"soon"}"#).unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }

    #[test]
    fn lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("AUTHLINK_BASE_URL", "http://127.0.0.1:9000"),
            ("AUTHLINK_ACCEPT_SELF_SIGNED", "yes"),
            ("AUTHLINK_CALL_TIMEOUT_MS", "250"),
            ("AUTHLINK_TRUSTED_ROOTS", "CN=root, CN=backup,"),
        ]
        .into_iter()
        .collect();
        let config = ClientConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.base_url, "http://127.0.0.1:9000");
        assert!(config.accept_single_self_signed);
        assert_eq!(config.call_timeout_ms, 250);
        assert_eq!(config.trusted_roots, vec!["CN=root", "CN=backup"]);
    }

    #[test]
    fn lookup_rejects_garbage() {
        let err = ClientConfig::from_lookup(|k| {
            (k == "AUTHLINK_ACCEPT_SELF_SIGNED").then(|| "maybe".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }
}
