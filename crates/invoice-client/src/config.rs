//! Client configuration.

use std::env;

use thiserror::Error;

pub const DEFAULT_ENDPOINT: &str = "https://pay.infra.cash";
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_KEY_FETCH_ATTEMPTS: usize = 2;
pub const DEFAULT_PUSH_CONNECT_TIMEOUT_MS: u64 = 10_000;

const MIN_TIMEOUT_MS: u64 = 250;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL of the invoice service.
    pub endpoint: String,
    pub timeout_ms: u64,
    /// Attempts for idempotent GETs. Invoice creation is never retried.
    pub key_fetch_attempts: usize,
    /// Open a push-channel subscription once the invoice is live.
    pub listen: bool,
    /// Reject push messages that carry no signature envelope.
    pub require_signed_messages: bool,
    pub push_connect_timeout_ms: u64,
    pub trusted_endpoints: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid INVOICE_ENDPOINT: {0}")]
    InvalidEndpoint(String),
    #[error("invalid INVOICE_HTTP_TIMEOUT_MS: {0}")]
    InvalidTimeoutMs(String),
    #[error("invalid INVOICE_KEY_FETCH_ATTEMPTS: {0}")]
    InvalidKeyFetchAttempts(String),
    #[error("invalid INVOICE_LISTEN: {0}")]
    InvalidListen(String),
    #[error("invalid INVOICE_REQUIRE_SIGNED_MESSAGES: {0}")]
    InvalidRequireSignedMessages(String),
    #[error("invalid INVOICE_PUSH_CONNECT_TIMEOUT_MS: {0}")]
    InvalidPushConnectTimeoutMs(String),
    #[error("invalid INVOICE_TRUSTED_ENDPOINTS: {0}")]
    InvalidTrustedEndpoints(String),
}

impl ClientConfig {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            key_fetch_attempts: DEFAULT_KEY_FETCH_ATTEMPTS,
            listen: true,
            require_signed_messages: false,
            push_connect_timeout_ms: DEFAULT_PUSH_CONNECT_TIMEOUT_MS,
            trusted_endpoints: Vec::new(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let endpoint = match read("INVOICE_ENDPOINT") {
            Some(value) => {
                let parsed = url::Url::parse(&value)
                    .map_err(|error| ConfigError::InvalidEndpoint(error.to_string()))?;
                if parsed.scheme() != "http" && parsed.scheme() != "https" {
                    return Err(ConfigError::InvalidEndpoint(format!(
                        "expected http or https scheme, got {}",
                        parsed.scheme()
                    )));
                }
                value.trim_end_matches('/').to_string()
            }
            None => DEFAULT_ENDPOINT.to_string(),
        };

        let timeout_ms = read("INVOICE_HTTP_TIMEOUT_MS")
            .map(|value| value.parse::<u64>())
            .transpose()
            .map_err(|error| ConfigError::InvalidTimeoutMs(error.to_string()))?
            .unwrap_or(DEFAULT_TIMEOUT_MS)
            .max(MIN_TIMEOUT_MS);

        let key_fetch_attempts = read("INVOICE_KEY_FETCH_ATTEMPTS")
            .map(|value| value.parse::<usize>())
            .transpose()
            .map_err(|error| ConfigError::InvalidKeyFetchAttempts(error.to_string()))?
            .unwrap_or(DEFAULT_KEY_FETCH_ATTEMPTS)
            .max(1);

        let listen = read("INVOICE_LISTEN")
            .map(|value| parse_bool(&value).ok_or(ConfigError::InvalidListen(value)))
            .transpose()?
            .unwrap_or(true);

        let require_signed_messages = read("INVOICE_REQUIRE_SIGNED_MESSAGES")
            .map(|value| {
                parse_bool(&value).ok_or(ConfigError::InvalidRequireSignedMessages(value))
            })
            .transpose()?
            .unwrap_or(false);

        let push_connect_timeout_ms = read("INVOICE_PUSH_CONNECT_TIMEOUT_MS")
            .map(|value| value.parse::<u64>())
            .transpose()
            .map_err(|error| ConfigError::InvalidPushConnectTimeoutMs(error.to_string()))?
            .unwrap_or(DEFAULT_PUSH_CONNECT_TIMEOUT_MS)
            .max(MIN_TIMEOUT_MS);

        let trusted_endpoints = match read("INVOICE_TRUSTED_ENDPOINTS") {
            Some(value) => parse_endpoint_list(&value)?,
            None => Vec::new(),
        };

        Ok(Self {
            endpoint,
            timeout_ms,
            key_fetch_attempts,
            listen,
            require_signed_messages,
            push_connect_timeout_ms,
            trusted_endpoints,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_endpoint_list(value: &str) -> Result<Vec<String>, ConfigError> {
    let mut endpoints = Vec::new();
    for raw in value.split(',') {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        url::Url::parse(trimmed)
            .map_err(|error| ConfigError::InvalidTrustedEndpoints(format!("{trimmed}: {error}")))?;
        endpoints.push(trimmed.trim_end_matches('/').to_string());
    }
    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = ClientConfig::from_lookup(lookup_from(&[])).expect("config");
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert!(config.listen);
        assert!(!config.require_signed_messages);
    }

    #[test]
    fn overrides_are_parsed_and_clamped() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("INVOICE_ENDPOINT", "http://127.0.0.1:8080/"),
            ("INVOICE_HTTP_TIMEOUT_MS", "10"),
            ("INVOICE_KEY_FETCH_ATTEMPTS", "0"),
            ("INVOICE_LISTEN", "off"),
            ("INVOICE_REQUIRE_SIGNED_MESSAGES", "yes"),
            (
                "INVOICE_TRUSTED_ENDPOINTS",
                "https://pay.infra.cash/, ,https://alt.example.com",
            ),
        ]))
        .expect("config");

        assert_eq!(config.endpoint, "http://127.0.0.1:8080");
        assert_eq!(config.timeout_ms, MIN_TIMEOUT_MS);
        assert_eq!(config.key_fetch_attempts, 1);
        assert!(!config.listen);
        assert!(config.require_signed_messages);
        assert_eq!(
            config.trusted_endpoints,
            vec![
                "https://pay.infra.cash".to_string(),
                "https://alt.example.com".to_string()
            ]
        );
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let error = ClientConfig::from_lookup(lookup_from(&[("INVOICE_LISTEN", "maybe")]))
            .expect_err("invalid bool");
        assert_eq!(error, ConfigError::InvalidListen("maybe".to_string()));
        assert!(error.to_string().contains("INVOICE_LISTEN"));

        let error = ClientConfig::from_lookup(lookup_from(&[("INVOICE_ENDPOINT", "ftp://x")]))
            .expect_err("invalid scheme");
        assert!(matches!(error, ConfigError::InvalidEndpoint(_)));

        let error = ClientConfig::from_lookup(lookup_from(&[("INVOICE_HTTP_TIMEOUT_MS", "soon")]))
            .expect_err("invalid number");
        assert!(matches!(error, ConfigError::InvalidTimeoutMs(_)));
    }
}
