// Copyright 2020 Joyent, Inc.

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::error::{FcpError, Result};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8481;
pub const DEFAULT_HTL: u32 = 20;
pub const DEFAULT_MAX_WORKERS: usize = 4;
pub const DEFAULT_FEC_ALGORITHM: &str = "OnionFEC_a_1_2";

/*
 * Keys other than CHKs are limited to 32768 bytes of metadata plus data.
 * Inserts stay a little below that.
 */
pub const DEFAULT_REDIRECT_THRESHOLD: usize = 32000;

pub const DEFAULT_SPLITFILE_THRESHOLD: usize = 1024 * 1024;

/// Client settings.  Every field has a default, so a partial JSON document
/// is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub hops_to_live: u32,
    /// Upper bound on concurrently running block operations.
    pub max_workers: usize,
    /// Fetch every inserted key back before accepting the insert.
    pub verify_inserts: bool,
    pub fec_algorithm: String,
    pub description: String,
    pub splitfile_threshold: usize,
    pub redirect_threshold: usize,
    pub max_redirects: usize,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: String::from(DEFAULT_HOST),
            port: DEFAULT_PORT,
            hops_to_live: DEFAULT_HTL,
            max_workers: DEFAULT_MAX_WORKERS,
            verify_inserts: true,
            fec_algorithm: String::from(DEFAULT_FEC_ALGORITHM),
            description: String::from("Onion FEC v1.2 file"),
            splitfile_threshold: DEFAULT_SPLITFILE_THRESHOLD,
            redirect_threshold: DEFAULT_REDIRECT_THRESHOLD,
            max_redirects: 16,
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn new<S: Into<String>>(host: S, port: u16) -> ClientConfig {
        ClientConfig {
            host: host.into(),
            port,
            ..ClientConfig::default()
        }
    }

    pub fn from_json(json: &str) -> Result<ClientConfig> {
        let config: ClientConfig = serde_json::from_str(json)
            .map_err(|e| FcpError::Config(format!("invalid client config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(FcpError::Config(String::from("max_workers must be at least 1")));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(FcpError::Config(String::from(
                "retry.max_attempts must be at least 1",
            )));
        }
        if self.retry.multiplier < 1.0 {
            return Err(FcpError::Config(String::from(
                "retry.multiplier must not be below 1.0",
            )));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How often, and how patiently, an insert is retried.
///
/// `max_attempts` of `None` retries until the insert succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: Some(10),
            initial_backoff_ms: 5000,
            max_backoff_ms: 120_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let ms = (self.initial_backoff_ms as f64) * self.multiplier.powi(exponent);
        Duration::from_millis(ms.min(self.max_backoff_ms as f64) as u64)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts >= max,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let config = ClientConfig::from_json(r#"{"port": 9481, "max_workers": 8}"#).unwrap();
        assert_eq!(config.port, 9481);
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.hops_to_live, DEFAULT_HTL);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.address(), "127.0.0.1:9481");
    }

    #[test]
    fn invalid_json_is_rejected() {
        assert!(ClientConfig::from_json(r#"{"max_workers": 0}"#).is_err());
        assert!(ClientConfig::from_json(r#"{"retry": {"max_attempts": 0}}"#).is_err());
        assert!(ClientConfig::from_json("port = 3").is_err());
    }

    #[test]
    fn unbounded_retry() {
        let config = ClientConfig::from_json(r#"{"retry": {"max_attempts": null}}"#).unwrap();
        assert!(!config.retry.exhausted(u32::max_value()));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: Some(4),
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert!(!policy.exhausted(3));
        assert!(policy.exhausted(4));
    }
}
