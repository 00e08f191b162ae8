//! Worker configuration from environment variables.
//!
//! Expected variables:
//! - `DATABASE_URL` (required)
//! - `DATABASE_MAX_CONNECTIONS` (default 5)
//! - `PDP_BASE_URL` (required)
//! - `PDP_API_KEY` (default empty)
//! - `PDP_TIMEOUT_SECS` (default 10)
//! - `JOB_POLL_INTERVAL_SECS` (default 10)
//! - `JOB_BATCH_SIZE` (default 10)
//! - `JOB_MAX_CONCURRENCY` (default 4)
//! - `JOB_STALE_AFTER_SECS` (default 300)
//! - `JOB_MAX_RETRIES` (default 5)
//! - `JOB_RETRY_BASE_SECS` (default 60)
//! - `JOB_RETRY_MAX_DELAY_SECS` (default 3600)
//! - `ALERT_WEBHOOK_URL` (optional)

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::db::DatabaseConfig;
use crate::external::pdp::PdpClientConfig;
use crate::jobs::{DEFAULT_MAX_RETRIES, DispatcherConfig, RetryPolicy};
use crate::services::ProducerConfig;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database: DatabaseConfig,
    pub pdp: PdpClientConfig,
    pub dispatcher: DispatcherConfig,
    /// Applied by the entity services to the jobs they create.
    pub producer: ProducerConfig,
    pub alert_webhook_url: Option<String>,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes `std::env::var`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let mut database = DatabaseConfig::new(required("DATABASE_URL")?);
        database.max_connections = parse_or(&get, "DATABASE_MAX_CONNECTIONS", 5u32)?;
        if database.max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "DATABASE_MAX_CONNECTIONS",
                value: "0".into(),
            });
        }

        let api_key = get("PDP_API_KEY").unwrap_or_else(|| {
            warn!("PDP_API_KEY not set; PDP requests will carry an empty apikey header");
            String::new()
        });
        let pdp = PdpClientConfig::new(required("PDP_BASE_URL")?, api_key)
            .with_timeout(secs(parse_or(&get, "PDP_TIMEOUT_SECS", 10u64)?));

        let producer = ProducerConfig {
            max_retries: parse_or(&get, "JOB_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
        };
        let retry_policy = RetryPolicy::new(
            secs(parse_or(&get, "JOB_RETRY_BASE_SECS", 60u64)?),
            secs(parse_or(&get, "JOB_RETRY_MAX_DELAY_SECS", 3600u64)?),
        );
        if !retry_policy.is_uncapped_within(producer.max_retries) {
            warn!(
                max_retries = producer.max_retries,
                max_delay_secs = retry_policy.max_delay.as_secs(),
                "JOB_RETRY_MAX_DELAY_SECS caps backoff before the last retry; later delays stop doubling"
            );
        }

        let batch_size: usize = parse_or(&get, "JOB_BATCH_SIZE", 10)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "JOB_BATCH_SIZE",
                value: "0".into(),
            });
        }

        let dispatcher = DispatcherConfig::default()
            .with_poll_interval(secs(parse_or(&get, "JOB_POLL_INTERVAL_SECS", 10u64)?.max(1)))
            .with_batch_size(batch_size)
            .with_max_concurrency(parse_or(&get, "JOB_MAX_CONCURRENCY", 4usize)?.max(1))
            .with_stale_after(secs(parse_or(&get, "JOB_STALE_AFTER_SECS", 300u64)?))
            .with_retry_policy(retry_policy);

        Ok(Self {
            database,
            pdp,
            dispatcher,
            producer,
            alert_webhook_url: get("ALERT_WEBHOOK_URL"),
        })
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&'static str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("DATABASE_URL", "postgres://localhost/portal"),
        ("PDP_BASE_URL", "http://pdp:8082"),
    ];

    #[test]
    fn defaults_match_documented_values() {
        let cfg = WorkerConfig::from_lookup(lookup(&REQUIRED)).unwrap();

        assert_eq!(cfg.database.max_connections, 5);
        assert_eq!(cfg.pdp.timeout, Duration::from_secs(10));
        assert_eq!(cfg.pdp.api_key, "");
        assert_eq!(cfg.dispatcher.poll_interval, Duration::from_secs(10));
        assert_eq!(cfg.dispatcher.batch_size, 10);
        assert_eq!(cfg.dispatcher.max_concurrency, 4);
        assert_eq!(cfg.dispatcher.stale_after, Duration::from_secs(300));
        assert_eq!(cfg.dispatcher.retry_policy, RetryPolicy::default());
        assert_eq!(cfg.producer, ProducerConfig::default());
        assert_eq!(cfg.alert_webhook_url, None);
    }

    #[test]
    fn overrides_are_applied() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("PDP_API_KEY", "secret"),
            ("JOB_BATCH_SIZE", "25"),
            ("JOB_MAX_RETRIES", "3"),
            ("JOB_RETRY_BASE_SECS", "5"),
            ("ALERT_WEBHOOK_URL", "https://alerts.example/hook"),
        ]);
        let cfg = WorkerConfig::from_lookup(lookup(&pairs)).unwrap();

        assert_eq!(cfg.pdp.api_key, "secret");
        assert_eq!(cfg.dispatcher.batch_size, 25);
        assert_eq!(cfg.producer.max_retries, 3);
        assert_eq!(cfg.dispatcher.retry_policy.base_delay, Duration::from_secs(5));
        assert_eq!(cfg.alert_webhook_url.as_deref(), Some("https://alerts.example/hook"));
    }

    #[test]
    fn missing_and_invalid_values_are_reported() {
        let err = WorkerConfig::from_lookup(lookup(&[("PDP_BASE_URL", "http://pdp")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DATABASE_URL"));

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("JOB_BATCH_SIZE", "ten"));
        let err = WorkerConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "JOB_BATCH_SIZE",
                value: "ten".into()
            }
        );

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("JOB_BATCH_SIZE", "0"));
        assert!(WorkerConfig::from_lookup(lookup(&pairs)).is_err());
    }
}
