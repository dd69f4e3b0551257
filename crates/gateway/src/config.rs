//! Gateway configuration read from the environment.

use crate::error::{GatewayError, Result};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Port for the WebSocket/HTTP listener.
    pub http_port: u16,
    /// Port for the Prometheus exporter.
    pub metrics_port: u16,
    /// Outbound queue capacity per connection.
    pub client_queue_capacity: usize,
    /// Capacity of the producer → router ingest channel.
    pub ingest_capacity: usize,
    /// Interval between server pings.
    pub ping_interval: Duration,
    /// Connections silent for longer than this are evicted.
    pub stale_client_timeout: Duration,
    /// Latency above which updates are logged.
    pub max_latency_ms: f64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_port: 8000,
            metrics_port: 9093,
            client_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            ingest_capacity: 1024,
            ping_interval: Duration::from_secs(30),
            stale_client_timeout: Duration::from_secs(120),
            max_latency_ms: 3000.0,
        }
    }
}

impl GatewayConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read configuration through `lookup`; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            http_port: parse_or(&lookup, "HTTP_PORT", defaults.http_port)?,
            metrics_port: parse_or(&lookup, "METRICS_PORT", defaults.metrics_port)?,
            client_queue_capacity: parse_or(
                &lookup,
                "CLIENT_QUEUE_CAPACITY",
                defaults.client_queue_capacity,
            )?,
            ingest_capacity: parse_or(&lookup, "INGEST_CAPACITY", defaults.ingest_capacity)?,
            ping_interval: Duration::from_secs(parse_or(
                &lookup,
                "PING_INTERVAL_SECS",
                defaults.ping_interval.as_secs(),
            )?),
            stale_client_timeout: Duration::from_secs(parse_or(
                &lookup,
                "STALE_CLIENT_SECS",
                defaults.stale_client_timeout.as_secs(),
            )?),
            max_latency_ms: parse_or(&lookup, "MAX_LATENCY_MS", defaults.max_latency_ms)?,
        };

        if config.ping_interval.is_zero() || config.stale_client_timeout.is_zero() {
            return Err(GatewayError::Config(
                "PING_INTERVAL_SECS and STALE_CLIENT_SECS must be positive".to_string(),
            ));
        }
        Ok(config)
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| GatewayError::Config(format!("{key} must be a number, got {raw:?}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_unset() {
        let config = GatewayConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.http_port, 8000);
        assert_eq!(config.client_queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.ping_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let vars = HashMap::from([
            ("HTTP_PORT", "9000"),
            ("CLIENT_QUEUE_CAPACITY", "8"),
            ("STALE_CLIENT_SECS", "5"),
        ]);
        let config =
            GatewayConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.client_queue_capacity, 8);
        assert_eq!(config.stale_client_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_number() {
        let result = GatewayConfig::from_lookup(|key| {
            (key == "METRICS_PORT").then(|| "not-a-port".to_string())
        });
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = GatewayConfig::from_lookup(|key| {
            (key == "PING_INTERVAL_SECS").then(|| "0".to_string())
        });
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }
}
