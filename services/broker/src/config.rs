use anyhow::{Context, Result, bail};
use comet_common::validate_ivorn;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

use crate::transport::tcp::{ProtocolMode, ReconnectPolicy};

// Broker service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    // Identifier stamped on acks and heartbeats.
    pub local_ivorn: String,
    // Publisher listener bind address; publishing disabled when unset.
    pub publisher_bind: Option<SocketAddr>,
    // Receiver listener bind address; receiving disabled when unset.
    pub receiver_bind: Option<SocketAddr>,
    // Remote publishers to subscribe to.
    pub subscribe_to: Vec<SocketAddr>,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Max payload size accepted on any connection.
    pub max_frame_bytes: usize,
    // Publisher heartbeat interval.
    pub keepalive_interval_ms: u64,
    // Reconnect backoff floor.
    pub reconnect_initial_ms: u64,
    // Reconnect backoff ceiling.
    pub reconnect_max_ms: u64,
    // Backoff escalation factor.
    pub reconnect_factor: f64,
    // Relative jitter applied to each reconnect sleep.
    pub reconnect_jitter: f64,
    // If true, persistent connections close on unparsable or unexpected input.
    pub strict_protocol: bool,
}

pub const DEFAULT_LOCAL_IVORN: &str = "ivo://comet.broker/default";
const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8080";
const DEFAULT_MAX_FRAME_BYTES: usize = comet_wire::DEFAULT_MAX_FRAME_BYTES;
const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 5000;
const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1000;
const DEFAULT_RECONNECT_MAX_MS: u64 = 3_600_000;
const DEFAULT_RECONNECT_FACTOR: f64 = std::f64::consts::E;
const DEFAULT_RECONNECT_JITTER: f64 = 0.119;

#[derive(Debug, Deserialize)]
struct BrokerConfigOverride {
    local_ivorn: Option<String>,
    publisher_bind: Option<String>,
    receiver_bind: Option<String>,
    subscribe_to: Option<Vec<String>>,
    metrics_bind: Option<String>,
    max_frame_bytes: Option<usize>,
    keepalive_interval_ms: Option<u64>,
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    reconnect_factor: Option<f64>,
    reconnect_jitter: Option<f64>,
    strict_protocol: Option<bool>,
}

fn parse_addr_list(value: &str, what: &str) -> Result<Vec<SocketAddr>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<SocketAddr>()
                .with_context(|| format!("parse {what} entry {item:?}"))
        })
        .collect()
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64, valid: impl Fn(f64) -> bool) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite() && valid(*value))
        .unwrap_or(default)
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let local_ivorn = std::env::var("COMET_LOCAL_IVORN")
            .unwrap_or_else(|_| DEFAULT_LOCAL_IVORN.to_string());
        let publisher_bind = std::env::var("COMET_PUBLISHER_BIND")
            .ok()
            .map(|value| value.parse::<SocketAddr>())
            .transpose()
            .with_context(|| "parse COMET_PUBLISHER_BIND")?;
        let receiver_bind = std::env::var("COMET_RECEIVER_BIND")
            .ok()
            .map(|value| value.parse::<SocketAddr>())
            .transpose()
            .with_context(|| "parse COMET_RECEIVER_BIND")?;
        let subscribe_to = match std::env::var("COMET_SUBSCRIBE_TO") {
            Ok(value) => parse_addr_list(&value, "COMET_SUBSCRIBE_TO")?,
            Err(_) => Vec::new(),
        };
        let metrics_bind = std::env::var("COMET_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse COMET_METRICS_BIND")?;
        let max_frame_bytes = std::env::var("COMET_MAX_FRAME_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);
        let keepalive_interval_ms =
            env_u64("COMET_KEEPALIVE_INTERVAL_MS", DEFAULT_KEEPALIVE_INTERVAL_MS);
        let reconnect_initial_ms =
            env_u64("COMET_RECONNECT_INITIAL_MS", DEFAULT_RECONNECT_INITIAL_MS);
        let reconnect_max_ms = env_u64("COMET_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS);
        let reconnect_factor = env_f64(
            "COMET_RECONNECT_FACTOR",
            DEFAULT_RECONNECT_FACTOR,
            |value| value >= 1.0,
        );
        let reconnect_jitter = env_f64(
            "COMET_RECONNECT_JITTER",
            DEFAULT_RECONNECT_JITTER,
            |value| (0.0..1.0).contains(&value),
        );
        let strict_protocol = std::env::var("COMET_STRICT_PROTOCOL")
            .ok()
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let config = Self {
            local_ivorn,
            publisher_bind,
            receiver_bind,
            subscribe_to,
            metrics_bind,
            max_frame_bytes,
            keepalive_interval_ms,
            reconnect_initial_ms,
            reconnect_max_ms,
            reconnect_factor,
            reconnect_jitter,
            strict_protocol,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("COMET_BROKER_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read COMET_BROKER_CONFIG: {path}"))?;
            let override_cfg: BrokerConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse broker config yaml")?;
            if let Some(value) = override_cfg.local_ivorn {
                config.local_ivorn = value;
            }
            if let Some(value) = override_cfg.publisher_bind {
                config.publisher_bind =
                    Some(value.parse().with_context(|| "parse publisher_bind")?);
            }
            if let Some(value) = override_cfg.receiver_bind {
                config.receiver_bind =
                    Some(value.parse().with_context(|| "parse receiver_bind")?);
            }
            if let Some(values) = override_cfg.subscribe_to {
                config.subscribe_to = parse_addr_list(&values.join(","), "subscribe_to")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.max_frame_bytes
                && value > 0
            {
                config.max_frame_bytes = value;
            }
            if let Some(value) = override_cfg.keepalive_interval_ms
                && value > 0
            {
                config.keepalive_interval_ms = value;
            }
            if let Some(value) = override_cfg.reconnect_initial_ms
                && value > 0
            {
                config.reconnect_initial_ms = value;
            }
            if let Some(value) = override_cfg.reconnect_max_ms
                && value > 0
            {
                config.reconnect_max_ms = value;
            }
            if let Some(value) = override_cfg.reconnect_factor
                && value.is_finite()
                && value >= 1.0
            {
                config.reconnect_factor = value;
            }
            if let Some(value) = override_cfg.reconnect_jitter
                && (0.0..1.0).contains(&value)
            {
                config.reconnect_jitter = value;
            }
            if let Some(value) = override_cfg.strict_protocol {
                config.strict_protocol = value;
            }
            config.validate()?;
        }
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        validate_ivorn(&self.local_ivorn)
            .with_context(|| format!("invalid local ivorn {:?}", self.local_ivorn))?;
        if self.reconnect_initial_ms > self.reconnect_max_ms {
            bail!(
                "reconnect_initial_ms ({}) exceeds reconnect_max_ms ({})",
                self.reconnect_initial_ms,
                self.reconnect_max_ms
            );
        }
        Ok(())
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.reconnect_initial_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            factor: self.reconnect_factor,
            jitter: self.reconnect_jitter,
        }
    }

    pub fn protocol_mode(&self) -> ProtocolMode {
        ProtocolMode::from_strict(self.strict_protocol)
    }
}
