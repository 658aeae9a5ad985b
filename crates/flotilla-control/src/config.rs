//! Configuration types for the control plane.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{ControlError, ControlResult};

/// Control-plane configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Server identity.
    pub server: ServerConfig,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
    /// Evaluation broker configuration.
    pub broker: BrokerConfig,
    /// Garbage collection configuration.
    pub gc: GcConfig,
}

impl ControlConfig {
    /// Loads configuration from `flotilla.toml` merged with
    /// `FLOTILLA_`-prefixed environment variables.
    pub fn load() -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file("flotilla.toml"))
            .merge(Env::prefixed("FLOTILLA_").split("_"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }
}

/// Server identity configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Region this server answers for.
    pub region: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            region: "global".to_owned(),
        }
    }
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Minimum TTL granted to a node; the granted TTL is jittered into
    /// `[min, 2*min)` to spread renewals.
    #[serde(with = "serde_duration_secs")]
    pub min_heartbeat_ttl: Duration,
    /// How often expired heartbeats are swept.
    #[serde(with = "serde_duration_secs")]
    pub sweep_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            min_heartbeat_ttl: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Evaluation broker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// How long a dispatched evaluation may stay unacknowledged before
    /// it is nacked and redelivered.
    #[serde(with = "serde_duration_secs")]
    pub visibility_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
        }
    }
}

/// Garbage collection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Minimum age before a terminal evaluation may be collected.
    #[serde(with = "serde_duration_secs")]
    pub eval_gc_threshold: Duration,
    /// Minimum age before a dead job may be collected.
    #[serde(with = "serde_duration_secs")]
    pub job_gc_threshold: Duration,
    /// Minimum age before a down node may be collected.
    #[serde(with = "serde_duration_secs")]
    pub node_gc_threshold: Duration,
    /// How often core GC evaluations are emitted while leader.
    #[serde(with = "serde_duration_secs")]
    pub gc_interval: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            eval_gc_threshold: Duration::from_secs(60 * 60),
            job_gc_threshold: Duration::from_secs(4 * 60 * 60),
            node_gc_threshold: Duration::from_secs(24 * 60 * 60),
            gc_interval: Duration::from_secs(60),
        }
    }
}

/// Serde helper for Duration as seconds.
mod serde_duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ControlConfig::default();
        assert_eq!(config.server.region, "global");
        assert_eq!(config.heartbeat.min_heartbeat_ttl, Duration::from_secs(10));
        assert_eq!(config.broker.visibility_timeout, Duration::from_secs(60));
    }

    #[test]
    fn gc_defaults() {
        let config = GcConfig::default();
        assert_eq!(config.eval_gc_threshold, Duration::from_secs(3600));
        assert!(config.job_gc_threshold > config.eval_gc_threshold);
        assert!(config.node_gc_threshold > config.job_gc_threshold);
    }
}
