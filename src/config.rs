// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replication core.
//!
//! Configuration carries tunables and connection URLs only. Engines receive
//! already-connected store and channel handles; resolving URLs into handles is
//! the embedding process's job.
//!
//! # Quick Start
//!
//! ```rust
//! use store_replication::config::{DeploymentMode, ReplicationConfig};
//!
//! let config = ReplicationConfig {
//!     mode: DeploymentMode::Mirror,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── mode: DeploymentMode          # async (queue) or mirror (dual-write)
//! ├── endpoints: EndpointConfig     # store + broker URLs
//! ├── channels: ChannelConfig       # channel names, consumer group
//! ├── consumer: ConsumerConfig      # block timeout, redelivery, rate limit
//! ├── mirror: MirrorConfig          # compensation, secondary circuit
//! ├── health: HealthConfig          # probe timeout
//! └── shutdown_timeout: String      # consumer drain timeout
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "mode": "async",
//!   "endpoints": {
//!     "primary_url": "memory://primary",
//!     "secondary_url": "memory://secondary",
//!     "relational_url": "sqlite://replica.db",
//!     "broker_url": "redis://127.0.0.1:6379"
//!   },
//!   "consumer": { "block_timeout": "5s", "max_deliveries": 10 }
//! }
//! ```
//!
//! # Environment
//!
//! [`ReplicationConfig::from_env()`] reads `REPLICATION_MODE`,
//! `PRIMARY_STORE_URL`, `SECONDARY_STORE_URL`, `RELATIONAL_STORE_URL` and
//! `BROKER_URL` on top of the defaults.

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default channel for document replication.
pub const DEFAULT_REPLICATION_CHANNEL: &str = "db_replication";

/// Default channel for cross-technology (relational) replication.
pub const DEFAULT_RELATIONAL_CHANNEL: &str = "pg_replication";

/// Default informational sync-status channel.
pub const DEFAULT_SYNC_STATUS_CHANNEL: &str = "db_sync_status";

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Which write path the deployment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Primary write + durable publish; secondary catches up in the background.
    #[default]
    Async,
    /// Blocking dual-write with comparison-based commit/abort.
    Mirror,
}

impl DeploymentMode {
    /// Parse a mode name. Accepts `sync` as an alias for `mirror`.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "async" | "queue" => Ok(Self::Async),
            "mirror" | "sync" => Ok(Self::Mirror),
            other => Err(ReplicationError::Config(format!(
                "unknown replication mode '{}' (expected async or mirror)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Async => write!(f, "async"),
            Self::Mirror => write!(f, "mirror"),
        }
    }
}

/// The top-level config object passed to the engine constructors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Deployment write path.
    #[serde(default)]
    pub mode: DeploymentMode,

    /// Store and broker endpoints.
    #[serde(default)]
    pub endpoints: EndpointConfig,

    /// Channel naming.
    #[serde(default)]
    pub channels: ChannelConfig,

    /// Background consumer settings (async mode).
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Mirror engine settings (mirror mode).
    #[serde(default)]
    pub mirror: MirrorConfig,

    /// Health reporter settings.
    #[serde(default)]
    pub health: HealthConfig,

    /// How long shutdown waits for consumer tasks to drain (e.g. "10s").
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,
}

fn default_shutdown_timeout() -> String {
    "10s".to_string()
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::default(),
            endpoints: EndpointConfig::default(),
            channels: ChannelConfig::default(),
            consumer: ConsumerConfig::default(),
            mirror: MirrorConfig::default(),
            health: HealthConfig::default(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl ReplicationConfig {
    /// Create a config tuned for fast tests.
    pub fn for_testing(mode: DeploymentMode) -> Self {
        Self {
            mode,
            endpoints: EndpointConfig::default(),
            channels: ChannelConfig::default(),
            consumer: ConsumerConfig::for_testing(),
            mirror: MirrorConfig::for_testing(),
            health: HealthConfig {
                probe_timeout: "500ms".to_string(),
            },
            shutdown_timeout: "2s".to_string(),
        }
    }

    /// Defaults overlaid with process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup` (environment-style keys).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(mode) = lookup("REPLICATION_MODE") {
            config.mode = DeploymentMode::parse(&mode)?;
        }
        if let Some(url) = lookup("PRIMARY_STORE_URL") {
            config.endpoints.primary_url = url;
        }
        if let Some(url) = lookup("SECONDARY_STORE_URL") {
            config.endpoints.secondary_url = url;
        }
        if let Some(url) = lookup("RELATIONAL_STORE_URL") {
            config.endpoints.relational_url = Some(url).filter(|u| !u.is_empty());
        }
        if let Some(url) = lookup("BROKER_URL") {
            config.endpoints.broker_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.primary_url.trim().is_empty() {
            return Err(ReplicationError::Config("primary_url is empty".into()));
        }
        if self.endpoints.primary_url == self.endpoints.secondary_url {
            return Err(ReplicationError::Config(
                "primary and secondary store URLs must differ".into(),
            ));
        }
        if self.mode == DeploymentMode::Async && self.endpoints.broker_url.trim().is_empty() {
            return Err(ReplicationError::Config(
                "broker_url is required in async mode".into(),
            ));
        }
        for (label, name) in [
            ("replication", &self.channels.replication),
            ("relational", &self.channels.relational),
        ] {
            if name.trim().is_empty() {
                return Err(ReplicationError::Config(format!(
                    "{} channel name is empty",
                    label
                )));
            }
        }
        for (label, value) in [
            ("consumer.block_timeout", &self.consumer.block_timeout),
            ("consumer.backoff_base", &self.consumer.backoff_base),
            ("consumer.backoff_max", &self.consumer.backoff_max),
            ("mirror.circuit_reset_timeout", &self.mirror.circuit_reset_timeout),
            ("health.probe_timeout", &self.health.probe_timeout),
            ("shutdown_timeout", &self.shutdown_timeout),
        ] {
            let parsed = humantime::parse_duration(value).map_err(|e| {
                ReplicationError::Config(format!("{} '{}': {}", label, value, e))
            })?;
            // A zero block is "wait forever" to Redis.
            if parsed.is_zero() {
                return Err(ReplicationError::Config(format!(
                    "{} '{}' must be greater than zero",
                    label, value
                )));
            }
        }
        Ok(())
    }

    /// Parse the shutdown timeout to a Duration.
    pub fn shutdown_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.shutdown_timeout).unwrap_or(Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EndpointConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Connection endpoints. Resolved into handles outside the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_primary_url")]
    pub primary_url: String,

    #[serde(default = "default_secondary_url")]
    pub secondary_url: String,

    /// Optional heterogeneous (relational) secondary.
    #[serde(default)]
    pub relational_url: Option<String>,

    #[serde(default = "default_broker_url")]
    pub broker_url: String,
}

fn default_primary_url() -> String {
    "memory://primary".to_string()
}

fn default_secondary_url() -> String {
    "memory://secondary".to_string()
}

fn default_broker_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            primary_url: default_primary_url(),
            secondary_url: default_secondary_url(),
            relational_url: None,
            broker_url: default_broker_url(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ChannelConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Channel names and consumer identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Document replication channel.
    #[serde(default = "default_replication_channel")]
    pub replication: String,

    /// Relational replication channel.
    #[serde(default = "default_relational_channel")]
    pub relational: String,

    /// Informational status channel. Disabled when `None`.
    #[serde(default)]
    pub sync_status: Option<String>,

    /// Consumer group name (Redis Streams).
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Consumer name within the group.
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,
}

fn default_replication_channel() -> String {
    DEFAULT_REPLICATION_CHANNEL.to_string()
}

fn default_relational_channel() -> String {
    DEFAULT_RELATIONAL_CHANNEL.to_string()
}

fn default_consumer_group() -> String {
    "replication".to_string()
}

fn default_consumer_name() -> String {
    "consumer-1".to_string()
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            replication: default_replication_channel(),
            relational: default_relational_channel(),
            sync_status: None,
            consumer_group: default_consumer_group(),
            consumer_name: default_consumer_name(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConsumerConfig: background apply loop
// ═══════════════════════════════════════════════════════════════════════════════

/// Background consumer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// How long one receive blocks waiting for a message (e.g. "5s").
    #[serde(default = "default_block_timeout")]
    pub block_timeout: String,

    /// Deliveries before a record is quarantined. 0 = retry forever.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    /// First redelivery delay (e.g. "100ms").
    #[serde(default = "default_backoff_base")]
    pub backoff_base: String,

    /// Redelivery delay ceiling (e.g. "30s").
    #[serde(default = "default_backoff_max")]
    pub backoff_max: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting
    // ─────────────────────────────────────────────────────────────────────────

    /// Throttle applies to the secondary.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Sustained applies per second.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst size above the sustained rate.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_block_timeout() -> String {
    "5s".to_string()
}

fn default_max_deliveries() -> u32 {
    10
}

fn default_backoff_base() -> String {
    "100ms".to_string()
}

fn default_backoff_max() -> String {
    "30s".to_string()
}

fn default_false() -> bool {
    false
}

fn default_true() -> bool {
    true
}

fn default_rate_limit_per_sec() -> u32 {
    1000
}

fn default_rate_limit_burst() -> u32 {
    100
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            block_timeout: default_block_timeout(),
            max_deliveries: default_max_deliveries(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl ConsumerConfig {
    /// Short timeouts and backoff for tests.
    pub fn for_testing() -> Self {
        Self {
            block_timeout: "50ms".to_string(),
            backoff_base: "1ms".to_string(),
            backoff_max: "10ms".to_string(),
            ..Default::default()
        }
    }

    /// Parse the block_timeout string to a Duration. Never zero.
    pub fn block_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.block_timeout)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_secs(5))
    }

    /// Redelivery backoff derived from this config.
    pub fn retry_config(&self) -> crate::resilience::RetryConfig {
        crate::resilience::RetryConfig {
            initial_delay: humantime::parse_duration(&self.backoff_base)
                .unwrap_or(Duration::from_millis(100)),
            max_delay: humantime::parse_duration(&self.backoff_max)
                .unwrap_or(Duration::from_secs(30)),
            backoff_factor: 2.0,
            max_deliveries: match self.max_deliveries {
                0 => None,
                n => Some(n),
            },
        }
    }

    /// Create rate limit configuration.
    ///
    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<crate::resilience::RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(crate::resilience::RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MirrorConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Synchronous mirror configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Issue compensating writes to the secondary after an abort.
    #[serde(default = "default_true")]
    pub compensate: bool,

    /// Consecutive secondary failures before the circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long the circuit stays open before probing (e.g. "30s").
    #[serde(default = "default_circuit_reset_timeout")]
    pub circuit_reset_timeout: String,
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout() -> String {
    "30s".to_string()
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            compensate: true,
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_reset_timeout: default_circuit_reset_timeout(),
        }
    }
}

impl MirrorConfig {
    pub fn for_testing() -> Self {
        Self {
            compensate: true,
            circuit_failure_threshold: 3,
            circuit_reset_timeout: "50ms".to_string(),
        }
    }

    /// Circuit breaker settings for secondary writes.
    pub fn circuit_config(&self) -> crate::circuit_breaker::CircuitConfig {
        crate::circuit_breaker::CircuitConfig {
            failure_threshold: self.circuit_failure_threshold.max(1),
            success_threshold: 1,
            recovery_timeout: humantime::parse_duration(&self.circuit_reset_timeout)
                .unwrap_or(Duration::from_secs(30)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HealthConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Health reporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Per-probe timeout (e.g. "2s"). A probe exceeding it reports unhealthy.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: String,
}

fn default_probe_timeout() -> String {
    "2s".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout: default_probe_timeout(),
        }
    }
}

impl HealthConfig {
    pub fn probe_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.probe_timeout).unwrap_or(Duration::from_secs(2))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
