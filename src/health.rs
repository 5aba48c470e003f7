// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Health/status reporting.
//!
//! [`HealthReporter::status`] pings every store, reads the depth and age of
//! every replication channel, and returns a [`HealthSnapshot`]. It never
//! mutates state and never fails: a probe error or timeout is reported as an
//! unhealthy entry.
//!
//! # Example
//!
//! ```rust,ignore
//! let snapshot = engine.status().await;
//!
//! // For /health endpoint
//! if snapshot.healthy {
//!     HttpResponse::Ok().json(&snapshot)
//! } else {
//!     HttpResponse::ServiceUnavailable().json(&snapshot)
//! }
//! ```

use crate::channel::ReplicationChannel;
use crate::config::DeploymentMode;
use crate::coordinator::EngineState;
use crate::metrics;
use crate::store::StoreAdapter;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::warn;

/// Liveness of one store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreHealth {
    pub name: String,
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Backlog of one replication channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelHealth {
    pub name: String,
    /// The broker answered the depth probe.
    pub healthy: bool,
    /// Not-yet-acknowledged messages.
    pub pending: Option<u64>,
    /// Age of the oldest pending message.
    pub oldest_pending_ms: Option<u64>,
    /// Records waiting in this channel's dead-letter channel.
    pub quarantined: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Point-in-time health. Recomputed on every call, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub mode: DeploymentMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<EngineState>,
    /// Every store and channel probe succeeded.
    pub healthy: bool,
    pub stores: Vec<StoreHealth>,
    pub channels: Vec<ChannelHealth>,
    /// Sum of pending messages over channels that answered.
    pub pending: u64,
    /// Sum of quarantined records over all channels.
    pub quarantined: u64,
    pub checked_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Look up a store by name.
    pub fn store(&self, name: &str) -> Option<&StoreHealth> {
        self.stores.iter().find(|s| s.name == name)
    }

    /// Look up a channel by name.
    pub fn channel(&self, name: &str) -> Option<&ChannelHealth> {
        self.channels.iter().find(|c| c.name == name)
    }
}

struct MonitoredChannel {
    channel: Arc<dyn ReplicationChannel>,
    dead_letter: Option<Arc<dyn ReplicationChannel>>,
}

/// Polls stores and channels on demand.
pub struct HealthReporter {
    mode: DeploymentMode,
    stores: Vec<Arc<dyn StoreAdapter>>,
    channels: Vec<MonitoredChannel>,
    probe_timeout: Duration,
}

impl HealthReporter {
    pub fn new(mode: DeploymentMode, probe_timeout: Duration) -> Self {
        Self {
            mode,
            stores: Vec::new(),
            channels: Vec::new(),
            probe_timeout,
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn StoreAdapter>) -> Self {
        self.stores.push(store);
        self
    }

    /// Monitor a channel. The depth of `dead_letter` is its quarantine count.
    #[must_use]
    pub fn with_channel(
        mut self,
        channel: Arc<dyn ReplicationChannel>,
        dead_letter: Option<Arc<dyn ReplicationChannel>>,
    ) -> Self {
        self.channels.push(MonitoredChannel { channel, dead_letter });
        self
    }

    /// Probe everything concurrently and build a snapshot.
    pub async fn status(&self) -> HealthSnapshot {
        let store_probes = self
            .stores
            .iter()
            .map(|store| probe_store(store.as_ref(), self.probe_timeout));
        let channel_probes = self.channels.iter().map(|m| self.probe_channel(m));

        let (stores, channels) = futures::join!(join_all(store_probes), join_all(channel_probes));

        let healthy = stores.iter().all(|s| s.healthy) && channels.iter().all(|c| c.healthy);
        let pending = channels.iter().filter_map(|c| c.pending).sum();
        let quarantined = channels.iter().map(|c| c.quarantined).sum();

        HealthSnapshot {
            mode: self.mode,
            state: None,
            healthy,
            stores,
            channels,
            pending,
            quarantined,
            checked_at: Utc::now(),
        }
    }

    async fn probe_channel(&self, monitored: &MonitoredChannel) -> ChannelHealth {
        let channel = &monitored.channel;

        let probe = async {
            let pending = channel.depth().await?;
            let oldest = channel.oldest_pending_age().await?;
            Ok::<_, crate::error::ReplicationError>((pending, oldest))
        };
        // Quarantined records live in the dead-letter channel.
        let quarantined_depth = async {
            match &monitored.dead_letter {
                Some(dead_letter) => dead_letter.depth().await,
                None => Ok(0),
            }
        };

        let (backlog, quarantine) = futures::join!(
            timeout(self.probe_timeout, probe),
            timeout(self.probe_timeout, quarantined_depth)
        );

        let (pending, oldest, mut error) = match backlog {
            Ok(Ok((pending, oldest))) => {
                metrics::set_pending_depth(channel.name(), pending);
                (Some(pending), oldest.map(duration_ms), None)
            }
            Ok(Err(e)) => (None, None, Some(e.to_string())),
            Err(_) => (None, None, Some(format!("probe timed out after {:?}", self.probe_timeout))),
        };
        let quarantined = match quarantine {
            Ok(Ok(depth)) => depth,
            Ok(Err(e)) => {
                error.get_or_insert_with(|| format!("dead-letter depth check failed: {}", e));
                0
            }
            Err(_) => {
                error.get_or_insert_with(|| format!("dead-letter depth check timed out after {:?}", self.probe_timeout));
                0
            }
        };

        if let Some(error) = &error {
            warn!(channel = channel.name(), error = %error, "Channel health probe failed");
        }

        ChannelHealth {
            name: channel.name().to_string(),
            healthy: error.is_none(),
            pending,
            oldest_pending_ms: oldest,
            quarantined,
            error,
        }
    }
}

/// Ping one store with a timeout.
pub async fn probe_store(store: &dyn StoreAdapter, probe_timeout: Duration) -> StoreHealth {
    let start = Instant::now();
    let error = match timeout(probe_timeout, store.ping()).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!("probe timed out after {:?}", probe_timeout)),
    };
    let latency = start.elapsed();
    metrics::record_store_probe(store.name(), error.is_none(), latency);

    if let Some(error) = &error {
        warn!(store = store.name(), error = %error, "Store health probe failed");
    }

    StoreHealth {
        name: store.name().to_string(),
        healthy: error.is_none(),
        latency_ms: duration_ms(latency),
        error,
    }
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{dead_letter_name, MemoryChannel};
    use crate::store::MemoryStore;

    fn reporter(primary: &MemoryStore, secondary: &MemoryStore, channel: &MemoryChannel) -> HealthReporter {
        HealthReporter::new(DeploymentMode::Async, Duration::from_millis(200))
            .with_store(Arc::new(primary.clone()))
            .with_store(Arc::new(secondary.clone()))
            .with_channel(Arc::new(channel.clone()), None)
    }

    #[tokio::test]
    async fn test_all_healthy_with_pending_count() {
        let primary = MemoryStore::new("primary");
        let secondary = MemoryStore::new("secondary");
        let channel = MemoryChannel::new("db_replication");
        channel.publish(b"a").await.unwrap();
        channel.publish(b"b").await.unwrap();
        let claimed = channel.receive(Duration::from_millis(10)).await.unwrap().unwrap();

        let snapshot = reporter(&primary, &secondary, &channel).status().await;

        assert!(snapshot.healthy);
        assert!(snapshot.store("primary").unwrap().healthy);
        assert!(snapshot.store("secondary").unwrap().healthy);
        assert_eq!(snapshot.pending, 2);
        assert!(snapshot.channel("db_replication").unwrap().oldest_pending_ms.is_some());

        channel.ack(&claimed).await.unwrap();
        let snapshot = reporter(&primary, &secondary, &channel).status().await;
        assert_eq!(snapshot.pending, 1);
    }

    #[tokio::test]
    async fn test_failed_probe_reported_not_raised() {
        let primary = MemoryStore::new("primary");
        let secondary = MemoryStore::new("secondary");
        let channel = MemoryChannel::new("db_replication");
        secondary.set_online(false);
        channel.set_online(false);

        let snapshot = reporter(&primary, &secondary, &channel).status().await;

        assert!(!snapshot.healthy);
        assert!(snapshot.store("primary").unwrap().healthy);
        let secondary = snapshot.store("secondary").unwrap();
        assert!(!secondary.healthy);
        assert!(secondary.error.is_some());

        let ch = snapshot.channel("db_replication").unwrap();
        assert!(!ch.healthy);
        assert_eq!(ch.pending, None);
        assert_eq!(snapshot.pending, 0);
    }

    #[tokio::test]
    async fn test_quarantine_count_read_from_dead_letter_channel() {
        let channel = MemoryChannel::new("db_replication");
        let dead_letter = MemoryChannel::new(dead_letter_name("db_replication"));
        dead_letter.publish(b"first").await.unwrap();
        dead_letter.publish(b"second").await.unwrap();

        // A reporter built after a restart has no in-process history
        let snapshot = HealthReporter::new(DeploymentMode::Async, Duration::from_millis(200))
            .with_channel(Arc::new(channel.clone()), Some(Arc::new(dead_letter.clone())))
            .status()
            .await;

        assert!(snapshot.healthy);
        assert_eq!(snapshot.quarantined, 2);
        assert_eq!(snapshot.pending, 0);
        assert_eq!(snapshot.channel("db_replication").unwrap().quarantined, 2);

        dead_letter.set_online(false);
        let snapshot = HealthReporter::new(DeploymentMode::Async, Duration::from_millis(200))
            .with_channel(Arc::new(channel), Some(Arc::new(dead_letter)))
            .status()
            .await;
        let ch = snapshot.channel("db_replication").unwrap();
        assert!(!ch.healthy);
        assert!(ch.error.as_deref().unwrap().contains("dead-letter"));
    }

    #[tokio::test]
    async fn test_snapshot_serializes() {
        let snapshot = HealthReporter::new(DeploymentMode::Mirror, Duration::from_millis(200))
            .with_store(Arc::new(MemoryStore::new("primary")))
            .status()
            .await;

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["mode"], "mirror");
        assert_eq!(value["healthy"], true);
        assert!(value.get("state").is_none());
        assert_eq!(value["stores"][0]["name"], "primary");
    }
}
