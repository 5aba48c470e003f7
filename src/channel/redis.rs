// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Streams replication channel.
//!
//! One stream per channel, one consumer group per stream.
//!
//! ```text
//! publish  → XADD <stream> * record <payload> hash <sha256>
//! receive  → XREADGROUP GROUP <g> <c> COUNT 1 STREAMS <stream> 0   (own pending first)
//!            XREADGROUP GROUP <g> <c> BLOCK <ms> COUNT 1 STREAMS <stream> >
//! ack      → XACK + XDEL
//! nack     → no-op (the entry stays in the pending list and is re-read first)
//! depth    → XLEN
//! declare  → XGROUP CREATE ... MKSTREAM, then XAUTOCLAIM <stream> <g> <c> 0 0-0 JUSTID
//! ```
//!
//! Acknowledged entries are deleted, so `XLEN` is the count of
//! not-yet-acknowledged messages and the oldest entry id gives the lag.
//!
//! # Content Hash Validation
//!
//! Every entry carries the SHA-256 of its payload. A mismatch is reported as
//! a [`Delivery::defect`] so the consumer quarantines instead of applying.

use super::{ChannelFuture, Delivery, ReplicationChannel};
use crate::error::{ReplicationError, Result};
use ::redis::aio::ConnectionManager;
use ::redis::streams::{StreamReadOptions, StreamReadReply};
use ::redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Payload field name.
const RECORD_FIELD: &str = "record";
/// Digest field name.
const HASH_FIELD: &str = "hash";

/// Connection attempts before giving up.
const CONNECT_MAX_ATTEMPTS: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_BASE_DELAY: Duration = Duration::from_millis(100);
/// Pending entries taken over per XAUTOCLAIM call.
const RECLAIM_BATCH: usize = 100;

/// Redis Streams channel with a consumer group.
#[derive(Clone)]
pub struct RedisChannel {
    name: String,
    stream_key: String,
    group: String,
    consumer: String,
    conn: ConnectionManager,
}

impl RedisChannel {
    /// Connect to `url` and bind to stream `name`.
    pub async fn connect(
        url: &str,
        name: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        info!(channel = %name, url, "Connecting to broker");

        let client = Client::open(url)
            .map_err(|e| ReplicationError::Config(format!("Invalid Redis URL: {}", e)))?;

        let mut attempt = 0;
        let mut delay = CONNECT_BASE_DELAY;
        let conn = loop {
            attempt += 1;
            match timeout(CONNECT_TIMEOUT, client.get_connection_manager()).await {
                Ok(Ok(conn)) => break conn,
                Ok(Err(e)) if attempt >= CONNECT_MAX_ATTEMPTS => {
                    return Err(ReplicationError::redis("CONNECT", e));
                }
                Err(_) if attempt >= CONNECT_MAX_ATTEMPTS => {
                    return Err(ReplicationError::redis_msg(
                        "CONNECT",
                        format!("timed out after {} attempts", attempt),
                    ));
                }
                Ok(Err(e)) => {
                    warn!(channel = %name, attempt, error = %e, "Broker connection failed, retrying");
                }
                Err(_) => {
                    warn!(channel = %name, attempt, "Broker connection timed out, retrying");
                }
            }
            tokio::time::sleep(delay).await;
            delay *= 2;
        };

        Ok(Self::with_connection(conn, name, group, consumer))
    }

    /// Bind to stream `name` over an existing connection.
    pub fn with_connection(
        conn: ConnectionManager,
        name: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            stream_key: name.clone(),
            name,
            group: group.into(),
            consumer: consumer.into(),
            conn,
        }
    }

    /// Another channel on the same connection and consumer group.
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self::with_connection(self.conn.clone(), name, self.group.clone(), self.consumer.clone())
    }

    /// Stream key this channel reads and writes.
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    async fn read_group(&self, id: &str, block: Option<Duration>) -> Result<Option<Delivery>> {
        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1);
        if let Some(block) = block {
            opts = opts.block(block.as_millis() as usize);
        }

        let mut conn = self.conn.clone();
        let reply: StreamReadReply = conn
            .xread_options(&[&self.stream_key], &[id], &opts)
            .await
            .map_err(|e| ReplicationError::redis("XREADGROUP", e))?;

        let Some(entry) = reply.keys.into_iter().flat_map(|k| k.ids).next() else {
            return Ok(None);
        };

        let mut delivery = parse_entry(&entry.id, &entry.map);
        if id != ">" {
            delivery.delivery_count = self.delivery_count(&entry.id).await?.max(2);
        }
        trace!(
            channel = %self.name,
            stream_id = %delivery.id,
            delivery_count = delivery.delivery_count,
            "Claimed entry"
        );
        Ok(Some(delivery))
    }

    /// Take over every entry pending under any consumer name in the group.
    ///
    /// A consumer that restarts under a new name would otherwise never see
    /// what its predecessor read but did not acknowledge.
    async fn reclaim_pending(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cursor = "0-0".to_string();
        let mut reclaimed = 0usize;
        loop {
            let reply: Vec<::redis::Value> = ::redis::cmd("XAUTOCLAIM")
                .arg(&self.stream_key)
                .arg(&self.group)
                .arg(&self.consumer)
                .arg(0)
                .arg(&cursor)
                .arg("COUNT")
                .arg(RECLAIM_BATCH)
                .arg("JUSTID")
                .query_async(&mut conn)
                .await
                .map_err(|e| ReplicationError::redis("XAUTOCLAIM", e))?;

            let (next, ids) = match reply.as_slice() {
                [next, ids, ..] => (
                    ::redis::from_redis_value::<String>(next),
                    ::redis::from_redis_value::<Vec<String>>(ids),
                ),
                _ => return Err(ReplicationError::redis_msg("XAUTOCLAIM", "malformed reply")),
            };
            let next = next.map_err(|e| ReplicationError::redis("XAUTOCLAIM", e))?;
            reclaimed += ids.map_err(|e| ReplicationError::redis("XAUTOCLAIM", e))?.len();

            if next == "0-0" {
                break;
            }
            cursor = next;
        }

        if reclaimed > 0 {
            info!(
                channel = %self.name,
                consumer = %self.consumer,
                reclaimed,
                "Reclaimed pending entries"
            );
        }
        Ok(())
    }

    /// Delivery counter from the group's pending list.
    async fn delivery_count(&self, stream_id: &str) -> Result<u32> {
        let mut conn = self.conn.clone();
        let pending: Vec<(String, String, u64, u64)> = ::redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(stream_id)
            .arg(stream_id)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| ReplicationError::redis("XPENDING", e))?;
        Ok(pending
            .first()
            .map(|(_, _, _, count)| (*count).min(u32::MAX as u64) as u32)
            .unwrap_or(1))
    }
}

impl ReplicationChannel for RedisChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn declare(&self) -> ChannelFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let result: std::result::Result<String, ::redis::RedisError> = ::redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&self.stream_key)
                .arg(&self.group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;
            match result {
                Ok(_) => {
                    info!(channel = %self.name, group = %self.group, "Created consumer group");
                }
                Err(e) if e.code() == Some("BUSYGROUP") => {
                    debug!(channel = %self.name, group = %self.group, "Consumer group exists");
                }
                Err(e) => return Err(ReplicationError::redis("XGROUP CREATE", e)),
            }
            self.reclaim_pending().await
        })
    }

    fn publish<'a>(&'a self, payload: &'a [u8]) -> ChannelFuture<'a, String> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let id: String = ::redis::cmd("XADD")
                .arg(&self.stream_key)
                .arg("*")
                .arg(RECORD_FIELD)
                .arg(payload)
                .arg(HASH_FIELD)
                .arg(compute_content_hash(payload))
                .query_async(&mut conn)
                .await
                .map_err(|e| ReplicationError::redis("XADD", e))?;
            trace!(channel = %self.name, stream_id = %id, bytes = payload.len(), "Published entry");
            Ok(id)
        })
    }

    fn receive(&self, block: Duration) -> ChannelFuture<'_, Option<Delivery>> {
        Box::pin(async move {
            // Entries claimed earlier but never acknowledged come first.
            if let Some(delivery) = self.read_group("0", None).await? {
                return Ok(Some(delivery));
            }
            self.read_group(">", Some(block)).await
        })
    }

    fn ack<'a>(&'a self, delivery: &'a Delivery) -> ChannelFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: u64 = conn
                .xack(&self.stream_key, &self.group, &[&delivery.id])
                .await
                .map_err(|e| ReplicationError::redis("XACK", e))?;
            let _: u64 = conn
                .xdel(&self.stream_key, &[&delivery.id])
                .await
                .map_err(|e| ReplicationError::redis("XDEL", e))?;
            Ok(())
        })
    }

    fn nack<'a>(&'a self, delivery: &'a Delivery) -> ChannelFuture<'a, ()> {
        Box::pin(async move {
            trace!(channel = %self.name, stream_id = %delivery.id, "Left entry pending for redelivery");
            Ok(())
        })
    }

    fn depth(&self) -> ChannelFuture<'_, u64> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let len: u64 = ::redis::cmd("XLEN")
                .arg(&self.stream_key)
                .query_async(&mut conn)
                .await
                .map_err(|e| ReplicationError::redis("XLEN", e))?;
            Ok(len)
        })
    }

    fn oldest_pending_age(&self) -> ChannelFuture<'_, Option<Duration>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            // XRANGE key - + COUNT 1 returns the oldest entry
            let result: Vec<(String, HashMap<String, ::redis::Value>)> = ::redis::cmd("XRANGE")
                .arg(&self.stream_key)
                .arg("-")
                .arg("+")
                .arg("COUNT")
                .arg(1)
                .query_async(&mut conn)
                .await
                .map_err(|e| ReplicationError::redis("XRANGE", e))?;

            let now = format!("{}-0", chrono::Utc::now().timestamp_millis().max(0));
            Ok(result
                .first()
                .and_then(|(id, _)| calculate_lag_ms(id, &now))
                .map(Duration::from_millis))
        })
    }
}

/// Turn a stream entry into a delivery, flagging integrity problems.
fn parse_entry(stream_id: &str, fields: &HashMap<String, ::redis::Value>) -> Delivery {
    let mut delivery = Delivery::new(stream_id, Vec::new());

    let payload = match get_bytes_field(fields, RECORD_FIELD) {
        Ok(payload) => payload,
        Err(e) => {
            delivery.defect = Some(e);
            return delivery;
        }
    };

    match get_bytes_field(fields, HASH_FIELD).map(|h| String::from_utf8_lossy(&h).into_owned()) {
        Ok(expected) => {
            let computed = compute_content_hash(&payload);
            if computed != expected {
                delivery.defect = Some(format!(
                    "content hash mismatch: expected {}, got {}",
                    expected, computed
                ));
            }
        }
        Err(e) => delivery.defect = Some(e),
    }

    delivery.payload = payload;
    delivery
}

/// Extract a bytes field from a stream entry.
fn get_bytes_field(
    fields: &HashMap<String, ::redis::Value>,
    name: &str,
) -> std::result::Result<Vec<u8>, String> {
    let value = fields
        .get(name)
        .ok_or_else(|| format!("Missing field: {}", name))?;

    match value {
        ::redis::Value::BulkString(bytes) => Ok(bytes.clone()),
        ::redis::Value::SimpleString(s) => Ok(s.as_bytes().to_vec()),
        _ => Err(format!("Unexpected type for field {}: {:?}", name, value)),
    }
}

/// Compute SHA256 content hash as hex string.
pub fn compute_content_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

/// Parse the timestamp (milliseconds since epoch) from a stream ID.
///
/// Returns `None` for malformed IDs or special cases like "0".
pub fn parse_stream_id_timestamp(stream_id: &str) -> Option<u64> {
    let (ts, seq) = stream_id.split_once('-')?;
    seq.parse::<u64>().ok()?;
    ts.parse().ok()
}

/// Time lag in milliseconds between two stream IDs.
///
/// Returns 0 if `oldest` is ahead of `latest`.
pub fn calculate_lag_ms(oldest: &str, latest: &str) -> Option<u64> {
    let oldest_ts = parse_stream_id_timestamp(oldest)?;
    let latest_ts = parse_stream_id_timestamp(latest)?;
    Some(latest_ts.saturating_sub(oldest_ts))
}
