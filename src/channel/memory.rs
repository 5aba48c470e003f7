// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process replication channel.
//!
//! FIFO queue with an in-flight set. Messages survive consumer restarts
//! within the process: [`declare`](ReplicationChannel::declare) returns any
//! claimed-but-unacknowledged messages to the head of the queue.
//!
//! Clones share the same queue.

use super::{ChannelFuture, Delivery, ReplicationChannel};
use crate::error::ReplicationError;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug, Clone)]
struct Message {
    seq: u64,
    payload: Vec<u8>,
    delivery_count: u32,
    published_at: Instant,
}

#[derive(Debug, Default)]
struct Queue {
    ready: VecDeque<Message>,
    in_flight: HashMap<String, Message>,
    next_seq: u64,
}

/// In-process channel.
#[derive(Clone)]
pub struct MemoryChannel {
    name: String,
    queue: Arc<Mutex<Queue>>,
    notify: Arc<Notify>,
    online: Arc<AtomicBool>,
}

impl MemoryChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: Arc::new(Mutex::new(Queue::default())),
            notify: Arc::new(Notify::new()),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate a broker outage: every operation fails while offline.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    /// Payloads not yet acknowledged, in delivery order (in-flight first).
    pub fn pending_payloads(&self) -> Vec<Vec<u8>> {
        let Ok(queue) = self.queue.lock() else {
            return Vec::new();
        };
        let mut in_flight: Vec<&Message> = queue.in_flight.values().collect();
        in_flight.sort_by_key(|m| m.seq);
        in_flight
            .into_iter()
            .chain(queue.ready.iter())
            .map(|m| m.payload.clone())
            .collect()
    }

    fn lock(&self) -> crate::error::Result<MutexGuard<'_, Queue>> {
        if !self.online.load(Ordering::Acquire) {
            return Err(ReplicationError::channel(&self.name, "broker unavailable"));
        }
        self.queue
            .lock()
            .map_err(|_| ReplicationError::channel(&self.name, "queue lock poisoned"))
    }

    fn try_claim(&self) -> crate::error::Result<Option<Delivery>> {
        let mut queue = self.lock()?;
        let Some(mut message) = queue.ready.pop_front() else {
            return Ok(None);
        };
        message.delivery_count += 1;
        let delivery = Delivery {
            id: message.seq.to_string(),
            payload: message.payload.clone(),
            delivery_count: message.delivery_count,
            defect: None,
        };
        queue.in_flight.insert(delivery.id.clone(), message);
        Ok(Some(delivery))
    }
}

impl ReplicationChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn declare(&self) -> ChannelFuture<'_, ()> {
        Box::pin(async move {
            let mut queue = self.lock()?;
            let mut orphaned: Vec<Message> = queue.in_flight.drain().map(|(_, m)| m).collect();
            orphaned.sort_by_key(|m| std::cmp::Reverse(m.seq));
            for message in orphaned {
                queue.ready.push_front(message);
            }
            drop(queue);
            self.notify.notify_one();
            Ok(())
        })
    }

    fn publish<'a>(&'a self, payload: &'a [u8]) -> ChannelFuture<'a, String> {
        Box::pin(async move {
            let seq = {
                let mut queue = self.lock()?;
                queue.next_seq += 1;
                let seq = queue.next_seq;
                queue.ready.push_back(Message {
                    seq,
                    payload: payload.to_vec(),
                    delivery_count: 0,
                    published_at: Instant::now(),
                });
                seq
            };
            trace!(channel = %self.name, seq, "Published message");
            self.notify.notify_one();
            Ok(seq.to_string())
        })
    }

    fn receive(&self, block: Duration) -> ChannelFuture<'_, Option<Delivery>> {
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + block;
            loop {
                if let Some(delivery) = self.try_claim()? {
                    return Ok(Some(delivery));
                }
                if tokio::time::timeout_at(deadline, self.notify.notified())
                    .await
                    .is_err()
                {
                    return self.try_claim();
                }
            }
        })
    }

    fn ack<'a>(&'a self, delivery: &'a Delivery) -> ChannelFuture<'a, ()> {
        Box::pin(async move {
            let mut queue = self.lock()?;
            match queue.in_flight.remove(&delivery.id) {
                Some(_) => Ok(()),
                None => Err(ReplicationError::channel(
                    &self.name,
                    format!("ack for unknown delivery {}", delivery.id),
                )),
            }
        })
    }

    fn nack<'a>(&'a self, delivery: &'a Delivery) -> ChannelFuture<'a, ()> {
        Box::pin(async move {
            {
                let mut queue = self.lock()?;
                let Some(message) = queue.in_flight.remove(&delivery.id) else {
                    return Err(ReplicationError::channel(
                        &self.name,
                        format!("nack for unknown delivery {}", delivery.id),
                    ));
                };
                queue.ready.push_front(message);
            }
            self.notify.notify_one();
            Ok(())
        })
    }

    fn depth(&self) -> ChannelFuture<'_, u64> {
        Box::pin(async move {
            let queue = self.lock()?;
            Ok((queue.ready.len() + queue.in_flight.len()) as u64)
        })
    }

    fn oldest_pending_age(&self) -> ChannelFuture<'_, Option<Duration>> {
        Box::pin(async move {
            let queue = self.lock()?;
            Ok(queue
                .ready
                .iter()
                .chain(queue.in_flight.values())
                .map(|m| m.published_at)
                .min()
                .map(|at| at.elapsed()))
        })
    }
}
