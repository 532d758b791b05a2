//! In-process log backend.
//!
//! Same semantics as the Postgres backend, minus persistence across process
//! restarts. Used for tests and single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Delivery, DurableLog, LogEntry, PendingEntry, Position, record_op};
use crate::error::Result;

pub struct MemoryLog {
    name: String,
    inner: Mutex<Inner>,
    appended: Notify,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<i64, Stored>,
    last: i64,
    groups: HashMap<String, Group>,
}

struct Stored {
    payload: serde_json::Value,
    appended_at: DateTime<Utc>,
}

#[derive(Default)]
struct Group {
    last_delivered: i64,
    pending: BTreeMap<i64, Pending>,
}

struct Pending {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

impl Inner {
    fn entry(&self, position: i64) -> Option<LogEntry> {
        self.entries.get(&position).map(|s| LogEntry {
            position: Position(position),
            payload: s.payload.clone(),
            appended_at: s.appended_at,
        })
    }

    fn deliver(&mut self, group: &str, consumer: &str, count: usize) -> Vec<Delivery> {
        let now = Instant::now();
        let Inner {
            entries, groups, ..
        } = self;
        let group = groups.entry(group.to_string()).or_default();

        let mut out = Vec::new();
        for (&position, stored) in entries.range(group.last_delivered + 1..).take(count) {
            group.last_delivered = position;
            group.pending.insert(
                position,
                Pending {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            out.push(Delivery {
                entry: LogEntry {
                    position: Position(position),
                    payload: stored.payload.clone(),
                    appended_at: stored.appended_at,
                },
                delivery_count: 1,
            });
        }
        out
    }

    fn tail(&self, after: Position, count: usize) -> Vec<LogEntry> {
        self.entries
            .range(after.0 + 1..)
            .take(count)
            .map(|(&position, s)| LogEntry {
                position: Position(position),
                payload: s.payload.clone(),
                appended_at: s.appended_at,
            })
            .collect()
    }
}

impl MemoryLog {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
            appended: Notify::new(),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock can't leave Inner half-updated in a
        // way later readers care about, so recover the guard.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DurableLog for MemoryLog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn append(&self, payload: &serde_json::Value) -> Result<Position> {
        let position = {
            let mut inner = self.inner();
            inner.last += 1;
            let position = inner.last;
            inner.entries.insert(
                position,
                Stored {
                    payload: payload.clone(),
                    appended_at: Utc::now(),
                },
            );
            position
        };
        self.appended.notify_waiters();
        record_op(&self.name, "append");
        Ok(Position(position))
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.inner().entries.len() as u64)
    }

    async fn last_position(&self) -> Result<Position> {
        Ok(Position(self.inner().last))
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.inner().deliver(group, consumer, count);
            if !batch.is_empty() {
                record_op(&self.name, "read_group");
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                record_op(&self.name, "read_group_empty");
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, group: &str, position: Position) -> Result<bool> {
        let acked = self
            .inner()
            .groups
            .get_mut(group)
            .is_some_and(|g| g.pending.remove(&position.0).is_some());
        record_op(&self.name, "ack");
        Ok(acked)
    }

    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Delivery>> {
        let now = Instant::now();
        let mut inner = self.inner();
        let Inner {
            entries, groups, ..
        } = &mut *inner;
        let Some(group) = groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let mut claimed = Vec::new();
        let mut gone = Vec::new();
        for (&position, pending) in group.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if now.saturating_duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            let Some(stored) = entries.get(&position) else {
                gone.push(position);
                continue;
            };
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.delivery_count += 1;
            claimed.push(Delivery {
                entry: LogEntry {
                    position: Position(position),
                    payload: stored.payload.clone(),
                    appended_at: stored.appended_at,
                },
                delivery_count: pending.delivery_count,
            });
        }
        for position in gone {
            group.pending.remove(&position);
        }
        drop(inner);

        record_op(&self.name, "claim_idle");
        Ok(claimed)
    }

    async fn read_after(
        &self,
        after: Position,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.inner().tail(after, count);
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn delete(&self, position: Position) -> Result<bool> {
        let removed = self.inner().entries.remove(&position.0).is_some();
        record_op(&self.name, "delete");
        Ok(removed)
    }

    async fn trim(&self, max_len: u64) -> Result<u64> {
        let mut inner = self.inner();
        let mut removed = 0;
        while inner.entries.len() as u64 > max_len {
            inner.entries.pop_first();
            removed += 1;
        }
        drop(inner);
        record_op(&self.name, "trim");
        Ok(removed)
    }

    async fn pending(&self, group: &str) -> Result<Vec<PendingEntry>> {
        let now = Instant::now();
        let inner = self.inner();
        let Some(group) = inner.groups.get(group) else {
            return Ok(Vec::new());
        };
        Ok(group
            .pending
            .iter()
            .map(|(&position, p)| PendingEntry {
                position: Position(position),
                consumer: p.consumer.clone(),
                idle: now.saturating_duration_since(p.delivered_at),
                delivery_count: p.delivery_count,
            })
            .collect())
    }
}

impl MemoryLog {
    /// Look up a single entry by position.
    pub fn get(&self, position: Position) -> Option<LogEntry> {
        self.inner().entry(position.0)
    }
}
