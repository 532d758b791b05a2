//! Durable, append-only, trimmable logs with consumer groups.
//!
//! Three logs back the system: the job queue, the result stream and the
//! dead-letter log. Each is an ordered sequence of JSON entries addressed by
//! a monotonically increasing [`Position`].
//!
//! Consumer groups give at-most-one-owner delivery: `read_group` hands each
//! entry to exactly one consumer and records it in the group's pending list
//! until `ack`. Entries left pending past an idle threshold can be taken over
//! with `claim_idle`.
//!
//! Retention is advisory. `trim` discards the oldest entries, so readers
//! must not assume unlimited history.

pub mod memory;
pub mod postgres;
pub mod retention;

pub use memory::MemoryLog;
pub use postgres::PgLog;
pub use retention::{Retention, spawn_trimmer};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::telemetry::metrics;

/// Log-assigned position of an entry. Strictly increasing per log.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Position(pub i64);

impl Position {
    /// Before the first entry. Reading after `ZERO` reads from the start.
    pub const ZERO: Position = Position(0);
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An entry read from a log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub position: Position,
    pub payload: serde_json::Value,
    pub appended_at: DateTime<Utc>,
}

/// An entry delivered to a consumer under a group.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub entry: LogEntry,
    /// How many times this entry has been handed out in this group,
    /// including this delivery.
    pub delivery_count: u32,
}

/// A delivered-but-unacknowledged entry in a group's pending list.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub position: Position,
    pub consumer: String,
    /// Time since the entry was last delivered.
    pub idle: Duration,
    pub delivery_count: u32,
}

/// A durable log. Implementations must be safe to share between workers.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Name of the log, used for logging and metrics.
    fn name(&self) -> &str;

    /// Append an entry, returning its position.
    async fn append(&self, payload: &serde_json::Value) -> Result<Position>;

    /// Number of entries currently retained.
    async fn len(&self) -> Result<u64>;

    /// Position of the newest entry ever appended, or `ZERO` if empty.
    /// Tailing from here yields only entries appended afterwards.
    async fn last_position(&self) -> Result<Position>;

    /// Read up to `count` entries never delivered to `group`, assigning them
    /// to `consumer`. Waits up to `block` for entries if none are ready.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>>;

    /// Acknowledge a delivery, removing it from the group's pending list.
    /// Returns false if it wasn't pending.
    async fn ack(&self, group: &str, position: Position) -> Result<bool>;

    /// Reassign up to `count` entries pending longer than `min_idle` to
    /// `consumer`. Pending entries whose log entry was trimmed or deleted are
    /// dropped from the pending list and not returned.
    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Delivery>>;

    /// Read up to `count` entries after `after`, outside any group. Waits up
    /// to `block` if none are ready.
    async fn read_after(
        &self,
        after: Position,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>>;

    /// Remove an entry from the log. Returns false if it was already gone.
    async fn delete(&self, position: Position) -> Result<bool>;

    /// Discard the oldest entries so at most `max_len` remain. Returns the
    /// number discarded.
    async fn trim(&self, max_len: u64) -> Result<u64>;

    /// The group's pending list, oldest position first.
    async fn pending(&self, group: &str) -> Result<Vec<PendingEntry>>;
}

pub(crate) fn record_op(log: &str, operation: &'static str) {
    metrics::log_operations().add(
        1,
        &[
            KeyValue::new("log", log.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}
