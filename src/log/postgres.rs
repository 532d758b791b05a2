//! Postgres log backend via direct SQLx.
//!
//! Entries live in `log_entries`, group cursors in `log_groups`, and the
//! pending-entries list in `log_pending` (see `migrations/`). Appends fire
//! `pg_notify` so blocked readers wake immediately; readers also re-poll at a
//! fixed interval in case a notification is missed.
//!
//! Appends to a stream take a transaction-scoped advisory lock, so
//! positions grow in commit order and a cursor never skips an entry that
//! commits late.
//!
//! Single-owner delivery comes from locking the group's cursor row
//! (`FOR UPDATE`) while entries are assigned, and from `SKIP LOCKED` when
//! idle entries are claimed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Delivery, DurableLog, LogEntry, PendingEntry, Position, record_op};
use crate::error::Result;

/// NOTIFY channel carrying the name of the log that was appended to.
pub const APPEND_CHANNEL: &str = "relay_log_appended";

type EntryRow = (i64, serde_json::Value, DateTime<Utc>);

pub struct PgLog {
    pool: PgPool,
    name: String,
    appended: Arc<Notify>,
    poll_interval: Duration,
    listener: JoinHandle<()>,
}

impl PgLog {
    /// Open a log on the shared pool and start listening for appends.
    pub async fn open(pool: PgPool, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let appended = Arc::new(Notify::new());

        let mut listener = sqlx::postgres::PgListener::connect_with(&pool).await?;
        listener.listen(APPEND_CHANNEL).await?;

        let wake = Arc::clone(&appended);
        let log_name = name.clone();
        let listener = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(n) if n.payload() == log_name => wake.notify_waiters(),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(log = %log_name, "append listener error: {e}, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        debug!(log = %name, "postgres log opened");
        Ok(Self {
            pool,
            name,
            appended,
            poll_interval: Duration::from_millis(250),
            listener,
        })
    }

    /// Append inside the caller's transaction. The entry becomes visible,
    /// and blocked readers wake, when `tx` commits.
    ///
    /// Appends to one stream are serialized by a transaction-scoped advisory
    /// lock held until commit or rollback, so positions are assigned in
    /// commit order. Readers advancing a cursor past a position can never
    /// later see a smaller one appear.
    pub async fn append_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payload: &serde_json::Value,
    ) -> Result<Position> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&self.name)
            .execute(&mut **tx)
            .await?;

        let (position,): (i64,) = sqlx::query_as(
            "INSERT INTO log_entries (stream, payload) VALUES ($1, $2) RETURNING position",
        )
        .bind(&self.name)
        .bind(payload)
        .fetch_one(&mut **tx)
        .await?;

        // NOTIFY is transactional: it fires on commit.
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(APPEND_CHANNEL)
            .bind(&self.name)
            .execute(&mut **tx)
            .await?;
        Ok(Position(position))
    }

    /// Fallback polling interval for blocked reads.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Wait for an append notification, the poll interval, or the deadline,
    /// whichever comes first. Returns false once the deadline has passed.
    async fn wait(&self, notified: Pin<&mut Notified<'_>>, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let until = deadline.min(now + self.poll_interval);
        let _ = tokio::time::timeout_at(until, notified).await;
        true
    }

    async fn try_deliver(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<Delivery>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO log_groups (stream, group_name, last_delivered) VALUES ($1, $2, 0)
             ON CONFLICT (stream, group_name) DO NOTHING",
        )
        .bind(&self.name)
        .bind(group)
        .execute(&mut *tx)
        .await?;

        // Row lock serializes concurrent readers of the same group.
        let (last_delivered,): (i64,) = sqlx::query_as(
            "SELECT last_delivered FROM log_groups
             WHERE stream = $1 AND group_name = $2
             FOR UPDATE",
        )
        .bind(&self.name)
        .bind(group)
        .fetch_one(&mut *tx)
        .await?;

        let rows: Vec<EntryRow> = sqlx::query_as(
            "SELECT position, payload, appended_at FROM log_entries
             WHERE stream = $1 AND position > $2
             ORDER BY position
             LIMIT $3",
        )
        .bind(&self.name)
        .bind(last_delivered)
        .bind(count as i64)
        .fetch_all(&mut *tx)
        .await?;

        let Some(&(newest, _, _)) = rows.last() else {
            tx.rollback().await?;
            return Ok(Vec::new());
        };

        let positions: Vec<i64> = rows.iter().map(|(p, _, _)| *p).collect();
        sqlx::query(
            "INSERT INTO log_pending
                 (stream, group_name, position, consumer, delivered_at, delivery_count)
             SELECT $1, $2, p, $3, now(), 1 FROM UNNEST($4::bigint[]) AS p",
        )
        .bind(&self.name)
        .bind(group)
        .bind(consumer)
        .bind(&positions)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE log_groups SET last_delivered = $3 WHERE stream = $1 AND group_name = $2",
        )
        .bind(&self.name)
        .bind(group)
        .bind(newest)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(rows
            .into_iter()
            .map(|(position, payload, appended_at)| Delivery {
                entry: LogEntry {
                    position: Position(position),
                    payload,
                    appended_at,
                },
                delivery_count: 1,
            })
            .collect())
    }

    async fn try_tail(&self, after: Position, count: usize) -> Result<Vec<LogEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(
            "SELECT position, payload, appended_at FROM log_entries
             WHERE stream = $1 AND position > $2
             ORDER BY position
             LIMIT $3",
        )
        .bind(&self.name)
        .bind(after.0)
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(position, payload, appended_at)| LogEntry {
                position: Position(position),
                payload,
                appended_at,
            })
            .collect())
    }
}

impl Drop for PgLog {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl DurableLog for PgLog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn append(&self, payload: &serde_json::Value) -> Result<Position> {
        let mut tx = self.pool.begin().await?;
        let position = self.append_in(&mut tx, payload).await?;
        tx.commit().await?;

        record_op(&self.name, "append");
        Ok(position)
    }

    async fn len(&self) -> Result<u64> {
        let (n,): (i64,) = sqlx::query_as("SELECT count(*) FROM log_entries WHERE stream = $1")
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    async fn last_position(&self) -> Result<Position> {
        let (p,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(position), 0) FROM log_entries WHERE stream = $1",
        )
        .bind(&self.name)
        .fetch_one(&self.pool)
        .await?;
        Ok(Position(p))
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

            let batch = self.try_deliver(group, consumer, count).await?;
            if !batch.is_empty() {
                record_op(&self.name, "read_group");
                return Ok(batch);
            }
            if !self.wait(notified, deadline).await {
                record_op(&self.name, "read_group_empty");
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, group: &str, position: Position) -> Result<bool> {
        let rows = sqlx::query(
            "DELETE FROM log_pending WHERE stream = $1 AND group_name = $2 AND position = $3",
        )
        .bind(&self.name)
        .bind(group)
        .bind(position.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        record_op(&self.name, "ack");
        Ok(rows > 0)
    }

    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Delivery>> {
        let mut tx = self.pool.begin().await?;

        let claimed: Vec<(i64, i32)> = sqlx::query_as(
            "WITH idle AS (
                 SELECT position FROM log_pending
                 WHERE stream = $1 AND group_name = $2
                   AND delivered_at <= now() - ($4::bigint * interval '1 millisecond')
                 ORDER BY position
                 LIMIT $5
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE log_pending p
             SET consumer = $3, delivered_at = now(), delivery_count = p.delivery_count + 1
             FROM idle
             WHERE p.stream = $1 AND p.group_name = $2 AND p.position = idle.position
             RETURNING p.position, p.delivery_count",
        )
        .bind(&self.name)
        .bind(group)
        .bind(consumer)
        .bind(min_idle.as_millis() as i64)
        .bind(count as i64)
        .fetch_all(&mut *tx)
        .await?;

        if claimed.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let positions: Vec<i64> = claimed.iter().map(|(p, _)| *p).collect();
        let rows: Vec<EntryRow> = sqlx::query_as(
            "SELECT position, payload, appended_at FROM log_entries
             WHERE stream = $1 AND position = ANY($2)
             ORDER BY position",
        )
        .bind(&self.name)
        .bind(&positions)
        .fetch_all(&mut *tx)
        .await?;

        // Pending entries whose log entry is gone can never be processed.
        let live: Vec<i64> = rows.iter().map(|(p, _, _)| *p).collect();
        let gone: Vec<i64> = positions
            .iter()
            .copied()
            .filter(|p| !live.contains(p))
            .collect();
        if !gone.is_empty() {
            sqlx::query(
                "DELETE FROM log_pending
                 WHERE stream = $1 AND group_name = $2 AND position = ANY($3)",
            )
            .bind(&self.name)
            .bind(group)
            .bind(&gone)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        record_op(&self.name, "claim_idle");

        Ok(rows
            .into_iter()
            .map(|(position, payload, appended_at)| {
                let delivery_count = claimed
                    .iter()
                    .find(|(p, _)| *p == position)
                    .map(|(_, n)| *n as u32)
                    .unwrap_or(1);
                Delivery {
                    entry: LogEntry {
                        position: Position(position),
                        payload,
                        appended_at,
                    },
                    delivery_count,
                }
            })
            .collect())
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

            let batch = self.try_tail(after, count).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if !self.wait(notified, deadline).await {
                return Ok(Vec::new());
            }
        }
    }

    async fn delete(&self, position: Position) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM log_entries WHERE stream = $1 AND position = $2")
            .bind(&self.name)
            .bind(position.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        record_op(&self.name, "delete");
        Ok(rows > 0)
    }

    async fn trim(&self, max_len: u64) -> Result<u64> {
        let rows = sqlx::query(
            "DELETE FROM log_entries
             WHERE stream = $1 AND position <= (
                 SELECT position FROM log_entries WHERE stream = $1
                 ORDER BY position DESC
                 OFFSET $2 LIMIT 1
             )",
        )
        .bind(&self.name)
        .bind(max_len as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        record_op(&self.name, "trim");
        Ok(rows)
    }

    async fn pending(&self, group: &str) -> Result<Vec<PendingEntry>> {
        let rows: Vec<(i64, String, i64, i32)> = sqlx::query_as(
            "SELECT position, consumer,
                    (EXTRACT(EPOCH FROM (now() - delivered_at)) * 1000)::bigint,
                    delivery_count
             FROM log_pending
             WHERE stream = $1 AND group_name = $2
             ORDER BY position",
        )
        .bind(&self.name)
        .bind(group)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(position, consumer, idle_ms, delivery_count)| PendingEntry {
                position: Position(position),
                consumer,
                idle: Duration::from_millis(idle_ms.max(0) as u64),
                delivery_count: delivery_count as u32,
            })
            .collect())
    }
}
