//! Integration tests for the in-memory durable log.

use relay_rs::log::{DurableLog, MemoryLog, Position};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const GROUP: &str = "workers";

async fn filled(n: usize) -> MemoryLog {
    let log = MemoryLog::new("test");
    for i in 0..n {
        log.append(&json!({ "n": i })).await.unwrap();
    }
    log
}

// ---------------------------------------------------------------------------
// Append and tail
// ---------------------------------------------------------------------------

#[tokio::test]
async fn append_assigns_increasing_positions() {
    let log = MemoryLog::new("test");
    let a = log.append(&json!("a")).await.unwrap();
    let b = log.append(&json!("b")).await.unwrap();

    assert!(b > a);
    assert_eq!(log.len().await.unwrap(), 2);
    assert_eq!(log.last_position().await.unwrap(), b);
}

#[tokio::test]
async fn read_after_last_position_sees_only_new_entries() {
    let log = filled(3).await;
    let cursor = log.last_position().await.unwrap();
    log.append(&json!("new")).await.unwrap();

    let entries = log.read_after(cursor, 10, Duration::ZERO).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].payload, json!("new"));
}

#[tokio::test]
async fn read_after_wakes_on_append() {
    let log = Arc::new(MemoryLog::new("test"));
    let reader = {
        let log = log.clone();
        tokio::spawn(async move {
            log.read_after(Position::ZERO, 10, Duration::from_secs(5))
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    log.append(&json!("late")).await.unwrap();

    let entries = tokio::time::timeout(Duration::from_secs(1), reader)
        .await
        .expect("reader should wake before its block expires")
        .unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn empty_read_returns_after_block() {
    let log = MemoryLog::new("test");
    let start = tokio::time::Instant::now();

    let entries = log
        .read_group(GROUP, "c1", 1, Duration::from_secs(5))
        .await
        .unwrap();

    assert!(entries.is_empty());
    assert!(start.elapsed() >= Duration::from_secs(5));
}

// ---------------------------------------------------------------------------
// Consumer groups
// ---------------------------------------------------------------------------

#[tokio::test]
async fn group_delivers_each_entry_once() {
    let log = filled(3).await;

    let first = log.read_group(GROUP, "c1", 2, Duration::ZERO).await.unwrap();
    let second = log.read_group(GROUP, "c2", 2, Duration::ZERO).await.unwrap();
    let third = log.read_group(GROUP, "c1", 2, Duration::ZERO).await.unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 1);
    assert!(third.is_empty());
    assert!(first.iter().all(|d| d.delivery_count == 1));
}

#[tokio::test]
async fn groups_are_independent() {
    let log = filled(2).await;

    let workers = log.read_group("workers", "c1", 10, Duration::ZERO).await.unwrap();
    let audit = log.read_group("audit", "c1", 10, Duration::ZERO).await.unwrap();

    assert_eq!(workers.len(), 2);
    assert_eq!(audit.len(), 2);
}

#[tokio::test]
async fn ack_clears_pending() {
    let log = filled(1).await;
    let delivery = log.read_group(GROUP, "c1", 1, Duration::ZERO).await.unwrap();
    let position = delivery[0].entry.position;

    let pending = log.pending(GROUP).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].consumer, "c1");

    assert!(log.ack(GROUP, position).await.unwrap());
    assert!(!log.ack(GROUP, position).await.unwrap());
    assert!(log.pending(GROUP).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn claim_idle_waits_for_min_idle() {
    let log = filled(1).await;
    log.read_group(GROUP, "c1", 1, Duration::ZERO).await.unwrap();

    let early = log
        .claim_idle(GROUP, "c2", Duration::from_secs(30), 10)
        .await
        .unwrap();
    assert!(early.is_empty());

    tokio::time::advance(Duration::from_secs(31)).await;
    let claimed = log
        .claim_idle(GROUP, "c2", Duration::from_secs(30), 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].delivery_count, 2);

    let pending = log.pending(GROUP).await.unwrap();
    assert_eq!(pending[0].consumer, "c2");
    assert_eq!(pending[0].idle, Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn claim_idle_drops_deleted_entries() {
    let log = filled(2).await;
    let delivered = log.read_group(GROUP, "c1", 2, Duration::ZERO).await.unwrap();
    log.delete(delivered[0].entry.position).await.unwrap();

    tokio::time::advance(Duration::from_secs(31)).await;
    let claimed = log
        .claim_idle(GROUP, "c2", Duration::from_secs(30), 10)
        .await
        .unwrap();

    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].entry.position, delivered[1].entry.position);
    assert_eq!(log.pending(GROUP).await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

#[tokio::test]
async fn trim_keeps_newest_entries() {
    let log = filled(5).await;

    assert_eq!(log.trim(2).await.unwrap(), 3);
    assert_eq!(log.len().await.unwrap(), 2);

    let left = log.read_after(Position::ZERO, 10, Duration::ZERO).await.unwrap();
    assert_eq!(left[0].payload, json!({ "n": 3 }));
    assert_eq!(left[1].payload, json!({ "n": 4 }));
}

#[tokio::test]
async fn trim_below_max_len_is_a_no_op() {
    let log = filled(2).await;
    assert_eq!(log.trim(10).await.unwrap(), 0);
    assert_eq!(log.len().await.unwrap(), 2);
}

#[tokio::test]
async fn delete_removes_entry() {
    let log = filled(1).await;
    let position = log.last_position().await.unwrap();

    assert!(log.delete(position).await.unwrap());
    assert!(!log.delete(position).await.unwrap());
    assert!(log.get(position).is_none());
    // Positions are never reused.
    assert_eq!(log.last_position().await.unwrap(), position);
}

#[tokio::test(start_paused = true)]
async fn trimmer_trims_on_interval() {
    use relay_rs::log::{Retention, spawn_trimmer};
    use tokio_util::sync::CancellationToken;

    let log = Arc::new(filled(10).await);
    let shutdown = CancellationToken::new();
    let handle = spawn_trimmer(
        vec![Retention {
            log: log.clone(),
            max_len: 4,
        }],
        Duration::from_secs(60),
        shutdown.clone(),
    );

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(log.len().await.unwrap(), 4);

    shutdown.cancel();
    handle.await.unwrap();
}
