//! Integration tests for backpressure-aware submission.

use relay_rs::Error;
use relay_rs::log::{DurableLog, MemoryLog, Position};
use relay_rs::model::{Job, NewJob};
use relay_rs::producer::{BackpressureConfig, Producer};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

async fn queue_with_depth(depth: usize) -> Arc<MemoryLog> {
    let log = Arc::new(MemoryLog::new("jobs"));
    for _ in 0..depth {
        log.append(&json!({})).await.unwrap();
    }
    log
}

fn producer(log: &Arc<MemoryLog>) -> Producer {
    Producer::new(log.clone(), BackpressureConfig::default())
}

#[tokio::test(start_paused = true)]
async fn rejects_above_hard_ceiling_without_enqueueing() {
    let log = queue_with_depth(5001).await;

    let err = producer(&log)
        .submit(NewJob::new("chat", "client-a").message("hi"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Overloaded {
            depth: 5001,
            ceiling: 5000
        }
    ));
    assert_eq!(err.code(), "OVERLOADED");
    assert_eq!(log.len().await.unwrap(), 5001);
}

#[tokio::test(start_paused = true)]
async fn at_hard_ceiling_is_still_admitted() {
    let log = queue_with_depth(5000).await;
    producer(&log)
        .submit(NewJob::new("chat", "client-a"))
        .await
        .unwrap();
    assert_eq!(log.len().await.unwrap(), 5001);
}

#[tokio::test(start_paused = true)]
async fn delays_above_soft_ceiling() {
    let log = queue_with_depth(3001).await;
    let start = Instant::now();

    producer(&log)
        .submit(NewJob::new("chat", "client-a"))
        .await
        .unwrap();

    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!(log.len().await.unwrap(), 3002);
}

#[tokio::test(start_paused = true)]
async fn no_delay_below_soft_ceiling() {
    let log = queue_with_depth(3000).await;
    let start = Instant::now();

    producer(&log)
        .submit(NewJob::new("chat", "client-a"))
        .await
        .unwrap();

    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test]
async fn submit_message_enqueues_chat_job() {
    let log = queue_with_depth(0).await;
    let id = producer(&log)
        .submit_message("user-1", Some("conv-9"), "hello", json!({ "lang": "en" }))
        .await
        .unwrap();

    let entries = log.read_after(Position::ZERO, 10, Duration::ZERO).await.unwrap();
    let job: Job = serde_json::from_value(entries[0].payload.clone()).unwrap();

    assert_eq!(job.id, id);
    assert_eq!(job.job_type, "chat");
    assert_eq!(job.client_id, "user-1");
    assert_eq!(job.conversation_id.as_deref(), Some("conv-9"));
    assert_eq!(job.message(), Some("hello"));
    assert_eq!(job.payload["metadata"], json!({ "lang": "en" }));
    assert_eq!(job.retry_count, 0);
}

#[tokio::test]
async fn depth_reports_queue_length() {
    let log = queue_with_depth(7).await;
    assert_eq!(producer(&log).depth().await.unwrap(), 7);
}
