//! Periodic trimming of logs to a maximum length.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::DurableLog;

/// A log and the number of entries it may retain.
#[derive(Clone)]
pub struct Retention {
    pub log: Arc<dyn DurableLog>,
    pub max_len: u64,
}

/// Trim every log to its `max_len` each `interval` until `shutdown` is
/// cancelled.
pub fn spawn_trimmer(
    logs: Vec<Retention>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(logs = logs.len(), ?interval, "log trimmer started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("log trimmer shutting down");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            for r in &logs {
                match r.log.trim(r.max_len).await {
                    Ok(0) => {}
                    Ok(n) => debug!(log = r.log.name(), removed = n, "trimmed"),
                    Err(e) => warn!(log = r.log.name(), "trim failed: {e}"),
                }
            }
        }
    })
}
