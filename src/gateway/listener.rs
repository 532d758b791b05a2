//! Per-request result listener: tails the result log and forwards the
//! chunks addressed to one client.

use opentelemetry::KeyValue;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, trace, warn};

use super::{GatewayConfig, RESULT_TIMEOUT, ServerMessage, Transport, deliver};
use crate::log::{DurableLog, Position};
use crate::model::{JobId, ResultChunk};
use crate::telemetry::metrics;

/// Entries fetched per read of the result log.
const READ_BATCH: usize = 64;

/// Why a listener stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    /// The target job's final chunk was forwarded.
    Finished,
    /// Nothing was forwarded for `result_timeout`.
    TimedOut,
    /// Replaced by a newer request or the session closed.
    Cancelled,
}

/// A running listener. Dropping it leaves the task running; call
/// [`Listener::stop`] to cancel and wait.
pub(crate) struct Listener {
    job_id: JobId,
    cancel: CancellationToken,
    handle: JoinHandle<ListenerExit>,
}

impl Listener {
    /// Start tailing `results` after `cursor` for chunks of `job_id`
    /// addressed to `client_id`.
    pub(crate) fn spawn(
        client_id: String,
        job_id: JobId,
        cursor: Position,
        results: Arc<dyn DurableLog>,
        transport: Arc<dyn Transport>,
        config: GatewayConfig,
        cancel: CancellationToken,
    ) -> Self {
        let span = tracing::info_span!(
            "gateway.listen",
            client_id = %client_id,
            job_id = %job_id,
        );
        let task = ListenTask {
            client_id,
            job_id,
            results,
            transport,
            config,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run(cursor).instrument(span));
        Self {
            job_id,
            cancel,
            handle,
        }
    }

    pub(crate) fn job_id(&self) -> JobId {
        self.job_id
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the listener to stop on its own.
    pub(crate) async fn wait(self) -> ListenerExit {
        self.handle.await.unwrap_or(ListenerExit::Cancelled)
    }

    /// Cancel the listener and wait until it has stopped forwarding.
    pub(crate) async fn stop(self) -> ListenerExit {
        self.cancel.cancel();
        self.handle.await.unwrap_or(ListenerExit::Cancelled)
    }
}

struct ListenTask {
    client_id: String,
    job_id: JobId,
    results: Arc<dyn DurableLog>,
    transport: Arc<dyn Transport>,
    config: GatewayConfig,
    cancel: CancellationToken,
}

impl ListenTask {
    async fn run(self, mut cursor: Position) -> ListenerExit {
        let mut last_forward = Instant::now();

        loop {
            let deadline = last_forward + self.config.result_timeout;
            let now = Instant::now();
            if now >= deadline {
                return self.time_out().await;
            }
            let block = self.config.read_block.min(deadline - now);

            let read = tokio::select! {
                _ = self.cancel.cancelled() => return ListenerExit::Cancelled,
                read = self.results.read_after(cursor, READ_BATCH, block) => read,
            };
            let entries = match read {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "result log read failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return ListenerExit::Cancelled,
                        _ = tokio::time::sleep(block) => continue,
                    }
                }
            };

            for entry in entries {
                cursor = entry.position;
                let chunk = match ResultChunk::from_entry(&entry) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        trace!(position = %entry.position, error = %e, "skipping non-chunk entry");
                        continue;
                    }
                };
                // Chunks for other clients are never forwarded.
                if chunk.client_id != self.client_id || chunk.job_id != self.job_id {
                    continue;
                }
                if self.cancel.is_cancelled() {
                    return ListenerExit::Cancelled;
                }

                let is_final = chunk.is_final;
                let delivered = deliver(
                    self.transport.as_ref(),
                    ServerMessage::chunk(&chunk),
                    self.config.send_timeout,
                )
                .await;
                let outcome = if delivered { "forwarded" } else { "send_failed" };
                metrics::chunks_forwarded().add(1, &[KeyValue::new("outcome", outcome)]);
                last_forward = Instant::now();

                if is_final {
                    debug!(position = %chunk.position, "final chunk forwarded");
                    return ListenerExit::Finished;
                }
            }
        }
    }

    async fn time_out(&self) -> ListenerExit {
        warn!(timeout = ?self.config.result_timeout, "no result within timeout");
        let message = ServerMessage::Error {
            job_id: Some(self.job_id),
            code: RESULT_TIMEOUT.to_string(),
            message: format!(
                "no result received within {}s",
                self.config.result_timeout.as_secs()
            ),
        };
        deliver(self.transport.as_ref(), message, self.config.send_timeout).await;
        ListenerExit::TimedOut
    }
}
