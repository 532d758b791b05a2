//! Publishing result chunks to the shared result log.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::trace;

use crate::error::Result;
use crate::log::{DurableLog, Position};
use crate::model::{JobId, ResultChunk};

/// Writes chunks for any job to the result log.
#[derive(Clone)]
pub struct ResultPublisher {
    log: Arc<dyn DurableLog>,
}

impl ResultPublisher {
    pub fn new(log: Arc<dyn DurableLog>) -> Self {
        Self { log }
    }

    pub async fn publish_chunk(
        &self,
        job_id: JobId,
        client_id: &str,
        text: &str,
        is_final: bool,
    ) -> Result<Position> {
        let chunk = ResultChunk::new(job_id, client_id, text, is_final);
        let position = self.log.append(&serde_json::to_value(&chunk)?).await?;
        trace!(%job_id, %position, is_final, "chunk published");
        Ok(position)
    }

    /// A sink bound to one job's client.
    pub fn sink(&self, job_id: JobId, client_id: impl Into<String>) -> ChunkSink {
        ChunkSink {
            publisher: self.clone(),
            job_id,
            client_id: client_id.into(),
            sent: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        }
    }
}

/// Where a handler writes its output. Chunks go out in call order, so a
/// single handler produces a strictly ordered stream for its job.
pub struct ChunkSink {
    publisher: ResultPublisher,
    job_id: JobId,
    client_id: String,
    sent: AtomicU64,
    finished: AtomicBool,
}

impl ChunkSink {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Publish a partial result.
    pub async fn send(&self, text: &str) -> Result<Position> {
        let position = self
            .publisher
            .publish_chunk(self.job_id, &self.client_id, text, false)
            .await?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(position)
    }

    /// Publish the last chunk for this job.
    pub async fn finish(&self, text: &str) -> Result<Position> {
        let position = self
            .publisher
            .publish_chunk(self.job_id, &self.client_id, text, true)
            .await?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.finished.store(true, Ordering::Relaxed);
        Ok(position)
    }

    /// Chunks published so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Whether a final chunk has been published.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }
}
