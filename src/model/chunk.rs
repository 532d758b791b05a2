//! Result chunks streamed back to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::JobId;
use crate::log::Position;

/// A fragment of a job's output, addressed to one client.
///
/// Chunks are written once and never mutated. `position` is assigned by the
/// result log on append, so it is absent in the serialized entry and filled
/// in when the chunk is read back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultChunk {
    pub job_id: JobId,
    pub client_id: String,
    #[serde(skip)]
    pub position: Position,
    pub payload: String,
    pub is_final: bool,
    pub timestamp: DateTime<Utc>,
}

impl ResultChunk {
    pub fn new(
        job_id: JobId,
        client_id: impl Into<String>,
        payload: impl Into<String>,
        is_final: bool,
    ) -> Self {
        Self {
            job_id,
            client_id: client_id.into(),
            position: Position::ZERO,
            payload: payload.into(),
            is_final,
            timestamp: Utc::now(),
        }
    }

    /// Decode a chunk from a result-log entry, stamping its position.
    pub fn from_entry(entry: &crate::log::LogEntry) -> crate::error::Result<Self> {
        let mut chunk: ResultChunk = serde_json::from_value(entry.payload.clone())?;
        chunk.position = entry.position;
        Ok(chunk)
    }
}
