//! Job handler trait and routing table.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::model::Job;
use crate::results::ChunkSink;

/// Processes one job type.
///
/// A handler publishes its output through `sink`. Returning `Err` marks the
/// attempt as failed and the job is retried or dead-lettered; a handler
/// that wants to report failure to the client without a retry should
/// publish a final chunk itself and return `Ok`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, sink: &ChunkSink) -> Result<()>;
}

/// Routes jobs to handlers by `job.job_type`.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        job_type: impl Into<String>,
        handler: impl JobHandler + 'static,
    ) -> Self {
        self.handlers.insert(job_type.into(), Arc::new(handler));
        self
    }

    pub fn register_arc(
        mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    /// Look up the handler for a job type.
    pub fn handler_for(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
