//! A set of in-process workers sharing one shutdown signal.

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::Worker;
use crate::error::{Error, Result};

pub struct WorkerPool {
    shutdown: CancellationToken,
    tasks: JoinSet<Result<()>>,
    ids: Vec<String>,
}

impl WorkerPool {
    /// Spawn `size` copies of `template`, named `<template id>-<n>`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn(template: &Worker, size: usize) -> Self {
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let mut ids = Vec::with_capacity(size);

        for n in 0..size {
            let worker = template
                .clone()
                .with_id(format!("{}-{n}", template.id()))
                .with_shutdown(shutdown.child_token());
            ids.push(worker.id().to_string());
            tasks.spawn(async move { worker.run().await });
        }

        info!(workers = size, group = %template.config().group, "worker pool started");
        Self {
            shutdown,
            tasks,
            ids,
        }
    }

    /// Consumer names of the pool's workers.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// A token that stops every worker in the pool when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for every worker to exit. Returns the first failure, after all
    /// workers have stopped.
    pub async fn join(mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let result = joined.map_err(|e| Error::Other(format!("worker task failed: {e}")));
            if let Err(e) = result.and_then(|r| r) {
                error!(error = %e, "worker exited with error");
                first_error.get_or_insert(e);
            }
        }
        info!("worker pool stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Signal shutdown and wait for the workers to finish their current
    /// deliveries.
    pub async fn shutdown_and_join(self) -> Result<()> {
        self.shutdown();
        self.join().await
    }
}
