//! Result streaming gateway.
//!
//! One [`Session`] per client connection. Each inbound message becomes a
//! job; a listener task then tails the shared result log, forwards the
//! chunks addressed to this client and job, and stops at the final chunk.
//! At most one listener runs per session: a new request cancels the
//! previous listener and waits for it before starting its own, so results
//! of overlapping requests never interleave on one connection.
//!
//! A separate idle monitor closes the connection with a normal close code
//! when no inbound message has arrived for `idle_timeout`.

mod listener;
pub mod transport;

pub use listener::ListenerExit;
pub use transport::{ChannelTransport, CloseCode, Transport, TransportEvent};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::error::{Error, Result};
use crate::handlers::{CHAT_JOB, PLAN_JOB};
use crate::log::{DurableLog, Position};
use crate::model::{JobId, NewJob, ResultChunk, WorkflowPlan};
use crate::producer::Producer;
use listener::Listener;

/// Error code sent when a job produces nothing for `result_timeout`.
pub const RESULT_TIMEOUT: &str = "RESULT_TIMEOUT";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Close a connection after this long without an inbound message.
    pub idle_timeout: Duration,
    /// Give up on a job after this long without a forwarded chunk.
    pub result_timeout: Duration,
    /// Upper bound on a single blocking read of the result log.
    pub read_block: Duration,
    /// Upper bound on a single send to the client.
    pub send_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            result_timeout: Duration::from_secs(120),
            read_block: Duration::from_secs(5),
            send_timeout: Duration::from_secs(2),
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A request from an already-authenticated client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// When present the request runs as a multi-step plan.
    #[serde(default)]
    pub plan: Option<WorkflowPlan>,
}

impl InboundMessage {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    fn into_job(self, client_id: &str) -> Result<NewJob> {
        let job_type = if self.plan.is_some() { PLAN_JOB } else { CHAT_JOB };
        let mut new = NewJob::new(job_type, client_id)
            .message(self.message)
            .metadata(self.metadata);
        if let Some(conversation_id) = self.conversation_id {
            new = new.conversation(conversation_id);
        }
        if let Some(plan) = self.plan {
            new = new.field("plan", serde_json::to_value(plan)?);
        }
        Ok(new)
    }
}

/// What the gateway sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The request was queued as `job_id`.
    Accepted { job_id: JobId },
    /// A piece of a job's output.
    Chunk {
        job_id: JobId,
        text: String,
        position: Position,
        is_final: bool,
    },
    Error {
        job_id: Option<JobId>,
        code: String,
        message: String,
    },
    /// The request was refused without being queued.
    Rejected { code: String, message: String },
}

impl ServerMessage {
    pub fn chunk(chunk: &ResultChunk) -> Self {
        ServerMessage::Chunk {
            job_id: chunk.job_id,
            text: chunk.payload.clone(),
            position: chunk.position,
            is_final: chunk.is_final,
        }
    }
}

/// Best-effort send bounded by `send_timeout`. Returns whether the message
/// was handed to the transport.
pub(crate) async fn deliver(
    transport: &dyn Transport,
    message: ServerMessage,
    send_timeout: Duration,
) -> bool {
    match tokio::time::timeout(send_timeout, transport.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(code = e.code(), error = %e, "send to client failed");
            false
        }
        Err(_) => {
            warn!(timeout = ?send_timeout, "send to client timed out");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Accepts connections. Cheap to clone; one per process is enough.
#[derive(Clone)]
pub struct Gateway {
    producer: Producer,
    results: Arc<dyn DurableLog>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(producer: Producer, results: Arc<dyn DurableLog>, config: GatewayConfig) -> Self {
        Self {
            producer,
            results,
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Open a session for an authenticated client. Starts the idle monitor.
    pub fn connect(&self, client_id: impl Into<String>, transport: Arc<dyn Transport>) -> Session {
        let client_id = client_id.into();
        let closed = CancellationToken::new();
        let (activity, last_seen) = watch::channel(Instant::now());

        let span = tracing::info_span!("gateway.session", client_id = %client_id);
        let idle_monitor = tokio::spawn(
            idle_monitor(
                last_seen,
                self.config.idle_timeout,
                transport.clone(),
                closed.clone(),
            )
            .instrument(span),
        );
        info!(%client_id, "client connected");

        Session {
            client_id,
            transport,
            producer: self.producer.clone(),
            results: self.results.clone(),
            config: self.config.clone(),
            listener: Mutex::new(None),
            activity,
            closed,
            idle_monitor,
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One client connection.
pub struct Session {
    client_id: String,
    transport: Arc<dyn Transport>,
    producer: Producer,
    results: Arc<dyn DurableLog>,
    config: GatewayConfig,
    listener: Mutex<Option<Listener>>,
    activity: watch::Sender<Instant>,
    closed: CancellationToken,
    idle_monitor: JoinHandle<()>,
}

impl Session {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Whether the connection was closed, by idle timeout or `disconnect`.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Job the current listener is streaming, if it is still running.
    pub async fn active_job(&self) -> Option<JobId> {
        self.listener
            .lock()
            .await
            .as_ref()
            .filter(|l| !l.is_finished())
            .map(|l| l.job_id())
    }

    /// Handle one inbound message: submit it as a job and stream its
    /// results. Returns `None` if the job was rejected for overload.
    ///
    /// The result cursor is taken before the job is submitted, so a chunk
    /// published before the listener starts is still delivered.
    pub async fn on_message(&self, inbound: InboundMessage) -> Result<Option<JobId>> {
        if self.is_closed() {
            return Err(Error::Delivery(format!(
                "session for {} is closed",
                self.client_id
            )));
        }
        self.activity.send_replace(Instant::now());

        // Held across submit so concurrent messages start listeners in
        // submission order.
        let mut current = self.listener.lock().await;

        let cursor = self.results.last_position().await?;
        let new = inbound.into_job(&self.client_id)?;
        let job_id = match self.producer.submit(new).await {
            Ok(job_id) => job_id,
            Err(e @ Error::Overloaded { .. }) => {
                let message = ServerMessage::Rejected {
                    code: e.code().to_string(),
                    message: e.to_string(),
                };
                self.send(message).await;
                return Ok(None);
            }
            Err(e) => {
                let message = ServerMessage::Error {
                    job_id: None,
                    code: e.code().to_string(),
                    message: "request could not be queued".to_string(),
                };
                self.send(message).await;
                return Err(e);
            }
        };
        self.send(ServerMessage::Accepted { job_id }).await;

        if let Some(previous) = current.take() {
            let previous_job = previous.job_id();
            let exit = previous.stop().await;
            debug!(
                client_id = %self.client_id,
                job_id = %previous_job,
                ?exit,
                "listener replaced"
            );
        }
        *current = Some(Listener::spawn(
            self.client_id.clone(),
            job_id,
            cursor,
            self.results.clone(),
            self.transport.clone(),
            self.config.clone(),
            self.closed.child_token(),
        ));

        Ok(Some(job_id))
    }

    /// Wait for the current listener to stop on its own.
    pub async fn wait_listener(&self) -> Option<ListenerExit> {
        let listener = self.listener.lock().await.take()?;
        Some(listener.wait().await)
    }

    /// Stop the listener and idle monitor. Does not close the transport;
    /// the client went away or the caller closes it.
    pub async fn disconnect(&self) {
        self.closed.cancel();
        if let Some(listener) = self.listener.lock().await.take() {
            listener.stop().await;
        }
        self.idle_monitor.abort();
        info!(client_id = %self.client_id, "client disconnected");
    }

    async fn send(&self, message: ServerMessage) -> bool {
        deliver(self.transport.as_ref(), message, self.config.send_timeout).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Close the connection once `idle_timeout` passes without activity.
async fn idle_monitor(
    mut last_seen: watch::Receiver<Instant>,
    idle_timeout: Duration,
    transport: Arc<dyn Transport>,
    closed: CancellationToken,
) {
    loop {
        let deadline = *last_seen.borrow_and_update() + idle_timeout;
        tokio::select! {
            _ = closed.cancelled() => return,
            changed = last_seen.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                info!(timeout = ?idle_timeout, "closing idle connection");
                closed.cancel();
                if let Err(e) = transport.close(CloseCode::Normal, "idle timeout").await {
                    warn!(error = %e, "failed to close idle connection");
                }
                return;
            }
        }
    }
}
