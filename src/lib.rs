//! # relay-rs
//!
//! Durable job relay: clients submit work through a backpressure-aware
//! producer, a consumer-group worker pool processes it with bounded retries
//! and a dead-letter log, and a gateway streams each job's result chunks
//! back to the client that asked for them. Multi-step jobs run as DAG
//! plans on a round-based orchestrator.
//!
//! Logs are Postgres-backed ([`log::PgLog`]) in production and in-memory
//! ([`log::MemoryLog`]) for tests and single-process use. Completion is
//! provided by rig-core; observability by tracing and OpenTelemetry.

pub mod config;
pub mod db;
pub mod dead_letter;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod llm;
pub mod log;
pub mod model;
pub mod orchestrator;
pub mod producer;
pub mod results;
pub mod retry;
pub mod telemetry;
pub mod worker;

pub use error::{Error, Result};
