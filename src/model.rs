//! Core data model.
//!
//! A job is a unit of work submitted by a client. Workers turn jobs into
//! result chunks addressed back to that client. Some jobs carry a workflow
//! plan: a set of steps with dependencies executed by the orchestrator.

pub mod chunk;
pub mod job;
pub mod plan;

pub use chunk::ResultChunk;
pub use job::{DeadLetter, Job, JobId, JobStatus, NewJob};
pub use plan::{Action, Step, WorkflowPlan};
