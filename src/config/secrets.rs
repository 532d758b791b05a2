//! Secret handling utilities.
//!
//! Re-exports the secrecy types used for credentials in relay-rs config.

pub use secrecy::{ExposeSecret, SecretString};
