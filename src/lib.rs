//! gitauth: personal access tokens and SSH keys for git clients.
//!
//! The binary in `main.rs` wires these modules together; integration tests
//! in `tests/` drive them directly.

use std::sync::Arc;

pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod delegate;
pub mod errors;
pub mod hashing;
pub mod jobs;
pub mod manager;
pub mod metrics;
pub mod pubsub;
pub mod ssh_keys;
pub mod startup;
pub mod store;
pub mod tokens;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub manager: Arc<manager::CredentialManager>,
    pub config: config::Config,
}
