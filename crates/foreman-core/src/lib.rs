//! Core of the foreman harness: agent adapters, runtimes, credentials,
//! stage execution and the dispatcher loop.
//!
//! Persistence lives in `foreman-db`; the HTTP API and CLI live in
//! `foreman-cli`. Everything here takes an explicit
//! [`config::HarnessConfig`].

pub mod agents;
pub mod app;
pub mod attachments;
pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod guard;
pub mod profiles;
pub mod projection;
pub mod prompt;
pub mod runtime;
pub mod state;
pub mod workitems;

pub use app::Foreman;
pub use config::HarnessConfig;
pub use error::{HarnessError, HarnessResult};
