//! Persistence layer for the foreman harness.
//!
//! SQLite through `sqlx`, with embedded migrations and one module of free
//! query functions per table under [`queries`].

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
