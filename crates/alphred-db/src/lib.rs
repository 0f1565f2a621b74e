//! Persistence gateway for the alphred orchestrator.
//!
//! An embedded SQLite store holds the durable state: workflow runs and the
//! nodes, edges, artifacts, routing decisions, and join barriers each run
//! owns. This crate provides the connection pool, runtime migrations, row
//! models, and typed query functions; all policy lives in `alphred-core`.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
