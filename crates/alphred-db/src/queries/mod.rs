//! Typed query functions, one module per table.
//!
//! Every function is generic over [`sqlx::SqliteExecutor`] so it can run
//! against the pool directly or inside a transaction. Mutations that must
//! be observed atomically (status + artifact + barrier) are composed into
//! a single transaction by the caller.

pub mod artifacts;
pub mod barriers;
pub mod decisions;
pub mod edges;
pub mod nodes;
pub mod runs;
