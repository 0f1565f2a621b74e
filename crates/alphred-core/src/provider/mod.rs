//! Provider adapter core.
//!
//! This module defines the canonical event shapes, the [`Provider`] trait
//! all adapters implement, the [`ProviderRegistry`] for runtime lookup,
//! the typed failure taxonomy, and the phase runner that drives one
//! invocation to its terminal outcome.
//!
//! # Architecture
//!
//! ```text
//! Executor
//!     |
//!     v
//! ProviderRegistry --resolve("claude")--> &dyn Provider
//!     |                                        |
//!     |   run(prompt, options) ----------------+
//!     |        |
//!     |        v
//!     |   Stream<Result<ProviderEvent, ProviderError>>
//!     |        |
//!     |   drive_provider: timeout, dedupe, usage accounting,
//!     |                   routing-decision extraction
//! ```

pub mod events;
pub mod failure;
pub mod registry;
pub mod runner;
pub mod trait_def;

// Re-export the primary public API at the module level.
pub use events::{normalize_raw_event, ProviderEvent, ProviderEventType};
pub use failure::{FailureKind, ProviderError};
pub use registry::ProviderRegistry;
pub use runner::{drive_provider, EventObserver, ProviderOutcome};
pub use trait_def::{Provider, ProviderEventStream, ProviderRunOptions};
