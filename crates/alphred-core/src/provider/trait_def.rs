//! The `Provider` trait -- the adapter interface for agent runtimes.
//!
//! Each concrete provider (Claude, Codex, etc.) adapts its SDK's native
//! stream into the canonical event shape. The trait is intentionally
//! object-safe so providers can be stored as `Box<dyn Provider>` in the
//! [`super::ProviderRegistry`].

use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
use tokio_util::sync::CancellationToken;

use super::events::ProviderEvent;
use super::failure::ProviderError;

/// Options for a single provider invocation.
#[derive(Debug, Clone)]
pub struct ProviderRunOptions {
    /// Directory the agent works in (a worktree path from the workspace
    /// layer; its contents are opaque to the executor).
    pub working_directory: PathBuf,
    pub system_prompt: Option<String>,
    /// Per-invocation wall-clock limit. Enforced by the adapter core, not
    /// by individual providers.
    pub timeout: Option<Duration>,
    /// Rendered upstream context envelopes, in prompt order.
    pub context: Vec<String>,
    /// Cancellation signal owned by the adapter core; providers must stop
    /// their SDK stream promptly once it fires.
    pub cancellation: CancellationToken,
}

impl ProviderRunOptions {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            system_prompt: None,
            timeout: None,
            context: Vec::new(),
            cancellation: CancellationToken::new(),
        }
    }
}

/// A finite, non-restartable sequence of canonical events. A successful
/// run ends with exactly one `result` event; a terminal failure ends the
/// stream with a typed error.
pub type ProviderEventStream =
    Pin<Box<dyn Stream<Item = Result<ProviderEvent, ProviderError>> + Send>>;

/// Adapter interface for LLM agent runtimes.
///
/// # Object Safety
///
/// This trait is object-safe: `run` returns a boxed stream rather than an
/// `impl Trait`, so `Box<dyn Provider>` works in collections.
pub trait Provider: Send + Sync {
    /// Registry name for this provider (e.g. "claude").
    fn name(&self) -> &str;

    /// Start a run and return its event stream. The stream is lazy: no
    /// work happens until it is polled.
    fn run(&self, prompt: &str, options: &ProviderRunOptions) -> ProviderEventStream;
}

// Compile-time assertion: Provider must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Provider) {}
};
