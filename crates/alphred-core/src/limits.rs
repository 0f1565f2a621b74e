//! Fixed policy constants for context budgeting and control loops.

/// Version of the context-envelope format, bumped whenever the envelope
/// layout changes so downstream consumers can interpret stored manifests.
pub const CONTEXT_POLICY_VERSION: u32 = 1;

/// Maximum number of upstream report artifacts included per execution.
pub const MAX_UPSTREAM_ARTIFACTS: usize = 8;

/// Per-artifact character cap before head+tail truncation applies.
pub const MAX_CHARS_PER_ARTIFACT: usize = 24_000;

/// Aggregate character cap across all envelopes of one execution.
pub const MAX_CONTEXT_CHARS_TOTAL: usize = 96_000;

/// Minimum usable remainder; when the running budget drops below this,
/// further artifacts are dropped rather than squeezed in.
pub const MIN_REMAINING_CONTEXT_CHARS: usize = 1_000;

/// Character cap for the retry-failure-summary envelope.
pub const MAX_RETRY_SUMMARY_CONTEXT_CHARS: usize = 4_000;

/// Character cap for the failure-route diagnostic envelope.
pub const MAX_FAILURE_ROUTE_CONTEXT_CHARS: usize = 8_000;

/// Character cap for persisted failure summaries.
pub const MAX_ERROR_SUMMARY_CHARS: usize = 4_000;

/// Bounded retries for control actions racing against status changes.
pub const MAX_CONTROL_PRECONDITION_RETRIES: u32 = 5;

/// Default step cap for driving a run to completion.
pub const DEFAULT_MAX_STEPS: u32 = 200;
