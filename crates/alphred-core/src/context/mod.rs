//! Upstream context assembly.
//!
//! For the node about to execute, package its predecessors' latest report
//! artifacts (plus the optional retry-failure summary and failure-route
//! diagnostics) into an ordered list of bounded context envelopes and a
//! manifest describing what was included, dropped, or truncated.
//!
//! Assembly is a single pass with running counters over pure inputs; the
//! executor gathers the rows and persists the manifest.

pub mod truncate;

use std::fmt;

use alphred_db::models::{PhaseArtifact, RunNode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::limits::{
    CONTEXT_POLICY_VERSION, MAX_CHARS_PER_ARTIFACT, MAX_CONTEXT_CHARS_TOTAL,
    MAX_ERROR_SUMMARY_CHARS, MAX_FAILURE_ROUTE_CONTEXT_CHARS, MAX_RETRY_SUMMARY_CONTEXT_CHARS,
    MAX_UPSTREAM_ARTIFACTS, MIN_REMAINING_CONTEXT_CHARS,
};
use truncate::{truncate_head_tail, Truncated};

/// What role an envelope plays in the assembled context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    FailureRoute,
    UpstreamReport,
    RetrySummary,
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FailureRoute => "failure_route",
            Self::UpstreamReport => "upstream_report",
            Self::RetrySummary => "retry_summary",
        };
        f.write_str(s)
    }
}

/// Truncation record carried on every envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationInfo {
    pub applied: bool,
    pub original_chars: usize,
    pub included_chars: usize,
}

impl From<&Truncated> for TruncationInfo {
    fn from(t: &Truncated) -> Self {
        Self {
            applied: t.applied,
            original_chars: t.original_chars,
            included_chars: t.included_chars,
        }
    }
}

/// A self-describing text block handed to the provider prompt template.
///
/// The digest is always of the *original* content, so downstream
/// consumers can detect semantic identity across truncations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEnvelope {
    pub kind: EnvelopeKind,
    pub source_node_key: String,
    pub source_run_node_id: i64,
    pub artifact_id: Option<i64>,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    pub sha256: String,
    pub truncation: TruncationInfo,
    pub included_content: String,
}

impl ContextEnvelope {
    /// Render the envelope as the text block passed to the provider.
    pub fn render(&self) -> String {
        format!(
            "[{} | node {} | sha256 {}]\n{}",
            self.kind, self.source_node_key, self.sha256, self.included_content
        )
    }
}

/// Per-artifact truncation entry in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactTruncation {
    pub artifact_id: i64,
    pub applied: bool,
    pub original_chars: usize,
    pub included_chars: usize,
}

/// What was included, dropped, or truncated for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextManifest {
    pub policy_version: u32,
    pub included_artifact_ids: Vec<i64>,
    pub dropped_artifact_ids: Vec<i64>,
    pub truncations: Vec<ArtifactTruncation>,
    pub included_count: usize,
    pub included_chars_total: usize,
    pub missing_upstream_artifacts: bool,
    pub no_eligible_artifact_types: bool,
    pub budget_overflow: bool,
    pub retry_summary_included: bool,
    pub retry_summary_chars: usize,
    pub failure_route_included: bool,
    pub failure_route_chars: usize,
}

impl Default for ContextManifest {
    fn default() -> Self {
        Self {
            policy_version: CONTEXT_POLICY_VERSION,
            included_artifact_ids: Vec::new(),
            dropped_artifact_ids: Vec::new(),
            truncations: Vec::new(),
            included_count: 0,
            included_chars_total: 0,
            missing_upstream_artifacts: false,
            no_eligible_artifact_types: false,
            budget_overflow: false,
            retry_summary_included: false,
            retry_summary_chars: 0,
            failure_route_included: false,
            failure_route_chars: 0,
        }
    }
}

/// The assembled context: envelopes in prompt order plus the manifest.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub envelopes: Vec<ContextEnvelope>,
    pub manifest: ContextManifest,
}

impl AssembledContext {
    /// Render all envelopes to the strings passed as provider context.
    pub fn rendered(&self) -> Vec<String> {
        self.envelopes.iter().map(ContextEnvelope::render).collect()
    }
}

/// One direct predecessor of the target, with its latest report (if any).
#[derive(Debug, Clone)]
pub struct UpstreamInput<'a> {
    pub source: &'a RunNode,
    pub report: Option<&'a PhaseArtifact>,
    /// The predecessor produced artifacts, just none of type `report`.
    pub has_other_artifacts: bool,
}

/// Diagnostics for a target reached through a failure edge.
#[derive(Debug, Clone)]
pub struct FailureRouteInput<'a> {
    pub source: &'a RunNode,
    pub failure_log: Option<&'a PhaseArtifact>,
    pub retry_summary: Option<&'a PhaseArtifact>,
    pub failure_reason: String,
}

/// Everything the assembler needs, gathered by the executor.
#[derive(Debug, Clone)]
pub struct ContextRequest<'a> {
    pub target: &'a RunNode,
    /// Direct predecessors in `(sequence_path, sequence_index, node_key,
    /// id)` order of the source.
    pub upstream: Vec<UpstreamInput<'a>>,
    /// Retry-failure summary from the previous attempt of the target.
    pub retry_summary: Option<&'a PhaseArtifact>,
    pub failure_route: Option<FailureRouteInput<'a>>,
}

fn sha256_hex(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Compose the failure-route diagnostic text for a failed source.
fn render_failure_block(input: &FailureRouteInput<'_>) -> String {
    let retries_used = input.source.attempt - 1;
    let retries_exhausted = input.source.attempt > input.source.max_retries;
    let mut block = format!(
        "upstream node {} failed\nattempt: {}\nmax_retries: {}\nretries_used: {}\n\
         retries_exhausted: {}\nfailure_reason: {}\n",
        input.source.node_key,
        input.source.attempt,
        input.source.max_retries,
        retries_used,
        retries_exhausted,
        input.failure_reason,
    );
    if let Some(log) = input.failure_log {
        block.push_str("\n--- failure log ---\n");
        block.push_str(&log.content);
    }
    if let Some(summary) = input.retry_summary {
        block.push_str("\n\n--- last retry summary ---\n");
        block.push_str(&summary.content);
    }
    block
}

/// Assemble the context for one execution.
///
/// Envelope order is fixed: `[failure-route?, upstream-report xN,
/// retry-summary?]`. The retry summary runs at a reserved budget so late
/// upstream artifacts cannot starve it.
pub fn assemble(request: &ContextRequest<'_>) -> AssembledContext {
    let mut manifest = ContextManifest::default();
    let mut envelopes = Vec::new();
    let mut used: usize = 0;

    // Failure-route diagnostics come first.
    if let Some(failure) = &request.failure_route {
        let block = render_failure_block(failure);
        let cap = MAX_FAILURE_ROUTE_CONTEXT_CHARS.min(MAX_CONTEXT_CHARS_TOTAL - used);
        let truncated = truncate_head_tail(&block, cap);
        used += truncated.included_chars;
        manifest.failure_route_included = true;
        manifest.failure_route_chars = truncated.included_chars;
        envelopes.push(ContextEnvelope {
            kind: EnvelopeKind::FailureRoute,
            source_node_key: failure.source.node_key.clone(),
            source_run_node_id: failure.source.id,
            artifact_id: failure.failure_log.map(|a| a.id),
            content_type: "text/plain".to_string(),
            created_at: failure
                .failure_log
                .map(|a| a.created_at)
                .unwrap_or(failure.source.created_at),
            sha256: sha256_hex(&block),
            truncation: TruncationInfo::from(&truncated),
            included_content: truncated.text,
        });
    }

    // Reserve the retry summary's budget before walking upstream.
    let summary_cap = MAX_ERROR_SUMMARY_CHARS.min(MAX_RETRY_SUMMARY_CONTEXT_CHARS);
    let reserved = request
        .retry_summary
        .map(|note| summary_cap.min(note.content.chars().count()))
        .unwrap_or(0);

    for upstream in &request.upstream {
        let Some(report) = upstream.report else {
            if upstream.has_other_artifacts {
                manifest.no_eligible_artifact_types = true;
            } else {
                manifest.missing_upstream_artifacts = true;
            }
            continue;
        };

        if manifest.included_artifact_ids.len() >= MAX_UPSTREAM_ARTIFACTS {
            manifest.dropped_artifact_ids.push(report.id);
            manifest.budget_overflow = true;
            continue;
        }

        let remaining = MAX_CONTEXT_CHARS_TOTAL.saturating_sub(used + reserved);
        if remaining < MIN_REMAINING_CONTEXT_CHARS {
            manifest.dropped_artifact_ids.push(report.id);
            manifest.budget_overflow = true;
            continue;
        }

        let cap = MAX_CHARS_PER_ARTIFACT.min(remaining);
        let truncated = truncate_head_tail(&report.content, cap);
        used += truncated.included_chars;
        manifest.included_artifact_ids.push(report.id);
        manifest.truncations.push(ArtifactTruncation {
            artifact_id: report.id,
            applied: truncated.applied,
            original_chars: truncated.original_chars,
            included_chars: truncated.included_chars,
        });
        envelopes.push(ContextEnvelope {
            kind: EnvelopeKind::UpstreamReport,
            source_node_key: upstream.source.node_key.clone(),
            source_run_node_id: upstream.source.id,
            artifact_id: Some(report.id),
            content_type: report.content_type.clone(),
            created_at: report.created_at,
            sha256: sha256_hex(&report.content),
            truncation: TruncationInfo::from(&truncated),
            included_content: truncated.text,
        });
    }

    // Retry summary last, bounded by its reserved budget.
    if let Some(note) = request.retry_summary {
        let cap = summary_cap.min(MAX_CONTEXT_CHARS_TOTAL.saturating_sub(used));
        let truncated = truncate_head_tail(&note.content, cap);
        used += truncated.included_chars;
        manifest.retry_summary_included = true;
        manifest.retry_summary_chars = truncated.included_chars;
        envelopes.push(ContextEnvelope {
            kind: EnvelopeKind::RetrySummary,
            source_node_key: request.target.node_key.clone(),
            source_run_node_id: request.target.id,
            artifact_id: Some(note.id),
            content_type: note.content_type.clone(),
            created_at: note.created_at,
            sha256: sha256_hex(&note.content),
            truncation: TruncationInfo::from(&truncated),
            included_content: truncated.text,
        });
    }

    manifest.included_count = manifest.included_artifact_ids.len();
    manifest.included_chars_total = used;

    AssembledContext {
        envelopes,
        manifest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alphred_db::models::{ArtifactType, NodeRole, NodeStatus, NodeType};
    use chrono::TimeZone;

    fn test_node(id: i64, key: &str) -> RunNode {
        RunNode {
            id,
            workflow_run_id: 1,
            tree_node_id: id,
            node_key: key.to_string(),
            node_role: NodeRole::Standard,
            status: NodeStatus::Completed,
            sequence_index: id,
            sequence_path: format!("{id:04}"),
            lineage_depth: 0,
            spawner_node_id: None,
            join_node_id: None,
            attempt: 1,
            started_at: None,
            completed_at: None,
            max_retries: 0,
            max_children: 0,
            node_type: NodeType::Agent,
            provider: Some("claude".to_string()),
            model: None,
            execution_permissions: None,
            error_handler_config: None,
            execution_metadata: None,
            prompt: "p".to_string(),
            prompt_content_type: "text/markdown".to_string(),
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn report(id: i64, node_id: i64, content: &str) -> PhaseArtifact {
        PhaseArtifact {
            id,
            workflow_run_id: 1,
            run_node_id: node_id,
            artifact_type: ArtifactType::Report,
            content_type: "text/markdown".to_string(),
            content: content.to_string(),
            metadata: serde_json::json!({}),
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap(),
        }
    }

    fn note(id: i64, node_id: i64, content: &str) -> PhaseArtifact {
        PhaseArtifact {
            artifact_type: ArtifactType::Note,
            ..report(id, node_id, content)
        }
    }

    #[test]
    fn single_upstream_report_included_whole() {
        let target = test_node(2, "b");
        let source = test_node(1, "a");
        let artifact = report(10, 1, "upstream findings");
        let request = ContextRequest {
            target: &target,
            upstream: vec![UpstreamInput {
                source: &source,
                report: Some(&artifact),
                has_other_artifacts: false,
            }],
            retry_summary: None,
            failure_route: None,
        };

        let assembled = assemble(&request);
        assert_eq!(assembled.envelopes.len(), 1);
        assert_eq!(assembled.manifest.included_count, 1);
        assert_eq!(assembled.manifest.included_artifact_ids, vec![10]);
        assert!(assembled.manifest.dropped_artifact_ids.is_empty());
        assert!(!assembled.manifest.budget_overflow);
        let env = &assembled.envelopes[0];
        assert_eq!(env.kind, EnvelopeKind::UpstreamReport);
        assert_eq!(env.source_node_key, "a");
        assert_eq!(env.included_content, "upstream findings");
        assert!(!env.truncation.applied);
        assert_eq!(env.sha256, sha256_hex("upstream findings"));
    }

    #[test]
    fn artifact_at_per_artifact_cap_untruncated() {
        let target = test_node(2, "b");
        let source = test_node(1, "a");
        let content = "x".repeat(MAX_CHARS_PER_ARTIFACT);
        let artifact = report(10, 1, &content);
        let request = ContextRequest {
            target: &target,
            upstream: vec![UpstreamInput {
                source: &source,
                report: Some(&artifact),
                has_other_artifacts: false,
            }],
            retry_summary: None,
            failure_route: None,
        };

        let assembled = assemble(&request);
        let t = &assembled.manifest.truncations[0];
        assert!(!t.applied);
        assert_eq!(t.included_chars, MAX_CHARS_PER_ARTIFACT);
    }

    #[test]
    fn artifact_one_over_cap_truncated() {
        let target = test_node(2, "b");
        let source = test_node(1, "a");
        let content = "x".repeat(MAX_CHARS_PER_ARTIFACT + 1);
        let artifact = report(10, 1, &content);
        let request = ContextRequest {
            target: &target,
            upstream: vec![UpstreamInput {
                source: &source,
                report: Some(&artifact),
                has_other_artifacts: false,
            }],
            retry_summary: None,
            failure_route: None,
        };

        let assembled = assemble(&request);
        let t = &assembled.manifest.truncations[0];
        assert!(t.applied);
        assert_eq!(t.original_chars, MAX_CHARS_PER_ARTIFACT + 1);
        assert!(t.included_chars <= MAX_CHARS_PER_ARTIFACT);
    }

    #[test]
    fn exhausted_budget_drops_candidates() {
        let target = test_node(9, "target");
        let sources: Vec<RunNode> = (1..=5).map(|i| test_node(i, &format!("s{i}"))).collect();
        let artifacts: Vec<PhaseArtifact> = (1..=5)
            .map(|i| report(i * 10, i, &"y".repeat(MAX_CHARS_PER_ARTIFACT)))
            .collect();
        let upstream: Vec<UpstreamInput<'_>> = sources
            .iter()
            .zip(&artifacts)
            .map(|(source, artifact)| UpstreamInput {
                source,
                report: Some(artifact),
                has_other_artifacts: false,
            })
            .collect();
        let request = ContextRequest {
            target: &target,
            upstream,
            retry_summary: None,
            failure_route: None,
        };

        let assembled = assemble(&request);
        // 5 x 24k does not fit into the 96k aggregate budget.
        assert!(assembled.manifest.budget_overflow);
        assert!(!assembled.manifest.dropped_artifact_ids.is_empty());
        assert!(assembled.manifest.included_chars_total <= MAX_CONTEXT_CHARS_TOTAL);
        assert!(assembled.manifest.included_count <= MAX_UPSTREAM_ARTIFACTS);
        let included_plus_dropped =
            assembled.manifest.included_count + assembled.manifest.dropped_artifact_ids.len();
        assert_eq!(included_plus_dropped, 5);
    }

    #[test]
    fn upstream_count_capped() {
        let target = test_node(99, "target");
        let sources: Vec<RunNode> = (1..=(MAX_UPSTREAM_ARTIFACTS as i64 + 2))
            .map(|i| test_node(i, &format!("s{i}")))
            .collect();
        let artifacts: Vec<PhaseArtifact> = sources
            .iter()
            .map(|s| report(s.id * 10, s.id, "small"))
            .collect();
        let upstream: Vec<UpstreamInput<'_>> = sources
            .iter()
            .zip(&artifacts)
            .map(|(source, artifact)| UpstreamInput {
                source,
                report: Some(artifact),
                has_other_artifacts: false,
            })
            .collect();
        let request = ContextRequest {
            target: &target,
            upstream,
            retry_summary: None,
            failure_route: None,
        };

        let assembled = assemble(&request);
        assert_eq!(assembled.manifest.included_count, MAX_UPSTREAM_ARTIFACTS);
        assert_eq!(assembled.manifest.dropped_artifact_ids.len(), 2);
    }

    #[test]
    fn missing_and_ineligible_artifacts_flagged() {
        let target = test_node(9, "target");
        let bare = test_node(1, "bare");
        let logs_only = test_node(2, "logs-only");
        let request = ContextRequest {
            target: &target,
            upstream: vec![
                UpstreamInput {
                    source: &bare,
                    report: None,
                    has_other_artifacts: false,
                },
                UpstreamInput {
                    source: &logs_only,
                    report: None,
                    has_other_artifacts: true,
                },
            ],
            retry_summary: None,
            failure_route: None,
        };

        let assembled = assemble(&request);
        assert!(assembled.manifest.missing_upstream_artifacts);
        assert!(assembled.manifest.no_eligible_artifact_types);
        assert_eq!(assembled.manifest.included_count, 0);
    }

    #[test]
    fn retry_summary_bounded_and_last() {
        let mut target = test_node(2, "b");
        target.attempt = 2;
        let source = test_node(1, "a");
        let artifact = report(10, 1, "upstream");
        let summary_content = "e".repeat(MAX_RETRY_SUMMARY_CONTEXT_CHARS + 500);
        let summary = note(20, 2, &summary_content);
        let request = ContextRequest {
            target: &target,
            upstream: vec![UpstreamInput {
                source: &source,
                report: Some(&artifact),
                has_other_artifacts: false,
            }],
            retry_summary: Some(&summary),
            failure_route: None,
        };

        let assembled = assemble(&request);
        assert!(assembled.manifest.retry_summary_included);
        assert!(
            assembled.manifest.retry_summary_chars
                <= MAX_ERROR_SUMMARY_CHARS.min(MAX_RETRY_SUMMARY_CONTEXT_CHARS)
        );
        let last = assembled.envelopes.last().unwrap();
        assert_eq!(last.kind, EnvelopeKind::RetrySummary);
        assert!(last.truncation.applied);
    }

    #[test]
    fn failure_route_block_comes_first() {
        let target = test_node(3, "handler");
        let mut failed_source = test_node(1, "a");
        failed_source.status = NodeStatus::Failed;
        failed_source.attempt = 3;
        failed_source.max_retries = 2;
        let log = PhaseArtifact {
            artifact_type: ArtifactType::Log,
            ..report(30, 1, "provider exploded")
        };
        let upstream_source = test_node(2, "b");
        let upstream_report = report(10, 2, "fine");

        let request = ContextRequest {
            target: &target,
            upstream: vec![UpstreamInput {
                source: &upstream_source,
                report: Some(&upstream_report),
                has_other_artifacts: false,
            }],
            retry_summary: None,
            failure_route: Some(FailureRouteInput {
                source: &failed_source,
                failure_log: Some(&log),
                retry_summary: None,
                failure_reason: "timeout".to_string(),
            }),
        };

        let assembled = assemble(&request);
        assert!(assembled.manifest.failure_route_included);
        let first = &assembled.envelopes[0];
        assert_eq!(first.kind, EnvelopeKind::FailureRoute);
        assert!(first.included_content.contains("retries_exhausted: true"));
        assert!(first.included_content.contains("retries_used: 2"));
        assert!(first.included_content.contains("provider exploded"));
        assert!(first.included_content.contains("failure_reason: timeout"));
    }

    #[test]
    fn assembly_is_deterministic() {
        let target = test_node(2, "b");
        let source = test_node(1, "a");
        let artifact = report(10, 1, &"m".repeat(50_000));
        let make = || {
            let request = ContextRequest {
                target: &target,
                upstream: vec![UpstreamInput {
                    source: &source,
                    report: Some(&artifact),
                    has_other_artifacts: false,
                }],
                retry_summary: None,
                failure_route: None,
            };
            assemble(&request)
        };
        let a = make();
        let b = make();
        assert_eq!(a.manifest, b.manifest);
        assert_eq!(a.envelopes, b.envelopes);
    }

    #[test]
    fn rendered_envelope_carries_header() {
        let target = test_node(2, "b");
        let source = test_node(1, "a");
        let artifact = report(10, 1, "body");
        let request = ContextRequest {
            target: &target,
            upstream: vec![UpstreamInput {
                source: &source,
                report: Some(&artifact),
                has_other_artifacts: false,
            }],
            retry_summary: None,
            failure_route: None,
        };
        let assembled = assemble(&request);
        let rendered = assembled.rendered();
        assert_eq!(rendered.len(), 1);
        assert!(rendered[0].starts_with("[upstream_report | node a | sha256 "));
        assert!(rendered[0].ends_with("body"));
    }
}
