//! The phase runner: drives one provider invocation to its terminal
//! outcome.
//!
//! Wraps the provider's event stream with timeout arming, tool-use
//! deduplication, usage accounting, routing-decision extraction, and
//! missing-result detection. Events are forwarded to the observer in
//! strict emission order; the observer is synchronous and must not block.

use std::collections::HashSet;

use alphred_db::models::DecisionType;
use futures::StreamExt;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::events::{ProviderEvent, ProviderEventType};
use super::failure::{FailureKind, ProviderError};
use super::trait_def::{Provider, ProviderRunOptions};

/// Synchronous per-event callback.
pub type EventObserver = dyn Fn(&ProviderEvent) + Send + Sync;

/// Terminal outcome of a successful provider run.
#[derive(Debug, Clone)]
pub struct ProviderOutcome {
    /// Content of the terminal `result` event.
    pub content: String,
    pub result_metadata: Option<JsonValue>,
    /// Routing decision extracted from the result metadata's canonical
    /// `routingDecision` key, if a valid one was declared.
    pub routing_decision: Option<DecisionType>,
    pub tokens_used: i64,
    /// Every forwarded event, in emission order, ending with the result.
    pub events: Vec<ProviderEvent>,
}

/// Absolute and incremental token counts carried by one event.
///
/// Absolute counts come as `total_tokens` or `input_tokens` +
/// `output_tokens`, possibly nested under `usage`; incremental deltas
/// come as `tokens`.
fn token_counts(event: &ProviderEvent) -> (Option<i64>, Option<i64>) {
    let Some(metadata) = &event.metadata else {
        return (None, None);
    };
    let scope = metadata.get("usage").unwrap_or(metadata);

    let absolute = scope
        .get("total_tokens")
        .and_then(JsonValue::as_i64)
        .or_else(|| {
            let input = scope.get("input_tokens").and_then(JsonValue::as_i64);
            let output = scope.get("output_tokens").and_then(JsonValue::as_i64);
            match (input, output) {
                (None, None) => None,
                (i, o) => Some(i.unwrap_or(0) + o.unwrap_or(0)),
            }
        });
    let incremental = scope.get("tokens").and_then(JsonValue::as_i64);

    (absolute, incremental)
}

/// Read the canonical `routingDecision` key from result metadata.
///
/// Only `approved`, `changes_requested`, `blocked`, and `retry` are
/// accepted; anything else -- including values under legacy keys such as
/// `routing_decision` -- is treated as absent.
fn extract_routing_decision(metadata: Option<&JsonValue>) -> Option<DecisionType> {
    let value = metadata?.get("routingDecision")?.as_str()?;
    match value.parse::<DecisionType>() {
        Ok(DecisionType::NoRoute) | Err(_) => None,
        Ok(decision) => Some(decision),
    }
}

/// Drive a provider run to its terminal outcome.
///
/// The runner owns the cancellation token for this invocation: it is
/// installed into the options before the stream starts, fired when the
/// timeout elapses (or `external_cancel` fires), and the timer is dropped
/// on every exit path.
pub async fn drive_provider(
    provider: &dyn Provider,
    prompt: &str,
    mut options: ProviderRunOptions,
    observer: Option<&EventObserver>,
    external_cancel: Option<&CancellationToken>,
) -> Result<ProviderOutcome, ProviderError> {
    let cancellation = CancellationToken::new();
    options.cancellation = cancellation.clone();
    let timeout = options.timeout;

    let mut stream = provider.run(prompt, &options);

    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => futures::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let external = async {
        match external_cancel {
            Some(token) => token.cancelled().await,
            None => futures::future::pending().await,
        }
    };
    tokio::pin!(external);

    let mut seen_tool_use_ids: HashSet<String> = HashSet::new();
    let mut latest_absolute: i64 = 0;
    let mut incremental_sum: i64 = 0;
    let mut events: Vec<ProviderEvent> = Vec::new();

    loop {
        tokio::select! {
            () = &mut deadline => {
                cancellation.cancel();
                return Err(ProviderError::timeout(timeout.unwrap_or_default()));
            }
            () = &mut external => {
                cancellation.cancel();
                return Err(ProviderError::new(
                    FailureKind::InternalError,
                    "provider run cancelled by executor",
                ));
            }
            next = stream.next() => match next {
                None => {
                    cancellation.cancel();
                    return Err(ProviderError::missing_result());
                }
                Some(Err(err)) => {
                    cancellation.cancel();
                    return Err(err);
                }
                Some(Ok(event)) => {
                    // tool_use events can arrive both from assistant
                    // content blocks and from out-of-band progress
                    // events; the id wins, the duplicate is dropped.
                    if event.event_type == ProviderEventType::ToolUse {
                        if let Some(id) = event.tool_use_id() {
                            if !seen_tool_use_ids.insert(id.to_owned()) {
                                debug!(tool_use_id = id, "dropping duplicate tool_use event");
                                continue;
                            }
                        }
                    }

                    let (absolute, incremental) = token_counts(&event);
                    if let Some(snapshot) = absolute {
                        // An absolute snapshot wins over an incremental
                        // delta carried by the same event.
                        latest_absolute = snapshot;
                    } else if let Some(delta) = incremental {
                        incremental_sum += delta;
                    }

                    if let Some(observer) = observer {
                        observer(&event);
                    }

                    let is_result = event.event_type == ProviderEventType::Result;
                    events.push(event);

                    if is_result {
                        cancellation.cancel();
                        let (content, result_metadata) = {
                            let result = events.last().expect("result event just pushed");
                            (result.content.clone(), result.metadata.clone())
                        };
                        let routing_decision =
                            extract_routing_decision(result_metadata.as_ref());
                        return Ok(ProviderOutcome {
                            content,
                            result_metadata,
                            routing_decision,
                            tokens_used: latest_absolute.max(incremental_sum),
                            events,
                        });
                    }
                }
            }
        }
    }
}
