//! Head+tail truncation for oversized artifact content.

use serde::{Deserialize, Serialize};

/// Sentinel inserted between the kept head and tail.
pub const TRUNCATION_MARKER: &str = "\n[... content truncated ...]\n";

/// Result of applying (or not applying) truncation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Truncated {
    pub text: String,
    pub applied: bool,
    pub original_chars: usize,
    pub included_chars: usize,
}

/// Cap `input` at `max_chars` characters, keeping a head prefix and tail
/// suffix around the sentinel marker. Content at or under the cap passes
/// through untouched. The returned text never exceeds `max_chars`.
pub fn truncate_head_tail(input: &str, max_chars: usize) -> Truncated {
    let original_chars = input.chars().count();
    if original_chars <= max_chars {
        return Truncated {
            text: input.to_owned(),
            applied: false,
            original_chars,
            included_chars: original_chars,
        };
    }

    let marker_chars = TRUNCATION_MARKER.chars().count();
    if max_chars <= marker_chars {
        // Degenerate budget: no room for the marker, keep a bare head.
        let text: String = input.chars().take(max_chars).collect();
        let included_chars = text.chars().count();
        return Truncated {
            text,
            applied: true,
            original_chars,
            included_chars,
        };
    }

    let keep = max_chars - marker_chars;
    let head = keep / 2;
    let tail = keep - head;
    let head_text: String = input.chars().take(head).collect();
    let tail_text: String = input.chars().skip(original_chars - tail).collect();
    let text = format!("{head_text}{TRUNCATION_MARKER}{tail_text}");
    let included_chars = text.chars().count();

    Truncated {
        text,
        applied: true,
        original_chars,
        included_chars,
    }
}
