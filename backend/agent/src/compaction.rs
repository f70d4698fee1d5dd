/// State compaction at model-switch boundaries.
///
/// Switching to a smaller model shrinks what the next turn can see, so the
/// tool-call history is cut to the most recent calls and the discovered
/// pattern list to the best few. Hypothesis, search results, and validation
/// results are never touched.
use serde::{Deserialize, Serialize};
use tubelens_core::{SessionState, ToolCall};

/// Tool calls retained after a model switch.
pub const KEEP_TOOL_CALLS: usize = 10;

/// Discovered patterns retained after a model switch.
pub const KEEP_PATTERNS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub original_tool_calls: usize,
    pub retained_tool_calls: usize,
    pub original_patterns: usize,
    pub retained_patterns: usize,
    /// One line per dropped tool call; empty when nothing was dropped.
    pub summary: String,
}

impl CompactionReport {
    pub fn dropped_tool_calls(&self) -> usize {
        self.original_tool_calls - self.retained_tool_calls
    }

    pub fn dropped_patterns(&self) -> usize {
        self.original_patterns - self.retained_patterns
    }
}

/// Compact `state` in place.
///
/// Patterns are ranked by descending score; equal scores keep discovery
/// order, and NaN scores rank last.
pub fn compact_for_model_switch(
    state: &mut SessionState,
    keep_tool_calls: usize,
    keep_patterns: usize,
) -> CompactionReport {
    let original_tool_calls = state.tool_calls.len();
    let original_patterns = state.discovered_patterns.len();

    let split_at = original_tool_calls.saturating_sub(keep_tool_calls);
    let dropped: Vec<ToolCall> = state.tool_calls.drain(..split_at).collect();

    let summary = if dropped.is_empty() {
        String::new()
    } else {
        let lines: Vec<String> = dropped
            .iter()
            .map(|c| {
                let outcome = if c.is_success() { "ok" } else { "error" };
                format!("[{}] {}", c.tool_name, outcome)
            })
            .collect();
        format!("[Compacted {} tool calls]\n{}", dropped.len(), lines.join("\n"))
    };

    state.discovered_patterns.sort_by(|a, b| {
        let a_score = if a.score.is_nan() { f64::NEG_INFINITY } else { a.score };
        let b_score = if b.score.is_nan() { f64::NEG_INFINITY } else { b.score };
        b_score.total_cmp(&a_score)
    });
    state.discovered_patterns.truncate(keep_patterns);

    CompactionReport {
        original_tool_calls,
        retained_tool_calls: state.tool_calls.len(),
        original_patterns,
        retained_patterns: state.discovered_patterns.len(),
        summary,
    }
}
