use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LensError;

/// Which analysis pipeline a session runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    /// Deterministic, non-LLM pipeline.
    #[default]
    Classic,
    /// LLM-tool-driven exploratory pipeline.
    Agentic,
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisMode::Classic => write!(f, "classic"),
            AnalysisMode::Agentic => write!(f, "agentic"),
        }
    }
}

/// The kind of work a single orchestration turn performs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TurnType {
    HypothesisGeneration,
    Validation,
    Enrichment,
    Lookup,
    Finalization,
}

impl fmt::Display for TurnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnType::HypothesisGeneration => "hypothesis_generation",
            TurnType::Validation => "validation",
            TurnType::Enrichment => "enrichment",
            TurnType::Lookup => "lookup",
            TurnType::Finalization => "finalization",
        };
        write!(f, "{}", s)
    }
}

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

/// Hard per-session resource caps. Immutable once a session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetCaps {
    pub max_fanouts: u32,
    pub max_validations: u32,
    pub max_candidates: u32,
    pub max_tokens: u64,
    pub max_duration_ms: u64,
    pub max_tool_calls: u32,
}

impl Default for BudgetCaps {
    fn default() -> Self {
        Self {
            max_fanouts: 5,
            max_validations: 10,
            max_candidates: 100,
            max_tokens: 100_000,
            max_duration_ms: 60_000,
            max_tool_calls: 50,
        }
    }
}

impl BudgetCaps {
    /// Every cap must be a positive integer.
    pub fn validate(&self) -> Result<(), LensError> {
        let fields = [
            ("maxFanouts", self.max_fanouts as u64),
            ("maxValidations", self.max_validations as u64),
            ("maxCandidates", self.max_candidates as u64),
            ("maxTokens", self.max_tokens),
            ("maxDurationMs", self.max_duration_ms),
            ("maxToolCalls", self.max_tool_calls as u64),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(LensError::ConfigError(format!(
                    "budget cap {} must be positive",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Accumulated cost, total and per tool (LLM turns are keyed by model id).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    pub total: f64,
    pub by_tool: BTreeMap<String, f64>,
}

/// Snapshot of what a session has consumed so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetUsage {
    pub tokens: u64,
    pub tool_calls: u32,
    pub costs: CostBreakdown,
    pub elapsed_ms: u64,
}

impl BudgetUsage {
    pub fn token_ratio(&self, caps: &BudgetCaps) -> f64 {
        ratio(self.tokens, caps.max_tokens)
    }

    pub fn tool_call_ratio(&self, caps: &BudgetCaps) -> f64 {
        ratio(self.tool_calls as u64, caps.max_tool_calls as u64)
    }

    pub fn time_ratio(&self, caps: &BudgetCaps) -> f64 {
        ratio(self.elapsed_ms, caps.max_duration_ms)
    }
}

fn ratio(used: u64, cap: u64) -> f64 {
    if cap == 0 {
        return 1.0;
    }
    used as f64 / cap as f64
}

// ---------------------------------------------------------------------------
// Session payloads
// ---------------------------------------------------------------------------

/// Derived facts about the video under analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub niche: Option<String>,
}

/// The working explanation of a video's performance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hypothesis {
    pub statement: String,
    pub confidence: f64,
    #[serde(default)]
    pub supporting_evidence: Vec<String>,
}

impl Hypothesis {
    pub fn new(statement: impl Into<String>, confidence: f64) -> Self {
        Self {
            statement: statement.into(),
            confidence,
            supporting_evidence: Vec::new(),
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.supporting_evidence.push(evidence.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    #[serde(default)]
    pub semantic_neighbors: Vec<String>,
    #[serde(default)]
    pub competitive_successes: Vec<String>,
    #[serde(default)]
    pub total_candidates: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedPattern {
    pub pattern: String,
    pub confidence: f64,
    pub validations: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResults {
    #[serde(default)]
    pub validated_patterns: Vec<ValidatedPattern>,
    #[serde(default)]
    pub total_validations: u32,
}

/// A candidate pattern surfaced during exploration, ranked by score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredPattern {
    pub pattern: String,
    pub score: f64,
}

impl DiscoveredPattern {
    pub fn new(pattern: impl Into<String>, score: f64) -> Self {
        Self {
            pattern: pattern.into(),
            score,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Success,
    Error,
}

/// One tool invocation as recorded in the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    pub params: serde_json::Value,
    pub status: ToolCallStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set for cacheable tools; identical keys within a session share a result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    /// True when the result was served from an earlier call.
    #[serde(default)]
    pub cached: bool,
}

impl ToolCall {
    pub fn success(
        id: impl Into<String>,
        tool_name: impl Into<String>,
        params: serde_json::Value,
        start_time: DateTime<Utc>,
        result: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            params,
            status: ToolCallStatus::Success,
            start_time,
            end_time: Utc::now(),
            result: Some(result),
            error: None,
            cache_key: None,
            cached: false,
        }
    }

    pub fn failure(
        id: impl Into<String>,
        tool_name: impl Into<String>,
        params: serde_json::Value,
        start_time: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            params,
            status: ToolCallStatus::Error,
            start_time,
            end_time: Utc::now(),
            result: None,
            error: Some(error.into()),
            cache_key: None,
            cached: false,
        }
    }

    pub fn with_cache_key(mut self, key: Option<String>) -> Self {
        self.cache_key = key;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolCallStatus::Success
    }

    pub fn duration_ms(&self) -> u64 {
        (self.end_time - self.start_time).num_milliseconds().max(0) as u64
    }
}

/// An error entry in the session log. Never removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionError {
    pub timestamp: DateTime<Utc>,
    pub error: String,
    pub context: String,
    pub recoverable: bool,
}

impl SessionError {
    pub fn new(error: impl Into<String>, context: impl Into<String>, recoverable: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            error: error.into(),
            context: context.into(),
            recoverable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSwitch {
    pub from: String,
    pub to: String,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Everything the orchestrator knows about one analysis session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: String,
    pub video_id: String,
    pub video_context: Option<VideoContext>,
    pub hypothesis: Option<Hypothesis>,
    pub search_results: Option<SearchResults>,
    pub validation_results: Option<ValidationResults>,
    #[serde(default)]
    pub discovered_patterns: Vec<DiscoveredPattern>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub errors: Vec<SessionError>,
    pub mode: AnalysisMode,
    pub current_model: String,
    #[serde(default)]
    pub model_switch_history: Vec<ModelSwitch>,
    pub budget_caps: BudgetCaps,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_from: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(
        session_id: impl Into<String>,
        video_id: impl Into<String>,
        mode: AnalysisMode,
        model: impl Into<String>,
        budget_caps: BudgetCaps,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            video_id: video_id.into(),
            video_context: None,
            hypothesis: None,
            search_results: None,
            validation_results: None,
            discovered_patterns: Vec::new(),
            tool_calls: Vec::new(),
            errors: Vec::new(),
            mode,
            current_model: model.into(),
            model_switch_history: Vec::new(),
            budget_caps,
            fallback_from: None,
            created_at: Utc::now(),
        }
    }

    /// Number of errors that count toward fallback.
    pub fn nonrecoverable_errors(&self) -> usize {
        self.errors.iter().filter(|e| !e.recoverable).count()
    }

    /// Most recent successful call for `tool_name`, if any.
    pub fn last_result(&self, tool_name: &str) -> Option<&serde_json::Value> {
        self.tool_calls
            .iter()
            .rev()
            .find(|c| c.tool_name == tool_name && c.is_success())
            .and_then(|c| c.result.as_ref())
    }

    /// Check structural invariants. Returns a description of the first
    /// violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.video_id.trim().is_empty() {
            return Err("video id is empty".to_string());
        }
        if let Some(h) = &self.hypothesis {
            if !(0.0..=1.0).contains(&h.confidence) {
                return Err(format!(
                    "hypothesis confidence {} outside [0, 1]",
                    h.confidence
                ));
            }
        }
        if let Some(last) = self.model_switch_history.last() {
            if last.to != self.current_model {
                return Err(format!(
                    "current model '{}' does not match last switch target '{}'",
                    self.current_model, last.to
                ));
            }
        }
        Ok(())
    }
}
