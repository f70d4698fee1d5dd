/// Analysis mode selection and the fallback policy.
///
/// The selector scores how well a video suits exploratory (agentic) analysis
/// from a handful of boolean signals, discounts that score by recent failure
/// history, and maps the result onto a mode. During an agentic run the same
/// component decides when to give up and fall back to the classic pipeline.
use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tubelens_core::{AnalysisMode, BudgetCaps};

/// Agentic runs needed before historical failure rate counts against a selection.
const MIN_RUNS_FOR_HISTORY: usize = 3;

/// Agentic selections inspected for the recent-fallback penalty.
const RECENT_FALLBACK_WINDOW: usize = 10;

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectionFactors {
    pub video_has_high_tps: bool,
    pub channel_has_patterns: bool,
    pub has_competitive_data: bool,
    pub has_semantic_clusters: bool,
    pub previous_failures: u32,
    pub quota_available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeDecision {
    pub mode: AnalysisMode,
    /// Confidence in the chosen mode, in [0, 1].
    pub confidence: f64,
    /// Agentic was chosen, but only marginally.
    pub fallback_recommended: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionResult {
    /// The selected mode ran to completion.
    Selected,
    /// The selected mode was abandoned for classic.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRecord {
    pub timestamp: DateTime<Utc>,
    pub factors: SelectionFactors,
    pub mode: AnalysisMode,
    pub result: SelectionResult,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Additive weights for favorable factors and subtractive penalties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectorWeights {
    pub high_tps: f64,
    pub channel_patterns: f64,
    pub competitive_data: f64,
    pub semantic_clusters: f64,
    /// Penalty per previous failure on this video.
    pub previous_failure: f64,
    /// Cap on the total previous-failure penalty.
    pub max_failure_penalty: f64,
    /// Scales the historical agentic failure rate.
    pub failure_rate: f64,
    /// Scales the share of recent agentic selections that fell back.
    pub recent_fallback: f64,
}

impl Default for SelectorWeights {
    fn default() -> Self {
        Self {
            high_tps: 0.3,
            channel_patterns: 0.25,
            competitive_data: 0.2,
            semantic_clusters: 0.25,
            previous_failure: 0.1,
            max_failure_penalty: 0.3,
            failure_rate: 0.3,
            recent_fallback: 0.2,
        }
    }
}

/// Limits past which an agentic session falls back to classic.
///
/// Time and token limits are taken from the session's [`BudgetCaps`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FallbackThresholds {
    /// Share of `max_tokens` past which the session falls back.
    pub token_fallback_ratio: f64,
    pub max_errors: usize,
}

impl Default for FallbackThresholds {
    fn default() -> Self {
        Self {
            token_fallback_ratio: 0.8,
            max_errors: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectorConfig {
    pub weights: SelectorWeights,
    /// Scores below this select classic.
    pub classic_below: f64,
    /// Scores below this (and at least `classic_below`) select agentic with a
    /// fallback recommendation.
    pub confident_above: f64,
    pub fallback: FallbackThresholds,
    pub history_limit: usize,
    pub performance_window: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            weights: SelectorWeights::default(),
            classic_below: 0.4,
            confident_above: 0.6,
            fallback: FallbackThresholds::default(),
            history_limit: 50,
            performance_window: 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Performance tracking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct Outcome {
    success: bool,
    duration_ms: u64,
    cost: f64,
    pattern_quality: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeStats {
    pub runs: usize,
    pub successes: usize,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub avg_cost: f64,
    pub avg_pattern_quality: f64,
}

impl ModeStats {
    fn from_window(window: &VecDeque<Outcome>) -> Self {
        let runs = window.len();
        if runs == 0 {
            return Self::default();
        }
        let n = runs as f64;
        let successes = window.iter().filter(|o| o.success).count();
        Self {
            runs,
            successes,
            success_rate: successes as f64 / n,
            avg_duration_ms: window.iter().map(|o| o.duration_ms as f64).sum::<f64>() / n,
            avg_cost: window.iter().map(|o| o.cost).sum::<f64>() / n,
            avg_pattern_quality: window.iter().map(|o| o.pattern_quality).sum::<f64>() / n,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    pub agentic: ModeStats,
    pub classic: ModeStats,
    pub recent_selections: usize,
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ModeSelector {
    config: SelectorConfig,
    selections: VecDeque<SelectionRecord>,
    agentic: VecDeque<Outcome>,
    classic: VecDeque<Outcome>,
}

impl ModeSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    pub fn select_mode(&self, factors: &SelectionFactors) -> ModeDecision {
        if !factors.quota_available {
            return ModeDecision {
                mode: AnalysisMode::Classic,
                confidence: 1.0,
                fallback_recommended: false,
                reason: "LLM quota unavailable".to_string(),
            };
        }

        let w = &self.config.weights;
        let mut signals = Vec::new();
        let mut score = 0.0;
        for (present, weight, label) in [
            (factors.video_has_high_tps, w.high_tps, "high TPS"),
            (factors.channel_has_patterns, w.channel_patterns, "channel patterns"),
            (factors.has_competitive_data, w.competitive_data, "competitive data"),
            (factors.has_semantic_clusters, w.semantic_clusters, "semantic clusters"),
        ] {
            if present {
                score += weight;
                signals.push(label);
            }
        }

        let failure_penalty =
            (factors.previous_failures as f64 * w.previous_failure).min(w.max_failure_penalty);
        let history_penalty = self.agentic_failure_rate() * w.failure_rate;
        let fallback_penalty = self.recent_fallback_rate() * w.recent_fallback;
        let score = (score - failure_penalty - history_penalty - fallback_penalty).clamp(0.0, 1.0);

        let signal_text = if signals.is_empty() {
            "no favorable signals".to_string()
        } else {
            signals.join(", ")
        };
        let penalty_total = failure_penalty + history_penalty + fallback_penalty;
        let detail = if penalty_total > 0.0 {
            format!("{} (score {:.2}, penalties {:.2})", signal_text, score, penalty_total)
        } else {
            format!("{} (score {:.2})", signal_text, score)
        };

        let decision = if score < self.config.classic_below {
            ModeDecision {
                mode: AnalysisMode::Classic,
                confidence: 1.0 - score,
                fallback_recommended: false,
                reason: format!("Weak agentic fit: {}", detail),
            }
        } else if score < self.config.confident_above {
            ModeDecision {
                mode: AnalysisMode::Agentic,
                confidence: score,
                fallback_recommended: true,
                reason: format!("Marginal agentic fit: {}", detail),
            }
        } else {
            ModeDecision {
                mode: AnalysisMode::Agentic,
                confidence: score,
                fallback_recommended: false,
                reason: format!("Strong agentic fit: {}", detail),
            }
        };

        debug!(
            mode = %decision.mode,
            confidence = decision.confidence,
            fallback_recommended = decision.fallback_recommended,
            "Selected analysis mode"
        );
        decision
    }

    /// Whether a running session should abandon its mode for classic.
    ///
    /// Classic sessions never fall back. `caps` are the running session's caps.
    pub fn should_fallback(
        &self,
        mode: AnalysisMode,
        caps: &BudgetCaps,
        elapsed_ms: u64,
        tokens_used: u64,
        nonrecoverable_errors: usize,
    ) -> bool {
        self.fallback_reason(mode, caps, elapsed_ms, tokens_used, nonrecoverable_errors)
            .is_some()
    }

    /// The first fallback condition that holds, described for the event log.
    pub fn fallback_reason(
        &self,
        mode: AnalysisMode,
        caps: &BudgetCaps,
        elapsed_ms: u64,
        tokens_used: u64,
        nonrecoverable_errors: usize,
    ) -> Option<String> {
        if mode == AnalysisMode::Classic {
            return None;
        }
        let t = &self.config.fallback;
        if nonrecoverable_errors >= t.max_errors {
            return Some(format!(
                "{} non-recoverable errors (limit {})",
                nonrecoverable_errors, t.max_errors
            ));
        }
        if elapsed_ms > caps.max_duration_ms {
            return Some(format!(
                "elapsed {}ms exceeds {}ms",
                elapsed_ms, caps.max_duration_ms
            ));
        }
        let token_limit = t.token_fallback_ratio * caps.max_tokens as f64;
        if tokens_used as f64 > token_limit {
            return Some(format!(
                "{} tokens used, above {:.0}",
                tokens_used, token_limit
            ));
        }
        None
    }

    pub fn record_selection(
        &mut self,
        factors: SelectionFactors,
        mode: AnalysisMode,
        result: SelectionResult,
    ) {
        if result == SelectionResult::Fallback {
            info!(mode = %mode, "Recorded fallback selection");
        }
        self.selections.push_back(SelectionRecord {
            timestamp: Utc::now(),
            factors,
            mode,
            result,
        });
        while self.selections.len() > self.config.history_limit {
            self.selections.pop_front();
        }
    }

    pub fn update_performance(
        &mut self,
        mode: AnalysisMode,
        success: bool,
        duration_ms: u64,
        cost: f64,
        pattern_quality: f64,
    ) {
        let window = self.config.performance_window;
        let outcomes = match mode {
            AnalysisMode::Agentic => &mut self.agentic,
            AnalysisMode::Classic => &mut self.classic,
        };
        outcomes.push_back(Outcome {
            success,
            duration_ms,
            cost,
            pattern_quality,
        });
        while outcomes.len() > window {
            outcomes.pop_front();
        }
    }

    pub fn performance_stats(&self) -> PerformanceStats {
        PerformanceStats {
            agentic: ModeStats::from_window(&self.agentic),
            classic: ModeStats::from_window(&self.classic),
            recent_selections: self.selections.len(),
        }
    }

    pub fn recent_selections(&self) -> impl Iterator<Item = &SelectionRecord> {
        self.selections.iter()
    }

    fn agentic_failure_rate(&self) -> f64 {
        if self.agentic.len() < MIN_RUNS_FOR_HISTORY {
            return 0.0;
        }
        let failures = self.agentic.iter().filter(|o| !o.success).count();
        failures as f64 / self.agentic.len() as f64
    }

    fn recent_fallback_rate(&self) -> f64 {
        let recent: Vec<&SelectionRecord> = self
            .selections
            .iter()
            .rev()
            .filter(|r| r.mode == AnalysisMode::Agentic)
            .take(RECENT_FALLBACK_WINDOW)
            .collect();
        if recent.is_empty() {
            return 0.0;
        }
        let fallbacks = recent
            .iter()
            .filter(|r| r.result == SelectionResult::Fallback)
            .count();
        fallbacks as f64 / recent.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn favorable() -> SelectionFactors {
        SelectionFactors {
            video_has_high_tps: true,
            channel_has_patterns: true,
            has_competitive_data: true,
            has_semantic_clusters: true,
            previous_failures: 0,
            quota_available: true,
        }
    }

    #[test]
    fn test_no_quota_means_classic() {
        let selector = ModeSelector::default();
        let decision = selector.select_mode(&SelectionFactors {
            quota_available: false,
            ..favorable()
        });
        assert_eq!(decision.mode, AnalysisMode::Classic);
        assert!(!decision.fallback_recommended);
        assert!(decision.reason.contains("quota"));
    }

    #[test]
    fn test_strong_signals_select_agentic() {
        let selector = ModeSelector::default();
        let decision = selector.select_mode(&favorable());
        assert_eq!(decision.mode, AnalysisMode::Agentic);
        assert!(!decision.fallback_recommended);
        assert!((0.0..=1.0).contains(&decision.confidence));
        assert!(decision.confidence >= 0.6);
    }

    #[test]
    fn test_no_signals_select_classic() {
        let selector = ModeSelector::default();
        let decision = selector.select_mode(&SelectionFactors {
            quota_available: true,
            ..Default::default()
        });
        assert_eq!(decision.mode, AnalysisMode::Classic);
        assert!(decision.reason.contains("no favorable signals"));
    }

    #[test]
    fn test_marginal_fit_recommends_fallback() {
        let selector = ModeSelector::default();
        // 0.3 + 0.25 = 0.55
        let decision = selector.select_mode(&SelectionFactors {
            video_has_high_tps: true,
            channel_has_patterns: true,
            quota_available: true,
            ..Default::default()
        });
        assert_eq!(decision.mode, AnalysisMode::Agentic);
        assert!(decision.fallback_recommended);
    }

    #[test]
    fn test_previous_failures_lower_confidence() {
        let selector = ModeSelector::default();
        let clean = selector.select_mode(&favorable());
        let failed = selector.select_mode(&SelectionFactors {
            previous_failures: 2,
            ..favorable()
        });
        assert!(failed.confidence < clean.confidence);

        // Capped penalty: many failures cost no more than max_failure_penalty.
        let many = selector.select_mode(&SelectionFactors {
            previous_failures: 50,
            ..favorable()
        });
        assert!((many.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_agentic_failure_history_penalizes() {
        let mut selector = ModeSelector::default();
        let before = selector.select_mode(&favorable()).confidence;

        // Below the minimum run count history is ignored.
        selector.update_performance(AnalysisMode::Agentic, false, 1_000, 0.1, 0.0);
        selector.update_performance(AnalysisMode::Agentic, false, 1_000, 0.1, 0.0);
        assert_eq!(selector.select_mode(&favorable()).confidence, before);

        selector.update_performance(AnalysisMode::Agentic, false, 1_000, 0.1, 0.0);
        let after = selector.select_mode(&favorable()).confidence;
        assert!(after < before);
    }

    #[test]
    fn test_recent_fallbacks_penalize() {
        let mut selector = ModeSelector::default();
        let before = selector.select_mode(&favorable()).confidence;
        for _ in 0..4 {
            selector.record_selection(favorable(), AnalysisMode::Agentic, SelectionResult::Fallback);
        }
        let after = selector.select_mode(&favorable());
        assert!(after.confidence < before);
        assert!(after.reason.contains("penalties"));
    }

    #[test]
    fn test_classic_never_falls_back() {
        let selector = ModeSelector::default();
        let caps = BudgetCaps::default();
        assert!(!selector.should_fallback(AnalysisMode::Classic, &caps, u64::MAX, u64::MAX, usize::MAX));
        assert!(!selector.should_fallback(AnalysisMode::Classic, &caps, 0, 0, 0));
    }

    #[test]
    fn test_error_threshold() {
        let selector = ModeSelector::default();
        let caps = BudgetCaps::default();
        assert!(!selector.should_fallback(AnalysisMode::Agentic, &caps, 10_000, 50_000, 1));
        assert!(!selector.should_fallback(AnalysisMode::Agentic, &caps, 10_000, 50_000, 2));
        assert!(selector.should_fallback(AnalysisMode::Agentic, &caps, 10_000, 50_000, 3));
    }

    #[test]
    fn test_time_and_token_thresholds() {
        let selector = ModeSelector::default();
        let caps = BudgetCaps::default();
        assert!(!selector.should_fallback(AnalysisMode::Agentic, &caps, 60_000, 0, 0));
        assert!(selector.should_fallback(AnalysisMode::Agentic, &caps, 60_001, 0, 0));
        assert!(!selector.should_fallback(AnalysisMode::Agentic, &caps, 0, 80_000, 0));
        assert!(selector.should_fallback(AnalysisMode::Agentic, &caps, 0, 80_001, 0));
    }

    #[test]
    fn test_thresholds_follow_session_caps() {
        let selector = ModeSelector::default();
        let small = BudgetCaps {
            max_tokens: 10_000,
            max_duration_ms: 5_000,
            ..Default::default()
        };
        assert!(selector.should_fallback(AnalysisMode::Agentic, &small, 0, 9_000, 0));
        assert!(!selector.should_fallback(AnalysisMode::Agentic, &small, 0, 8_000, 0));
        assert!(selector.should_fallback(AnalysisMode::Agentic, &small, 5_001, 0, 0));

        let large = BudgetCaps {
            max_tokens: 1_000_000,
            max_duration_ms: 600_000,
            ..Default::default()
        };
        assert!(!selector.should_fallback(AnalysisMode::Agentic, &large, 61_000, 90_000, 0));
    }

    #[test]
    fn test_fallback_reason_names_the_trigger() {
        let selector = ModeSelector::default();
        let caps = BudgetCaps::default();
        let reason = selector
            .fallback_reason(AnalysisMode::Agentic, &caps, 10_000, 50_000, 3)
            .unwrap();
        assert!(reason.contains("non-recoverable"));
        assert!(selector
            .fallback_reason(AnalysisMode::Agentic, &caps, 70_000, 0, 0)
            .unwrap()
            .contains("elapsed"));
        assert!(selector.fallback_reason(AnalysisMode::Classic, &caps, 70_000, 0, 9).is_none());
    }

    #[test]
    fn test_selection_log_is_bounded() {
        let mut selector = ModeSelector::default();
        for _ in 0..60 {
            selector.record_selection(favorable(), AnalysisMode::Classic, SelectionResult::Selected);
        }
        assert_eq!(selector.performance_stats().recent_selections, 50);
        assert_eq!(selector.recent_selections().count(), 50);
    }

    #[test]
    fn test_performance_window_and_stats() {
        let mut selector = ModeSelector::default();
        for i in 0..25u64 {
            selector.update_performance(AnalysisMode::Classic, i % 5 != 0, 1_000, 0.02, 0.5);
        }
        selector.update_performance(AnalysisMode::Agentic, true, 3_000, 0.3, 0.9);

        let stats = selector.performance_stats();
        assert_eq!(stats.classic.runs, 20);
        assert_eq!(stats.classic.successes, 16);
        assert!((stats.classic.success_rate - 0.8).abs() < 1e-9);
        assert!((stats.classic.avg_duration_ms - 1_000.0).abs() < 1e-9);
        assert_eq!(stats.agentic.runs, 1);
        assert!((stats.agentic.avg_pattern_quality - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_config_deserializes_partial() {
        let config: SelectorConfig = serde_json::from_value(serde_json::json!({
            "classicBelow": 0.3,
            "fallback": {"maxErrors": 5}
        }))
        .unwrap();
        assert_eq!(config.classic_below, 0.3);
        assert_eq!(config.fallback.max_errors, 5);
        assert_eq!(config.fallback.token_fallback_ratio, 0.8);
        assert_eq!(config.history_limit, 50);
    }
}
