use std::time::Instant;

use tracing::{debug, warn};

use tubelens_core::{BudgetCaps, BudgetUsage, CostBreakdown};

use crate::pricing::ModelPricing;

/// Session-scoped budget accounting.
///
/// Usage only ever grows. Once any cap is reached `can_execute` refuses every
/// further admission; callers finalize with whatever partial results they
/// have rather than treating it as an error.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    caps: BudgetCaps,
    tokens: u64,
    tool_calls: u32,
    validations: u32,
    costs: CostBreakdown,
    started_at: Instant,
    pricing: ModelPricing,
    exhaustion_logged: bool,
}

impl BudgetTracker {
    pub fn new(caps: BudgetCaps) -> Self {
        Self::with_start(caps, Instant::now())
    }

    /// Start the session clock at `started_at` instead of now.
    pub fn with_start(caps: BudgetCaps, started_at: Instant) -> Self {
        Self {
            caps,
            tokens: 0,
            tool_calls: 0,
            validations: 0,
            costs: CostBreakdown::default(),
            started_at,
            pricing: ModelPricing::default(),
            exhaustion_logged: false,
        }
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = pricing;
        self
    }

    /// Begin accounting for a new session under `caps`.
    pub fn initialize(&mut self, caps: BudgetCaps) {
        let pricing = std::mem::take(&mut self.pricing);
        *self = Self::new(caps).with_pricing(pricing);
    }

    pub fn caps(&self) -> &BudgetCaps {
        &self.caps
    }

    /// Would admitting one more call of `estimated_tokens` stay within caps?
    pub fn can_execute(&self, tool_name: &str, estimated_tokens: u64) -> bool {
        if self.is_exceeded() {
            debug!(tool = %tool_name, "Admission refused: budget exhausted");
            return false;
        }
        let tokens_ok = self.tokens.saturating_add(estimated_tokens) <= self.caps.max_tokens;
        let calls_ok = self.tool_calls.saturating_add(1) <= self.caps.max_tool_calls;
        if !(tokens_ok && calls_ok) {
            debug!(
                tool = %tool_name,
                estimated_tokens,
                tokens = self.tokens,
                tool_calls = self.tool_calls,
                "Admission refused: projected usage over cap"
            );
        }
        tokens_ok && calls_ok
    }

    /// Account for one admitted tool call.
    pub fn record_tool_call(&mut self, tool_name: &str, tokens: u64, cost: f64) {
        self.tool_calls = self.tool_calls.saturating_add(1);
        self.tokens = self.tokens.saturating_add(tokens);
        self.add_cost(tool_name, cost);
        debug!(
            tool = %tool_name,
            tokens,
            cost,
            total_tokens = self.tokens,
            tool_calls = self.tool_calls,
            "Recorded tool call"
        );
        self.log_exhaustion();
    }

    /// Account for tokens spent by an LLM turn on `model`. Returns its cost.
    pub fn record_model_usage(&mut self, model: &str, tokens: u64) -> f64 {
        let cost = self.pricing.calculate_cost(model, tokens);
        self.tokens = self.tokens.saturating_add(tokens);
        self.add_cost(model, cost);
        debug!(model = %model, tokens, cost, total_tokens = self.tokens, "Recorded model usage");
        self.log_exhaustion();
        cost
    }

    pub fn usage(&self) -> BudgetUsage {
        BudgetUsage {
            tokens: self.tokens,
            tool_calls: self.tool_calls,
            costs: self.costs.clone(),
            elapsed_ms: self.elapsed_ms(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// True once any cap has been reached.
    pub fn is_exceeded(&self) -> bool {
        self.exceeded_reason().is_some()
    }

    /// Which cap was reached first, in check order: tokens, tool calls, time.
    pub fn exceeded_reason(&self) -> Option<String> {
        if self.tokens >= self.caps.max_tokens {
            return Some(format!(
                "token budget reached ({}/{})",
                self.tokens, self.caps.max_tokens
            ));
        }
        if self.tool_calls >= self.caps.max_tool_calls {
            return Some(format!(
                "tool call budget reached ({}/{})",
                self.tool_calls, self.caps.max_tool_calls
            ));
        }
        let elapsed = self.elapsed_ms();
        if elapsed >= self.caps.max_duration_ms {
            return Some(format!(
                "time budget reached ({}ms/{}ms)",
                elapsed, self.caps.max_duration_ms
            ));
        }
        None
    }

    /// Clamp a requested fan-out batch to `max_fanouts`.
    pub fn fanout_width(&self, requested: usize) -> usize {
        requested.min(self.caps.max_fanouts as usize)
    }

    pub fn can_validate(&self) -> bool {
        self.validations < self.caps.max_validations
    }

    pub fn record_validation(&mut self) {
        self.validations = self.validations.saturating_add(1);
    }

    pub fn validations(&self) -> u32 {
        self.validations
    }

    pub fn candidate_limit(&self) -> u32 {
        self.caps.max_candidates
    }

    fn add_cost(&mut self, key: &str, cost: f64) {
        // Negative costs would break monotonicity.
        let cost = if cost.is_finite() { cost.max(0.0) } else { 0.0 };
        self.costs.total += cost;
        *self.costs.by_tool.entry(key.to_string()).or_insert(0.0) += cost;
    }

    fn log_exhaustion(&mut self) {
        if self.exhaustion_logged {
            return;
        }
        if let Some(reason) = self.exceeded_reason() {
            self.exhaustion_logged = true;
            warn!(reason = %reason, "Budget exhausted; no further admissions");
        }
    }
}
