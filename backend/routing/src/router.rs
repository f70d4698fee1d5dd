/// Model router: pick the model tier for each orchestration turn.
///
/// Reasoning-heavy turns go to the large tier, validation to the medium tier,
/// and bulk lookups to the small tier. Once any budget dimension crosses the
/// configured threshold every turn is pushed down to the small tier.
use serde::{Deserialize, Serialize};
use tracing::debug;

use tubelens_core::{BudgetUsage, SessionState, TurnType};

// ---------------------------------------------------------------------------
// Tiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Small,
    Medium,
    Large,
}

impl ModelTier {
    /// Tier a turn runs on when the budget is healthy.
    pub fn for_turn(turn: TurnType) -> Self {
        match turn {
            TurnType::HypothesisGeneration | TurnType::Finalization => ModelTier::Large,
            TurnType::Validation => ModelTier::Medium,
            TurnType::Enrichment | TurnType::Lookup => ModelTier::Small,
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelTier::Small => write!(f, "small"),
            ModelTier::Medium => write!(f, "medium"),
            ModelTier::Large => write!(f, "large"),
        }
    }
}

/// Tier → model id map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TierModels {
    pub large: String,
    pub medium: String,
    pub small: String,
}

impl Default for TierModels {
    fn default() -> Self {
        Self {
            large: "gpt-5".to_string(),
            medium: "gpt-5-mini".to_string(),
            small: "gpt-5-nano".to_string(),
        }
    }
}

impl TierModels {
    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Large => &self.large,
            ModelTier::Medium => &self.medium,
            ModelTier::Small => &self.small,
        }
    }

    pub fn tier_of(&self, model: &str) -> Option<ModelTier> {
        [ModelTier::Large, ModelTier::Medium, ModelTier::Small]
            .into_iter()
            .find(|tier| self.model_for(*tier) == model)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterConfig {
    pub models: TierModels,
    /// Usage ratio (of any cap) at which turns are forced to the small tier.
    pub budget_threshold: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            models: TierModels::default(),
            budget_threshold: 0.8,
        }
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDecision {
    pub model: String,
    pub tier: ModelTier,
    pub reason: String,
    /// The chosen model differs from the session's current model.
    pub switch_required: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ModelRouter {
    config: RouterConfig,
}

impl ModelRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn route(&self, turn: TurnType, state: &SessionState, usage: &BudgetUsage) -> RouteDecision {
        let (tier, reason) = match self.budget_pressure(state, usage) {
            Some(pressure) => (ModelTier::Small, format!("Budget constraint: {}", pressure)),
            None => {
                let tier = ModelTier::for_turn(turn);
                (tier, format!("{} turn uses the {} tier", turn, tier))
            }
        };

        let model = self.config.models.model_for(tier).to_string();
        let switch_required = model != state.current_model;
        debug!(
            session_id = %state.session_id,
            turn = %turn,
            tier = %tier,
            model = %model,
            switch_required,
            "Routed turn"
        );

        RouteDecision {
            model,
            tier,
            reason,
            switch_required,
        }
    }

    /// Describe the first budget dimension at or past the threshold.
    fn budget_pressure(&self, state: &SessionState, usage: &BudgetUsage) -> Option<String> {
        let caps = &state.budget_caps;
        let dimensions = [
            ("token", usage.token_ratio(caps)),
            ("tool call", usage.tool_call_ratio(caps)),
            ("time", usage.time_ratio(caps)),
        ];
        dimensions
            .into_iter()
            .find(|(_, ratio)| *ratio >= self.config.budget_threshold)
            .map(|(label, ratio)| format!("{:.0}% of {} budget used", ratio * 100.0, label))
    }
}
