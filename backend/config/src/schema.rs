//! TubeLens runtime configuration schema.
//!
//! Every section is optional in YAML; `apply_all_defaults` fills the gaps so
//! the typed accessors below never have to guess.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tubelens_core::BudgetCaps;
use tubelens_planner::SelectorConfig;
use tubelens_routing::RouterConfig;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TubeLensConfig {
    /// Per-session resource caps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetConfig>,

    /// Mode selection weights and fallback thresholds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<SelectorConfig>,

    /// Tier → model map and budget pressure threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router: Option<RouterConfig>,

    /// What survives a model switch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction: Option<CompactionConfig>,

    /// Retry of recoverable tool failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    /// Analytic engine endpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsConfig>,

    /// Agentic planner service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,

    /// Model prices in USD per 1k tokens, merged over the built-in table
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pricing: BTreeMap<String, f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fanouts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_validations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_candidates: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<u32>,
}

impl BudgetConfig {
    /// Resolve into caps, taking unset fields from `BudgetCaps::default()`.
    pub fn to_caps(&self) -> BudgetCaps {
        let d = BudgetCaps::default();
        BudgetCaps {
            max_fanouts: self.max_fanouts.unwrap_or(d.max_fanouts),
            max_validations: self.max_validations.unwrap_or(d.max_validations),
            max_candidates: self.max_candidates.unwrap_or(d.max_candidates),
            max_tokens: self.max_tokens.unwrap_or(d.max_tokens),
            max_duration_ms: self.max_duration_ms.unwrap_or(d.max_duration_ms),
            max_tool_calls: self.max_tool_calls.unwrap_or(d.max_tool_calls),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionConfig {
    /// Most recent tool calls kept across a switch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_tool_calls: Option<usize>,
    /// Top-scoring patterns kept across a switch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_patterns: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsConfig {
    /// Engines without an explicit endpoint are served at `{baseUrl}/{tool}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Per-tool endpoint overrides, keyed by tool name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub endpoints: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ToolsConfig {
    /// Endpoint for `tool`, if one is configured.
    pub fn endpoint_for(&self, tool: &str) -> Option<String> {
        if let Some(endpoint) = self.endpoints.get(tool) {
            return Some(endpoint.clone());
        }
        self.base_url
            .as_deref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), tool))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Agentic mode is only available when this is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planner_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// Directory for the daily JSON log; console only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

// ---------------------------------------------------------------------------
// Typed accessors
// ---------------------------------------------------------------------------

impl TubeLensConfig {
    pub fn budget_caps(&self) -> BudgetCaps {
        self.budget.clone().unwrap_or_default().to_caps()
    }

    pub fn selector_config(&self) -> SelectorConfig {
        self.selector.clone().unwrap_or_default()
    }

    pub fn router_config(&self) -> RouterConfig {
        self.router.clone().unwrap_or_default()
    }

    pub fn tools_config(&self) -> ToolsConfig {
        self.tools.clone().unwrap_or_default()
    }

    pub fn agent_config(&self) -> AgentConfig {
        self.agent.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_parses() {
        let yaml = r#"
budget:
  maxToolCalls: 20
router:
  budgetThreshold: 0.7
tools:
  baseUrl: http://engines.local:8080/
  endpoints:
    transcript: http://transcripts.local/fetch
"#;
        let config: TubeLensConfig = serde_yaml::from_str(yaml).unwrap();
        let caps = config.budget_caps();
        assert_eq!(caps.max_tool_calls, 20);
        assert_eq!(caps.max_tokens, BudgetCaps::default().max_tokens);
        assert_eq!(config.router_config().budget_threshold, 0.7);
        assert_eq!(config.router_config().models.small, "gpt-5-nano");

        let tools = config.tools_config();
        assert_eq!(
            tools.endpoint_for("transcript").as_deref(),
            Some("http://transcripts.local/fetch")
        );
        assert_eq!(
            tools.endpoint_for("topic_clusters").as_deref(),
            Some("http://engines.local:8080/topic_clusters")
        );
    }

    #[test]
    fn test_no_base_url_means_no_endpoint() {
        assert!(ToolsConfig::default().endpoint_for("transcript").is_none());
    }
}
