//! Config defaults: fills unset sections after load.

use tubelens_core::BudgetCaps;

use crate::schema::{
    AgentConfig, BudgetConfig, CompactionConfig, LoggingConfig, RetryConfig, TubeLensConfig,
};

pub const DEFAULT_KEEP_TOOL_CALLS: usize = 10;
pub const DEFAULT_KEEP_PATTERNS: usize = 3;

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 200;
pub const DEFAULT_RETRY_BACKOFF: f64 = 2.0;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 2_000;

/// Per-call timeout for analytic engines.
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_PLANNER_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_MAX_TURNS: u32 = 24;

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Apply all defaults to a freshly loaded config.
pub fn apply_all_defaults(config: TubeLensConfig) -> TubeLensConfig {
    let config = apply_budget_defaults(config);
    let config = apply_compaction_defaults(config);
    let config = apply_retry_defaults(config);
    let config = apply_agent_defaults(config);
    let config = apply_tool_defaults(config);
    apply_logging_defaults(config)
}

fn apply_budget_defaults(mut config: TubeLensConfig) -> TubeLensConfig {
    let d = BudgetCaps::default();
    let budget = config.budget.get_or_insert_with(BudgetConfig::default);
    budget.max_fanouts.get_or_insert(d.max_fanouts);
    budget.max_validations.get_or_insert(d.max_validations);
    budget.max_candidates.get_or_insert(d.max_candidates);
    budget.max_tokens.get_or_insert(d.max_tokens);
    budget.max_duration_ms.get_or_insert(d.max_duration_ms);
    budget.max_tool_calls.get_or_insert(d.max_tool_calls);
    config
}

fn apply_compaction_defaults(mut config: TubeLensConfig) -> TubeLensConfig {
    let compaction = config.compaction.get_or_insert_with(CompactionConfig::default);
    compaction.keep_tool_calls.get_or_insert(DEFAULT_KEEP_TOOL_CALLS);
    compaction.keep_patterns.get_or_insert(DEFAULT_KEEP_PATTERNS);
    config
}

fn apply_retry_defaults(mut config: TubeLensConfig) -> TubeLensConfig {
    let retry = config.retry.get_or_insert_with(RetryConfig::default);
    retry.max_attempts.get_or_insert(DEFAULT_RETRY_ATTEMPTS);
    retry.base_delay_ms.get_or_insert(DEFAULT_RETRY_BASE_DELAY_MS);
    retry.backoff_factor.get_or_insert(DEFAULT_RETRY_BACKOFF);
    retry.max_delay_ms.get_or_insert(DEFAULT_RETRY_MAX_DELAY_MS);
    retry.jitter.get_or_insert(true);
    config
}

fn apply_agent_defaults(mut config: TubeLensConfig) -> TubeLensConfig {
    let agent = config.agent.get_or_insert_with(AgentConfig::default);
    agent.timeout_ms.get_or_insert(DEFAULT_PLANNER_TIMEOUT_MS);
    agent.max_turns.get_or_insert(DEFAULT_MAX_TURNS);
    config
}

/// Only touches an existing tools section; no section means no engines.
fn apply_tool_defaults(mut config: TubeLensConfig) -> TubeLensConfig {
    if let Some(tools) = &mut config.tools {
        tools.timeout_ms.get_or_insert(DEFAULT_TOOL_TIMEOUT_MS);
    }
    config
}

fn apply_logging_defaults(mut config: TubeLensConfig) -> TubeLensConfig {
    let logging = config.logging.get_or_insert_with(LoggingConfig::default);
    if logging.level.is_none() {
        logging.level = Some(DEFAULT_LOG_LEVEL.to_string());
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ToolsConfig;

    #[test]
    fn fills_every_budget_cap() {
        let cfg = apply_all_defaults(TubeLensConfig::default());
        let budget = cfg.budget.unwrap();
        assert_eq!(budget.max_tool_calls, Some(50));
        assert_eq!(budget.max_duration_ms, Some(60_000));
    }

    #[test]
    fn does_not_override_user_values() {
        let mut cfg = TubeLensConfig::default();
        cfg.compaction = Some(CompactionConfig {
            keep_tool_calls: Some(4),
            ..Default::default()
        });
        let cfg = apply_all_defaults(cfg);
        let compaction = cfg.compaction.unwrap();
        assert_eq!(compaction.keep_tool_calls, Some(4));
        assert_eq!(compaction.keep_patterns, Some(DEFAULT_KEEP_PATTERNS));
    }

    #[test]
    fn tool_timeout_only_with_tools_section() {
        let cfg = apply_all_defaults(TubeLensConfig::default());
        assert!(cfg.tools.is_none());

        let mut cfg = TubeLensConfig::default();
        cfg.tools = Some(ToolsConfig::default());
        let cfg = apply_all_defaults(cfg);
        assert_eq!(cfg.tools.unwrap().timeout_ms, Some(DEFAULT_TOOL_TIMEOUT_MS));
    }

    #[test]
    fn logging_level_defaults_to_info() {
        let cfg = apply_all_defaults(TubeLensConfig::default());
        assert_eq!(cfg.logging.unwrap().level.as_deref(), Some("info"));
    }
}
