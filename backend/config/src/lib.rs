//! `tubelens-config`: runtime configuration for the TubeLens orchestrator.
//!
//! Provides:
//! - Typed config schema (budget, selector, router, compaction, retry,
//!   engines, planner, pricing, logging)
//! - YAML read/write with backup rotation
//! - `${ENV_VAR}` substitution
//! - Default value application
//! - Validation with paths and warnings
//! - Redaction for display

pub mod defaults;
pub mod env;
pub mod io;
pub mod redact;
pub mod schema;
pub mod validation;

pub use defaults::apply_all_defaults;
pub use env::{collect_referenced_vars, resolve_env_vars, resolve_env_vars_with, MissingEnvVarError};
pub use io::{config_dir, config_file_path, load_config, write_config};
pub use redact::redact;
pub use schema::{
    AgentConfig, BudgetConfig, CompactionConfig, LoggingConfig, RetryConfig, ToolsConfig,
    TubeLensConfig,
};
pub use validation::{validate, ConfigValidationError, ValidationReport};

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tubelens_core::LensError;

/// Load, substitute env vars, apply defaults, and validate a config file.
///
/// Warnings are logged; any validation error fails the load with
/// [`LensError::ConfigError`].
pub async fn load_and_prepare(path: &Path) -> Result<TubeLensConfig> {
    let raw_config = load_config(path).await?;
    prepare(raw_config, resolve_env_vars)
}

/// The post-load pipeline, with the env source injectable.
pub fn prepare<F>(raw_config: TubeLensConfig, resolve: F) -> Result<TubeLensConfig>
where
    F: FnOnce(&Value) -> Result<Value>,
{
    let value: Value =
        serde_json::to_value(&raw_config).context("Failed to serialize config for processing")?;
    let value = resolve(&value).context("Failed to resolve env vars in config")?;
    let config: TubeLensConfig =
        serde_json::from_value(value).context("Failed to deserialize config after processing")?;

    let config = apply_all_defaults(config);

    let report = validate(&config);
    for warning in &report.warnings {
        tracing::warn!(path = %warning.path, message = %warning.message, "Config warning");
    }
    for error in &report.errors {
        tracing::error!(path = %error.path, message = %error.message, "Config error");
    }
    if !report.is_valid() {
        let summary = report
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.path, e.message))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(LensError::ConfigError(summary).into());
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[tokio::test]
    async fn prepares_file_with_env_refs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        tokio::fs::write(
            &path,
            "agent:\n  plannerEndpoint: https://planner.local/v1\n  apiKey: ${TL_TEST_KEY}\n",
        )
        .await
        .unwrap();

        let raw = load_config(&path).await.unwrap();
        let env: HashMap<String, String> =
            [("TL_TEST_KEY".to_string(), "sk-test".to_string())].into();
        let config = prepare(raw, |v| resolve_env_vars_with(v, &env)).unwrap();

        let agent = config.agent_config();
        assert_eq!(agent.api_key.as_deref(), Some("sk-test"));
        assert_eq!(agent.max_turns, Some(defaults::DEFAULT_MAX_TURNS));
        assert_eq!(config.budget_caps(), tubelens_core::BudgetCaps::default());
    }

    #[test]
    fn invalid_config_fails_with_config_error() {
        let raw = TubeLensConfig {
            budget: Some(BudgetConfig {
                max_tool_calls: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = prepare(raw, |v| Ok(v.clone())).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LensError>(),
            Some(LensError::ConfigError(msg)) if msg.contains("budget.maxToolCalls")
        ));
    }

    #[tokio::test]
    async fn missing_file_prepares_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_and_prepare(&dir.path().join("none.yaml")).await.unwrap();
        assert_eq!(config.logging.unwrap().level.as_deref(), Some("info"));
    }
}
