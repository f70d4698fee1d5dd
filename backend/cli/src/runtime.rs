//! Wiring from a prepared `TubeLensConfig` to a runnable orchestrator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use tubelens_agent::SessionManager;
use tubelens_config::{ToolsConfig, TubeLensConfig};
use tubelens_executor::{Orchestrator, OrchestratorConfig, RemotePlanner, RetryPolicy, TurnPlanner};
use tubelens_planner::ModeSelector;
use tubelens_routing::ModelRouter;
use tubelens_supervisor::ModelPricing;
use tubelens_tools::{AnalyticTool, RemoteTool, ToolRegistry};

/// Register a remote engine for every tool with a configured endpoint.
pub fn build_registry(tools: &ToolsConfig) -> Result<ToolRegistry> {
    let timeout = Duration::from_millis(tools.timeout_ms.unwrap_or(30_000));
    for name in tools.endpoints.keys() {
        if AnalyticTool::from_name(name).is_none() {
            warn!(tool = %name, "Endpoint configured for unknown tool; ignoring");
        }
    }

    let mut registry = ToolRegistry::new();
    for tool in AnalyticTool::ALL {
        let Some(endpoint) = tools.endpoint_for(tool.name()) else {
            continue;
        };
        let remote = RemoteTool::new(tool.name(), &endpoint, timeout)
            .with_context(|| format!("Failed to configure engine for {}", tool))?;
        registry.register(tool.definition(Arc::new(remote)));
    }
    info!(tools = registry.len(), "Tool registry ready");
    Ok(registry)
}

pub fn retry_policy(config: &TubeLensConfig) -> RetryPolicy {
    let d = RetryPolicy::default();
    let Some(retry) = &config.retry else { return d };
    RetryPolicy {
        max_attempts: retry.max_attempts.unwrap_or(d.max_attempts),
        base_delay_ms: retry.base_delay_ms.unwrap_or(d.base_delay_ms),
        backoff_factor: retry.backoff_factor.unwrap_or(d.backoff_factor),
        max_delay_ms: retry.max_delay_ms.unwrap_or(d.max_delay_ms),
        jitter: retry.jitter.unwrap_or(d.jitter),
    }
}

pub fn model_pricing(config: &TubeLensConfig) -> ModelPricing {
    config
        .pricing
        .iter()
        .fold(ModelPricing::default(), |pricing, (model, price)| {
            pricing.with_price(model.clone(), *price)
        })
}

pub fn build_orchestrator(config: &TubeLensConfig) -> Result<Orchestrator> {
    let registry = build_registry(&config.tools_config())?;

    let compaction = config.compaction.clone().unwrap_or_default();
    let sessions = SessionManager::with_compaction(
        compaction.keep_tool_calls.unwrap_or(tubelens_agent::KEEP_TOOL_CALLS),
        compaction.keep_patterns.unwrap_or(tubelens_agent::KEEP_PATTERNS),
    );

    let orchestrator_config = OrchestratorConfig {
        budget_caps: config.budget_caps(),
        retry: retry_policy(config),
        max_turns: config
            .agent_config()
            .max_turns
            .unwrap_or(OrchestratorConfig::default().max_turns),
        retain_sessions: false,
    };

    Ok(Orchestrator::new(Arc::new(registry), orchestrator_config)
        .with_sessions(sessions)
        .with_selector(ModeSelector::new(config.selector_config()))
        .with_router(ModelRouter::new(config.router_config()))
        .with_pricing(model_pricing(config)))
}

/// The remote agentic planner, when one is configured.
pub fn agentic_planner(config: &TubeLensConfig) -> Result<Option<Arc<dyn TurnPlanner>>> {
    let agent = config.agent_config();
    let Some(endpoint) = agent.planner_endpoint.as_deref() else {
        return Ok(None);
    };
    let timeout = Duration::from_millis(agent.timeout_ms.unwrap_or(60_000));
    let mut planner = RemotePlanner::new(endpoint, timeout)?;
    if let Some(key) = agent.api_key.filter(|k| !k.is_empty()) {
        planner = planner.with_api_key(key);
    }
    Ok(Some(Arc::new(planner)))
}
