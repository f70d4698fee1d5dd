//! Config validation: deep checks with user-friendly error messages.

use thiserror::Error;

use crate::schema::TubeLensConfig;

/// A config validation error with field path and message.
#[derive(Debug, Error)]
#[error("Config validation error at '{path}': {message}")]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

/// A collection of validation errors found in one pass.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Validate the config and return a report of all errors and warnings.
pub fn validate(config: &TubeLensConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_budget(config, &mut report);
    validate_selector(config, &mut report);
    validate_router(config, &mut report);
    validate_compaction(config, &mut report);
    validate_retry(config, &mut report);
    validate_tools(config, &mut report);
    validate_agent(config, &mut report);
    validate_pricing(config, &mut report);
    validate_logging(config, &mut report);
    report
}

fn validate_budget(config: &TubeLensConfig, report: &mut ValidationReport) {
    let Some(budget) = &config.budget else { return };
    let fields = [
        ("maxFanouts", budget.max_fanouts.map(u64::from)),
        ("maxValidations", budget.max_validations.map(u64::from)),
        ("maxCandidates", budget.max_candidates.map(u64::from)),
        ("maxTokens", budget.max_tokens),
        ("maxDurationMs", budget.max_duration_ms),
        ("maxToolCalls", budget.max_tool_calls.map(u64::from)),
    ];
    for (name, value) in fields {
        if value == Some(0) {
            report.error(format!("budget.{name}"), "Budget caps must be positive");
        }
    }
}

fn validate_selector(config: &TubeLensConfig, report: &mut ValidationReport) {
    let Some(selector) = &config.selector else { return };
    let w = &selector.weights;
    let weights = [
        ("highTps", w.high_tps),
        ("channelPatterns", w.channel_patterns),
        ("competitiveData", w.competitive_data),
        ("semanticClusters", w.semantic_clusters),
        ("previousFailure", w.previous_failure),
        ("maxFailurePenalty", w.max_failure_penalty),
        ("failureRate", w.failure_rate),
        ("recentFallback", w.recent_fallback),
    ];
    for (name, value) in weights {
        if !value.is_finite() || value < 0.0 {
            report.error(format!("selector.weights.{name}"), "Weights must be non-negative");
        }
    }
    let positive = w.high_tps + w.channel_patterns + w.competitive_data + w.semantic_clusters;
    if (positive - 1.0).abs() > 1e-6 {
        report.warn(
            "selector.weights",
            format!("Factor weights sum to {positive:.2}; scores will not span [0, 1]"),
        );
    }

    if !(0.0..=1.0).contains(&selector.classic_below)
        || !(0.0..=1.0).contains(&selector.confident_above)
    {
        report.error("selector", "classicBelow and confidentAbove must be within [0, 1]");
    } else if selector.classic_below > selector.confident_above {
        report.error("selector.classicBelow", "classicBelow must not exceed confidentAbove");
    }

    let fallback = &selector.fallback;
    if fallback.max_errors == 0 {
        report.error("selector.fallback.maxErrors", "maxErrors must be >= 1");
    }
    if !(fallback.token_fallback_ratio > 0.0 && fallback.token_fallback_ratio <= 1.0) {
        report.error("selector.fallback.tokenFallbackRatio", "Ratio must be within (0, 1]");
    }
    if selector.history_limit == 0 {
        report.warn("selector.historyLimit", "Selection history is disabled");
    }
}

fn validate_router(config: &TubeLensConfig, report: &mut ValidationReport) {
    let Some(router) = &config.router else { return };
    let threshold = router.budget_threshold;
    if !(threshold > 0.0 && threshold <= 1.0) {
        report.error("router.budgetThreshold", "budgetThreshold must be within (0, 1]");
    }
    let models = [
        ("large", &router.models.large),
        ("medium", &router.models.medium),
        ("small", &router.models.small),
    ];
    for (tier, model) in models {
        if model.trim().is_empty() {
            report.error(format!("router.models.{tier}"), "Model id cannot be empty");
        }
    }
}

fn validate_compaction(config: &TubeLensConfig, report: &mut ValidationReport) {
    let Some(compaction) = &config.compaction else { return };
    if compaction.keep_tool_calls == Some(0) {
        report.warn(
            "compaction.keepToolCalls",
            "Every tool call is dropped on a model switch; results will not be reused",
        );
    }
}

fn validate_retry(config: &TubeLensConfig, report: &mut ValidationReport) {
    let Some(retry) = &config.retry else { return };
    if retry.max_attempts == Some(0) {
        report.error("retry.maxAttempts", "maxAttempts counts the first call and must be >= 1");
    }
    if let Some(factor) = retry.backoff_factor {
        if !factor.is_finite() || factor < 1.0 {
            report.error("retry.backoffFactor", "backoffFactor must be >= 1.0");
        }
    }
    if let (Some(base), Some(max)) = (retry.base_delay_ms, retry.max_delay_ms) {
        if base > max {
            report.warn("retry.baseDelayMs", "baseDelayMs exceeds maxDelayMs; every retry waits the max");
        }
    }
}

fn validate_tools(config: &TubeLensConfig, report: &mut ValidationReport) {
    let Some(tools) = &config.tools else { return };
    if let Some(base) = &tools.base_url {
        check_http_url("tools.baseUrl", base, report);
    }
    for (tool, endpoint) in &tools.endpoints {
        if tool.trim().is_empty() {
            report.error("tools.endpoints", "Tool name cannot be empty");
        }
        check_http_url(&format!("tools.endpoints.{tool}"), endpoint, report);
    }
    if tools.timeout_ms == Some(0) {
        report.error("tools.timeoutMs", "timeoutMs must be positive");
    }
    if tools.base_url.is_none() && tools.endpoints.is_empty() {
        report.warn("tools", "No engine endpoints configured; every call will be rejected");
    }
}

fn validate_agent(config: &TubeLensConfig, report: &mut ValidationReport) {
    let Some(agent) = &config.agent else { return };
    if let Some(endpoint) = &agent.planner_endpoint {
        check_http_url("agent.plannerEndpoint", endpoint, report);
        if agent.api_key.as_deref().map(str::is_empty).unwrap_or(true) {
            report.warn("agent.apiKey", "Planner endpoint configured without an API key");
        }
    }
    if agent.max_turns == Some(0) {
        report.error("agent.maxTurns", "maxTurns must be >= 1");
    }
    if agent.timeout_ms == Some(0) {
        report.error("agent.timeoutMs", "timeoutMs must be positive");
    }
}

fn validate_pricing(config: &TubeLensConfig, report: &mut ValidationReport) {
    for (model, price) in &config.pricing {
        if !price.is_finite() || *price < 0.0 {
            report.error(format!("pricing.{model}"), "Price per 1k tokens must be non-negative");
        }
    }
}

fn validate_logging(config: &TubeLensConfig, report: &mut ValidationReport) {
    let Some(logging) = &config.logging else { return };
    if let Some(level) = &logging.level {
        if !LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
            report.error(
                "logging.level",
                format!("Unknown log level '{level}'. Use one of: {}", LOG_LEVELS.join(", ")),
            );
        }
    }
}

fn check_http_url(path: &str, value: &str, report: &mut ValidationReport) {
    if !(value.starts_with("http://") || value.starts_with("https://")) {
        report.error(path, format!("'{value}' is not an http(s) URL"));
    }
}
