use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use tubelens_core::{LensError, SessionState, Tool, ToolCall, ToolFailure};

use crate::cache::default_cache_key;
use crate::schema::ParamSchema;

/// Custom cache key derivation: `(tool_name, params) -> key`.
pub type CacheKeyFn = Arc<dyn Fn(&str, &Value) -> String + Send + Sync>;

/// Broad grouping used for reporting and planner prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Context,
    Search,
    Scoring,
    Clustering,
    Validation,
    #[default]
    Other,
}

/// Everything the orchestrator needs to know to admit and schedule a tool.
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: ParamSchema,
    pub handler: Arc<dyn Tool>,
    pub category: ToolCategory,
    /// Safe to run concurrently with other calls in the same session.
    pub parallel_safe: bool,
    pub estimated_cost: f64,
    pub estimated_tokens: u64,
    pub cacheable: bool,
    pub cache_key: Option<CacheKeyFn>,
}

impl ToolDefinition {
    pub fn new(handler: Arc<dyn Tool>, parameters: ParamSchema) -> Self {
        Self {
            name: handler.name().to_string(),
            description: String::new(),
            parameters,
            handler,
            category: ToolCategory::default(),
            parallel_safe: false,
            estimated_cost: 0.0,
            estimated_tokens: 0,
            cacheable: false,
            cache_key: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn category(mut self, category: ToolCategory) -> Self {
        self.category = category;
        self
    }

    pub fn parallel_safe(mut self, parallel_safe: bool) -> Self {
        self.parallel_safe = parallel_safe;
        self
    }

    pub fn estimate(mut self, tokens: u64, cost: f64) -> Self {
        self.estimated_tokens = tokens;
        self.estimated_cost = cost;
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn with_cache_key<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&str, &Value) -> String + Send + Sync + 'static,
    {
        self.cacheable = true;
        self.cache_key = Some(Arc::new(key_fn));
        self
    }

    /// Cache key for `params`, or `None` when the tool is not cacheable.
    pub fn cache_key_for(&self, params: &Value) -> Option<String> {
        if !self.cacheable {
            return None;
        }
        Some(match &self.cache_key {
            Some(key_fn) => key_fn(&self.name, params),
            None => default_cache_key(&self.name, params),
        })
    }
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("parallel_safe", &self.parallel_safe)
            .field("estimated_tokens", &self.estimated_tokens)
            .field("estimated_cost", &self.estimated_cost)
            .field("cacheable", &self.cacheable)
            .finish()
    }
}

/// Result of running (or short-circuiting) one tool call.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub call: ToolCall,
    /// Meaningful only for failed calls.
    pub recoverable: bool,
}

impl Invocation {
    /// Served from an earlier call; the handler was not run.
    pub fn is_cached(&self) -> bool {
        self.call.cached
    }
}

/// Immutable once built; share it across sessions behind an `Arc`.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDefinition>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Returns the definition it replaced, if any.
    pub fn register(&mut self, definition: ToolDefinition) -> Option<ToolDefinition> {
        let name = definition.name.clone();
        let previous = self.tools.insert(name.clone(), definition);
        if previous.is_some() {
            warn!(tool = %name, "Replaced existing tool definition");
        } else {
            debug!(tool = %name, "Registered tool");
        }
        previous
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tools that may be fanned out concurrently.
    pub fn parallel_safe(&self) -> Vec<&ToolDefinition> {
        let mut tools: Vec<&ToolDefinition> =
            self.tools.values().filter(|t| t.parallel_safe).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Admission-time schema check.
    pub fn validate(&self, name: &str, params: &Value) -> Result<&ToolDefinition, LensError> {
        let definition = self
            .get(name)
            .ok_or_else(|| LensError::UnknownTool(name.to_string()))?;
        definition
            .parameters
            .validate(params)
            .map_err(|message| LensError::InvalidParams {
                tool: name.to_string(),
                message,
            })?;
        Ok(definition)
    }

    /// Latest successful call in `state` with the same cache key.
    pub fn cached_call<'s>(
        &self,
        state: &'s SessionState,
        name: &str,
        params: &Value,
    ) -> Option<&'s ToolCall> {
        let key = self.get(name)?.cache_key_for(params)?;
        state.tool_calls.iter().rev().find(|call| {
            call.tool_name == name
                && call.is_success()
                && call.cache_key.as_deref() == Some(key.as_str())
        })
    }

    pub fn cached_result(&self, state: &SessionState, name: &str, params: &Value) -> Option<Value> {
        self.cached_call(state, name, params)
            .and_then(|call| call.result.clone())
    }

    /// Validate, consult the session cache, then run the handler.
    ///
    /// Schema violations are returned as errors so the caller can refuse
    /// admission. Handler failures come back as an `Invocation` whose call
    /// has `status = error`.
    pub async fn invoke(
        &self,
        state: &SessionState,
        call_id: impl Into<String>,
        name: &str,
        params: Value,
    ) -> Result<Invocation, LensError> {
        let call_id = call_id.into();
        let definition = self.validate(name, &params)?;
        let cache_key = definition.cache_key_for(&params);
        let start = Utc::now();

        if let Some(result) = self.cached_result(state, name, &params) {
            debug!(tool = %name, session_id = %state.session_id, "Serving cached tool result");
            let mut call = ToolCall::success(call_id, name, params, start, result)
                .with_cache_key(cache_key);
            call.cached = true;
            return Ok(Invocation {
                call,
                recoverable: false,
            });
        }

        info!(tool = %name, session_id = %state.session_id, "Invoking tool");
        match definition.handler.call(params.clone()).await {
            Ok(result) => Ok(Invocation {
                call: ToolCall::success(call_id, name, params, start, result)
                    .with_cache_key(cache_key),
                recoverable: false,
            }),
            Err(err) => {
                let (message, recoverable) = ToolFailure::classify(&err);
                warn!(
                    tool = %name,
                    session_id = %state.session_id,
                    recoverable,
                    error = %message,
                    "Tool failed"
                );
                Ok(Invocation {
                    call: ToolCall::failure(call_id, name, params, start, message)
                        .with_cache_key(cache_key),
                    recoverable,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use tubelens_core::{AnalysisMode, BudgetCaps};

    use super::*;
    use crate::schema::ParamKind;

    struct CountingTool {
        name: &'static str,
        calls: AtomicUsize,
        fail_with: Option<ToolFailure>,
    }

    impl CountingTool {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
                fail_with: None,
            })
        }

        fn failing(name: &'static str, failure: ToolFailure) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
                fail_with: Some(failure),
            })
        }
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            self.name
        }

        async fn call(&self, params: Value) -> Result<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(failure) = &self.fail_with {
                return Err(failure.clone().into());
            }
            Ok(json!({"echo": params, "invocation": n}))
        }
    }

    fn schema() -> ParamSchema {
        ParamSchema::new().required("video_id", ParamKind::String)
    }

    fn state() -> SessionState {
        SessionState::new("s-1", "vid-1", AnalysisMode::Agentic, "gpt-5", BudgetCaps::default())
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = ToolRegistry::new();
        let tool = CountingTool::new("transcript");
        assert!(registry
            .register(ToolDefinition::new(tool.clone(), schema()))
            .is_none());
        assert!(registry
            .register(ToolDefinition::new(tool, schema()))
            .is_some());
        assert_eq!(registry.len(), 1);
        assert!(registry.get("transcript").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_parallel_safe_filter() {
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolDefinition::new(CountingTool::new("channel_baseline"), schema()).parallel_safe(true),
        );
        registry.register(
            ToolDefinition::new(CountingTool::new("validate_pattern"), schema()).parallel_safe(false),
        );
        registry.register(
            ToolDefinition::new(CountingTool::new("performance_envelope"), schema())
                .parallel_safe(true),
        );
        let names: Vec<&str> = registry
            .parallel_safe()
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(names, vec!["channel_baseline", "performance_envelope"]);
    }

    #[test]
    fn test_validate_unknown_and_bad_params() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolDefinition::new(CountingTool::new("transcript"), schema()));
        assert!(matches!(
            registry.validate("nope", &json!({})),
            Err(LensError::UnknownTool(_))
        ));
        assert!(matches!(
            registry.validate("transcript", &json!({"video_id": 7})),
            Err(LensError::InvalidParams { .. })
        ));
        assert!(registry
            .validate("transcript", &json!({"video_id": "v"}))
            .is_ok());
    }

    #[tokio::test]
    async fn test_cacheable_tool_invoked_once() {
        let tool = CountingTool::new("transcript");
        let mut registry = ToolRegistry::new();
        registry.register(ToolDefinition::new(tool.clone(), schema()).cacheable(true));

        let mut session = state();
        let params = json!({"video_id": "vid-1"});

        let first = registry
            .invoke(&session, "c1", "transcript", params.clone())
            .await
            .unwrap();
        assert!(!first.is_cached());
        session.tool_calls.push(first.call.clone());

        let second = registry
            .invoke(&session, "c2", "transcript", params)
            .await
            .unwrap();
        assert!(second.is_cached());
        assert_eq!(second.call.result, first.call.result);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_cacheable_tool_runs_every_time() {
        let tool = CountingTool::new("transcript");
        let mut registry = ToolRegistry::new();
        registry.register(ToolDefinition::new(tool.clone(), schema()));

        let mut session = state();
        let params = json!({"video_id": "vid-1"});
        for id in ["c1", "c2"] {
            let inv = registry
                .invoke(&session, id, "transcript", params.clone())
                .await
                .unwrap();
            session.tool_calls.push(inv.call);
        }
        assert_eq!(tool.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_ignores_failed_calls_and_other_params() {
        let tool = CountingTool::new("transcript");
        let mut registry = ToolRegistry::new();
        registry.register(ToolDefinition::new(tool.clone(), schema()).cacheable(true));

        let mut session = state();
        let failed = ToolCall::failure("c0", "transcript", json!({"video_id": "vid-1"}), Utc::now(), "x")
            .with_cache_key(registry.get("transcript").unwrap().cache_key_for(&json!({"video_id": "vid-1"})));
        session.tool_calls.push(failed);

        let inv = registry
            .invoke(&session, "c1", "transcript", json!({"video_id": "vid-1"}))
            .await
            .unwrap();
        assert!(!inv.is_cached());
        session.tool_calls.push(inv.call);

        let other = registry
            .invoke(&session, "c2", "transcript", json!({"video_id": "vid-2"}))
            .await
            .unwrap();
        assert!(!other.is_cached());
        assert_eq!(tool.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_custom_cache_key() {
        let tool = CountingTool::new("transcript");
        let mut registry = ToolRegistry::new();
        // Language does not affect the cached transcript.
        registry.register(
            ToolDefinition::new(tool.clone(), schema().optional("language", ParamKind::String))
                .with_cache_key(|name, params| {
                    format!("{}:{}", name, params["video_id"].as_str().unwrap_or_default())
                }),
        );

        let mut session = state();
        let inv = registry
            .invoke(&session, "c1", "transcript", json!({"video_id": "v", "language": "en"}))
            .await
            .unwrap();
        session.tool_calls.push(inv.call);
        let inv = registry
            .invoke(&session, "c2", "transcript", json!({"video_id": "v", "language": "de"}))
            .await
            .unwrap();
        assert!(inv.is_cached());
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_error_call() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolDefinition::new(
            CountingTool::failing("topic_clusters", ToolFailure::transient("engine busy")),
            schema(),
        ));
        let inv = registry
            .invoke(&state(), "c1", "topic_clusters", json!({"video_id": "v"}))
            .await
            .unwrap();
        assert!(!inv.call.is_success());
        assert_eq!(inv.call.error.as_deref(), Some("engine busy"));
        assert!(inv.recoverable);
    }

    #[tokio::test]
    async fn test_invalid_params_never_reach_handler() {
        let tool = CountingTool::new("transcript");
        let mut registry = ToolRegistry::new();
        registry.register(ToolDefinition::new(tool.clone(), schema()));
        let result = registry
            .invoke(&state(), "c1", "transcript", json!({"videoId": "v"}))
            .await;
        assert!(matches!(result, Err(LensError::InvalidParams { .. })));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
    }
}
