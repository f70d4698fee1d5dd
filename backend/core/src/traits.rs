use anyhow::Result;
use async_trait::async_trait;

/// An analytic capability the orchestrator can invoke (topic clustering,
/// performance scoring, channel baselines, transcripts, ...).
///
/// Handlers receive params already validated against the tool's declared
/// schema and must not touch orchestrator state; every effect is recorded by
/// the session manager from the returned value.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name of the tool (e.g., "channel_baseline").
    fn name(&self) -> &str;

    /// Run the tool. Return a [`crate::ToolFailure`] to control retry behavior.
    async fn call(&self, params: serde_json::Value) -> Result<serde_json::Value>;
}
