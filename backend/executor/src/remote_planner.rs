/// Agentic turn planner reached over HTTP.
///
/// The LLM side lives in a separate service. Each turn the orchestrator sends
/// it the session state and receives either the next turn type or a planned
/// turn.
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use tubelens_core::{SessionState, ToolFailure, TurnType};

use crate::pipeline::{PlannedTurn, TurnPlanner};

const USER_AGENT: &str = "TubeLens/0.1";

pub struct RemotePlanner {
    base: Url,
    client: Client,
    timeout: Duration,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct NextTurnRequest<'a> {
    state: &'a SessionState,
}

#[derive(Deserialize)]
struct NextTurnResponse {
    turn: Option<TurnType>,
}

#[derive(Serialize)]
struct PlanRequest<'a> {
    state: &'a SessionState,
    turn: TurnType,
    model: &'a str,
}

impl RemotePlanner {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(endpoint)
            .with_context(|| format!("Invalid planner endpoint URL: {}", endpoint))?;
        if !matches!(base.scheme(), "http" | "https") {
            bail!("Unsupported planner endpoint scheme: {}", base.scheme());
        }
        // Relative joins replace the last segment unless the path ends in '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            client: Client::new(),
            timeout,
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn endpoint(&self, route: &str) -> Result<Url> {
        self.base
            .join(route)
            .with_context(|| format!("Invalid planner route: {}", route))
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, route: &str, body: &B) -> Result<R> {
        let url = self.endpoint(route)?;
        debug!(url = %url, "Calling agentic planner");

        let mut request = self
            .client
            .post(url)
            .header("User-Agent", USER_AGENT)
            .timeout(self.timeout)
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                ToolFailure::transient(format!("planner unreachable: {}", e))
            } else {
                ToolFailure::permanent(format!("planner request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("planner returned {}: {}", status, body.trim());
            let failure = if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                ToolFailure::transient(message)
            } else {
                ToolFailure::permanent(message)
            };
            return Err(failure.into());
        }

        let parsed = response
            .json::<R>()
            .await
            .map_err(|e| ToolFailure::permanent(format!("planner returned invalid JSON: {}", e)))?;
        Ok(parsed)
    }
}

#[async_trait]
impl TurnPlanner for RemotePlanner {
    fn name(&self) -> &str {
        "remote"
    }

    async fn next_turn_type(&self, state: &SessionState) -> Result<Option<TurnType>> {
        let response: NextTurnResponse = self.post("next-turn", &NextTurnRequest { state }).await?;
        Ok(response.turn)
    }

    async fn plan_turn(&self, state: &SessionState, turn: TurnType, model: &str) -> Result<PlannedTurn> {
        self.post("plan", &PlanRequest { state, turn, model }).await
    }
}

#[cfg(test)]
mod tests {
    use tubelens_core::{AnalysisMode, BudgetCaps};

    use super::*;

    #[test]
    fn test_routes_join_under_base_path() {
        let planner = RemotePlanner::new("http://planner.local:9000/v1", Duration::from_secs(5)).unwrap();
        assert_eq!(planner.endpoint("plan").unwrap().as_str(), "http://planner.local:9000/v1/plan");
        assert_eq!(
            planner.endpoint("next-turn").unwrap().as_str(),
            "http://planner.local:9000/v1/next-turn"
        );
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        assert!(RemotePlanner::new("planner.local", Duration::from_secs(1)).is_err());
        assert!(RemotePlanner::new("file:///tmp/planner", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_next_turn_response_shapes() {
        let done: NextTurnResponse = serde_json::from_str(r#"{"turn": null}"#).unwrap();
        assert!(done.turn.is_none());
        let next: NextTurnResponse = serde_json::from_str(r#"{"turn": "validation"}"#).unwrap();
        assert_eq!(next.turn, Some(TurnType::Validation));
    }

    #[tokio::test]
    async fn test_unreachable_planner_is_transient() {
        let planner = RemotePlanner::new("http://127.0.0.1:9/", Duration::from_millis(500)).unwrap();
        let state = SessionState::new("s", "v", AnalysisMode::Agentic, "gpt-5", BudgetCaps::default());
        let err = planner.next_turn_type(&state).await.unwrap_err();
        let (_, recoverable) = ToolFailure::classify(&err);
        assert!(recoverable);
    }
}
