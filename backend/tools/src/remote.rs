/// Remote analytic engine adapter.
///
/// Each engine is an HTTP endpoint that accepts the tool's params as a JSON
/// body and answers with a JSON result.
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

use tubelens_core::{Tool, ToolFailure};

const USER_AGENT: &str = "TubeLens/0.1";

pub struct RemoteTool {
    name: String,
    endpoint: Url,
    client: Client,
    timeout: Duration,
}

impl RemoteTool {
    pub fn new(name: impl Into<String>, endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("Invalid tool endpoint URL: {}", endpoint))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            bail!("Unsupported tool endpoint scheme: {}", endpoint.scheme());
        }
        Ok(Self {
            name: name.into(),
            endpoint,
            client: Client::new(),
            timeout,
        })
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// Throttling and upstream faults are worth retrying; other statuses are not.
fn is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, params: Value) -> Result<Value> {
        debug!(tool = %self.name, endpoint = %self.endpoint, "Calling remote engine");

        let response = self
            .client
            .post(self.endpoint.clone())
            .header("User-Agent", USER_AGENT)
            .timeout(self.timeout)
            .json(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    ToolFailure::transient(format!("{} unreachable: {}", self.name, e))
                } else {
                    ToolFailure::permanent(format!("{} request failed: {}", self.name, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("{} returned {}: {}", self.name, status, body.trim());
            let failure = if is_transient(status) {
                ToolFailure::transient(message)
            } else {
                ToolFailure::permanent(message)
            };
            return Err(failure.into());
        }

        let result = response.json::<Value>().await.map_err(|e| {
            ToolFailure::permanent(format!("{} returned invalid JSON: {}", self.name, e))
        })?;
        Ok(result)
    }
}
