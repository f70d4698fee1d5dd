//! Orchestrator Event Logger
//!
//! Structured events (tool calls, model switches, fallbacks, errors) emitted
//! through `tracing` under the `orchestrator_events` target, so the JSON file
//! layer writes them as NDJSON.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::redact::redact_sensitive_data;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    ToolCall {
        tool_name: String,
        params_json: String,
        success: bool,
        cached: bool,
        duration_ms: u64,
    },
    ModelSwitch {
        from: String,
        to: String,
        reason: String,
    },
    Fallback {
        from_mode: String,
        reason: String,
        fallback_session_id: String,
    },
    Error {
        context: String,
        error_msg: String,
        recoverable: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct EventLogEntry {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: OrchestratorEvent,
}

pub struct EventLogger;

impl EventLogger {
    /// Redacts free-text fields, then emits the event. Returns the entry as logged.
    pub fn log_event(session_id: &str, mut event: OrchestratorEvent) -> EventLogEntry {
        match &mut event {
            OrchestratorEvent::ToolCall { params_json, .. } => {
                *params_json = redact_sensitive_data(params_json);
            }
            OrchestratorEvent::Fallback { reason, .. }
            | OrchestratorEvent::ModelSwitch { reason, .. } => {
                *reason = redact_sensitive_data(reason);
            }
            OrchestratorEvent::Error { error_msg, .. } => {
                *error_msg = redact_sensitive_data(error_msg);
            }
        }

        let entry = EventLogEntry {
            session_id: session_id.into(),
            timestamp: Utc::now(),
            event,
        };

        match serde_json::to_string(&entry) {
            Ok(json) => info!(target: "orchestrator_events", session_id = %session_id, event = %json, "Orchestrator event"),
            Err(_) => info!(target: "orchestrator_events", session_id = %session_id, event = ?entry, "Orchestrator event"),
        }
        entry
    }
}
