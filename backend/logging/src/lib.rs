//! Structured logging for the TubeLens orchestrator.
//!
//! Console and rolling NDJSON file output, redaction of credentials, and the
//! orchestrator event stream (tool calls, model switches, fallbacks, errors).

pub mod event_logger;
pub mod logger;
pub mod redact;

pub use event_logger::{EventLogEntry, EventLogger, OrchestratorEvent};
pub use logger::{init_console_logger, init_logger};
pub use redact::redact_sensitive_data;
