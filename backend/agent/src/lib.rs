//! Session state for analysis runs.
//!
//! The session manager is the single writer of every `SessionState`: tool
//! outcomes, errors, partial updates, model switches, and recovery all go
//! through it.

pub mod compaction;
pub mod session_manager;

pub use compaction::{compact_for_model_switch, CompactionReport, KEEP_PATTERNS, KEEP_TOOL_CALLS};
pub use session_manager::{RecoveredSession, SessionConfig, SessionManager};
