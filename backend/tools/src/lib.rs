//! Tool capability descriptions for the orchestrator.
//!
//! The registry describes what each analytic engine accepts and how it may be
//! scheduled; it does not decide call order. Dependent calls are wired by the
//! orchestration loop.

pub mod analytics;
pub mod cache;
pub mod registry;
pub mod remote;
pub mod schema;

pub use analytics::AnalyticTool;
pub use cache::default_cache_key;
pub use registry::{Invocation, ToolCategory, ToolDefinition, ToolRegistry};
pub use remote::RemoteTool;
pub use schema::{ParamField, ParamKind, ParamSchema};
