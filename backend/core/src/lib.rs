pub mod error;
pub mod traits;
pub mod types;

pub use error::{LensError, ToolFailure};
pub use traits::Tool;
pub use types::{
    AnalysisMode, BudgetCaps, BudgetUsage, CostBreakdown, DiscoveredPattern, Hypothesis,
    ModelSwitch, SearchResults, SessionError, SessionState, ToolCall, ToolCallStatus, TurnType,
    ValidatedPattern, ValidationResults, VideoContext,
};
