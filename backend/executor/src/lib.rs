//! Drives analysis sessions: mode selection, the turn loop, tool dispatch,
//! and fallback from agentic to classic.

pub mod orchestrator;
pub mod pipeline;
pub mod remote_planner;
pub mod retry;

pub use orchestrator::{
    AnalysisReport, Orchestrator, OrchestratorConfig, SessionOutcome, SessionReport,
};
pub use pipeline::{
    derive_hypothesis, ClassicPipeline, ParamSource, PlannedCall, PlannedTurn, ResultBinding,
    Stage, StageCall, StateUpdate, TurnPlanner,
};
pub use remote_planner::RemotePlanner;
pub use retry::RetryPolicy;
