pub mod selector;

pub use selector::{
    FallbackThresholds, ModeDecision, ModeSelector, ModeStats, PerformanceStats,
    SelectionFactors, SelectionRecord, SelectionResult, SelectorConfig, SelectorWeights,
};
