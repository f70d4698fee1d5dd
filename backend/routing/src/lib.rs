pub mod router;

pub use router::{ModelRouter, ModelTier, RouteDecision, RouterConfig, TierModels};
