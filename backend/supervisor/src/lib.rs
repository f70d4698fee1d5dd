pub mod budget;
pub mod pricing;

pub use budget::BudgetTracker;
pub use pricing::ModelPricing;
