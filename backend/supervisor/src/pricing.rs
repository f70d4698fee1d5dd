//! Model price table.
//!
//! Converts LLM token consumption into cost so agentic turns are metered in
//! the same currency as tool calls.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Price used for models missing from the table.
pub const DEFAULT_PRICE_PER_1K: f64 = 0.001;

/// Per-model blended price (USD per 1k tokens).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    prices: HashMap<String, f64>,
    default_per_1k: f64,
}

impl Default for ModelPricing {
    fn default() -> Self {
        let prices = [("gpt-5", 0.01), ("gpt-5-mini", 0.002), ("gpt-5-nano", 0.0005)]
            .into_iter()
            .map(|(model, price)| (model.to_string(), price))
            .collect();
        Self {
            prices,
            default_per_1k: DEFAULT_PRICE_PER_1K,
        }
    }
}

impl ModelPricing {
    pub fn new(prices: HashMap<String, f64>) -> Self {
        Self {
            prices,
            default_per_1k: DEFAULT_PRICE_PER_1K,
        }
    }

    pub fn with_price(mut self, model: impl Into<String>, per_1k: f64) -> Self {
        self.prices.insert(model.into(), per_1k);
        self
    }

    pub fn price_per_1k(&self, model: &str) -> f64 {
        self.prices.get(model).copied().unwrap_or(self.default_per_1k)
    }

    /// Cost of `tokens` on `model`.
    pub fn calculate_cost(&self, model: &str, tokens: u64) -> f64 {
        (tokens as f64 / 1000.0) * self.price_per_1k(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_price() {
        let pricing = ModelPricing::default();
        let cost = pricing.calculate_cost("gpt-5", 2_000);
        assert!((cost - 0.02).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_uses_default() {
        let pricing = ModelPricing::default();
        let cost = pricing.calculate_cost("llama-local", 1_000);
        assert!((cost - DEFAULT_PRICE_PER_1K).abs() < 1e-9);
    }

    #[test]
    fn override_price() {
        let pricing = ModelPricing::default().with_price("gpt-5", 0.5);
        assert!((pricing.price_per_1k("gpt-5") - 0.5).abs() < 1e-9);
    }
}
