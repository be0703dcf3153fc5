//! Token usage and cost estimation
//!
//! Usage is additive: an agent run sums every model call it makes, and a
//! trace node carries the total for its own execution.

use std::collections::HashMap;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Tokens and estimated USD cost for one or more model calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            cost: 0.0,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens() == 0 && self.cost == 0.0
    }
}

impl Add for TokenUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            completion_tokens: self.completion_tokens + rhs.completion_tokens,
            cost: self.cost + rhs.cost,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Pricing for a specific model (per million tokens)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl ModelPricing {
    pub fn estimate_cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        let input_cost = (prompt_tokens as f64 / 1_000_000.0) * self.input_per_mtok;
        let output_cost = (completion_tokens as f64 / 1_000_000.0) * self.output_per_mtok;
        input_cost + output_cost
    }
}

/// Per-model price list used to attach a cost to raw token counts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingTable {
    pub model_prices: HashMap<String, ModelPricing>,
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut model_prices = HashMap::new();
        model_prices.insert(
            "claude-opus-4-6".to_string(),
            ModelPricing {
                input_per_mtok: 15.0,
                output_per_mtok: 75.0,
            },
        );
        model_prices.insert(
            "claude-sonnet-4-5".to_string(),
            ModelPricing {
                input_per_mtok: 3.0,
                output_per_mtok: 15.0,
            },
        );
        model_prices.insert(
            "claude-haiku-4-5".to_string(),
            ModelPricing {
                input_per_mtok: 1.0,
                output_per_mtok: 5.0,
            },
        );
        Self { model_prices }
    }
}

impl PricingTable {
    /// Usage for the given token counts, priced when the model is known.
    /// Dated model ids (`claude-sonnet-4-5-20250929`) match their base entry.
    pub fn usage_for(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> TokenUsage {
        let usage = TokenUsage::new(prompt_tokens, completion_tokens);
        match self.lookup(model) {
            Some(pricing) => usage.with_cost(pricing.estimate_cost(prompt_tokens, completion_tokens)),
            None => usage,
        }
    }

    fn lookup(&self, model: &str) -> Option<&ModelPricing> {
        if let Some(p) = self.model_prices.get(model) {
            return Some(p);
        }
        self.model_prices
            .iter()
            .filter(|(name, _)| model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, p)| p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_add() {
        let mut total = TokenUsage::new(10, 5).with_cost(0.5);
        total += TokenUsage::new(3, 2).with_cost(0.25);
        assert_eq!(total.prompt_tokens, 13);
        assert_eq!(total.completion_tokens, 7);
        assert_eq!(total.total_tokens(), 20);
        assert!((total.cost - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_usage_serializes_camel_case() {
        let json = serde_json::to_value(TokenUsage::new(1, 2)).unwrap();
        assert_eq!(json["promptTokens"], 1);
        assert_eq!(json["completionTokens"], 2);
    }

    #[test]
    fn test_estimate_cost() {
        let pricing = ModelPricing {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
        };
        let cost = pricing.estimate_cost(1_000_000, 100_000);
        assert!((cost - 4.5).abs() < 1e-9);
    }

    #[test]
    fn test_pricing_table_prefix_match() {
        let table = PricingTable::default();
        let usage = table.usage_for("claude-sonnet-4-5-20250929", 1_000_000, 0);
        assert!((usage.cost - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_pricing_table_unknown_model() {
        let table = PricingTable::default();
        let usage = table.usage_for("mystery-model", 500, 500);
        assert_eq!(usage.total_tokens(), 1000);
        assert_eq!(usage.cost, 0.0);
    }
}
