//! Token cost attribution. Prices are data (USD per million tokens); an
//! unknown provider/model pair costs zero rather than failing the turn.

use crate::types::Usage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub provider: String,
    pub model: String,
    pub input: f64,
    pub output: f64,
    /// Cache reads; billed at `input` when absent.
    #[serde(default)]
    pub cached_input: Option<f64>,
    /// Cache writes; billed at `input` when absent.
    #[serde(default)]
    pub cache_write: Option<f64>,
}

impl ModelPricing {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, input: f64, output: f64) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            input,
            output,
            cached_input: None,
            cache_write: None,
        }
    }

    pub fn with_cached_input(mut self, price: f64) -> Self {
        self.cached_input = Some(price);
        self
    }

    pub fn with_cache_write(mut self, price: f64) -> Self {
        self.cache_write = Some(price);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Cost {
    pub input: f64,
    pub cached_input: f64,
    pub cache_write: f64,
    pub output: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    entries: Vec<ModelPricing>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = ModelPricing>) -> Self {
        let mut table = Self::new();
        for e in entries {
            table.insert(e);
        }
        table
    }

    /// Replaces an existing entry for the same provider and model.
    pub fn insert(&mut self, pricing: ModelPricing) {
        self.entries
            .retain(|e| !(same_provider(&e.provider, &pricing.provider) && e.model == pricing.model));
        self.entries.push(pricing);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact model match first, then the longest table model that prefixes
    /// the requested id (dated snapshots resolve to their family price).
    pub fn lookup(&self, provider: &str, model: &str) -> Option<&ModelPricing> {
        let candidates = self
            .entries
            .iter()
            .filter(|e| same_provider(&e.provider, provider));
        let mut best: Option<&ModelPricing> = None;
        for e in candidates {
            if e.model == model {
                return Some(e);
            }
            if model.starts_with(&e.model)
                && best.is_none_or(|b| e.model.len() > b.model.len())
            {
                best = Some(e);
            }
        }
        best
    }

    pub fn calculate(&self, provider: &str, model: &str, usage: &Usage) -> Cost {
        match self.lookup(provider, model) {
            Some(pricing) => calculate_cost(pricing, usage),
            None => {
                tracing::debug!(provider, model, "no pricing entry; cost is zero");
                Cost::default()
            }
        }
    }

    /// Sets `usage.cost`; leaves it untouched when the model is unpriced.
    pub fn apply(&self, provider: &str, model: &str, usage: &mut Usage) {
        if self.lookup(provider, model).is_some() {
            usage.cost = Some(self.calculate(provider, model, usage).total);
        }
    }
}

fn same_provider(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// `input_tokens` is canonical (cache reads and writes included), so the
/// uncached remainder is billed at the base rate.
pub fn calculate_cost(pricing: &ModelPricing, usage: &Usage) -> Cost {
    const PER: f64 = 1_000_000.0;
    let cached = usage.cached_tokens.unwrap_or(0);
    let written = usage.cache_creation_tokens.unwrap_or(0);
    let uncached = usage.input_tokens.saturating_sub(cached + written);

    let input = uncached as f64 / PER * pricing.input;
    let cached_input = cached as f64 / PER * pricing.cached_input.unwrap_or(pricing.input);
    let cache_write = written as f64 / PER * pricing.cache_write.unwrap_or(pricing.input);
    let output = usage.output_tokens as f64 / PER * pricing.output;

    Cost {
        input,
        cached_input,
        cache_write,
        output,
        total: input + cached_input + cache_write + output,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn table() -> PricingTable {
        PricingTable::from_entries([
            ModelPricing::new("openai", "gpt-4o", 2.5, 10.0).with_cached_input(1.25),
            ModelPricing::new("openai", "gpt-4o-mini", 0.15, 0.6),
            ModelPricing::new("anthropic", "claude-3-5-sonnet", 3.0, 15.0)
                .with_cached_input(0.3)
                .with_cache_write(3.75),
        ])
    }

    #[test]
    fn plain_input_and_output_are_priced_per_million() {
        let cost = table().calculate("openai", "gpt-4o", &Usage::new(1_000_000, 500_000));
        assert!(close(cost.input, 2.5));
        assert!(close(cost.output, 5.0));
        assert!(close(cost.total, 7.5));
    }

    #[test]
    fn cached_tokens_use_their_own_rate() {
        let usage = Usage {
            cached_tokens: Some(400_000),
            cache_creation_tokens: Some(100_000),
            ..Usage::new(1_000_000, 0)
        };
        let cost = table().calculate("anthropic", "claude-3-5-sonnet-20241022", &usage);
        assert!(close(cost.input, 0.5 * 3.0));
        assert!(close(cost.cached_input, 0.4 * 0.3));
        assert!(close(cost.cache_write, 0.1 * 3.75));
        assert!(close(cost.total, 1.5 + 0.12 + 0.375));
    }

    #[test]
    fn longest_prefix_wins_and_exact_match_beats_prefix() {
        let t = table();
        assert_eq!(t.lookup("openai", "gpt-4o-mini-2024-07-18").unwrap().model, "gpt-4o-mini");
        assert_eq!(t.lookup("openai", "gpt-4o-2024-08-06").unwrap().model, "gpt-4o");
        assert_eq!(t.lookup("OpenAI", "gpt-4o").unwrap().model, "gpt-4o");
    }

    #[test]
    fn unknown_pairs_cost_nothing_and_leave_usage_alone() {
        let t = table();
        assert_eq!(t.calculate("gemini", "gemini-2.0-flash", &Usage::new(10, 10)), Cost::default());
        let mut usage = Usage::new(10, 10);
        t.apply("openai", "davinci", &mut usage);
        assert_eq!(usage.cost, None);
        t.apply("openai", "gpt-4o-mini", &mut usage);
        assert!(usage.cost.unwrap() > 0.0);
    }

    #[test]
    fn insert_replaces_existing_entry() {
        let mut t = table();
        t.insert(ModelPricing::new("openai", "gpt-4o", 5.0, 15.0));
        assert_eq!(t.len(), 3);
        assert!(close(t.lookup("openai", "gpt-4o").unwrap().input, 5.0));
    }
}
