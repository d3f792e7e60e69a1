//! Static per-model price table.
//!
//! Prices are per million tokens and all arithmetic is integer nano-dollars,
//! so summing costs across phases and runs never drifts.

use std::collections::HashMap;

use utils::money::Usd;

const TOKENS_PER_PRICE_UNIT: i128 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPrice {
    pub input_per_million: Usd,
    pub output_per_million: Usd,
}

impl ModelPrice {
    pub const fn new(input_per_million: Usd, output_per_million: Usd) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> Usd {
        scale(self.input_per_million, input_tokens) + scale(self.output_per_million, output_tokens)
    }
}

/// `rate * tokens / 1M`, rounded half away from zero, saturating at the `Usd` range.
fn scale(rate: Usd, tokens: u64) -> Usd {
    let numerator = i128::from(rate.nanos()) * i128::from(tokens);
    let rounded = (numerator + TOKENS_PER_PRICE_UNIT / 2) / TOKENS_PER_PRICE_UNIT;
    Usd::from_nanos(i64::try_from(rounded).unwrap_or(i64::MAX))
}

/// Model id -> price, plus the model whose price is used for unknown ids.
#[derive(Debug, Clone)]
pub struct PriceTable {
    prices: HashMap<String, ModelPrice>,
    default_model: String,
}

impl PriceTable {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            prices: HashMap::new(),
            default_model: default_model.into(),
        }
    }

    pub fn with_price(mut self, model: impl Into<String>, price: ModelPrice) -> Self {
        self.prices.insert(model.into(), price);
        self
    }

    /// Built-in prices (USD per million tokens).
    pub fn standard(default_model: impl Into<String>) -> Self {
        Self::new(default_model)
            .with_price("claude-opus-4", per_million(15_000_000, 75_000_000))
            .with_price("claude-sonnet-4", per_million(3_000_000, 15_000_000))
            .with_price("claude-haiku-3-5", per_million(800_000, 4_000_000))
            .with_price("gpt-4o", per_million(2_500_000, 10_000_000))
            .with_price("gpt-4o-mini", per_million(150_000, 600_000))
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Exact id first, then the longest key that prefixes `model`
    /// (dated ids like `claude-sonnet-4-20250514`).
    pub fn lookup(&self, model: &str) -> Option<&ModelPrice> {
        if let Some(price) = self.prices.get(model) {
            return Some(price);
        }
        self.prices
            .iter()
            .filter(|(key, _)| model.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, price)| price)
    }

    /// Cost of one model call. Unknown models are billed at the default
    /// model's price.
    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Usd {
        let price = match self.lookup(model) {
            Some(price) => price,
            None => {
                tracing::warn!(
                    "[WORKFLOW_PRICING] No price for model '{}', using '{}'",
                    model,
                    self.default_model
                );
                match self.lookup(&self.default_model) {
                    Some(price) => price,
                    None => return Usd::ZERO,
                }
            }
        };
        price.cost(input_tokens, output_tokens)
    }
}

fn per_million(input_micros: i64, output_micros: i64) -> ModelPrice {
    ModelPrice::new(Usd::from_micros(input_micros), Usd::from_micros(output_micros))
}
