use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::TokenUsage;

const TOKENS_PER_MILLION: f64 = 1_000_000.0;

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("no pricing configured for model `{0}`")]
    UnknownModel(String),
    #[error("failed to read price table: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse price table YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse price table JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-million-token prices in US dollars.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    #[serde(rename = "inputCostPer1MTokens")]
    pub input_per_million: f64,
    #[serde(rename = "outputCostPer1MTokens")]
    pub output_per_million: f64,
}

impl ModelPrice {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    pub fn cost(&self, usage: TokenUsage) -> f64 {
        (usage.input_tokens as f64 / TOKENS_PER_MILLION) * self.input_per_million
            + (usage.output_tokens as f64 / TOKENS_PER_MILLION) * self.output_per_million
    }
}

/// Read-only model → price mapping handed to whoever needs to turn usage into cost.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceTable {
    prices: BTreeMap<String, ModelPrice>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Published list prices for the benchmarked models.
    pub fn builtin() -> Self {
        [
            ("gpt-4-0125-preview", ModelPrice::new(10.00, 30.00)),
            ("gpt-3.5-turbo-0125", ModelPrice::new(0.50, 1.50)),
            ("claude-3-opus-20240229", ModelPrice::new(15.00, 75.00)),
            ("claude-3-sonnet-20240229", ModelPrice::new(3.00, 15.00)),
            ("gemini-1.5-pro-preview-0409", ModelPrice::new(2.50, 7.50)),
            ("llama3-70b-8192", ModelPrice::new(0.59, 0.79)),
            ("mixtral-8x7b-32768", ModelPrice::new(0.27, 0.27)),
            ("llama3-8b-8192", ModelPrice::new(0.05, 0.10)),
        ]
        .into_iter()
        .collect()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PricingError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        if ext == "json" {
            Ok(serde_json::from_slice(&bytes)?)
        } else {
            Ok(serde_yaml::from_slice(&bytes)?)
        }
    }

    pub fn with_price(mut self, model: impl Into<String>, price: ModelPrice) -> Self {
        self.prices.insert(model.into(), price);
        self
    }

    /// Entries of `other` replace entries of `self` for the same model.
    pub fn merged(mut self, other: PriceTable) -> Self {
        self.prices.extend(other.prices);
        self
    }

    pub fn get(&self, model: &str) -> Option<&ModelPrice> {
        self.prices.get(model)
    }

    pub fn cost(&self, model: &str, usage: TokenUsage) -> Result<f64, PricingError> {
        self.get(model)
            .map(|price| price.cost(usage))
            .ok_or_else(|| PricingError::UnknownModel(model.to_string()))
    }
}

impl<S: Into<String>> FromIterator<(S, ModelPrice)> for PriceTable {
    fn from_iter<I: IntoIterator<Item = (S, ModelPrice)>>(iter: I) -> Self {
        Self {
            prices: iter
                .into_iter()
                .map(|(model, price)| (model.into(), price))
                .collect(),
        }
    }
}

/// Running token totals for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageAccumulator {
    turns: Vec<TokenUsage>,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, usage: TokenUsage) {
        self.turns.push(usage);
    }

    pub fn total(&self) -> TokenUsage {
        self.turns
            .iter()
            .copied()
            .fold(TokenUsage::default(), |acc, usage| acc + usage)
    }

    pub fn cost(&self, model: &str, prices: &PriceTable) -> Result<f64, PricingError> {
        prices.cost(model, self.total())
    }
}
