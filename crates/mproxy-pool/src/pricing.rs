//! Per-token unit prices, kept as data.
//!
//! Lookup order: exact `(provider, model)` row, then the provider's
//! `default` row, then the global `default` row. The shipped numbers are
//! illustrative; deployments override the whole table via configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use mproxy_protocol::openai::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitPrice {
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingTable {
    providers: HashMap<String, HashMap<String, UnitPrice>>,
    default: UnitPrice,
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut providers = HashMap::new();

        providers.insert(
            "openai".to_string(),
            HashMap::from([
                ("gpt-4".to_string(), UnitPrice { input: 0.000_03, output: 0.000_06 }),
                ("gpt-3.5-turbo".to_string(), UnitPrice { input: 0.000_001, output: 0.000_002 }),
                ("default".to_string(), UnitPrice { input: 0.000_005, output: 0.000_01 }),
            ]),
        );
        providers.insert(
            "anthropic".to_string(),
            HashMap::from([
                ("claude-3-opus".to_string(), UnitPrice { input: 0.000_03, output: 0.000_15 }),
                ("claude-3-sonnet".to_string(), UnitPrice { input: 0.000_013, output: 0.000_038 }),
                ("claude-3-haiku".to_string(), UnitPrice { input: 0.000_002, output: 0.000_015 }),
                ("default".to_string(), UnitPrice { input: 0.000_01, output: 0.000_03 }),
            ]),
        );
        providers.insert(
            "gemini".to_string(),
            HashMap::from([
                ("gemini-pro".to_string(), UnitPrice { input: 0.000_001, output: 0.000_002 }),
                ("default".to_string(), UnitPrice { input: 0.000_001, output: 0.000_002 }),
            ]),
        );
        providers.insert(
            "deepseek".to_string(),
            HashMap::from([("default".to_string(), UnitPrice { input: 0.000_002, output: 0.000_004 })]),
        );

        Self {
            providers,
            default: UnitPrice { input: 0.000_005, output: 0.000_01 },
        }
    }
}

impl PricingTable {
    pub fn new(providers: HashMap<String, HashMap<String, UnitPrice>>, default: UnitPrice) -> Self {
        Self { providers, default }
    }

    pub fn price_for(&self, provider: &str, model: Option<&str>) -> UnitPrice {
        let Some(rows) = self.providers.get(provider) else {
            return self.default;
        };
        if let Some(model) = model
            && let Some(price) = rows.get(model)
        {
            return *price;
        }
        rows.get("default").copied().unwrap_or(self.default)
    }

    /// Cost of one request in USD given its token usage.
    pub fn cost_of(&self, provider: &str, model: Option<&str>, usage: &Usage) -> f64 {
        let price = self.price_for(provider, model);
        usage.prompt_tokens as f64 * price.input + usage.completion_tokens as f64 * price.output
    }
}
