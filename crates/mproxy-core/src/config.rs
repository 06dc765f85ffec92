//! Runtime configuration for the proxy core.
//!
//! Everything here is data an operator can override: the transformer rule
//! table, per-provider strategy bindings, timeouts, retry policy, breaker
//! thresholds, and the pricing table.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use mproxy_pool::{BreakerConfig, PricingTable};

/// One transformer-mode fallback rule: when the requested model name
/// contains `token` (case-insensitive), route to `provider` instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformerRule {
    pub token: String,
    pub provider: String,
}

impl TransformerRule {
    pub fn new(token: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            provider: provider.into(),
        }
    }

    pub fn matches(&self, requested_model: &str) -> bool {
        requested_model
            .to_ascii_lowercase()
            .contains(&self.token.to_ascii_lowercase())
    }
}

/// Documented default rule table: unavailable first-party families fall
/// back to DeepSeek.
pub fn default_transformer_rules() -> Vec<TransformerRule> {
    vec![
        TransformerRule::new("claude", "deepseek"),
        TransformerRule::new("gpt", "deepseek"),
        TransformerRule::new("gemini", "deepseek"),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay: f64,
    pub max_delay: f64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: 3,
            base_delay: 1.0,
            max_delay: 60.0,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), in seconds.
    pub fn delay_for(&self, attempt: u32) -> f64 {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = (self.base_delay * self.backoff_multiplier.powi(exponent as i32))
            .min(self.max_delay);
        if self.jitter {
            delay * (0.5 + rand::random::<f64>() * 0.5)
        } else {
            delay
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub transformer_rules: Vec<TransformerRule>,
    pub default_route_key: String,
    /// Upstream request timeout in seconds, unless a model overrides it.
    pub upstream_timeout_secs: u64,
    pub image_fetch_timeout_secs: u64,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    /// Strategy name per provider (`round_robin`, `success_rate`,
    /// `least_used`, `weighted_random`, `hybrid`).
    pub strategies: HashMap<String, String>,
    pub pricing: PricingTable,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            transformer_rules: default_transformer_rules(),
            default_route_key: "chat".to_string(),
            upstream_timeout_secs: 30,
            image_fetch_timeout_secs: 30,
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            strategies: HashMap::new(),
            pricing: PricingTable::default(),
        }
    }
}
