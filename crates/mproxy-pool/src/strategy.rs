//! Pluggable key-selection strategies.
//!
//! Strategies rank an already availability-filtered candidate list; they
//! never mutate key statistics. The registry binds one strategy per
//! provider, falling back to `hybrid`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::context::RequestContext;
use crate::key::{ApiKey, KeyId};

pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick one key from `candidates`, or `None` when the list is empty.
    fn select(&self, candidates: &[ApiKey], ctx: &RequestContext) -> Option<KeyId>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    RoundRobin,
    SuccessRate,
    LeastUsed,
    WeightedRandom,
    Hybrid,
}

impl StrategyKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "round_robin" => Some(StrategyKind::RoundRobin),
            "success_rate" => Some(StrategyKind::SuccessRate),
            "least_used" => Some(StrategyKind::LeastUsed),
            "weighted_random" => Some(StrategyKind::WeightedRandom),
            "hybrid" => Some(StrategyKind::Hybrid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::RoundRobin => "round_robin",
            StrategyKind::SuccessRate => "success_rate",
            StrategyKind::LeastUsed => "least_used",
            StrategyKind::WeightedRandom => "weighted_random",
            StrategyKind::Hybrid => "hybrid",
        }
    }
}

#[derive(Default)]
pub struct RoundRobinStrategy {
    counters: Mutex<HashMap<String, usize>>,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, candidates: &[ApiKey], ctx: &RequestContext) -> Option<KeyId> {
        if candidates.is_empty() {
            return None;
        }
        let mut counters = self.counters.lock().ok()?;
        let counter = counters.entry(ctx.counter_key()).or_insert(0);
        let index = *counter % candidates.len();
        *counter = (index + 1) % candidates.len();
        Some(candidates[index].id)
    }
}

#[derive(Debug, Default)]
pub struct SuccessRateStrategy;

impl SelectionStrategy for SuccessRateStrategy {
    fn name(&self) -> &'static str {
        "success_rate"
    }

    fn select(&self, candidates: &[ApiKey], _ctx: &RequestContext) -> Option<KeyId> {
        candidates
            .iter()
            .enumerate()
            .min_by(|(ia, a), (ib, b)| {
                b.success_rate()
                    .partial_cmp(&a.success_rate())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.requests_count.cmp(&b.requests_count))
                    .then(ia.cmp(ib))
            })
            .map(|(_, key)| key.id)
    }
}

#[derive(Debug, Default)]
pub struct LeastUsedStrategy;

impl SelectionStrategy for LeastUsedStrategy {
    fn name(&self) -> &'static str {
        "least_used"
    }

    fn select(&self, candidates: &[ApiKey], _ctx: &RequestContext) -> Option<KeyId> {
        candidates
            .iter()
            .enumerate()
            .min_by(|(ia, a), (ib, b)| {
                a.requests_count
                    .cmp(&b.requests_count)
                    .then(
                        b.success_rate()
                            .partial_cmp(&a.success_rate())
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                    .then(ia.cmp(ib))
            })
            .map(|(_, key)| key.id)
    }
}

/// Samples proportionally to `success_rate / (requests_count + 1)`, biasing
/// toward reliable and lightly used keys.
#[derive(Debug, Default)]
pub struct WeightedRandomStrategy;

impl SelectionStrategy for WeightedRandomStrategy {
    fn name(&self) -> &'static str {
        "weighted_random"
    }

    fn select(&self, candidates: &[ApiKey], _ctx: &RequestContext) -> Option<KeyId> {
        if candidates.is_empty() {
            return None;
        }
        let weights: Vec<f64> = candidates
            .iter()
            .map(|key| key.success_rate() / (key.requests_count as f64 + 1.0))
            .collect();
        let total: f64 = weights.iter().sum();

        let mut rng = rand::rng();
        if total <= 0.0 {
            let index = rng.random_range(0..candidates.len());
            return Some(candidates[index].id);
        }

        let target = rng.random_range(0.0..total);
        let mut cumulative = 0.0;
        for (key, weight) in candidates.iter().zip(&weights) {
            cumulative += weight;
            if target <= cumulative {
                return Some(key.id);
            }
        }
        candidates.last().map(|key| key.id)
    }
}

/// Priority > 5 routes through success-rate; a lightly used pool (mean
/// requests < 10) through least-used; everything else round-robin.
pub struct HybridStrategy {
    round_robin: RoundRobinStrategy,
    success_rate: SuccessRateStrategy,
    least_used: LeastUsedStrategy,
}

impl Default for HybridStrategy {
    fn default() -> Self {
        Self {
            round_robin: RoundRobinStrategy::new(),
            success_rate: SuccessRateStrategy,
            least_used: LeastUsedStrategy,
        }
    }
}

impl HybridStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for HybridStrategy {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn select(&self, candidates: &[ApiKey], ctx: &RequestContext) -> Option<KeyId> {
        if candidates.is_empty() {
            return None;
        }
        if ctx.priority > 5 {
            return self.success_rate.select(candidates, ctx);
        }
        let mean_requests = candidates
            .iter()
            .map(|key| key.requests_count as f64)
            .sum::<f64>()
            / candidates.len() as f64;
        if mean_requests < 10.0 {
            return self.least_used.select(candidates, ctx);
        }
        self.round_robin.select(candidates, ctx)
    }
}

/// Strategy instances plus the per-provider bindings.
pub struct StrategyRegistry {
    strategies: HashMap<StrategyKind, Arc<dyn SelectionStrategy>>,
    per_provider: Mutex<HashMap<String, StrategyKind>>,
    default: StrategyKind,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        let mut strategies: HashMap<StrategyKind, Arc<dyn SelectionStrategy>> = HashMap::new();
        strategies.insert(
            StrategyKind::RoundRobin,
            Arc::new(RoundRobinStrategy::new()),
        );
        strategies.insert(StrategyKind::SuccessRate, Arc::new(SuccessRateStrategy));
        strategies.insert(StrategyKind::LeastUsed, Arc::new(LeastUsedStrategy));
        strategies.insert(
            StrategyKind::WeightedRandom,
            Arc::new(WeightedRandomStrategy),
        );
        strategies.insert(StrategyKind::Hybrid, Arc::new(HybridStrategy::new()));
        Self {
            strategies,
            per_provider: Mutex::new(HashMap::new()),
            default: StrategyKind::Hybrid,
        }
    }
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_provider(&self, provider: impl Into<String>, kind: StrategyKind) {
        if let Ok(mut guard) = self.per_provider.lock() {
            guard.insert(provider.into(), kind);
        }
    }

    pub fn kind_for(&self, provider: &str) -> StrategyKind {
        self.per_provider
            .lock()
            .ok()
            .and_then(|guard| guard.get(provider).copied())
            .unwrap_or(self.default)
    }

    pub fn strategy_for(&self, provider: &str) -> Arc<dyn SelectionStrategy> {
        let kind = self.kind_for(provider);
        self.strategies
            .get(&kind)
            .or_else(|| self.strategies.get(&StrategyKind::Hybrid))
            .cloned()
            .expect("hybrid strategy is always registered")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: KeyId, requests: u64, successes: u64) -> ApiKey {
        let mut key = ApiKey::new(id, "openai", format!("sk-test-key-{id}"));
        key.requests_count = requests;
        key.success_count = successes;
        key.error_count = requests - successes;
        key
    }

    #[test]
    fn round_robin_advances_per_model() {
        let strategy = RoundRobinStrategy::new();
        let keys = vec![key(1, 0, 0), key(2, 0, 0), key(3, 0, 0)];
        let ctx_a = RequestContext::new("openai").with_model("gpt-4");
        let ctx_b = RequestContext::new("openai").with_model("gpt-3.5-turbo");

        assert_eq!(strategy.select(&keys, &ctx_a), Some(1));
        assert_eq!(strategy.select(&keys, &ctx_a), Some(2));
        // A different model has its own counter.
        assert_eq!(strategy.select(&keys, &ctx_b), Some(1));
        assert_eq!(strategy.select(&keys, &ctx_a), Some(3));
        assert_eq!(strategy.select(&keys, &ctx_a), Some(1));
    }

    #[test]
    fn success_rate_prefers_reliable_then_least_used() {
        let strategy = SuccessRateStrategy;
        let ctx = RequestContext::new("openai");
        let keys = vec![key(1, 100, 90), key(2, 50, 50), key(3, 10, 10)];
        // Keys 2 and 3 tie on rate 1.0; the less-used one wins.
        assert_eq!(strategy.select(&keys, &ctx), Some(3));
    }

    #[test]
    fn least_used_prefers_low_volume() {
        let strategy = LeastUsedStrategy;
        let ctx = RequestContext::new("openai");
        let keys = vec![key(1, 5, 5), key(2, 2, 1), key(3, 9, 9)];
        assert_eq!(strategy.select(&keys, &ctx), Some(2));
    }

    #[test]
    fn weighted_random_only_returns_candidates() {
        let strategy = WeightedRandomStrategy;
        let ctx = RequestContext::new("openai");
        let keys = vec![key(1, 0, 0), key(2, 1000, 100)];
        for _ in 0..50 {
            let picked = strategy.select(&keys, &ctx).unwrap();
            assert!(picked == 1 || picked == 2);
        }
    }

    #[test]
    fn hybrid_switches_on_priority_and_volume() {
        let strategy = HybridStrategy::new();
        // High priority: success-rate ordering.
        let high = RequestContext::new("openai").with_priority(6);
        let keys = vec![key(1, 100, 50), key(2, 100, 99)];
        assert_eq!(strategy.select(&keys, &high), Some(2));

        // Young pool: least-used ordering.
        let normal = RequestContext::new("openai");
        let young = vec![key(1, 8, 8), key(2, 3, 3)];
        assert_eq!(strategy.select(&young, &normal), Some(2));
    }

    #[test]
    fn registry_binds_per_provider() {
        let registry = StrategyRegistry::new();
        assert_eq!(registry.kind_for("openai"), StrategyKind::Hybrid);
        registry.bind_provider("openai", StrategyKind::LeastUsed);
        assert_eq!(registry.kind_for("openai"), StrategyKind::LeastUsed);
        assert_eq!(registry.strategy_for("openai").name(), "least_used");
        assert_eq!(registry.kind_for("gemini"), StrategyKind::Hybrid);
    }

    #[test]
    fn strategy_kind_parses_known_names() {
        assert_eq!(
            StrategyKind::parse("weighted_random"),
            Some(StrategyKind::WeightedRandom)
        );
        assert_eq!(StrategyKind::parse("unknown"), None);
    }
}
