//! The credential pool: per-provider key sets, availability filtering,
//! strategy-driven selection, and statistics updates.
//!
//! All mutation happens under the pool's write lock, so a single key's
//! statistics never tear. Read paths clone snapshots and accept staleness.

use std::collections::HashMap;

use tokio::sync::RwLock;

use mproxy_protocol::openai::Usage;

use crate::context::RequestContext;
use crate::key::{ApiKey, KeyId, epoch_now};
use crate::pricing::PricingTable;
use crate::strategy::StrategyRegistry;

const LAST_ERROR_MAX_CHARS: usize = 255;
const RATE_LIMIT_BASE_SECONDS: f64 = 60.0;
const RATE_LIMIT_MAX_SECONDS: f64 = 3600.0;
const SERVER_ERROR_BACKOFF_SECONDS: f64 = 30.0;

/// What happened to one upstream request, as reported back to the pool.
#[derive(Debug, Clone, Default)]
pub struct RequestOutcome {
    pub success: bool,
    pub status_code: Option<u16>,
    pub usage: Option<Usage>,
    pub latency_seconds: Option<f64>,
    pub model: Option<String>,
    pub error: Option<String>,
}

impl RequestOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(status_code: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_latency(mut self, seconds: f64) -> Self {
        self.latency_seconds = Some(seconds);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RotateError {
    #[error("key {0} not found")]
    NotFound(KeyId),
    #[error("keys {0} and {1} belong to different providers")]
    ProviderMismatch(KeyId, KeyId),
    #[error("replacement key {0} is disabled")]
    ReplacementDisabled(KeyId),
}

/// One line of a rotation sweep report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationOutcome {
    pub flagged: KeyId,
    pub provider: String,
    pub replacement: Option<KeyId>,
    pub rotated: bool,
    pub reason: String,
}

pub struct KeyPool {
    keys: RwLock<HashMap<KeyId, ApiKey>>,
    by_provider: RwLock<HashMap<String, Vec<KeyId>>>,
    strategies: StrategyRegistry,
    pricing: PricingTable,
}

impl Default for KeyPool {
    fn default() -> Self {
        Self::new(StrategyRegistry::new(), PricingTable::default())
    }
}

impl KeyPool {
    pub fn new(strategies: StrategyRegistry, pricing: PricingTable) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            by_provider: RwLock::new(HashMap::new()),
            strategies,
            pricing,
        }
    }

    pub fn strategies(&self) -> &StrategyRegistry {
        &self.strategies
    }

    pub async fn insert(&self, key: ApiKey) {
        let id = key.id;
        let provider = key.provider.clone();
        self.keys.write().await.insert(id, key);

        let mut by_provider = self.by_provider.write().await;
        let ids = by_provider.entry(provider).or_default();
        if !ids.contains(&id) {
            ids.push(id);
            ids.sort_unstable();
        }
    }

    pub async fn remove(&self, id: KeyId) -> Option<ApiKey> {
        let removed = self.keys.write().await.remove(&id)?;
        let mut by_provider = self.by_provider.write().await;
        if let Some(ids) = by_provider.get_mut(&removed.provider) {
            ids.retain(|entry| *entry != id);
        }
        Some(removed)
    }

    pub async fn get(&self, id: KeyId) -> Option<ApiKey> {
        self.keys.read().await.get(&id).cloned()
    }

    pub async fn set_enabled(&self, id: KeyId, enabled: bool) -> bool {
        let mut keys = self.keys.write().await;
        match keys.get_mut(&id) {
            Some(key) => {
                key.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub async fn snapshot(&self) -> Vec<ApiKey> {
        let keys = self.keys.read().await;
        let mut rows: Vec<ApiKey> = keys.values().cloned().collect();
        rows.sort_unstable_by_key(|key| key.id);
        rows
    }

    /// Keys of `provider` that are enabled and not rate limited, in id
    /// order. Expired rate-limit windows are cleared while filtering.
    pub async fn available(&self, provider: &str) -> Vec<ApiKey> {
        let now = epoch_now();
        let ids = {
            let by_provider = self.by_provider.read().await;
            match by_provider.get(provider) {
                Some(ids) => ids.clone(),
                None => return Vec::new(),
            }
        };

        let mut keys = self.keys.write().await;
        let mut candidates = Vec::new();
        for id in ids {
            let Some(key) = keys.get_mut(&id) else {
                continue;
            };
            if let Some(until) = key.rate_limited_until
                && now >= until
            {
                key.rate_limited_until = None;
            }
            if key.is_available(now) {
                candidates.push(key.clone());
            }
        }
        candidates
    }

    pub async fn has_available(&self, provider: &str) -> bool {
        !self.available(provider).await.is_empty()
    }

    /// Pick one key for the request, via the provider's bound strategy.
    pub async fn select(&self, ctx: &RequestContext) -> Option<ApiKey> {
        let candidates = self.available(&ctx.provider).await;
        if candidates.is_empty() {
            tracing::warn!(provider = %ctx.provider, "no available keys");
            return None;
        }
        let strategy = self.strategies.strategy_for(&ctx.provider);
        let selected = strategy.select(&candidates, ctx)?;
        let key = candidates.into_iter().find(|key| key.id == selected)?;
        tracing::debug!(
            provider = %ctx.provider,
            strategy = strategy.name(),
            key_id = key.id,
            requests = key.requests_count,
            "selected upstream key"
        );
        Some(key)
    }

    /// Fold one request's outcome into the key's statistics.
    ///
    /// Returns the post-update snapshot so callers can persist it.
    pub async fn observe(&self, id: KeyId, outcome: &RequestOutcome) -> Option<ApiKey> {
        let now = epoch_now();
        let mut keys = self.keys.write().await;
        let key = keys.get_mut(&id)?;

        key.requests_count += 1;
        key.last_request_time = Some(now);

        if outcome.success {
            key.success_count += 1;
            key.consecutive_errors = 0;

            if let Some(usage) = &outcome.usage {
                key.total_tokens += usage.total_tokens;
                key.input_tokens += usage.prompt_tokens;
                key.output_tokens += usage.completion_tokens;
                key.cost += self
                    .pricing
                    .cost_of(&key.provider, outcome.model.as_deref(), usage);
            }
            if let Some(latency) = outcome.latency_seconds {
                key.avg_latency = if key.avg_latency == 0.0 {
                    latency
                } else {
                    0.9 * key.avg_latency + 0.1 * latency
                };
            }
        } else {
            key.error_count += 1;
            key.consecutive_errors += 1;
            if let Some(error) = &outcome.error {
                key.last_error = Some(truncate_chars(error, LAST_ERROR_MAX_CHARS));
            }

            match outcome.status_code {
                Some(429) => {
                    let exponent = key.consecutive_errors.saturating_sub(1).min(30);
                    let backoff = (RATE_LIMIT_BASE_SECONDS * f64::from(1u32 << exponent))
                        .min(RATE_LIMIT_MAX_SECONDS);
                    key.rate_limited_until = Some(now + backoff);
                    tracing::warn!(key_id = id, backoff, "key rate limited");
                }
                Some(401) | Some(403) => {
                    key.enabled = false;
                    tracing::error!(key_id = id, "key disabled after auth error");
                }
                Some(status) if status >= 500 => {
                    key.rate_limited_until = Some(now + SERVER_ERROR_BACKOFF_SECONDS);
                    tracing::warn!(key_id = id, status, "key backing off after server error");
                }
                _ => {}
            }
        }

        if !key.flagged_for_rotation && key.needs_rotation(now) {
            key.flagged_for_rotation = true;
            tracing::warn!(
                key_id = id,
                provider = %key.provider,
                consecutive_errors = key.consecutive_errors,
                requests = key.requests_count,
                "key flagged for rotation"
            );
        }

        Some(key.clone())
    }

    /// Retire `old_id` in favor of `new_id` within the same provider.
    pub async fn rotate(&self, old_id: KeyId, new_id: KeyId) -> Result<(), RotateError> {
        let now = epoch_now();
        let mut keys = self.keys.write().await;

        let old = keys.get(&old_id).ok_or(RotateError::NotFound(old_id))?;
        let new = keys.get(&new_id).ok_or(RotateError::NotFound(new_id))?;
        if old.provider != new.provider {
            return Err(RotateError::ProviderMismatch(old_id, new_id));
        }
        if !new.enabled {
            return Err(RotateError::ReplacementDisabled(new_id));
        }

        let carried_latency = old.avg_latency;
        if let Some(new) = keys.get_mut(&new_id) {
            new.last_rotation = Some(now);
            new.requests_at_last_rotation = 0;
            new.avg_latency = carried_latency;
        }
        if let Some(old) = keys.get_mut(&old_id) {
            old.enabled = false;
            old.flagged_for_rotation = false;
        }
        tracing::info!(old_key = old_id, new_key = new_id, "key rotated");
        Ok(())
    }

    /// Rotate every flagged key whose provider still has a healthy
    /// replacement, pairing flagged keys with replacements round-robin.
    pub async fn rotation_sweep(&self) -> Vec<RotationOutcome> {
        let (flagged_by_provider, replacements_by_provider) = {
            let keys = self.keys.read().await;
            let mut flagged: HashMap<String, Vec<KeyId>> = HashMap::new();
            let mut replacements: HashMap<String, Vec<KeyId>> = HashMap::new();
            let mut rows: Vec<&ApiKey> = keys.values().collect();
            rows.sort_unstable_by_key(|key| key.id);
            for key in rows {
                if key.flagged_for_rotation {
                    flagged.entry(key.provider.clone()).or_default().push(key.id);
                } else if key.enabled {
                    replacements
                        .entry(key.provider.clone())
                        .or_default()
                        .push(key.id);
                }
            }
            (flagged, replacements)
        };

        let mut report = Vec::new();
        for (provider, flagged) in flagged_by_provider {
            let replacements = replacements_by_provider
                .get(&provider)
                .cloned()
                .unwrap_or_default();
            for (index, old_id) in flagged.into_iter().enumerate() {
                if replacements.is_empty() {
                    report.push(RotationOutcome {
                        flagged: old_id,
                        provider: provider.clone(),
                        replacement: None,
                        rotated: false,
                        reason: "no replacement available".to_string(),
                    });
                    continue;
                }
                let new_id = replacements[index % replacements.len()];
                match self.rotate(old_id, new_id).await {
                    Ok(()) => report.push(RotationOutcome {
                        flagged: old_id,
                        provider: provider.clone(),
                        replacement: Some(new_id),
                        rotated: true,
                        reason: "rotated".to_string(),
                    }),
                    Err(err) => report.push(RotationOutcome {
                        flagged: old_id,
                        provider: provider.clone(),
                        replacement: Some(new_id),
                        rotated: false,
                        reason: err.to_string(),
                    }),
                }
            }
        }
        report
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
