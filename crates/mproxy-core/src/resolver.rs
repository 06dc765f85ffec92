//! Model routing: requested model name to `(provider, target_model)` plus
//! a usable credential, through the five-stage match.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use mproxy_pool::{ApiKey, KeyPool, RequestContext};

use crate::config::TransformerRule;
use crate::error::{ProxyError, ProxyResult};

/// One routing row, as loaded from storage. `route_key` is the externally
/// visible name; `target_model` is what the upstream sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: i64,
    pub route_key: String,
    pub target_model: String,
    pub provider: String,
    #[serde(default)]
    pub prompt_keywords: String,
    #[serde(default)]
    pub description: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub auth_header: Option<String>,
    #[serde(default)]
    pub auth_format: Option<String>,
}

impl ModelConfig {
    /// Non-empty keyword tokens from the comma-separated column.
    pub fn keywords(&self) -> impl Iterator<Item = &str> {
        self.prompt_keywords
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}

/// Read-mostly view of the enabled model rows. Swapped wholesale when
/// admin mutations invalidate it.
#[derive(Default)]
pub struct ModelView {
    rows: ArcSwap<Vec<ModelConfig>>,
}

impl ModelView {
    pub fn new(rows: Vec<ModelConfig>) -> Self {
        let view = Self::default();
        view.replace(rows);
        view
    }

    /// Install a new snapshot, keeping only enabled rows in id order.
    pub fn replace(&self, mut rows: Vec<ModelConfig>) {
        rows.retain(|row| row.enabled);
        rows.sort_unstable_by_key(|row| row.id);
        self.rows.store(Arc::new(rows));
    }

    pub fn load(&self) -> Arc<Vec<ModelConfig>> {
        self.rows.load_full()
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub model: ModelConfig,
    pub key: ApiKey,
}

pub struct ModelResolver {
    view: Arc<ModelView>,
    transformer_rules: Vec<TransformerRule>,
    default_route_key: String,
}

impl ModelResolver {
    pub fn new(
        view: Arc<ModelView>,
        transformer_rules: Vec<TransformerRule>,
        default_route_key: impl Into<String>,
    ) -> Self {
        Self {
            view,
            transformer_rules,
            default_route_key: default_route_key.into(),
        }
    }

    pub fn view(&self) -> &ModelView {
        &self.view
    }

    /// Full five-stage resolution. Stages match in order and each stage
    /// only accepts when the matched provider currently has a usable key;
    /// a key-less match records itself so the terminal error distinguishes
    /// `NoAvailableKey` from `ModelNotFound`.
    pub async fn resolve(
        &self,
        requested_model: &str,
        pool: &KeyPool,
        priority: i32,
    ) -> ProxyResult<Resolution> {
        let rows = self.view.load();
        let mut starved_provider: Option<String> = None;

        // Stage 1: exact route_key match.
        if let Some(row) = rows.iter().find(|row| row.route_key == requested_model) {
            match self.accept(row, pool, priority).await {
                Some(resolution) => return Ok(resolution),
                None => {
                    tracing::info!(
                        model = requested_model,
                        provider = %row.provider,
                        "route key matched but provider has no key, continuing"
                    );
                    starved_provider = Some(row.provider.clone());
                }
            }
        }

        // Stage 2: exact target_model match.
        if let Some(row) = rows.iter().find(|row| row.target_model == requested_model) {
            match self.accept(row, pool, priority).await {
                Some(resolution) => return Ok(resolution),
                None => starved_provider = Some(row.provider.clone()),
            }
        }

        // Stage 3: transformer fallback by family token.
        if let Some(rule) = self
            .transformer_rules
            .iter()
            .find(|rule| rule.matches(requested_model))
        {
            if let Some(row) = rows.iter().find(|row| row.provider == rule.provider) {
                tracing::info!(
                    model = requested_model,
                    token = %rule.token,
                    provider = %rule.provider,
                    "transformer fallback engaged"
                );
                match self.accept(row, pool, priority).await {
                    Some(resolution) => return Ok(resolution),
                    None => starved_provider = Some(row.provider.clone()),
                }
            }
        }

        // Stage 4: weak matches, rows in id order, predicates in order.
        for row in rows.iter() {
            let weak_match = requested_model.starts_with(&row.provider)
                || requested_model.contains(&row.route_key)
                || row.route_key.contains(requested_model)
                || row.keywords().any(|token| requested_model.contains(token));
            if !weak_match {
                continue;
            }
            match self.accept(row, pool, priority).await {
                Some(resolution) => return Ok(resolution),
                None => starved_provider = Some(row.provider.clone()),
            }
        }

        // Stage 5: the default chat row.
        if let Some(row) = rows
            .iter()
            .find(|row| row.route_key == self.default_route_key)
        {
            match self.accept(row, pool, priority).await {
                Some(resolution) => return Ok(resolution),
                None => starved_provider = Some(row.provider.clone()),
            }
        }

        match starved_provider {
            Some(provider) => Err(ProxyError::NoAvailableKey(provider)),
            None => Err(ProxyError::ModelNotFound(requested_model.to_string())),
        }
    }

    /// Forced-provider resolution: stage 1 restricted to one provider, no
    /// transformer fallback.
    pub async fn resolve_for_provider(
        &self,
        provider: &str,
        pool: &KeyPool,
        priority: i32,
    ) -> ProxyResult<Resolution> {
        let rows = self.view.load();
        let Some(row) = rows.iter().find(|row| row.provider == provider) else {
            return Err(ProxyError::ModelNotFound(provider.to_string()));
        };
        self.accept(row, pool, priority)
            .await
            .ok_or_else(|| ProxyError::NoAvailableKey(provider.to_string()))
    }

    async fn accept(
        &self,
        row: &ModelConfig,
        pool: &KeyPool,
        priority: i32,
    ) -> Option<Resolution> {
        let ctx = RequestContext::new(row.provider.clone())
            .with_model(row.target_model.clone())
            .with_priority(priority);
        let key = pool.select(&ctx).await?;
        Some(Resolution {
            model: row.clone(),
            key,
        })
    }
}
