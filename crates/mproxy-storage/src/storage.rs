//! SeaORM-backed persistence for routing rows, credentials, and request
//! logs. Runtime reads go through in-memory views; this layer loads them
//! at bootstrap and absorbs writebacks.

use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Schema,
};
use time::OffsetDateTime;

use mproxy_core::resolver::ModelConfig;
use mproxy_pool::ApiKey;

use crate::crypto::{CryptoError, SecretCipher, mask_key, validate_key_strength};
use crate::db;
use crate::entities;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("rejected key: {0}")]
    WeakKey(String),
}

pub struct SqlStorage {
    db: DatabaseConnection,
    cipher: SecretCipher,
}

impl SqlStorage {
    pub async fn connect(dsn: &str, master_secret: &str) -> StorageResult<Self> {
        let db = db::connect_shared(dsn).await?;
        Ok(Self {
            db,
            cipher: SecretCipher::new(master_secret),
        })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Entity-first schema sync.
    pub async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::ModelConfigs)
            .register(entities::ApiKeys)
            .register(entities::RequestLogs)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    pub async fn load_model_configs(&self) -> StorageResult<Vec<ModelConfig>> {
        use entities::model_configs::Column;
        let rows = entities::ModelConfigs::find()
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| ModelConfig {
                id: row.id,
                route_key: row.route_key,
                target_model: row.target_model,
                provider: row.provider,
                prompt_keywords: row.prompt_keywords.unwrap_or_default(),
                description: row.description,
                enabled: row.enabled,
                api_base: row.api_base,
                auth_header: row.auth_header,
                auth_format: row.auth_format,
            })
            .collect())
    }

    /// Load every key row, decrypting secrets. Rows that fail to decrypt
    /// (master key changed, corrupted blob) are skipped with a warning
    /// rather than poisoning the whole pool.
    pub async fn load_api_keys(&self) -> StorageResult<Vec<ApiKey>> {
        use entities::api_keys::Column;
        let rows = entities::ApiKeys::find()
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let secret = match self.cipher.decrypt(&row.secret_ciphertext) {
                Ok(secret) => secret,
                Err(err) => {
                    tracing::warn!(key_id = row.id, %err, "skipping undecryptable key");
                    continue;
                }
            };
            keys.push(ApiKey {
                id: row.id,
                provider: row.provider,
                secret,
                auth_header: row.auth_header,
                auth_format: row.auth_format,
                enabled: row.enabled,
                requests_count: row.requests_count.max(0) as u64,
                success_count: row.success_count.max(0) as u64,
                error_count: row.error_count.max(0) as u64,
                last_request_time: row.last_request_time,
                rate_limited_until: row.rate_limited_until,
                consecutive_errors: row.consecutive_errors.max(0) as u32,
                total_tokens: row.total_tokens,
                input_tokens: row.input_tokens,
                output_tokens: row.output_tokens,
                avg_latency: row.avg_latency,
                cost: row.cost,
                last_error: row.last_error,
                last_rotation: row.last_rotation,
                requests_at_last_rotation: row.requests_at_last_rotation.max(0) as u64,
                flagged_for_rotation: row.flagged_for_rotation,
            });
        }
        Ok(keys)
    }

    /// Store a new key: strength-checked, encrypted, masked in the log.
    pub async fn insert_api_key(
        &self,
        provider: &str,
        secret: &str,
        auth_header: Option<&str>,
        auth_format: Option<&str>,
    ) -> StorageResult<i64> {
        validate_key_strength(secret).map_err(StorageError::WeakKey)?;
        let ciphertext = self.cipher.encrypt(secret)?;

        let now = OffsetDateTime::now_utc();
        let active = entities::api_keys::ActiveModel {
            id: ActiveValue::NotSet,
            provider: ActiveValue::Set(provider.to_string()),
            secret_ciphertext: ActiveValue::Set(ciphertext),
            auth_header: ActiveValue::Set(
                auth_header.unwrap_or("Authorization").to_string(),
            ),
            auth_format: ActiveValue::Set(auth_format.unwrap_or("Bearer {key}").to_string()),
            enabled: ActiveValue::Set(true),
            requests_count: ActiveValue::Set(0),
            success_count: ActiveValue::Set(0),
            error_count: ActiveValue::Set(0),
            last_request_time: ActiveValue::Set(None),
            rate_limited_until: ActiveValue::Set(None),
            consecutive_errors: ActiveValue::Set(0),
            total_tokens: ActiveValue::Set(0),
            input_tokens: ActiveValue::Set(0),
            output_tokens: ActiveValue::Set(0),
            avg_latency: ActiveValue::Set(0.0),
            cost: ActiveValue::Set(0.0),
            last_error: ActiveValue::Set(None),
            last_rotation: ActiveValue::Set(None),
            requests_at_last_rotation: ActiveValue::Set(0),
            flagged_for_rotation: ActiveValue::Set(false),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };
        let inserted = active.insert(&self.db).await?;
        tracing::info!(
            key_id = inserted.id,
            provider,
            key = %mask_key(secret),
            "api key stored"
        );
        Ok(inserted.id)
    }

    /// Write back one key's live statistics.
    pub async fn persist_key_stats(&self, key: &ApiKey) -> StorageResult<()> {
        let active = entities::api_keys::ActiveModel {
            id: ActiveValue::Set(key.id),
            enabled: ActiveValue::Set(key.enabled),
            requests_count: ActiveValue::Set(key.requests_count as i64),
            success_count: ActiveValue::Set(key.success_count as i64),
            error_count: ActiveValue::Set(key.error_count as i64),
            last_request_time: ActiveValue::Set(key.last_request_time),
            rate_limited_until: ActiveValue::Set(key.rate_limited_until),
            consecutive_errors: ActiveValue::Set(key.consecutive_errors as i32),
            total_tokens: ActiveValue::Set(key.total_tokens),
            input_tokens: ActiveValue::Set(key.input_tokens),
            output_tokens: ActiveValue::Set(key.output_tokens),
            avg_latency: ActiveValue::Set(key.avg_latency),
            cost: ActiveValue::Set(key.cost),
            last_error: ActiveValue::Set(key.last_error.clone()),
            last_rotation: ActiveValue::Set(key.last_rotation),
            requests_at_last_rotation: ActiveValue::Set(key.requests_at_last_rotation as i64),
            flagged_for_rotation: ActiveValue::Set(key.flagged_for_rotation),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        active.update(&self.db).await?;
        Ok(())
    }

    /// Seed the default route rows on an empty database so a fresh
    /// install can serve the documented model names immediately.
    pub async fn seed_default_models(&self) -> StorageResult<()> {
        use entities::model_configs::Column;
        let existing = entities::ModelConfigs::find().count(&self.db).await?;
        if existing > 0 {
            return Ok(());
        }

        let defaults: &[(&str, &str, &str, &str)] = &[
            ("gpt-4", "gpt-4", "openai", "gpt4,openai"),
            ("gpt-3.5-turbo", "gpt-3.5-turbo", "openai", ""),
            (
                "claude-3-sonnet",
                "claude-3-sonnet-20240229",
                "anthropic",
                "claude,sonnet",
            ),
            ("gemini-pro", "gemini-pro", "gemini", "gemini"),
            ("deepseek-chat", "deepseek-chat", "deepseek", ""),
            ("deepseek-reasoner", "deepseek-reasoner", "deepseek", "reasoner"),
            ("chat", "deepseek-chat", "deepseek", ""),
        ];

        let now = OffsetDateTime::now_utc();
        for (route_key, target_model, provider, keywords) in defaults {
            // Route keys stay unique among enabled rows.
            let duplicate = entities::ModelConfigs::find()
                .filter(Column::RouteKey.eq(*route_key))
                .count(&self.db)
                .await?;
            if duplicate > 0 {
                continue;
            }
            let active = entities::model_configs::ActiveModel {
                id: ActiveValue::NotSet,
                route_key: ActiveValue::Set(route_key.to_string()),
                target_model: ActiveValue::Set(target_model.to_string()),
                provider: ActiveValue::Set(provider.to_string()),
                prompt_keywords: ActiveValue::Set(
                    (!keywords.is_empty()).then(|| keywords.to_string()),
                ),
                description: ActiveValue::Set(None),
                enabled: ActiveValue::Set(true),
                api_base: ActiveValue::Set(None),
                auth_header: ActiveValue::Set(None),
                auth_format: ActiveValue::Set(None),
                created_at: ActiveValue::Set(now),
                updated_at: ActiveValue::Set(now),
            };
            active.insert(&self.db).await?;
        }
        tracing::info!("seeded default model routes");
        Ok(())
    }
}
