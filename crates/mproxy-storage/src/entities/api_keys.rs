use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Upstream credentials plus their accumulated statistics. The secret is
/// ciphertext at rest; statistic timestamps are fractional epoch seconds
/// to match the in-memory pool's clock.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub provider: String,
    pub secret_ciphertext: String,
    pub auth_header: String,
    pub auth_format: String,
    pub enabled: bool,
    pub requests_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub last_request_time: Option<f64>,
    pub rate_limited_until: Option<f64>,
    pub consecutive_errors: i32,
    pub total_tokens: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub avg_latency: f64,
    pub cost: f64,
    pub last_error: Option<String>,
    pub last_rotation: Option<f64>,
    pub requests_at_last_rotation: i64,
    pub flagged_for_rotation: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
