use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub at: OffsetDateTime,
    pub source_api: String,
    pub target_api: String,
    pub source_model: String,
    pub target_model: String,
    pub provider: String,
    pub request_body: String,
    pub response_body: Option<String>,
    pub status_code: i32,
    pub error_message: Option<String>,
    pub processing_seconds: f64,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
