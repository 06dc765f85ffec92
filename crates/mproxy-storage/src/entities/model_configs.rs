use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "model_configs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub route_key: String,
    pub target_model: String,
    pub provider: String,
    pub prompt_keywords: Option<String>,
    pub description: Option<String>,
    pub enabled: bool,
    pub api_base: Option<String>,
    pub auth_header: Option<String>,
    pub auth_format: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
