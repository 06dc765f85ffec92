pub mod api_keys;
pub mod model_configs;
pub mod request_logs;

pub use api_keys::Entity as ApiKeys;
pub use model_configs::Entity as ModelConfigs;
pub use request_logs::Entity as RequestLogs;
