use serde_json::Value as JsonValue;

/// A translation failure. The half-translated payload is dropped; only the
/// adapter name, a message, and optional detail context survive.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{adapter} adapter: {message}")]
pub struct AdapterError {
    pub adapter: &'static str,
    pub message: String,
    pub details: Option<JsonValue>,
}

impl AdapterError {
    pub fn new(adapter: &'static str, message: impl Into<String>) -> Self {
        Self {
            adapter,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }

    pub fn decode(adapter: &'static str, err: serde_json::Error) -> Self {
        Self::new(adapter, format!("malformed native payload: {err}"))
    }
}
