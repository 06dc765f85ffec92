//! Per-request context consumed by selection strategies.

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub provider: String,
    pub model: Option<String>,
    pub request_type: String,
    pub priority: i32,
    pub user_id: Option<String>,
    pub request_size: Option<usize>,
}

impl RequestContext {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: None,
            request_type: "chat_completion".to_string(),
            priority: 0,
            user_id: None,
            request_size: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Key for the per-`(provider, model)` round-robin counters.
    pub fn counter_key(&self) -> String {
        format!(
            "{}_{}",
            self.provider,
            self.model.as_deref().unwrap_or("default")
        )
    }
}
