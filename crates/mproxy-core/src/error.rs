//! The request-path error taxonomy and its HTTP mapping.

use serde_json::{Value as JsonValue, json};

use mproxy_transform::AdapterError;

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{0}")]
    Validation(String),

    #[error("no route for model '{0}'")]
    ModelNotFound(String),

    #[error("no available key for provider '{0}'")]
    NoAvailableKey(String),

    #[error("upstream authentication failed: {0}")]
    Authentication(String),

    #[error("upstream rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<u64>,
    },

    #[error("upstream unavailable: {0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("upstream error ({status}): {message}")]
    Provider { status: u16, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error [{request_id}]: {message}")]
    Internal {
        request_id: String,
        message: String,
    },
}

impl ProxyError {
    /// Wrap an unexpected failure, stamping a request id that also goes to
    /// the log so operators can correlate.
    pub fn internal(message: impl Into<String>) -> Self {
        let request_id = uuid::Uuid::new_v4().to_string();
        let message = message.into();
        tracing::error!(request_id, %message, "internal error");
        ProxyError::Internal {
            request_id,
            message,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::Validation(_) => 400,
            ProxyError::ModelNotFound(_) => 404,
            ProxyError::NoAvailableKey(_) => 503,
            ProxyError::Authentication(_) => 401,
            ProxyError::RateLimit { .. } => 429,
            ProxyError::ServiceUnavailable(_) => 502,
            ProxyError::Adapter(_) => 500,
            ProxyError::Provider { status, .. } => *status,
            ProxyError::Configuration(_) => 500,
            ProxyError::Internal { .. } => 500,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Validation(_) => "validation_error",
            ProxyError::ModelNotFound(_) => "model_not_found",
            ProxyError::NoAvailableKey(_) => "no_available_key",
            ProxyError::Authentication(_) => "authentication_error",
            ProxyError::RateLimit { .. } => "rate_limit_error",
            ProxyError::ServiceUnavailable(_) => "service_unavailable",
            ProxyError::Adapter(_) => "adapter_error",
            ProxyError::Provider { .. } => "provider_error",
            ProxyError::Configuration(_) => "configuration_error",
            ProxyError::Internal { .. } => "internal_error",
        }
    }

    /// The JSON body clients receive (and the payload of mid-stream error
    /// frames).
    pub fn to_body(&self) -> JsonValue {
        let mut error = json!({
            "message": self.to_string(),
            "type": self.kind(),
        });
        if let ProxyError::RateLimit {
            retry_after: Some(seconds),
            ..
        } = self
        {
            error["retry_after"] = json!(seconds);
        }
        if let ProxyError::Adapter(err) = self
            && let Some(details) = &err.details
        {
            error["details"] = details.clone();
        }
        json!({ "error": error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(ProxyError::Validation("x".into()).status_code(), 400);
        assert_eq!(ProxyError::ModelNotFound("m".into()).status_code(), 404);
        assert_eq!(ProxyError::NoAvailableKey("p".into()).status_code(), 503);
        assert_eq!(ProxyError::Authentication("a".into()).status_code(), 401);
        assert_eq!(
            ProxyError::RateLimit {
                message: "slow down".into(),
                retry_after: Some(30)
            }
            .status_code(),
            429
        );
        assert_eq!(
            ProxyError::Provider {
                status: 418,
                message: "teapot".into()
            }
            .status_code(),
            418
        );
    }

    #[test]
    fn body_carries_type_and_retry_after() {
        let body = ProxyError::RateLimit {
            message: "slow down".into(),
            retry_after: Some(30),
        }
        .to_body();
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert_eq!(body["error"]["retry_after"], 30);

        let plain = ProxyError::ModelNotFound("gpt-9".into()).to_body();
        assert_eq!(plain["error"]["type"], "model_not_found");
        assert!(plain["error"].get("retry_after").is_none());
    }

    #[test]
    fn internal_errors_carry_a_request_id() {
        let err = ProxyError::internal("boom");
        match err {
            ProxyError::Internal { request_id, .. } => assert!(!request_id.is_empty()),
            _ => panic!("expected internal"),
        }
    }
}
