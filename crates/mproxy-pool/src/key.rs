//! Upstream credential records and their live statistics.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub type KeyId = i64;

/// Current wall-clock time as fractional epoch seconds.
pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

const ROTATION_MAX_CONSECUTIVE_ERRORS: u32 = 3;
const ROTATION_MAX_ERROR_RATIO: f64 = 0.20;
const ROTATION_MAX_REQUESTS: u64 = 10_000;
const ROTATION_MAX_AGE_SECONDS: f64 = 7.0 * 24.0 * 60.0 * 60.0;

/// One upstream API key plus the statistics accumulated over its lifetime.
///
/// `secret` holds the decrypted key material; it must never reach logs in
/// full (see the masking helpers in the storage crate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: KeyId,
    pub provider: String,
    pub secret: String,
    pub auth_header: String,
    pub auth_format: String,
    pub enabled: bool,

    pub requests_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub last_request_time: Option<f64>,
    pub rate_limited_until: Option<f64>,
    pub consecutive_errors: u32,

    pub total_tokens: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub avg_latency: f64,
    pub cost: f64,
    pub last_error: Option<String>,

    pub last_rotation: Option<f64>,
    pub requests_at_last_rotation: u64,
    pub flagged_for_rotation: bool,
}

impl ApiKey {
    pub fn new(id: KeyId, provider: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id,
            provider: provider.into(),
            secret: secret.into(),
            auth_header: "Authorization".to_string(),
            auth_format: "Bearer {key}".to_string(),
            enabled: true,
            requests_count: 0,
            success_count: 0,
            error_count: 0,
            last_request_time: None,
            rate_limited_until: None,
            consecutive_errors: 0,
            total_tokens: 0,
            input_tokens: 0,
            output_tokens: 0,
            avg_latency: 0.0,
            cost: 0.0,
            last_error: None,
            last_rotation: None,
            requests_at_last_rotation: 0,
            flagged_for_rotation: false,
        }
    }

    /// Fresh keys get the benefit of the doubt.
    pub fn success_rate(&self) -> f64 {
        if self.requests_count == 0 {
            return 1.0;
        }
        self.success_count as f64 / self.requests_count as f64
    }

    pub fn is_rate_limited(&self, now: f64) -> bool {
        match self.rate_limited_until {
            Some(until) => now < until,
            None => false,
        }
    }

    pub fn is_available(&self, now: f64) -> bool {
        self.enabled && !self.is_rate_limited(now)
    }

    /// Whether usage patterns warrant retiring this key.
    pub fn needs_rotation(&self, now: f64) -> bool {
        if self.consecutive_errors >= ROTATION_MAX_CONSECUTIVE_ERRORS {
            return true;
        }
        if self.requests_count > 0
            && self.error_count as f64 / self.requests_count as f64 > ROTATION_MAX_ERROR_RATIO
        {
            return true;
        }
        if let Some(last_rotation) = self.last_rotation {
            if self.requests_count.saturating_sub(self.requests_at_last_rotation)
                > ROTATION_MAX_REQUESTS
            {
                return true;
            }
            if now - last_rotation > ROTATION_MAX_AGE_SECONDS {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_key_has_perfect_success_rate() {
        let key = ApiKey::new(1, "openai", "sk-something-long");
        assert_eq!(key.success_rate(), 1.0);
        assert!(key.is_available(epoch_now()));
        assert!(!key.needs_rotation(epoch_now()));
    }

    #[test]
    fn rate_limit_window_is_clock_relative() {
        let mut key = ApiKey::new(1, "openai", "sk-something-long");
        key.rate_limited_until = Some(1_000.0);
        assert!(key.is_rate_limited(999.0));
        assert!(!key.is_rate_limited(1_000.0));
        assert!(!key.is_available(999.0));
        assert!(key.is_available(1_000.0));
    }

    #[test]
    fn rotation_triggers() {
        let now = epoch_now();

        let mut by_errors = ApiKey::new(1, "openai", "sk-a");
        by_errors.consecutive_errors = 3;
        assert!(by_errors.needs_rotation(now));

        let mut by_ratio = ApiKey::new(2, "openai", "sk-b");
        by_ratio.requests_count = 10;
        by_ratio.error_count = 3;
        by_ratio.success_count = 7;
        assert!(by_ratio.needs_rotation(now));

        let mut by_volume = ApiKey::new(3, "openai", "sk-c");
        by_volume.last_rotation = Some(now);
        by_volume.requests_count = 10_001;
        by_volume.requests_at_last_rotation = 0;
        assert!(by_volume.needs_rotation(now));

        let mut by_age = ApiKey::new(4, "openai", "sk-d");
        by_age.last_rotation = Some(now - 8.0 * 24.0 * 3600.0);
        assert!(by_age.needs_rotation(now));

        // Volume/age criteria only apply once a rotation has happened.
        let mut never_rotated = ApiKey::new(5, "openai", "sk-e");
        never_rotated.requests_count = 50_000;
        never_rotated.success_count = 50_000;
        assert!(!never_rotated.needs_rotation(now));
    }
}
