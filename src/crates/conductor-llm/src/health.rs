//! Per-(provider, model) health tracking.
//!
//! Each registered failover key carries success/failure counters, a rolling
//! latency average, and a cooldown deadline derived from the classified
//! failure reason. An entry is available iff its cooldown has elapsed.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::warn;

/// Why a failover was triggered, classified from the error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverReason {
    RateLimit,
    Timeout,
    ApiError,
    Authentication,
    QuotaExceeded,
    ModelUnavailable,
    Unknown,
}

impl FailoverReason {
    /// Classify an error message by substring patterns.
    ///
    /// Order matters: rate-limit phrasing often also contains "limit", and
    /// generic "error" must be the last resort before `Unknown`.
    pub fn classify(error: &str) -> Self {
        let lower = error.to_lowercase();
        let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if any(&["rate limit", "too many requests", "429", "throttl"]) {
            FailoverReason::RateLimit
        } else if any(&["timeout", "timed out"]) {
            FailoverReason::Timeout
        } else if any(&["quota", "exceeded", "limit exceeded"]) {
            FailoverReason::QuotaExceeded
        } else if any(&["auth", "unauthorized", "401", "403", "api key"]) {
            FailoverReason::Authentication
        } else if any(&["not found", "404", "unavailable", "does not exist"]) {
            FailoverReason::ModelUnavailable
        } else if any(&["error", "500", "502", "503"]) {
            FailoverReason::ApiError
        } else {
            FailoverReason::Unknown
        }
    }

    /// Cooldown applied to the failed entry for this reason.
    pub fn cooldown(&self) -> Duration {
        let secs = match self {
            FailoverReason::RateLimit => 300,
            FailoverReason::QuotaExceeded => 3600,
            FailoverReason::Timeout => 60,
            FailoverReason::ApiError => 120,
            FailoverReason::Authentication => 0,
            FailoverReason::ModelUnavailable => 600,
            FailoverReason::Unknown => 60,
        };
        Duration::from_secs(secs)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverReason::RateLimit => "rate_limit",
            FailoverReason::Timeout => "timeout",
            FailoverReason::ApiError => "api_error",
            FailoverReason::Authentication => "authentication",
            FailoverReason::QuotaExceeded => "quota_exceeded",
            FailoverReason::ModelUnavailable => "model_unavailable",
            FailoverReason::Unknown => "unknown",
        }
    }
}

/// Health and performance record for one (provider, model) pair.
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub provider_id: String,
    pub model: String,
    /// Lower is preferred.
    pub priority: u32,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
    pub cooldown_until: Option<Instant>,
    /// Rolling-average latency in seconds (EMA, alpha = 0.1).
    pub avg_response_time: f64,
}

impl ProviderHealth {
    pub fn new(provider_id: impl Into<String>, model: impl Into<String>, priority: u32) -> Self {
        Self {
            provider_id: provider_id.into(),
            model: model.into(),
            priority,
            success_count: 0,
            failure_count: 0,
            last_success: None,
            last_failure: None,
            cooldown_until: None,
            avg_response_time: 0.0,
        }
    }

    /// The failover key for this entry.
    pub fn key(&self) -> String {
        format!("{}/{}", self.provider_id, self.model)
    }

    /// Available iff the cooldown has elapsed.
    pub fn is_available(&self) -> bool {
        match self.cooldown_until {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    /// Success rate over all recorded attempts; 1.0 with no history.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    /// Record a successful request and fold its latency into the average.
    pub fn record_success(&mut self, response_time: Duration) {
        self.success_count += 1;
        self.last_success = Some(Instant::now());
        let secs = response_time.as_secs_f64();
        if self.avg_response_time == 0.0 {
            self.avg_response_time = secs;
        } else {
            self.avg_response_time = self.avg_response_time * 0.9 + secs * 0.1;
        }
    }

    /// Record a failure and apply the reason-specific cooldown.
    pub fn record_failure(&mut self, reason: FailoverReason) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
        self.cooldown_until = Some(Instant::now() + reason.cooldown());
        warn!(
            key = %self.key(),
            reason = reason.as_str(),
            cooldown_secs = reason.cooldown().as_secs(),
            "provider entered cooldown"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_errors() {
        assert_eq!(
            FailoverReason::classify("Error: rate limit exceeded"),
            FailoverReason::RateLimit
        );
        assert_eq!(
            FailoverReason::classify("HTTP 429 Too Many Requests"),
            FailoverReason::RateLimit
        );
        assert_eq!(
            FailoverReason::classify("request timed out after 30s"),
            FailoverReason::Timeout
        );
        assert_eq!(
            FailoverReason::classify("monthly quota exceeded"),
            FailoverReason::QuotaExceeded
        );
        assert_eq!(
            FailoverReason::classify("401 unauthorized"),
            FailoverReason::Authentication
        );
        assert_eq!(
            FailoverReason::classify("model does not exist"),
            FailoverReason::ModelUnavailable
        );
        assert_eq!(
            FailoverReason::classify("Error: internal server error 500"),
            FailoverReason::ApiError
        );
        assert_eq!(
            FailoverReason::classify("something odd happened"),
            FailoverReason::Unknown
        );
    }

    #[test]
    fn cooldown_durations() {
        assert_eq!(FailoverReason::RateLimit.cooldown().as_secs(), 300);
        assert_eq!(FailoverReason::QuotaExceeded.cooldown().as_secs(), 3600);
        assert_eq!(FailoverReason::Authentication.cooldown().as_secs(), 0);
        assert_eq!(FailoverReason::ModelUnavailable.cooldown().as_secs(), 600);
    }

    #[test]
    fn health_bookkeeping() {
        let mut health = ProviderHealth::new("local", "fast-1", 10);
        assert!(health.is_available());
        assert_eq!(health.success_rate(), 1.0);

        health.record_success(Duration::from_millis(200));
        assert_eq!(health.success_count, 1);
        assert!((health.avg_response_time - 0.2).abs() < 1e-9);

        health.record_success(Duration::from_millis(400));
        // EMA: 0.2 * 0.9 + 0.4 * 0.1
        assert!((health.avg_response_time - 0.22).abs() < 1e-9);

        health.record_failure(FailoverReason::RateLimit);
        assert_eq!(health.failure_count, 1);
        assert!(!health.is_available());
        assert_eq!(health.success_rate(), 0.5);
    }

    #[test]
    fn auth_failure_has_no_cooldown() {
        let mut health = ProviderHealth::new("cloud", "big-1", 0);
        health.record_failure(FailoverReason::Authentication);
        // Zero cooldown: immediately available again (but the failover loop
        // never retries the same key within one run).
        assert!(health.is_available());
    }
}
