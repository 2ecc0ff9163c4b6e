//! Provider failure classification for worker output.
//!
//! Three independent detectors, evaluated by [`classify_failure`] in a fixed
//! order: rate limit, then authentication, then billing. The first positive
//! result wins. The pattern sets are hand-tuned to be disjoint; any new
//! pattern must be checked against the other two categories' samples.

pub mod auth;
pub mod billing;
pub mod rate_limit;

use serde::Serialize;
use std::fmt;

pub use auth::{detect_auth_failure, AuthFailureDetection, AuthFailureType};
pub use billing::{detect_billing_failure, BillingFailureDetection, BillingFailureType};
pub use rate_limit::{detect_rate_limit, LimitType, RateLimitDetection};

use crate::profiles::ProfileStore;
use crate::wlog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    RateLimit,
    Auth,
    Billing,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureCategory::RateLimit => "rate_limit",
            FailureCategory::Auth => "auth_failure",
            FailureCategory::Billing => "billing_failure",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum FailureDetection {
    RateLimit(RateLimitDetection),
    Auth(AuthFailureDetection),
    Billing(BillingFailureDetection),
}

impl FailureDetection {
    pub fn category(&self) -> FailureCategory {
        match self {
            FailureDetection::RateLimit(_) => FailureCategory::RateLimit,
            FailureDetection::Auth(_) => FailureCategory::Auth,
            FailureDetection::Billing(_) => FailureCategory::Billing,
        }
    }

    pub fn profile_id(&self) -> Option<&str> {
        match self {
            FailureDetection::RateLimit(d) => d.profile_id.as_deref(),
            FailureDetection::Auth(d) => d.profile_id.as_deref(),
            FailureDetection::Billing(d) => d.profile_id.as_deref(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            FailureDetection::RateLimit(d) => &d.message,
            FailureDetection::Auth(d) => &d.message,
            FailureDetection::Billing(d) => &d.message,
        }
    }
}

/// Run the detectors without touching any profile store.
pub fn detect_failure(output: &str, profile_id: Option<&str>) -> Option<FailureDetection> {
    let rate = detect_rate_limit(output, profile_id);
    if rate.is_rate_limited {
        return Some(FailureDetection::RateLimit(rate));
    }
    let auth = detect_auth_failure(output, profile_id);
    if auth.is_auth_failure {
        return Some(FailureDetection::Auth(auth));
    }
    let billing = detect_billing_failure(output, profile_id);
    if billing.is_billing_failure {
        return Some(FailureDetection::Billing(billing));
    }
    None
}

/// Classify `output` for the given profile, or the active one when `None`.
///
/// Rate-limit hits are recorded against the limited profile and get a
/// suggested alternate attached.
pub async fn classify_failure(
    output: &str,
    profile_id: Option<&str>,
    profiles: &dyn ProfileStore,
) -> Option<FailureDetection> {
    let resolved = match profile_id {
        Some(id) => Some(id.to_string()),
        None => profiles.active_profile().await.map(|p| p.id),
    };
    let mut detection = detect_failure(output, resolved.as_deref())?;

    if let FailureDetection::RateLimit(rate) = &mut detection {
        if let Some(id) = resolved.as_deref() {
            profiles
                .record_rate_limit_event(id, rate.reset_time.as_deref())
                .await;
            rate.suggested_profile = profiles.best_alternate(id, false).await;
        }
    }
    wlog!(
        "classified worker failure as {} (profile {})",
        detection.category(),
        resolved.as_deref().unwrap_or("none")
    );
    Some(detection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfileConfig;
    use crate::profiles::ConfigProfileStore;

    const RATE_LIMIT_SAMPLES: &[&str] = &[
        "Limit reached · resets Dec 17 at 6am (Europe/Oslo)",
        "Limit reached • resets 11:59pm",
        "Error: rate limit exceeded",
        "API usage limit reached",
        "429 Too Many Requests",
    ];

    const AUTH_SAMPLES: &[&str] = &[
        "Authentication required",
        "[CLI] Error: Not authenticated. Please run /login",
        "Invalid API key",
        r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#,
        "OAuth token has expired",
        "API Error: 401 Unauthorized",
        "Session expired, please log in again",
    ];

    const BILLING_SAMPLES: &[&str] = &[
        "Insufficient credits to complete request",
        "Your credit balance is too low",
        "HTTP 402 Payment Required",
        "Subscription inactive",
        "No active subscription found",
        "error code: 402",
    ];

    #[test]
    fn test_categories_are_mutually_exclusive() {
        for sample in RATE_LIMIT_SAMPLES {
            assert!(detect_rate_limit(sample, None).is_rate_limited, "{}", sample);
            assert!(!detect_auth_failure(sample, None).is_auth_failure, "{}", sample);
            assert!(!detect_billing_failure(sample, None).is_billing_failure, "{}", sample);
        }
        for sample in AUTH_SAMPLES {
            assert!(!detect_rate_limit(sample, None).is_rate_limited, "{}", sample);
            assert!(detect_auth_failure(sample, None).is_auth_failure, "{}", sample);
            assert!(!detect_billing_failure(sample, None).is_billing_failure, "{}", sample);
        }
        for sample in BILLING_SAMPLES {
            assert!(!detect_rate_limit(sample, None).is_rate_limited, "{}", sample);
            assert!(!detect_auth_failure(sample, None).is_auth_failure, "{}", sample);
            assert!(detect_billing_failure(sample, None).is_billing_failure, "{}", sample);
        }
    }

    #[test]
    fn test_detect_failure_priority_order() {
        let mixed = "Invalid API key\nLimit reached · resets 3pm";
        assert_eq!(
            detect_failure(mixed, None).map(|d| d.category()),
            Some(FailureCategory::RateLimit)
        );
        let auth_and_billing = "Payment required\nAuthentication required";
        assert_eq!(
            detect_failure(auth_and_billing, None).map(|d| d.category()),
            Some(FailureCategory::Auth)
        );
        assert!(detect_failure("all good", None).is_none());
    }

    fn profile(id: &str) -> ProfileConfig {
        ProfileConfig {
            id: id.to_string(),
            name: id.to_uppercase(),
            ..ProfileConfig::default()
        }
    }

    #[tokio::test]
    async fn test_classify_resolves_active_profile_and_suggests() {
        let store = ConfigProfileStore::new(vec![profile("a"), profile("b")], Some("a".into()));
        let detection = classify_failure("Limit reached • resets 5pm", None, &store)
            .await
            .unwrap();
        assert_eq!(detection.profile_id(), Some("a"));
        match detection {
            FailureDetection::RateLimit(rate) => {
                assert_eq!(rate.suggested_profile.map(|p| p.id), Some("b".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(store.rate_limit_events("a"), 1);
    }

    #[tokio::test]
    async fn test_classify_explicit_profile_wins() {
        let store = ConfigProfileStore::new(vec![profile("a"), profile("b")], Some("a".into()));
        let detection = classify_failure("Unauthorized", Some("b"), &store)
            .await
            .unwrap();
        assert_eq!(detection.category(), FailureCategory::Auth);
        assert_eq!(detection.profile_id(), Some("b"));
    }
}
