//! Provider rate-limit detection.
//!
//! The provider CLI prints a banner of the form
//! `Limit reached · resets Dec 17 at 6am (Europe/Oslo)` when a usage window
//! is exhausted. The captured reset text decides the limit type:
//!
//! - **weekly**: the reset text names a date (`Dec 17`, `12/17`, `2026-12-17`)
//! - **session**: the reset text is a time only (`11:59pm`)
//!
//! Output without the banner is still flagged when it carries a generic
//! throttling phrase, but no reset time is extracted then.
//!
//! ```
//! use warden::detect::rate_limit::{detect_rate_limit, LimitType};
//!
//! let d = detect_rate_limit("Limit reached · resets Dec 17 at 6am", Some("work"));
//! assert!(d.is_rate_limited);
//! assert_eq!(d.limit_type, Some(LimitType::Weekly));
//! assert_eq!(d.reset_time.as_deref(), Some("Dec 17 at 6am"));
//! ```

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::profiles::ProfileSummary;

/// Banner with a trailing reset description.
static LIMIT_BANNER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)limit\s+reached\s*[·•|\-]\s*resets\s+(.+?)\s*$").unwrap()
});

/// A date-like token in the reset text.
static DATE_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(jan|feb|mar|apr|may|jun|jul|aug|sep|sept|oct|nov|dec)[a-z]*\.?\s+\d{1,2}\b|\b\d{1,2}/\d{1,2}\b|\b\d{4}-\d{2}-\d{2}\b",
    )
    .unwrap()
});

/// Secondary indicators, checked only when the banner is absent.
static THROTTLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(rate[\s_-]?limit(ed)?|usage\s+limit|too\s+many\s+requests)\b").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    Session,
    Weekly,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDetection {
    pub is_rate_limited: bool,
    pub reset_time: Option<String>,
    pub limit_type: Option<LimitType>,
    pub profile_id: Option<String>,
    /// Filled in by the classifier from the profile store.
    pub suggested_profile: Option<ProfileSummary>,
    pub message: String,
    pub original_error: String,
}

impl RateLimitDetection {
    pub fn not_detected(output: &str, profile_id: Option<&str>) -> Self {
        Self {
            is_rate_limited: false,
            reset_time: None,
            limit_type: None,
            profile_id: profile_id.map(str::to_string),
            suggested_profile: None,
            message: String::new(),
            original_error: output.to_string(),
        }
    }
}

fn classify_reset(reset: &str) -> LimitType {
    if DATE_TOKEN_RE.is_match(reset) {
        LimitType::Weekly
    } else {
        LimitType::Session
    }
}

pub fn detect_rate_limit(output: &str, profile_id: Option<&str>) -> RateLimitDetection {
    if let Some(caps) = LIMIT_BANNER_RE.captures(output) {
        let reset = caps[1].trim().to_string();
        let limit_type = classify_reset(&reset);
        let message = match limit_type {
            LimitType::Weekly => format!("Weekly usage limit reached. Resets {}.", reset),
            LimitType::Session => format!("Session usage limit reached. Resets {}.", reset),
        };
        return RateLimitDetection {
            is_rate_limited: true,
            reset_time: Some(reset),
            limit_type: Some(limit_type),
            message,
            ..RateLimitDetection::not_detected(output, profile_id)
        };
    }

    if THROTTLE_RE.is_match(output) {
        return RateLimitDetection {
            is_rate_limited: true,
            message: "Rate limit reached. The provider is throttling requests.".to_string(),
            ..RateLimitDetection::not_detected(output, profile_id)
        };
    }

    RateLimitDetection::not_detected(output, profile_id)
}
