//! Authentication failure detection.
//!
//! Patterns are grouped by failure class and checked in priority order:
//! `expired` first, then `missing`, then the broad `invalid` family (which
//! includes bare 401s). The first match decides the class.
//!
//! None of the phrases mention limits, credits, payments or subscriptions,
//! so rate-limit and billing output never lands here.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailureType {
    Missing,
    Invalid,
    Expired,
}

impl AuthFailureType {
    pub fn remediation(&self) -> &'static str {
        match self {
            AuthFailureType::Missing => {
                "Authentication required. Log in to the active profile before retrying."
            }
            AuthFailureType::Invalid => {
                "Invalid credentials. Re-authenticate the active profile or switch to another one."
            }
            AuthFailureType::Expired => {
                "Your session has expired. Log in again to refresh the profile's credentials."
            }
        }
    }
}

/// (pattern, class) pairs in priority order.
static AUTH_PATTERNS: LazyLock<Vec<(Regex, AuthFailureType)>> = LazyLock::new(|| {
    [
        (
            r"(?i)\b(token|session|credentials?)\s+(has\s+|have\s+)?expired\b",
            AuthFailureType::Expired,
        ),
        (r"(?i)\bexpired\s+(oauth\s+|access\s+)?token\b", AuthFailureType::Expired),
        (
            r"(?i)\bplease\s+(log\s*in|login|sign\s+in|re-?authenticate)\s+again\b",
            AuthFailureType::Expired,
        ),
        (r"(?i)\bauthentication\s+required\b", AuthFailureType::Missing),
        (r"(?i)\bnot\s+(authenticated|logged\s+in)\b", AuthFailureType::Missing),
        (
            r"(?i)\b(no|missing)\s+(api\s+key|credentials|auth(entication)?\s+token|oauth\s+token)\b",
            AuthFailureType::Missing,
        ),
        (
            r"(?i)\bplease\s+run\s+(/login|claude\s+(login|setup-token))",
            AuthFailureType::Missing,
        ),
        (r"(?i)\bunauthori[sz]ed\b", AuthFailureType::Invalid),
        (
            r"(?i)\binvalid\s+(api[\s_-]?key|x-api-key|token|bearer\s+token|oauth\s+token|credentials|authentication)\b",
            AuthFailureType::Invalid,
        ),
        (r"(?i)\bauthentication[\s_]+(failed|error)\b", AuthFailureType::Invalid),
        (
            r#"(?i)"type"\s*:\s*"authentication_error""#,
            AuthFailureType::Invalid,
        ),
        (
            r"(?i)\b(status|http|error|code)[\s:=]*401\b",
            AuthFailureType::Invalid,
        ),
    ]
    .into_iter()
    .map(|(re, kind)| (Regex::new(re).unwrap(), kind))
    .collect()
});

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthFailureDetection {
    pub is_auth_failure: bool,
    pub failure_type: Option<AuthFailureType>,
    pub profile_id: Option<String>,
    pub message: String,
    pub original_error: String,
}

pub fn detect_auth_failure(output: &str, profile_id: Option<&str>) -> AuthFailureDetection {
    let failure_type = AUTH_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(output))
        .map(|(_, kind)| *kind);
    AuthFailureDetection {
        is_auth_failure: failure_type.is_some(),
        failure_type,
        profile_id: profile_id.map(str::to_string),
        message: failure_type
            .map(|k| k.remediation().to_string())
            .unwrap_or_default(),
        original_error: output.to_string(),
    }
}
