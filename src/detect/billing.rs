//! Billing failure detection.
//!
//! A bare `402` is only trusted next to an HTTP-ish word (`status`, `http`,
//! `error`, `code`) or the word "payment", so line numbers and counts do not
//! trip it.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingFailureType {
    InsufficientCredits,
    PaymentRequired,
    SubscriptionInactive,
}

impl BillingFailureType {
    pub fn remediation(&self) -> &'static str {
        match self {
            BillingFailureType::InsufficientCredits => {
                "Insufficient credits. Add credits to the account or switch to another profile."
            }
            BillingFailureType::PaymentRequired => {
                "Payment required. Update the account's payment details to continue."
            }
            BillingFailureType::SubscriptionInactive => {
                "Subscription inactive. Renew the subscription or switch to another profile."
            }
        }
    }
}

/// (pattern, class) pairs in priority order.
static BILLING_PATTERNS: LazyLock<Vec<(Regex, BillingFailureType)>> = LazyLock::new(|| {
    [
        (
            r"(?i)\binsufficient\s+(credits?|balance|funds)\b",
            BillingFailureType::InsufficientCredits,
        ),
        (
            r"(?i)\bcredit\s+balance\s+(is\s+)?too\s+low\b",
            BillingFailureType::InsufficientCredits,
        ),
        (r"(?i)\bout\s+of\s+credits\b", BillingFailureType::InsufficientCredits),
        (
            r"(?i)\b(no|zero)\s+credits?\s+(remaining|left|available)\b",
            BillingFailureType::InsufficientCredits,
        ),
        (
            r#"(?i)"type"\s*:\s*"(insufficient_credits|credit_balance_too_low)""#,
            BillingFailureType::InsufficientCredits,
        ),
        (
            r"(?i)\bsubscription\s+(has\s+|is\s+)?(expired|inactive|cancell?ed|ended|not\s+active)\b",
            BillingFailureType::SubscriptionInactive,
        ),
        (
            r"(?i)\bno\s+active\s+subscription\b",
            BillingFailureType::SubscriptionInactive,
        ),
        (r"(?i)\bpayment\s+required\b", BillingFailureType::PaymentRequired),
        (
            r"(?i)\bpayment\s+(method\s+)?(failed|declined)\b",
            BillingFailureType::PaymentRequired,
        ),
        (
            r"(?i)\bbilling\s+(error|issue|problem)\b",
            BillingFailureType::PaymentRequired,
        ),
        (
            r"(?i)\b(status|http|error|code)[\s:=]*402\b",
            BillingFailureType::PaymentRequired,
        ),
        (r"(?i)\b402\b.{0,40}\bpayment\b", BillingFailureType::PaymentRequired),
    ]
    .into_iter()
    .map(|(re, kind)| (Regex::new(re).unwrap(), kind))
    .collect()
});

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingFailureDetection {
    pub is_billing_failure: bool,
    pub failure_type: Option<BillingFailureType>,
    pub profile_id: Option<String>,
    pub message: String,
    pub original_error: String,
}

pub fn detect_billing_failure(output: &str, profile_id: Option<&str>) -> BillingFailureDetection {
    let failure_type = BILLING_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(output))
        .map(|(_, kind)| *kind);
    BillingFailureDetection {
        is_billing_failure: failure_type.is_some(),
        failure_type,
        profile_id: profile_id.map(str::to_string),
        message: failure_type
            .map(|k| k.remediation().to_string())
            .unwrap_or_default(),
        original_error: output.to_string(),
    }
}
