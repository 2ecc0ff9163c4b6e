//! Whether a classified provider failure should swap credentials.

use crate::config::AutoSwitchSettings;
use crate::detect::{FailureCategory, FailureDetection};
use crate::profiles::{ProfileStore, ProfileSummary};
use crate::wlog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverDecision {
    /// Activate `to` and restart the task.
    Swap { to: ProfileSummary },
    /// Auto-switching is off globally or for this category.
    Disabled,
    /// No usable alternate profile.
    NoAlternate,
    /// The task already used its restarts.
    BudgetExhausted { max: u32 },
}

pub fn switch_enabled(settings: &AutoSwitchSettings, category: FailureCategory) -> bool {
    settings.enabled
        && match category {
            FailureCategory::RateLimit => settings.on_rate_limit,
            FailureCategory::Auth => settings.on_auth_failure,
            FailureCategory::Billing => settings.on_billing_failure,
        }
}

pub async fn decide(
    settings: &AutoSwitchSettings,
    max_swaps: u32,
    swap_count: u32,
    detection: &FailureDetection,
    profiles: &dyn ProfileStore,
) -> FailoverDecision {
    let category = detection.category();
    if !switch_enabled(settings, category) {
        return FailoverDecision::Disabled;
    }
    if swap_count >= max_swaps {
        wlog!("swap budget of {} used up, not switching profiles", max_swaps);
        return FailoverDecision::BudgetExhausted { max: max_swaps };
    }

    let failed = match detection.profile_id() {
        Some(id) => id.to_string(),
        None => match profiles.active_profile().await {
            Some(p) => p.id,
            None => return FailoverDecision::NoAlternate,
        },
    };
    // A swap away from bad credentials is pointless unless the target can
    // actually log in.
    let require_authenticated = category == FailureCategory::Auth;
    match profiles.best_alternate(&failed, require_authenticated).await {
        Some(to) => FailoverDecision::Swap { to },
        None => FailoverDecision::NoAlternate,
    }
}
