//! Hibernation eligibility

use chrono::{DateTime, Duration, Utc};
use genesis_config::HibernationSettings;
use genesis_store::TenantActivity;
use genesis_types::{Tenant, Tier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eligibility {
    pub eligible: bool,
    pub reason: String,
}

impl Eligibility {
    fn no(reason: impl Into<String>) -> Self {
        Self {
            eligible: false,
            reason: reason.into(),
        }
    }

    fn yes(reason: impl Into<String>) -> Self {
        Self {
            eligible: true,
            reason: reason.into(),
        }
    }
}

fn idle_since(last: Option<DateTime<Utc>>, days: i64, now: DateTime<Utc>) -> bool {
    match last {
        // Never-active counts as idle.
        None => true,
        Some(at) => now - at >= Duration::days(days),
    }
}

/// Evaluate whether a tenant may be hibernated right now.
pub fn check_eligibility(
    tenant: &Tenant,
    activity: &TenantActivity,
    settings: &HibernationSettings,
    now: DateTime<Utc>,
) -> Eligibility {
    if tenant.tier == Tier::Enterprise {
        return Eligibility::no("Enterprise tier - never hibernates");
    }
    if activity.manual_hold {
        return Eligibility::no("manual hold set by operator");
    }
    if !activity.account_active {
        return Eligibility::no("account is not active");
    }
    if !idle_since(activity.last_campaign_at, settings.campaign_idle_days, now) {
        return Eligibility::no(format!(
            "campaign activity within the last {} days",
            settings.campaign_idle_days
        ));
    }
    if !idle_since(
        activity.last_execution_at,
        settings.execution_idle_days,
        now,
    ) {
        return Eligibility::no(format!(
            "workflow executions within the last {} days",
            settings.execution_idle_days
        ));
    }
    if !idle_since(activity.last_login_at, settings.login_idle_days, now) {
        return Eligibility::no(format!(
            "dashboard logins within the last {} days",
            settings.login_idle_days
        ));
    }
    Eligibility::yes("idle thresholds met")
}
