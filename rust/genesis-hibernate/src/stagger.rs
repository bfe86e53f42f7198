//! Staggered wake scheduling
//!
//! Spaces a batch of wake requests by a fixed gap so the provider's
//! mutation-rate ceiling is respected, and anchors the batch early enough
//! that the first-due droplet is awake 60 seconds before its target.

use chrono::{DateTime, Duration, Utc};
use genesis_types::{DropletId, TenantId, Tier, WakeReason};

/// Lead time before the first target: a wake takes up to a minute to
/// settle, so the batch starts that far ahead.
const WAKE_LEAD: Duration = Duration::seconds(60);

#[derive(Debug, Clone)]
pub struct WakeRequest {
    pub tenant_id: TenantId,
    pub droplet_id: DropletId,
    pub tier: Tier,
    pub target_time: DateTime<Utc>,
    pub reason: WakeReason,
}

#[derive(Debug, Clone)]
pub struct ScheduledWake {
    pub request: WakeRequest,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WakePlan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub wakes: Vec<ScheduledWake>,
}

/// Order by (tier priority, target time), space by `gap`, and start at
/// `first_target - N*gap - 60s`. Returns `None` for an empty batch.
pub fn plan_staggered_wakes(
    mut requests: Vec<WakeRequest>,
    gap: Duration,
) -> Option<WakePlan> {
    if requests.is_empty() {
        return None;
    }
    requests.sort_by(|a, b| {
        a.tier
            .wake_rank()
            .cmp(&b.tier.wake_rank())
            .then_with(|| a.target_time.cmp(&b.target_time))
    });
    let n = requests.len() as i32;
    let first_target = requests
        .iter()
        .map(|r| r.target_time)
        .min()
        .expect("non-empty batch");
    let start = first_target - gap * n - WAKE_LEAD;
    let end = start + gap * n;
    let wakes = requests
        .into_iter()
        .enumerate()
        .map(|(i, request)| ScheduledWake {
            scheduled_at: start + gap * i as i32,
            request,
        })
        .collect();
    Some(WakePlan { start, end, wakes })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(tenant: &str, tier: Tier, target: DateTime<Utc>) -> WakeRequest {
        WakeRequest {
            tenant_id: TenantId::from(tenant),
            droplet_id: DropletId(1),
            tier,
            target_time: target,
            reason: WakeReason::ScheduledCampaign,
        }
    }

    #[test]
    fn five_wakes_spaced_one_second() {
        let t = Utc::now();
        let requests: Vec<WakeRequest> = (0..5i64)
            .map(|i| {
                request(
                    &format!("t-{}", i),
                    Tier::Standard,
                    t + Duration::seconds(2 * i),
                )
            })
            .collect();
        let plan = plan_staggered_wakes(requests, Duration::seconds(1)).unwrap();

        assert_eq!(plan.start, t - Duration::seconds(5) - Duration::seconds(60));
        for (i, wake) in plan.wakes.iter().enumerate() {
            assert_eq!(wake.scheduled_at, plan.start + Duration::seconds(i as i64));
        }
        assert_eq!(plan.end, plan.start + Duration::seconds(5));
    }

    #[test]
    fn higher_tiers_wake_first() {
        let t = Utc::now();
        let plan = plan_staggered_wakes(
            vec![
                request("t-std", Tier::Standard, t),
                request("t-ent", Tier::Enterprise, t + Duration::seconds(10)),
                request("t-hp", Tier::HighPriority, t + Duration::seconds(5)),
            ],
            Duration::seconds(1),
        )
        .unwrap();
        let order: Vec<&str> = plan
            .wakes
            .iter()
            .map(|w| w.request.tenant_id.as_str())
            .collect();
        assert_eq!(order, vec!["t-ent", "t-hp", "t-std"]);
    }

    #[test]
    fn empty_batch_has_no_plan() {
        assert!(plan_staggered_wakes(Vec::new(), Duration::seconds(1)).is_none());
    }
}
