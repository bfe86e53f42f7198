//! Wave planning
//!
//! Tier-weighted ordering (standard first, enterprise shielded until the
//! final wave) and cumulative percentage slicing where each wave carries
//! only the increment over the previous one.

use genesis_types::{RolloutStrategy, Tenant, TenantId, WAVE_PERCENTS};

/// Order the eligible population for wave assignment: standard tenants
/// first, then high-priority, enterprise last; ID order within a tier keeps
/// planning deterministic.
pub fn order_for_rollout(mut tenants: Vec<Tenant>) -> Vec<Tenant> {
    tenants.sort_by(|a, b| {
        a.tier
            .rollout_rank()
            .cmp(&b.tier.rollout_rank())
            .then_with(|| a.id.cmp(&b.id))
    });
    tenants
}

/// Slice an ordered population into wave membership lists. Canary-staged
/// uses the cumulative percentages {1, 10, 25, 50, 100} (ceil, canary at
/// least one tenant); fleet-sync is a single wave.
pub fn partition_waves(ordered: &[TenantId], strategy: RolloutStrategy) -> Vec<Vec<TenantId>> {
    let total = ordered.len();
    if total == 0 {
        return Vec::new();
    }
    match strategy {
        RolloutStrategy::FleetSync => vec![ordered.to_vec()],
        RolloutStrategy::CanaryStaged => {
            let mut waves = Vec::new();
            let mut previous_cut = 0usize;
            for pct in WAVE_PERCENTS {
                let mut cut = (total * pct as usize).div_ceil(100);
                cut = cut.clamp(1, total);
                if cut > previous_cut {
                    waves.push(ordered[previous_cut..cut].to_vec());
                    previous_cut = cut;
                }
            }
            waves
        }
    }
}
