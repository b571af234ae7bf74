//! Canonical genesis pool set.

use chrono::{DateTime, Duration, Utc};
use treasury_types::{
    AccessControl, Allocation, AutoExecutePolicy, Balance, Pool, PoolCategory, PoolId, PoolStatus,
    RebalanceConfig, RiskLevel, Role, MINOR_UNITS,
};

/// Ungoverned pools auto-execute transfers up to this value.
pub const DEFAULT_AUTO_EXECUTE_LIMIT: u64 = 10_000 * MINOR_UNITS;

struct PoolSpec {
    id: &'static str,
    label: &'static str,
    category: PoolCategory,
    allocation: Allocation,
    rebalance: RebalanceConfig,
    required_signatures: u32,
    roles: &'static [Role],
    governed: bool,
}

fn hours(h: i64) -> Duration {
    Duration::hours(h)
}

fn days(d: i64) -> Duration {
    Duration::days(d)
}

fn specs() -> Vec<PoolSpec> {
    vec![
        PoolSpec {
            id: "operational",
            label: "Operational Treasury",
            category: PoolCategory::Operational,
            allocation: Allocation::new(2_000, 1_500, 3_000),
            rebalance: RebalanceConfig::new(500, hours(24), days(7)),
            required_signatures: 2,
            roles: &[Role::TreasuryManager, Role::PoolManager],
            governed: false,
        },
        PoolSpec {
            id: "development",
            label: "Development Treasury",
            category: PoolCategory::Development,
            allocation: Allocation::new(1_500, 1_000, 2_500),
            rebalance: RebalanceConfig::new(1_000, hours(48), days(14)),
            required_signatures: 3,
            roles: &[Role::TechnicalLead, Role::TreasuryManager],
            governed: true,
        },
        PoolSpec {
            id: "reserve",
            label: "Strategic Reserve",
            category: PoolCategory::Reserve,
            allocation: Allocation::new(2_500, 2_000, 3_500),
            rebalance: RebalanceConfig::new(1_500, days(7), days(30)),
            required_signatures: 5,
            roles: &[Role::TreasuryManager, Role::BoardMember, Role::Founder],
            governed: true,
        },
        PoolSpec {
            id: "charity",
            label: "Social Impact Treasury",
            category: PoolCategory::Charity,
            allocation: Allocation::new(1_000, 500, 1_500),
            rebalance: RebalanceConfig::new(1_000, hours(24), days(7)),
            required_signatures: 2,
            roles: &[Role::PoolManager, Role::TreasuryManager],
            governed: false,
        },
        PoolSpec {
            id: "security",
            label: "Security Treasury",
            category: PoolCategory::Security,
            allocation: Allocation::new(500, 300, 1_000),
            rebalance: RebalanceConfig::new(2_000, hours(24), days(30)),
            required_signatures: 3,
            roles: &[Role::TechnicalLead, Role::TreasuryManager, Role::EmergencyResponder],
            governed: true,
        },
        PoolSpec {
            id: "founder",
            label: "Founder Allocation",
            category: PoolCategory::Founder,
            allocation: Allocation::fixed(1_000),
            rebalance: RebalanceConfig::disabled(),
            required_signatures: 1,
            roles: &[Role::Founder],
            governed: false,
        },
        PoolSpec {
            id: "liquidity",
            label: "Liquidity Support",
            category: PoolCategory::Liquidity,
            allocation: Allocation::new(1_000, 500, 1_500),
            rebalance: RebalanceConfig::new(500, hours(12), days(7)),
            required_signatures: 2,
            roles: &[Role::PoolManager, Role::TreasuryManager],
            governed: false,
        },
        PoolSpec {
            id: "incentive",
            label: "Community Incentives",
            category: PoolCategory::Incentive,
            allocation: Allocation::new(500, 300, 1_000),
            rebalance: RebalanceConfig::new(800, hours(24), days(14)),
            required_signatures: 2,
            roles: &[Role::PoolManager, Role::TreasuryManager],
            governed: false,
        },
    ]
}

/// The eight standard pools, empty, with targets summing to 100%.
pub fn default_pools(now: DateTime<Utc>) -> Vec<Pool> {
    specs()
        .into_iter()
        .map(|spec| {
            let auto_execute = if spec.governed || !spec.rebalance.enabled {
                AutoExecutePolicy::never()
            } else {
                AutoExecutePolicy::transfers_up_to(DEFAULT_AUTO_EXECUTE_LIMIT, RiskLevel::Medium)
            };
            Pool {
                id: PoolId::from(spec.id),
                label: spec.label.to_string(),
                category: spec.category,
                allocation: spec.allocation,
                balance: Balance::new(),
                min_balance: Balance::new(),
                max_balance: Balance::new(),
                rebalance: spec.rebalance,
                access: AccessControl {
                    required_signatures: spec.required_signatures,
                    authorized_roles: spec.roles.to_vec(),
                    governance_required: spec.governed,
                    auto_execute,
                },
                last_rebalance: now,
                status: PoolStatus::Active,
                created_at: now,
                updated_at: now,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::validate_pool;
    use crate::testing::t0;
    use treasury_types::BASIS_POINTS;

    #[test]
    fn defaults_are_valid_and_fully_allocated() {
        let pools = default_pools(t0());
        assert_eq!(pools.len(), 8);
        for pool in &pools {
            validate_pool(pool).unwrap();
        }
        let sum: u32 = pools.iter().map(|p| p.allocation.target_bps).sum();
        assert_eq!(sum, BASIS_POINTS);

        let founder = pools.iter().find(|p| p.category == PoolCategory::Founder).unwrap();
        assert!(!founder.rebalance.enabled);
        assert!(founder.category.is_protected());
        let reserve = pools.iter().find(|p| p.id.as_str() == "reserve").unwrap();
        assert!(reserve.access.governance_required);
        assert_eq!(reserve.access.required_signatures, 5);
    }
}
