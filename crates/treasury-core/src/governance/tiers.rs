//! Signature requirements, risk and role tables per proposal type.
//!
//! Every table is an exhaustive match or an ordered list evaluated top-down;
//! there is no fallback to a default map entry.

use crate::config::GovernanceConfig;
use treasury_types::{Amount, ProposalType, RiskLevel, Role, MINOR_UNITS};

const HIGH_RISK_VALUE: Amount = 1_000_000 * MINOR_UNITS;
const MEDIUM_RISK_VALUE: Amount = 100_000 * MINOR_UNITS;

/// Amount tier only. Monotonic in `amount` as long as the config validates.
pub fn tier_signatures(config: &GovernanceConfig, amount: Amount) -> u32 {
    config
        .signature_tiers
        .iter()
        .find(|tier| amount > tier.exceeds)
        .map(|tier| tier.required)
        .unwrap_or(config.base_signatures)
}

pub fn type_floor(proposal_type: ProposalType) -> u32 {
    match proposal_type {
        ProposalType::Withdrawal => 2,
        ProposalType::Rebalance => 3,
        ProposalType::ParameterChange => 4,
        ProposalType::PoolCreation => 4,
        ProposalType::PoolModification => 4,
        ProposalType::EmergencyAction => 2,
    }
}

pub fn authorized_roles(proposal_type: ProposalType) -> &'static [Role] {
    match proposal_type {
        ProposalType::Withdrawal => &[Role::TreasuryManager, Role::PoolManager, Role::BoardMember],
        ProposalType::Rebalance => &[Role::TreasuryManager, Role::FinancialOfficer],
        ProposalType::ParameterChange => {
            &[Role::TechnicalLead, Role::TreasuryManager, Role::BoardMember]
        }
        ProposalType::PoolCreation => &[Role::TreasuryManager, Role::BoardMember],
        ProposalType::PoolModification => &[Role::TreasuryManager, Role::PoolManager],
        ProposalType::EmergencyAction => {
            &[Role::EmergencyResponder, Role::TreasuryManager, Role::Founder]
        }
    }
}

/// `pool_value` is the value of the pool the proposal draws from, if any.
pub fn assess_risk(proposal_type: ProposalType, amount: Amount, pool_value: Option<u128>) -> RiskLevel {
    let by_amount = if amount > HIGH_RISK_VALUE {
        RiskLevel::High
    } else if amount > MEDIUM_RISK_VALUE {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };
    let by_share = match pool_value {
        Some(value) if u128::from(amount) * 2 > value => RiskLevel::High,
        _ => RiskLevel::Low,
    };
    let by_type = match proposal_type {
        ProposalType::Withdrawal | ProposalType::PoolModification => RiskLevel::Low,
        ProposalType::Rebalance => RiskLevel::Medium,
        ProposalType::ParameterChange
        | ProposalType::EmergencyAction
        | ProposalType::PoolCreation => RiskLevel::High,
    };
    by_amount.max(by_share).max(by_type)
}

/// Signatures needed to approve: the larger of the amount tier, the type
/// floor and the pool's own requirement, plus the high-risk surcharge,
/// capped at the configured maximum.
pub fn required_signatures(
    config: &GovernanceConfig,
    proposal_type: ProposalType,
    amount: Amount,
    risk: RiskLevel,
    pool_required: u32,
) -> u32 {
    let mut required = tier_signatures(config, amount)
        .max(type_floor(proposal_type))
        .max(pool_required);
    if risk == RiskLevel::High {
        required = required.saturating_add(config.high_risk_surcharge);
    }
    required.min(config.max_required_signatures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_type() -> impl Strategy<Value = ProposalType> {
        prop_oneof![
            Just(ProposalType::Withdrawal),
            Just(ProposalType::Rebalance),
            Just(ProposalType::ParameterChange),
            Just(ProposalType::PoolCreation),
            Just(ProposalType::PoolModification),
            Just(ProposalType::EmergencyAction),
        ]
    }

    #[test]
    fn tiers_are_strictly_greater_than() {
        let config = GovernanceConfig::default();
        assert_eq!(tier_signatures(&config, 10_000 * MINOR_UNITS), 2);
        assert_eq!(tier_signatures(&config, 10_000 * MINOR_UNITS + 1), 3);
        assert_eq!(tier_signatures(&config, 500_000 * MINOR_UNITS), 4);
        assert_eq!(tier_signatures(&config, 2_000_000 * MINOR_UNITS), 5);
    }

    #[test]
    fn withdrawal_over_100k_needs_four() {
        let config = GovernanceConfig::default();
        let amount = 500_000 * MINOR_UNITS;
        let risk = assess_risk(ProposalType::Withdrawal, amount, Some(u128::from(amount) * 10));
        assert_eq!(risk, RiskLevel::Medium);
        assert_eq!(
            required_signatures(&config, ProposalType::Withdrawal, amount, risk, 2),
            4
        );
    }

    #[test]
    fn type_floor_and_pool_requirement_raise_the_count() {
        let config = GovernanceConfig::default();
        let risk = assess_risk(ProposalType::ParameterChange, 0, None);
        assert_eq!(risk, RiskLevel::High);
        assert_eq!(
            required_signatures(&config, ProposalType::ParameterChange, 0, risk, 0),
            5
        );
        assert_eq!(
            required_signatures(&config, ProposalType::Withdrawal, 1, RiskLevel::Low, 5),
            5
        );
        assert_eq!(
            required_signatures(&config, ProposalType::Withdrawal, u64::MAX, RiskLevel::High, 9),
            config.max_required_signatures
        );
    }

    proptest! {
        #[test]
        fn required_signatures_are_monotonic_in_amount(
            proposal_type in any_type(),
            a in any::<u64>(),
            b in any::<u64>(),
            pool_required in 0u32..6,
        ) {
            let config = GovernanceConfig::default();
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            let count = |amount| {
                let risk = assess_risk(proposal_type, amount, None);
                required_signatures(&config, proposal_type, amount, risk, pool_required)
            };
            prop_assert!(count(low) <= count(high));
        }
    }
}
