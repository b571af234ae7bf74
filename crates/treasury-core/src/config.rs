use serde::{Deserialize, Serialize};
use treasury_types::{Amount, Denom, TreasuryError, TreasuryResult, MINOR_UNITS};

/// Engine-wide tunables. Every field can be changed at runtime through an
/// executed PARAMETER_CHANGE proposal addressing it by JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreasuryConfig {
    pub base_denom: Denom,
    pub planner: PlannerConfig,
    pub governance: GovernanceConfig,
    /// Cost attributed to rebalanced volume in performance reports.
    pub rebalance_cost_bps: u32,
}

impl Default for TreasuryConfig {
    fn default() -> Self {
        Self {
            base_denom: Denom::base(),
            planner: PlannerConfig::default(),
            governance: GovernanceConfig::default(),
            rebalance_cost_bps: 10,
        }
    }
}

impl TreasuryConfig {
    pub fn validate(&self) -> TreasuryResult<()> {
        if !Denom::is_well_formed(self.base_denom.as_str()) {
            return Err(TreasuryError::InvalidInput(format!(
                "malformed base denomination '{}'",
                self.base_denom
            )));
        }
        self.governance.validate()
    }

    /// Returns a copy with the value at `pointer` (e.g. `/planner/min_transfer`)
    /// replaced. The field must already exist and the result must validate.
    pub fn with_parameter(
        &self,
        pointer: &str,
        value: serde_json::Value,
    ) -> TreasuryResult<TreasuryConfig> {
        let mut doc =
            serde_json::to_value(self).map_err(|e| TreasuryError::Serialization(e.to_string()))?;
        let slot = doc.pointer_mut(pointer).ok_or_else(|| {
            TreasuryError::InvalidInput(format!("unknown configuration parameter '{}'", pointer))
        })?;
        *slot = value;
        let updated: TreasuryConfig = serde_json::from_value(doc).map_err(|e| {
            TreasuryError::InvalidInput(format!("invalid value for '{}': {}", pointer, e))
        })?;
        updated.validate()?;
        Ok(updated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Transfers smaller than this are not emitted.
    pub min_transfer: Amount,
    pub base_priority: u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            min_transfer: MINOR_UNITS,
            base_priority: 100,
        }
    }
}

/// Upper bound for signing, voting and execution periods: one year.
pub const MAX_GOVERNANCE_PERIOD_SECS: i64 = 366 * 24 * 3600;

/// Signatures required once the proposal value strictly exceeds `exceeds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureTier {
    pub exceeds: Amount,
    pub required: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Evaluated top-down; ordered by `exceeds` descending.
    pub signature_tiers: Vec<SignatureTier>,
    /// Required signatures below the lowest tier.
    pub base_signatures: u32,
    pub high_risk_surcharge: u32,
    pub max_required_signatures: u32,
    pub signing_period_secs: i64,
    pub voting_period_secs: i64,
    pub execution_window_secs: i64,
    /// Turnout needed among eligible voters, in basis points.
    pub quorum_bps: u32,
    /// Identity the engine uses when it submits plan-action proposals.
    pub system_proposer: String,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            signature_tiers: vec![
                SignatureTier {
                    exceeds: 1_000_000 * MINOR_UNITS,
                    required: 5,
                },
                SignatureTier {
                    exceeds: 100_000 * MINOR_UNITS,
                    required: 4,
                },
                SignatureTier {
                    exceeds: 10_000 * MINOR_UNITS,
                    required: 3,
                },
            ],
            base_signatures: 2,
            high_risk_surcharge: 1,
            max_required_signatures: 7,
            signing_period_secs: 7 * 24 * 3600,
            voting_period_secs: 3 * 24 * 3600,
            execution_window_secs: 48 * 3600,
            quorum_bps: 5_000,
            system_proposer: "treasury-engine".to_string(),
        }
    }
}

impl GovernanceConfig {
    /// Tier table must be monotonic so that a larger amount never needs
    /// fewer signatures.
    pub fn validate(&self) -> TreasuryResult<()> {
        for pair in self.signature_tiers.windows(2) {
            if pair[0].exceeds <= pair[1].exceeds {
                return Err(TreasuryError::InvalidInput(
                    "signature tiers must be ordered by threshold, highest first".to_string(),
                ));
            }
            if pair[0].required < pair[1].required {
                return Err(TreasuryError::InvalidInput(
                    "signature tiers must not require fewer signatures for larger amounts"
                        .to_string(),
                ));
            }
        }
        if let Some(lowest) = self.signature_tiers.last() {
            if lowest.required < self.base_signatures {
                return Err(TreasuryError::InvalidInput(
                    "lowest tier requires fewer signatures than the base".to_string(),
                ));
            }
        }
        if self.base_signatures == 0 || self.max_required_signatures < self.base_signatures {
            return Err(TreasuryError::InvalidInput(
                "signature bounds must satisfy 0 < base <= max".to_string(),
            ));
        }
        let periods = [
            ("signing_period_secs", self.signing_period_secs),
            ("voting_period_secs", self.voting_period_secs),
            ("execution_window_secs", self.execution_window_secs),
        ];
        for (name, secs) in periods {
            if !(1..=MAX_GOVERNANCE_PERIOD_SECS).contains(&secs) {
                return Err(TreasuryError::InvalidInput(format!(
                    "{} must be within 1..={}, got {}",
                    name, MAX_GOVERNANCE_PERIOD_SECS, secs
                )));
            }
        }
        if self.quorum_bps > treasury_types::BASIS_POINTS {
            return Err(TreasuryError::InvalidInput(
                "quorum cannot exceed 100%".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_config_validates() {
        TreasuryConfig::default().validate().unwrap();
    }

    #[test]
    fn parameter_change_by_pointer() {
        let config = TreasuryConfig::default();
        let updated = config
            .with_parameter("/planner/min_transfer", json!(42))
            .unwrap();
        assert_eq!(updated.planner.min_transfer, 42);

        let err = config
            .with_parameter("/planner/no_such_field", json!(1))
            .unwrap_err();
        assert!(matches!(err, TreasuryError::InvalidInput(_)));

        let err = config
            .with_parameter("/governance/base_signatures", json!(0))
            .unwrap_err();
        assert!(matches!(err, TreasuryError::InvalidInput(_)));
    }

    #[test]
    fn governance_periods_are_bounded() {
        let config = TreasuryConfig::default();
        for (pointer, value) in [
            ("/governance/execution_window_secs", json!(1_000_000_000_000_000i64)),
            ("/governance/signing_period_secs", json!(i64::MAX)),
            ("/governance/voting_period_secs", json!(0)),
            ("/governance/voting_period_secs", json!(-5)),
        ] {
            let err = config.with_parameter(pointer, value).unwrap_err();
            assert!(matches!(err, TreasuryError::InvalidInput(_)), "{}", pointer);
        }
        let updated = config
            .with_parameter(
                "/governance/execution_window_secs",
                json!(MAX_GOVERNANCE_PERIOD_SECS),
            )
            .unwrap();
        assert_eq!(
            updated.governance.execution_window_secs,
            MAX_GOVERNANCE_PERIOD_SECS
        );
    }

    #[test]
    fn non_monotonic_tiers_are_rejected() {
        let mut config = GovernanceConfig::default();
        config.signature_tiers[2].required = 6;
        assert!(config.validate().is_err());
    }
}
