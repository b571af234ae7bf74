use crate::amount::{Amount, Balance};
use crate::error::{TreasuryError, TreasuryResult};
use crate::plan::{ActionType, RiskLevel};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 100% expressed in basis points.
pub const BASIS_POINTS: u32 = 10_000;

/// Longest rebalance gap a pool may configure: ten years.
pub const MAX_REBALANCE_GAP_SECS: i64 = 10 * 366 * 24 * 3600;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(pub String);

impl PoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PoolId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolCategory {
    Operational,
    Reserve,
    Development,
    Security,
    Charity,
    Founder,
    Liquidity,
    Incentive,
}

impl PoolCategory {
    pub fn name(self) -> &'static str {
        match self {
            Self::Operational => "operational",
            Self::Reserve => "reserve",
            Self::Development => "development",
            Self::Security => "security",
            Self::Charity => "charity",
            Self::Founder => "founder",
            Self::Liquidity => "liquidity",
            Self::Incentive => "incentive",
        }
    }

    /// Categories whose rebalancing switch only governance may flip.
    pub fn is_protected(self) -> bool {
        matches!(self, Self::Founder)
    }
}

/// Target/min/max share of total treasury value, in basis points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub target_bps: u32,
    pub min_bps: u32,
    pub max_bps: u32,
}

impl Allocation {
    pub fn new(target_bps: u32, min_bps: u32, max_bps: u32) -> Self {
        Self {
            target_bps,
            min_bps,
            max_bps,
        }
    }

    /// Allocation without a corridor around the target.
    pub fn fixed(target_bps: u32) -> Self {
        Self::new(target_bps, target_bps, target_bps)
    }

    pub fn target_fraction(&self) -> f64 {
        f64::from(self.target_bps) / f64::from(BASIS_POINTS)
    }

    pub fn validate(&self) -> TreasuryResult<()> {
        if self.max_bps > BASIS_POINTS {
            return Err(TreasuryError::InvalidInput(format!(
                "allocation max {}bps exceeds 100%",
                self.max_bps
            )));
        }
        if !(self.min_bps <= self.target_bps && self.target_bps <= self.max_bps) {
            return Err(TreasuryError::InvalidInput(format!(
                "allocation requires min <= target <= max, got {}/{}/{}",
                self.min_bps, self.target_bps, self.max_bps
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceConfig {
    pub enabled: bool,
    pub threshold_bps: u32,
    /// Minimum seconds between two rebalances touching the pool.
    pub min_gap_secs: i64,
    /// Rebalance is forced once this many seconds pass. Zero disables.
    pub max_gap_secs: i64,
}

impl RebalanceConfig {
    pub fn new(threshold_bps: u32, min_gap: Duration, max_gap: Duration) -> Self {
        Self {
            enabled: true,
            threshold_bps,
            min_gap_secs: min_gap.num_seconds(),
            max_gap_secs: max_gap.num_seconds(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            threshold_bps: 0,
            min_gap_secs: 0,
            max_gap_secs: 0,
        }
    }

    pub fn validate(&self) -> TreasuryResult<()> {
        let gaps = [
            ("min_gap_secs", self.min_gap_secs),
            ("max_gap_secs", self.max_gap_secs),
        ];
        for (name, secs) in gaps {
            if !(0..=MAX_REBALANCE_GAP_SECS).contains(&secs) {
                return Err(TreasuryError::InvalidInput(format!(
                    "{} must be within 0..={}, got {}",
                    name, MAX_REBALANCE_GAP_SECS, secs
                )));
            }
        }
        Ok(())
    }

    /// Saturates instead of panicking on values that never passed `validate`.
    pub fn min_gap(&self) -> Duration {
        Duration::try_seconds(self.min_gap_secs).unwrap_or(Duration::MAX)
    }

    pub fn max_gap(&self) -> Option<Duration> {
        (self.max_gap_secs > 0)
            .then(|| Duration::try_seconds(self.max_gap_secs).unwrap_or(Duration::MAX))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    TreasuryManager,
    PoolManager,
    BoardMember,
    FinancialOfficer,
    TechnicalLead,
    EmergencyResponder,
    Founder,
}

/// Boundary below which an outgoing action executes without a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoExecutePolicy {
    /// Largest value, in base-denomination minor units, that may move unattended.
    pub limit: Amount,
    pub max_risk: RiskLevel,
    pub action_types: Vec<ActionType>,
}

impl AutoExecutePolicy {
    pub fn transfers_up_to(limit: Amount, max_risk: RiskLevel) -> Self {
        Self {
            limit,
            max_risk,
            action_types: vec![ActionType::Transfer],
        }
    }

    pub fn never() -> Self {
        Self {
            limit: 0,
            max_risk: RiskLevel::Low,
            action_types: Vec::new(),
        }
    }

    pub fn permits(&self, action_type: ActionType, value: u128, risk: RiskLevel) -> bool {
        self.action_types.contains(&action_type)
            && value <= u128::from(self.limit)
            && risk <= self.max_risk
    }
}

impl Default for AutoExecutePolicy {
    fn default() -> Self {
        Self::never()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControl {
    pub required_signatures: u32,
    pub authorized_roles: Vec<Role>,
    /// Every outgoing action is proposal-gated when set.
    pub governance_required: bool,
    #[serde(default)]
    pub auto_execute: AutoExecutePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolStatus {
    Active,
    Frozen,
}

/// Named sub-account of the treasury.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    pub label: String,
    pub category: PoolCategory,
    pub allocation: Allocation,
    pub balance: Balance,
    pub min_balance: Balance,
    /// Per-denomination ceiling. Absent denominations are unbounded.
    pub max_balance: Balance,
    pub rebalance: RebalanceConfig,
    pub access: AccessControl,
    pub last_rebalance: DateTime<Utc>,
    pub status: PoolStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pool {
    pub fn is_active(&self) -> bool {
        self.status == PoolStatus::Active
    }

    /// Within `minGap` of the last rebalance.
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        now - self.last_rebalance < self.rebalance.min_gap()
    }

    pub fn past_max_gap(&self, now: DateTime<Utc>) -> bool {
        match self.rebalance.max_gap() {
            Some(max_gap) => now - self.last_rebalance > max_gap,
            None => false,
        }
    }

    /// May the planner move funds into or out of this pool at all.
    pub fn is_rebalanceable(&self) -> bool {
        self.is_active() && self.rebalance.enabled
    }
}
