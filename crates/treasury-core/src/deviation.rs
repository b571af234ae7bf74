//! Deviation Analyzer.
//!
//! Derives each pool's share of total treasury value and its signed distance
//! from target. Derived data only; recomputed every cycle and never stored.
//!
//! Threshold comparisons use exact integer arithmetic on
//! `value * 10_000 - target_bps * total`, so identical snapshots give
//! bit-identical results. The `f64` fractions are for display.

use crate::pricing::PriceFeed;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;
use treasury_types::{Pool, PoolId, TreasuryError, TreasuryResult, BASIS_POINTS};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Deviation {
    pub pool_id: PoolId,
    /// Pool value in base minor units.
    pub value: u128,
    pub target_value: u128,
    pub current_fraction: f64,
    pub target_fraction: f64,
    /// `current_fraction - target_fraction`.
    pub delta: f64,
    /// `value * 10_000 - target_bps * total_value`.
    pub scaled_delta: i128,
    pub total_value: u128,
}

impl Deviation {
    /// `|delta| >= threshold`. A zero threshold fires on any non-zero delta.
    pub fn exceeds(&self, threshold_bps: u32) -> bool {
        if threshold_bps == 0 {
            return self.scaled_delta != 0;
        }
        self.scaled_delta.unsigned_abs() >= u128::from(threshold_bps) * self.total_value
    }

    pub fn is_over_allocated(&self) -> bool {
        self.scaled_delta > 0
    }

    pub fn is_under_allocated(&self) -> bool {
        self.scaled_delta < 0
    }

    /// Value above target.
    pub fn excess(&self) -> u128 {
        self.value.saturating_sub(self.target_value)
    }

    /// Value missing to reach target.
    pub fn shortfall(&self) -> u128 {
        self.target_value.saturating_sub(self.value)
    }
}

/// Zero total treasury value: nothing to compare against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegenerateStateWarning {
    pub pools: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviationReport {
    pub total_value: u128,
    pub deviations: BTreeMap<PoolId, Deviation>,
    pub warning: Option<DegenerateStateWarning>,
}

impl DeviationReport {
    pub fn get(&self, pool_id: &PoolId) -> Option<&Deviation> {
        self.deviations.get(pool_id)
    }

    pub fn is_degenerate(&self) -> bool {
        self.warning.is_some()
    }
}

#[derive(Clone)]
pub struct DeviationAnalyzer {
    prices: Arc<dyn PriceFeed>,
}

impl DeviationAnalyzer {
    pub fn new(prices: Arc<dyn PriceFeed>) -> Self {
        Self { prices }
    }

    pub fn analyze(&self, pools: &[Pool]) -> TreasuryResult<DeviationReport> {
        let mut values = BTreeMap::new();
        let mut total: u128 = 0;
        for pool in pools {
            let value = self.prices.balance_value(&pool.balance)?;
            total = total
                .checked_add(value)
                .ok_or_else(|| TreasuryError::InvariantViolation("treasury value overflow".to_string()))?;
            values.insert(pool.id.clone(), (value, pool.allocation.target_bps));
        }

        if total == 0 {
            let warning = DegenerateStateWarning {
                pools: pools.len(),
                message: "total treasury value is zero; no deviations computed".to_string(),
            };
            warn!(pools = pools.len(), "degenerate treasury state: zero total value");
            return Ok(DeviationReport {
                total_value: 0,
                deviations: BTreeMap::new(),
                warning: Some(warning),
            });
        }

        let mut deviations = BTreeMap::new();
        for (pool_id, (value, target_bps)) in values {
            let scaled_value = scaled(value, BASIS_POINTS)?;
            let scaled_target = scaled(total, target_bps)?;
            let current_fraction = value as f64 / total as f64;
            let target_fraction = f64::from(target_bps) / f64::from(BASIS_POINTS);
            deviations.insert(
                pool_id.clone(),
                Deviation {
                    pool_id,
                    value,
                    target_value: total * u128::from(target_bps) / u128::from(BASIS_POINTS),
                    current_fraction,
                    target_fraction,
                    delta: current_fraction - target_fraction,
                    scaled_delta: scaled_value - scaled_target,
                    total_value: total,
                },
            );
        }

        Ok(DeviationReport {
            total_value: total,
            deviations,
            warning: None,
        })
    }
}

fn scaled(value: u128, factor: u32) -> TreasuryResult<i128> {
    value
        .checked_mul(u128::from(factor))
        .and_then(|v| i128::try_from(v).ok())
        .ok_or_else(|| TreasuryError::InvariantViolation("deviation arithmetic overflow".to_string()))
}
