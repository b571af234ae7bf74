//! Read-only query surface.
//!
//! Nothing here mutates state; every call reads the last committed
//! snapshot from storage.

use crate::deviation::DeviationAnalyzer;
use crate::pricing::PriceFeed;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use treasury_store::{ProposalFilter, QueryWindow, TreasuryStorage};
use treasury_types::{
    BalanceSnapshot, GovernanceProposal, Pool, PoolCategory, PoolId, RebalancePlan, TransactionKind,
    TransactionRecord, TreasuryError, TreasuryResult, BASIS_POINTS,
};

/// Flow and allocation summary over `[from, to]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Deposits, revenue and mints, in base minor units.
    pub inflow: u128,
    /// Withdrawals and burns, in base minor units.
    pub outflow: u128,
    pub net_flow: i128,
    pub rebalance_count: usize,
    pub rebalance_volume: u128,
    pub rebalance_cost: u128,
    /// `1 - Σ|delta| / 2` over the current snapshot, clamped to `[0, 1]`.
    /// `None` when the treasury holds no value.
    pub allocation_adherence: Option<f64>,
    /// One entry per pool, in id order.
    pub pools: Vec<PoolPerformance>,
    pub generated_at: DateTime<Utc>,
}

/// Flows through one pool over the report window. Values are base minor
/// units at current prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolPerformance {
    pub pool_id: PoolId,
    pub category: PoolCategory,
    /// Deposits, revenue and mints landing in the pool.
    pub inflow: u128,
    /// Withdrawals and burns out of the pool.
    pub outflow: u128,
    pub rebalanced_in: u128,
    pub rebalanced_out: u128,
    /// All four flows: `inflow + rebalanced_in - outflow - rebalanced_out`.
    pub net_flow: i128,
    /// Value of the oldest and newest balance snapshots inside the window.
    pub starting_value: Option<u128>,
    pub ending_value: Option<u128>,
    /// Relative change between the two snapshots; `None` without a
    /// positive starting value.
    pub percentage_change: Option<f64>,
    pub target_bps: u32,
    pub current_fraction: Option<f64>,
    /// `1 - |current - target|` as fractions. `None` when the treasury
    /// holds no value.
    pub adherence: Option<f64>,
}

impl PoolPerformance {
    fn new(pool: &Pool) -> Self {
        Self {
            pool_id: pool.id.clone(),
            category: pool.category,
            inflow: 0,
            outflow: 0,
            rebalanced_in: 0,
            rebalanced_out: 0,
            net_flow: 0,
            starting_value: None,
            ending_value: None,
            percentage_change: None,
            target_bps: pool.allocation.target_bps,
            current_fraction: None,
            adherence: None,
        }
    }

    fn absorb(&mut self, tx: &TransactionRecord) {
        let value = u128::from(tx.value);
        let into = tx.destination.as_ref() == Some(&self.pool_id);
        let out_of = tx.source.as_ref() == Some(&self.pool_id);
        match tx.kind {
            // A swap inside one pool changes its mix, not its flows.
            TransactionKind::Rebalance | TransactionKind::Swap if into && out_of => {}
            TransactionKind::Rebalance | TransactionKind::Swap => {
                if into {
                    self.rebalanced_in += value;
                }
                if out_of {
                    self.rebalanced_out += value;
                }
            }
            kind => {
                if into && kind.is_inflow() {
                    self.inflow += value;
                }
                if out_of && kind.is_outflow() {
                    self.outflow += value;
                }
            }
        }
    }

    fn settle(&mut self) {
        let gained = self.inflow.saturating_add(self.rebalanced_in);
        let lost = self.outflow.saturating_add(self.rebalanced_out);
        self.net_flow = signed(gained) - signed(lost);
        self.percentage_change = match (self.starting_value, self.ending_value) {
            (Some(start), Some(end)) if start > 0 => {
                Some((signed(end) - signed(start)) as f64 / start as f64)
            }
            _ => None,
        };
    }
}

fn signed(value: u128) -> i128 {
    i128::try_from(value).unwrap_or(i128::MAX)
}

#[derive(Clone)]
pub struct TreasuryQueries {
    store: Arc<dyn TreasuryStorage>,
    prices: Arc<dyn PriceFeed>,
    analyzer: DeviationAnalyzer,
    rebalance_cost_bps: u32,
}

impl TreasuryQueries {
    pub fn new(store: Arc<dyn TreasuryStorage>, prices: Arc<dyn PriceFeed>, rebalance_cost_bps: u32) -> Self {
        Self {
            store,
            analyzer: DeviationAnalyzer::new(prices.clone()),
            prices,
            rebalance_cost_bps,
        }
    }

    pub async fn list_pools(&self) -> TreasuryResult<Vec<Pool>> {
        Ok(self.store.list_pools().await?)
    }

    pub async fn get_pool(&self, pool_id: &PoolId) -> TreasuryResult<Pool> {
        self.store
            .get_pool(pool_id)
            .await?
            .ok_or_else(|| TreasuryError::NotFound(format!("pool {} not found", pool_id)))
    }

    /// Newest first. Unknown pools are `NotFound` rather than an empty page.
    pub async fn balance_history(
        &self,
        pool_id: &PoolId,
        window: QueryWindow,
    ) -> TreasuryResult<Vec<BalanceSnapshot>> {
        self.get_pool(pool_id).await?;
        Ok(self.store.balance_history(pool_id, window).await?)
    }

    pub async fn get_plan(&self, plan_id: &str) -> TreasuryResult<RebalancePlan> {
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| TreasuryError::NotFound(format!("plan {} not found", plan_id)))
    }

    pub async fn list_plans(&self, window: QueryWindow) -> TreasuryResult<Vec<RebalancePlan>> {
        Ok(self.store.list_plans(window).await?)
    }

    pub async fn get_proposal(&self, proposal_id: &str) -> TreasuryResult<GovernanceProposal> {
        self.store
            .get_proposal(proposal_id)
            .await?
            .ok_or_else(|| TreasuryError::NotFound(format!("proposal {} not found", proposal_id)))
    }

    pub async fn proposals(
        &self,
        filter: &ProposalFilter,
        window: QueryWindow,
    ) -> TreasuryResult<Vec<GovernanceProposal>> {
        Ok(self.store.list_proposals(filter, window).await?)
    }

    pub async fn transactions(&self, window: QueryWindow) -> TreasuryResult<Vec<TransactionRecord>> {
        Ok(self.store.list_transactions(window).await?)
    }

    pub async fn performance_report(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> TreasuryResult<PerformanceReport> {
        if from > to {
            return Err(TreasuryError::InvalidInput(format!(
                "report window starts after it ends ({} > {})",
                from, to
            )));
        }
        let transactions = self.store.transactions_between(from, to).await?;

        let mut inflow: u128 = 0;
        let mut outflow: u128 = 0;
        let mut rebalance_count = 0;
        let mut rebalance_volume: u128 = 0;
        for tx in &transactions {
            let value = u128::from(tx.value);
            if tx.kind.is_inflow() {
                inflow += value;
            }
            if tx.kind.is_outflow() {
                outflow += value;
            }
            if matches!(tx.kind, TransactionKind::Rebalance | TransactionKind::Swap) {
                rebalance_count += 1;
                rebalance_volume += value;
            }
        }
        let net_flow = signed(inflow) - signed(outflow);
        let rebalance_cost = rebalance_volume * u128::from(self.rebalance_cost_bps)
            / u128::from(BASIS_POINTS);

        let pools = self.store.list_pools().await?;
        let report = self.analyzer.analyze(&pools)?;
        let allocation_adherence = if report.is_degenerate() {
            None
        } else {
            let drift: u128 = report
                .deviations
                .values()
                .map(|d| d.scaled_delta.unsigned_abs())
                .sum();
            let scale = 2.0 * f64::from(BASIS_POINTS) * report.total_value as f64;
            Some((1.0 - drift as f64 / scale).clamp(0.0, 1.0))
        };

        let mut per_pool = Vec::with_capacity(pools.len());
        for pool in &pools {
            let mut perf = PoolPerformance::new(pool);
            for tx in &transactions {
                perf.absorb(tx);
            }
            // Newest first.
            let history: Vec<BalanceSnapshot> = self
                .store
                .balance_history(&pool.id, QueryWindow::default())
                .await?
                .into_iter()
                .filter(|snap| snap.recorded_at >= from && snap.recorded_at <= to)
                .collect();
            if let (Some(newest), Some(oldest)) = (history.first(), history.last()) {
                perf.ending_value = Some(self.prices.balance_value(&newest.balance)?);
                perf.starting_value = Some(self.prices.balance_value(&oldest.balance)?);
            }
            if let Some(dev) = report.get(&pool.id) {
                perf.current_fraction = Some(dev.current_fraction);
                perf.adherence = Some((1.0 - dev.delta.abs()).clamp(0.0, 1.0));
            }
            perf.settle();
            per_pool.push(perf);
        }
        per_pool.sort_by(|a, b| a.pool_id.cmp(&b.pool_id));

        Ok(PerformanceReport {
            from,
            to,
            inflow,
            outflow,
            net_flow,
            rebalance_count,
            rebalance_volume,
            rebalance_cost,
            allocation_adherence,
            pools: per_pool,
            generated_at: Utc::now(),
        })
    }
}
