//! Rebalance Planner.
//!
//! Turns a pool snapshot into an ordered plan of transfers. Emergency
//! top-ups for pools below their minimum balance come first, then a greedy
//! match of over-allocated into under-allocated pools in lexicographic id
//! order. The match is not globally optimal; it is deterministic and bounded
//! by `O(pools^2)`.

use crate::config::PlannerConfig;
use crate::deviation::{DeviationAnalyzer, DeviationReport};
use crate::pricing::PriceFeed;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;
use treasury_types::{
    Amount, Balance, Coin, Denom, PlanStatus, Pool, PoolCategory, PoolId, RebalanceAction,
    RebalancePlan, RiskLevel, TreasuryError, TreasuryResult,
};

pub const EMERGENCY_PRIORITY: u32 = 0;

#[derive(Clone)]
pub struct RebalancePlanner {
    config: PlannerConfig,
    base_denom: Denom,
    analyzer: DeviationAnalyzer,
}

impl RebalancePlanner {
    pub fn new(config: PlannerConfig, base_denom: Denom, prices: Arc<dyn PriceFeed>) -> Self {
        Self {
            config,
            base_denom,
            analyzer: DeviationAnalyzer::new(prices),
        }
    }

    pub fn analyze(&self, pools: &[Pool]) -> TreasuryResult<DeviationReport> {
        self.analyzer.analyze(pools)
    }

    /// Human-readable reasons a cycle should rebalance. Empty means no-op.
    pub fn rebalance_triggers(
        &self,
        pools: &[Pool],
        now: DateTime<Utc>,
    ) -> TreasuryResult<Vec<String>> {
        let report = self.analyzer.analyze(pools)?;
        Ok(triggers(pools, &report, now))
    }

    pub fn needs_rebalance(&self, pools: &[Pool], now: DateTime<Utc>) -> TreasuryResult<bool> {
        Ok(!self.rebalance_triggers(pools, now)?.is_empty())
    }

    /// Build a plan for `pools` as of `now`. Pools in `busy` are held by a
    /// suspended plan and take no part. Returns `None` when nothing needs
    /// doing, the snapshot is degenerate, or no action clears the dust floor.
    pub fn generate_plan(
        &self,
        pools: &[Pool],
        now: DateTime<Utc>,
        busy: &BTreeSet<PoolId>,
    ) -> TreasuryResult<Option<RebalancePlan>> {
        let report = self.analyzer.analyze(pools)?;
        if report.is_degenerate() {
            return Ok(None);
        }
        let reasons = triggers(pools, &report, now);
        if reasons.is_empty() {
            return Ok(None);
        }

        let mut sorted: Vec<&Pool> = pools.iter().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));

        let mut ws = Workspace::new(&sorted, &self.base_denom);
        let mut actions = self.emergency_actions(&sorted, busy, &mut ws);
        actions.extend(self.matched_transfers(&sorted, &report, now, busy, &mut ws));

        actions.retain(|a| a.amount.amount > 0);
        if actions.is_empty() {
            debug!(triggers = ?reasons, "rebalance triggered but no transfer cleared constraints");
            return Ok(None);
        }
        // Stable: ties keep insertion order.
        actions.sort_by_key(|a| a.priority);

        let plan_id = plan_id(pools, now)?;
        let mut total_moved = Balance::new();
        let mut risk = RiskLevel::Low;
        for (seq, action) in actions.iter_mut().enumerate() {
            action.id = format!("{}:{:03}", plan_id, seq);
            total_moved.add(&action.amount)?;
            risk = risk.max(action.risk);
        }

        debug!(plan_id = %plan_id, actions = actions.len(), "rebalance plan generated");
        Ok(Some(RebalancePlan {
            id: plan_id,
            trigger_reason: reasons.join("; "),
            actions,
            total_moved,
            risk,
            status: PlanStatus::Planned,
            cursor: 0,
            suspended_on: None,
            failure: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }))
    }

    fn emergency_actions(
        &self,
        pools: &[&Pool],
        busy: &BTreeSet<PoolId>,
        ws: &mut Workspace,
    ) -> Vec<RebalanceAction> {
        let mut actions = Vec::new();
        for pool in pools
            .iter()
            .filter(|p| p.is_rebalanceable() && !busy.contains(&p.id))
        {
            let floor = pool.min_balance.amount_of(&self.base_denom);
            let held = pool.balance.amount_of(&self.base_denom);
            if held >= floor {
                continue;
            }
            let needed = floor - held;
            let source = pools.iter().find(|r| {
                r.category == PoolCategory::Reserve
                    && r.is_rebalanceable()
                    && r.id != pool.id
                    && !busy.contains(&r.id)
                    && ws.spendable(&r.id) >= needed
            });
            let Some(source) = source else {
                debug!(pool_id = %pool.id, needed, "no reserve can cover emergency top-up");
                continue;
            };

            ws.take(&source.id, needed);
            ws.give(&pool.id, needed);
            let mut action = RebalanceAction::transfer(
                source.id.clone(),
                pool.id.clone(),
                Coin::new(self.base_denom.clone(), needed),
            );
            action.priority = EMERGENCY_PRIORITY;
            action.risk = RiskLevel::High;
            action.emergency = true;
            action.reason = format!(
                "emergency top-up: {} holds {} below minimum {}",
                pool.id, held, floor
            );
            actions.push(action);
        }
        actions
    }

    fn matched_transfers(
        &self,
        pools: &[&Pool],
        report: &DeviationReport,
        now: DateTime<Utc>,
        busy: &BTreeSet<PoolId>,
        ws: &mut Workspace,
    ) -> Vec<RebalanceAction> {
        let eligible: Vec<&Pool> = pools
            .iter()
            .copied()
            .filter(|p| p.is_rebalanceable() && !p.in_cooldown(now) && !busy.contains(&p.id))
            .collect();

        let mut over: Vec<(&Pool, u128)> = Vec::new();
        let mut under: Vec<(&Pool, u128)> = Vec::new();
        for pool in eligible {
            let Some(dev) = report.get(&pool.id) else {
                continue;
            };
            // Emergency top-ups already moved value toward the floor.
            let adjust = u128::from(ws.received(&pool.id));
            if dev.is_over_allocated() {
                over.push((pool, dev.excess().saturating_sub(u128::from(ws.sent(&pool.id)))));
            } else if dev.is_under_allocated() {
                under.push((pool, dev.shortfall().saturating_sub(adjust)));
            }
        }

        let mut actions = Vec::new();
        for (source, excess) in over.iter_mut() {
            for (dest, needed) in under.iter_mut() {
                if *excess == 0 {
                    break;
                }
                if *needed == 0 {
                    continue;
                }
                let amount = (*excess)
                    .min(*needed)
                    .min(u128::from(ws.spendable(&source.id)))
                    .min(ws.headroom(&dest.id));
                let Ok(amount) = Amount::try_from(amount) else {
                    continue;
                };
                if amount == 0 || amount < self.config.min_transfer {
                    continue;
                }

                *excess -= u128::from(amount);
                *needed -= u128::from(amount);
                ws.take(&source.id, amount);
                ws.give(&dest.id, amount);

                let mut action = RebalanceAction::transfer(
                    source.id.clone(),
                    dest.id.clone(),
                    Coin::new(self.base_denom.clone(), amount),
                );
                action.priority = self.priority(source.category, dest.category);
                action.risk = RiskLevel::of_source_fraction(
                    amount,
                    source.balance.amount_of(&self.base_denom),
                );
                action.reason = format!("rebalance {} -> {}", source.id, dest.id);
                actions.push(action);
            }
        }
        actions
    }

    fn priority(&self, source: PoolCategory, dest: PoolCategory) -> u32 {
        let deduction = category_weight(source).max(category_weight(dest));
        self.config.base_priority.saturating_sub(deduction).max(1)
    }
}

/// Reserve, operational and security pools are drained and filled first.
fn category_weight(category: PoolCategory) -> u32 {
    match category {
        PoolCategory::Reserve => 50,
        PoolCategory::Operational => 30,
        PoolCategory::Security => 20,
        PoolCategory::Development
        | PoolCategory::Charity
        | PoolCategory::Founder
        | PoolCategory::Liquidity
        | PoolCategory::Incentive => 0,
    }
}

fn triggers(pools: &[Pool], report: &DeviationReport, now: DateTime<Utc>) -> Vec<String> {
    let mut sorted: Vec<&Pool> = pools.iter().filter(|p| p.is_rebalanceable()).collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut reasons = Vec::new();
    for pool in sorted {
        if let Some(dev) = report.get(&pool.id) {
            if dev.exceeds(pool.rebalance.threshold_bps) {
                reasons.push(format!(
                    "{} deviates {:+.2}% from target",
                    pool.id,
                    dev.delta * 100.0
                ));
            }
        }
        if pool.past_max_gap(now) {
            reasons.push(format!("{} exceeded its maximum rebalance gap", pool.id));
        }
    }
    reasons
}

fn plan_id(pools: &[Pool], now: DateTime<Utc>) -> TreasuryResult<String> {
    let mut sorted: Vec<&Pool> = pools.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    let material = serde_json::json!({
        "pools": sorted,
        "now": now,
    });
    let bytes =
        serde_json::to_vec(&material).map_err(|e| TreasuryError::Serialization(e.to_string()))?;
    let hash = blake3::hash(&bytes).to_hex();
    Ok(format!("plan-{}", &hash[..16]))
}

/// Running view of base-denomination movements already committed to the
/// plan being built, so later actions respect floors and ceilings.
struct Workspace {
    spendable: BTreeMap<PoolId, Amount>,
    headroom: BTreeMap<PoolId, Option<Amount>>,
    sent: BTreeMap<PoolId, Amount>,
    received: BTreeMap<PoolId, Amount>,
}

impl Workspace {
    fn new(pools: &[&Pool], denom: &Denom) -> Self {
        let mut spendable = BTreeMap::new();
        let mut headroom = BTreeMap::new();
        for pool in pools {
            let held = pool.balance.amount_of(denom);
            spendable.insert(
                pool.id.clone(),
                held.saturating_sub(pool.min_balance.amount_of(denom)),
            );
            let room = pool
                .max_balance
                .contains_denom(denom)
                .then(|| pool.max_balance.amount_of(denom).saturating_sub(held));
            headroom.insert(pool.id.clone(), room);
        }
        Self {
            spendable,
            headroom,
            sent: BTreeMap::new(),
            received: BTreeMap::new(),
        }
    }

    fn spendable(&self, id: &PoolId) -> Amount {
        self.spendable.get(id).copied().unwrap_or(0)
    }

    fn headroom(&self, id: &PoolId) -> u128 {
        match self.headroom.get(id) {
            Some(Some(room)) => u128::from(*room),
            _ => u128::MAX,
        }
    }

    fn sent(&self, id: &PoolId) -> Amount {
        self.sent.get(id).copied().unwrap_or(0)
    }

    fn received(&self, id: &PoolId) -> Amount {
        self.received.get(id).copied().unwrap_or(0)
    }

    fn take(&mut self, id: &PoolId, amount: Amount) {
        if let Some(s) = self.spendable.get_mut(id) {
            *s = s.saturating_sub(amount);
        }
        if let Some(Some(room)) = self.headroom.get_mut(id) {
            *room = room.saturating_add(amount);
        }
        let sent = self.sent.entry(id.clone()).or_insert(0);
        *sent = sent.saturating_add(amount);
    }

    fn give(&mut self, id: &PoolId, amount: Amount) {
        if let Some(Some(room)) = self.headroom.get_mut(id) {
            *room = room.saturating_sub(amount);
        }
        let received = self.received.entry(id.clone()).or_insert(0);
        *received = received.saturating_add(amount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::StaticPriceFeed;
    use crate::testing::{namo, pool, t0, BASE};
    use chrono::Duration;
    use proptest::prelude::*;
    use treasury_types::{ActionType, Balance};

    fn planner() -> RebalancePlanner {
        RebalancePlanner::new(
            PlannerConfig::default(),
            Denom::base(),
            Arc::new(StaticPriceFeed::new(Denom::base())),
        )
    }

    fn scenario() -> Vec<Pool> {
        vec![
            pool("reserve", PoolCategory::Reserve, 3_000, 1_000_000 * BASE),
            pool("operational", PoolCategory::Operational, 2_500, 150_000 * BASE),
            pool("development", PoolCategory::Development, 2_000, 50_000 * BASE),
        ]
    }

    fn apply(pools: &mut [Pool], plan: &RebalancePlan) {
        for action in &plan.actions {
            let (Some(src), Some(dst)) = (&action.source, &action.destination) else {
                continue;
            };
            for p in pools.iter_mut() {
                if &p.id == src {
                    p.balance.sub(&action.amount).unwrap();
                } else if &p.id == dst {
                    p.balance.add(&action.amount).unwrap();
                }
            }
        }
    }

    #[test]
    fn reserve_feeds_under_allocated_pools_in_id_order() {
        let pools = scenario();
        let plan = planner()
            .generate_plan(&pools, t0(), &BTreeSet::new())
            .unwrap()
            .expect("plan");

        assert_eq!(plan.actions.len(), 2);
        let first = &plan.actions[0];
        assert_eq!(first.source, Some(PoolId::from("reserve")));
        assert_eq!(first.destination, Some(PoolId::from("development")));
        assert_eq!(first.amount, namo(190_000 * BASE));
        assert_eq!(first.priority, 50);

        let second = &plan.actions[1];
        assert_eq!(second.destination, Some(PoolId::from("operational")));
        assert_eq!(second.amount, namo(150_000 * BASE));
        assert!(plan.actions.iter().all(|a| a.action_type == ActionType::Transfer));
        assert_eq!(plan.total_moved.amount_of(&Denom::base()), 340_000 * BASE);

        let before = planner().analyze(&pools).unwrap();
        let mut after_pools = pools.clone();
        apply(&mut after_pools, &plan);
        let after = planner().analyze(&after_pools).unwrap();
        let ops = PoolId::from("operational");
        let reserve = PoolId::from("reserve");
        assert!(after.get(&ops).unwrap().current_fraction > before.get(&ops).unwrap().current_fraction);
        assert!(
            after.get(&reserve).unwrap().current_fraction
                < before.get(&reserve).unwrap().current_fraction
        );
    }

    #[test]
    fn emergency_top_up_comes_first_from_reserve() {
        let mut pools = scenario();
        pools[2].min_balance = Balance::single(namo(60_000 * BASE));
        let plan = planner()
            .generate_plan(&pools, t0(), &BTreeSet::new())
            .unwrap()
            .unwrap();

        let first = &plan.actions[0];
        assert!(first.emergency);
        assert_eq!(first.priority, EMERGENCY_PRIORITY);
        assert_eq!(first.risk, RiskLevel::High);
        assert_eq!(first.amount, namo(10_000 * BASE));
        assert_eq!(first.destination, Some(PoolId::from("development")));
        assert_eq!(plan.risk, RiskLevel::High);
        // The regular match accounts for the top-up already planned.
        let regular: Amount = plan
            .actions
            .iter()
            .filter(|a| !a.emergency && a.destination == Some(PoolId::from("development")))
            .map(|a| a.amount.amount)
            .sum();
        assert_eq!(regular, 180_000 * BASE);
    }

    #[test]
    fn fixed_frozen_cooling_and_busy_pools_are_left_alone() {
        let mut pools = scenario();
        pools[2].rebalance.enabled = false;
        pools[1].rebalance.min_gap_secs = Duration::days(1).num_seconds();
        pools[1].last_rebalance = t0() - Duration::hours(1);
        assert!(planner()
            .generate_plan(&pools, t0(), &BTreeSet::new())
            .unwrap()
            .is_none());

        let pools = scenario();
        let busy: BTreeSet<PoolId> = [PoolId::from("development")].into_iter().collect();
        let plan = planner().generate_plan(&pools, t0(), &busy).unwrap().unwrap();
        assert!(plan
            .actions
            .iter()
            .all(|a| a.destination != Some(PoolId::from("development"))));
    }

    #[test]
    fn max_balance_caps_the_destination() {
        let mut pools = scenario();
        pools[1].max_balance = Balance::single(namo(200_000 * BASE));
        let plan = planner()
            .generate_plan(&pools, t0(), &BTreeSet::new())
            .unwrap()
            .unwrap();
        let into_ops: Amount = plan
            .actions
            .iter()
            .filter(|a| a.destination == Some(PoolId::from("operational")))
            .map(|a| a.amount.amount)
            .sum();
        assert_eq!(into_ops, 50_000 * BASE);
    }

    #[test]
    fn max_gap_alone_triggers_a_cycle() {
        let pools = vec![
            pool("a", PoolCategory::Operational, 5_000, 50 * BASE),
            pool("b", PoolCategory::Development, 5_000, 50 * BASE),
        ];
        assert!(!planner().needs_rebalance(&pools, t0()).unwrap());

        let mut stale = pools.clone();
        stale[0].rebalance.max_gap_secs = Duration::days(7).num_seconds();
        let triggers = planner().rebalance_triggers(&stale, t0()).unwrap();
        assert_eq!(triggers.len(), 1);
        assert!(triggers[0].contains("maximum rebalance gap"));
    }

    #[test]
    fn zero_value_treasury_plans_nothing() {
        let mut pools = scenario();
        for p in &mut pools {
            p.balance = Balance::new();
        }
        assert!(planner()
            .generate_plan(&pools, t0(), &BTreeSet::new())
            .unwrap()
            .is_none());
    }

    fn arb_pools() -> impl Strategy<Value = Vec<Pool>> {
        let categories = prop_oneof![
            Just(PoolCategory::Reserve),
            Just(PoolCategory::Operational),
            Just(PoolCategory::Development),
            Just(PoolCategory::Security),
            Just(PoolCategory::Charity),
        ];
        prop::collection::vec(
            (categories, 0u32..2_500, 0u64..2_000_000, 0u64..200_000, any::<bool>()),
            2..7,
        )
        .prop_map(|specs| {
            specs
                .into_iter()
                .enumerate()
                .map(|(i, (category, target, balance, floor, enabled))| {
                    let mut p = pool(&format!("pool-{i}"), category, target, balance * BASE);
                    p.min_balance = Balance::single(namo(floor * BASE));
                    p.rebalance.enabled = enabled || category == PoolCategory::Reserve;
                    p
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn plans_are_deterministic(pools in arb_pools()) {
            let a = planner().generate_plan(&pools, t0(), &BTreeSet::new()).unwrap();
            let b = planner().generate_plan(&pools, t0(), &BTreeSet::new()).unwrap();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn transfers_respect_floors_and_skip_fixed_pools(pools in arb_pools()) {
            let Some(plan) = planner().generate_plan(&pools, t0(), &BTreeSet::new()).unwrap() else {
                return Ok(());
            };
            let mut after = pools.clone();
            apply(&mut after, &plan);
            for (before, after) in pools.iter().zip(after.iter()) {
                let floor = before.min_balance.amount_of(&Denom::base());
                let held_before = before.balance.amount_of(&Denom::base());
                let held_after = after.balance.amount_of(&Denom::base());
                let emergency_target = plan
                    .actions
                    .iter()
                    .any(|a| a.emergency && a.destination.as_ref() == Some(&before.id));
                if held_after < held_before && !emergency_target {
                    prop_assert!(held_after >= floor);
                }
                if !before.rebalance.enabled {
                    prop_assert_eq!(held_before, held_after);
                }
            }
            let priorities: Vec<u32> = plan.actions.iter().map(|a| a.priority).collect();
            let mut sorted = priorities.clone();
            sorted.sort_unstable();
            prop_assert_eq!(priorities, sorted);
        }

        #[test]
        fn balanced_pools_are_a_no_op(value in 1u64..1_000_000, n in 2usize..6) {
            let target = 10_000 / n as u32;
            let pools: Vec<Pool> = (0..n)
                .map(|i| pool(&format!("p{i}"), PoolCategory::Development, target, value * BASE))
                .collect();
            prop_assert!(!planner().needs_rebalance(&pools, t0()).unwrap());
            prop_assert!(planner().generate_plan(&pools, t0(), &BTreeSet::new()).unwrap().is_none());
        }
    }
}
