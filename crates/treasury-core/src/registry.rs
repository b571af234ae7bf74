//! Pool Registry: the canonical, typed store of treasury pools.
//!
//! Every component receives the registry as an explicit handle; there is no
//! ambient pool state. All writes are validated here:
//! - denominations must be well formed (amounts are unsigned by type)
//! - per-denomination `min_balance <= max_balance`
//! - allocation `min <= target <= max <= 100%`
//! - sum of target allocations across pools `<= 100%`
//! - protected categories keep their rebalancing switch unless governance overrides
//! - new pools and unfreezing need a governance override

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use treasury_store::TreasuryStorage;
use treasury_types::{
    Balance, Denom, Pool, PoolId, PoolStatus, TreasuryError, TreasuryResult, BASIS_POINTS,
};

#[derive(Clone)]
pub struct PoolRegistry {
    store: Arc<dyn TreasuryStorage>,
}

impl PoolRegistry {
    pub fn new(store: Arc<dyn TreasuryStorage>) -> Self {
        Self { store }
    }

    pub async fn get(&self, pool_id: &PoolId) -> TreasuryResult<Pool> {
        self.store
            .get_pool(pool_id)
            .await?
            .ok_or_else(|| TreasuryError::NotFound(format!("pool {} not found", pool_id)))
    }

    /// All pools ordered by id.
    pub async fn list(&self) -> TreasuryResult<Vec<Pool>> {
        Ok(self.store.list_pools().await?)
    }

    /// Seed the fixed pool set. Only valid on an empty registry.
    pub async fn initialize(&self, pools: Vec<Pool>) -> TreasuryResult<()> {
        if !self.store.list_pools().await?.is_empty() {
            return Err(TreasuryError::InvalidTransition(
                "registry already initialized".to_string(),
            ));
        }
        for pool in &pools {
            validate_pool(pool)?;
        }
        ensure_target_sum(&pools)?;
        info!(pools = pools.len(), "treasury registry initialized");
        self.store.commit_pools(pools).await?;
        Ok(())
    }

    /// Upsert one pool.
    pub async fn put(&self, pool: Pool, governance_override: bool) -> TreasuryResult<()> {
        validate_pool(&pool)?;
        let existing = self.store.get_pool(&pool.id).await?;

        match &existing {
            None if !governance_override => {
                warn!(pool_id = %pool.id, "pool creation attempted without governance");
                return Err(TreasuryError::Unauthorized(format!(
                    "creating pool {} requires an executed POOL_CREATION proposal",
                    pool.id
                )));
            }
            Some(current) if !governance_override => {
                if current.category.is_protected()
                    && current.rebalance.enabled != pool.rebalance.enabled
                {
                    warn!(pool_id = %pool.id, "protected rebalance switch flip refused");
                    return Err(TreasuryError::Unauthorized(format!(
                        "rebalancing switch of {} pool {} is governance-protected",
                        current.category.name(),
                        pool.id
                    )));
                }
                if current.status == PoolStatus::Frozen && pool.status == PoolStatus::Active {
                    return Err(TreasuryError::Unauthorized(format!(
                        "unfreezing pool {} requires governance",
                        pool.id
                    )));
                }
            }
            _ => {}
        }

        let mut all = self.store.list_pools().await?;
        match all.iter_mut().find(|p| p.id == pool.id) {
            Some(slot) => *slot = pool.clone(),
            None => all.push(pool.clone()),
        }
        ensure_target_sum(&all)?;

        self.store.upsert_pool(pool).await?;
        Ok(())
    }

    /// Add a pool under a new id. Existing ids are refused.
    pub async fn create(&self, pool: Pool, governance_override: bool) -> TreasuryResult<()> {
        if self.store.get_pool(&pool.id).await?.is_some() {
            return Err(TreasuryError::InvalidInput(format!(
                "pool {} already exists",
                pool.id
            )));
        }
        let pool_id = pool.id.clone();
        self.put(pool, governance_override).await?;
        info!(%pool_id, "pool created");
        Ok(())
    }

    /// Pools are never deleted; freezing takes them out of every flow.
    pub async fn freeze(
        &self,
        pool_id: &PoolId,
        governance_override: bool,
        now: DateTime<Utc>,
    ) -> TreasuryResult<Pool> {
        if !governance_override {
            return Err(TreasuryError::Unauthorized(format!(
                "freezing pool {} requires governance",
                pool_id
            )));
        }
        let mut pool = self.get(pool_id).await?;
        pool.status = PoolStatus::Frozen;
        pool.updated_at = now;
        self.store.upsert_pool(pool.clone()).await?;
        info!(pool_id = %pool_id, "pool frozen");
        Ok(pool)
    }

    /// Atomic balance commit used by execution paths.
    pub(crate) async fn commit(&self, pools: Vec<Pool>) -> TreasuryResult<()> {
        for pool in &pools {
            validate_balances(pool)?;
        }
        self.store.commit_pools(pools).await?;
        Ok(())
    }
}

pub fn validate_pool(pool: &Pool) -> TreasuryResult<()> {
    if pool.id.as_str().trim().is_empty() {
        return Err(TreasuryError::InvalidInput("pool id is empty".to_string()));
    }
    pool.allocation.validate()?;
    pool.rebalance.validate()?;
    validate_balances(pool)?;
    for (denom, floor) in pool.min_balance.iter() {
        if pool.max_balance.contains_denom(denom) && pool.max_balance.amount_of(denom) < *floor {
            return Err(TreasuryError::InvalidInput(format!(
                "pool {}: min balance of {} exceeds max balance",
                pool.id, denom
            )));
        }
    }
    Ok(())
}

fn validate_balances(pool: &Pool) -> TreasuryResult<()> {
    for balance in [&pool.balance, &pool.min_balance, &pool.max_balance] {
        ensure_denoms(&pool.id, balance)?;
    }
    Ok(())
}

fn ensure_denoms(pool_id: &PoolId, balance: &Balance) -> TreasuryResult<()> {
    match balance
        .denoms()
        .find(|d| !Denom::is_well_formed(d.as_str()))
    {
        Some(bad) => Err(TreasuryError::InvalidInput(format!(
            "pool {}: malformed denomination '{}'",
            pool_id, bad
        ))),
        None => Ok(()),
    }
}

fn ensure_target_sum(pools: &[Pool]) -> TreasuryResult<()> {
    let sum: u64 = pools
        .iter()
        .map(|p| u64::from(p.allocation.target_bps))
        .sum();
    if sum > u64::from(BASIS_POINTS) {
        return Err(TreasuryError::InvariantViolation(format!(
            "target allocations sum to {}bps, above 100%",
            sum
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pool, BASE};
    use treasury_store::InMemoryTreasuryStorage;
    use treasury_types::PoolCategory;

    async fn registry_with(pools: Vec<Pool>) -> PoolRegistry {
        let registry = PoolRegistry::new(Arc::new(InMemoryTreasuryStorage::new()));
        registry.initialize(pools).await.unwrap();
        registry
    }

    #[tokio::test]
    async fn unknown_pool_is_not_found() {
        let registry = registry_with(vec![]).await;
        let err = registry.get(&PoolId::from("nope")).await.unwrap_err();
        assert!(matches!(err, TreasuryError::NotFound(_)));
    }

    #[tokio::test]
    async fn founder_switch_needs_override() {
        let mut founder = pool("founder", PoolCategory::Founder, 1_000, 1_000 * BASE);
        founder.rebalance.enabled = false;
        let registry = registry_with(vec![founder.clone()]).await;

        let mut flipped = founder.clone();
        flipped.rebalance.enabled = true;
        let err = registry.put(flipped.clone(), false).await.unwrap_err();
        assert!(matches!(err, TreasuryError::Unauthorized(_)));
        assert!(!registry.get(&founder.id).await.unwrap().rebalance.enabled);

        registry.put(flipped, true).await.unwrap();
        assert!(registry.get(&founder.id).await.unwrap().rebalance.enabled);
    }

    #[tokio::test]
    async fn creation_requires_governance_and_targets_stay_within_total() {
        let registry = registry_with(vec![pool(
            "reserve",
            PoolCategory::Reserve,
            9_000,
            10 * BASE,
        )])
        .await;

        let newcomer = pool("grants", PoolCategory::Development, 500, 0);
        let err = registry.put(newcomer.clone(), false).await.unwrap_err();
        assert!(matches!(err, TreasuryError::Unauthorized(_)));
        registry.put(newcomer, true).await.unwrap();

        let greedy = pool("greedy", PoolCategory::Incentive, 600, 0);
        let err = registry.put(greedy, true).await.unwrap_err();
        assert!(matches!(err, TreasuryError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn malformed_denomination_is_rejected() {
        let registry = registry_with(vec![]).await;
        let mut bad = pool("ops", PoolCategory::Operational, 1_000, 0);
        bad.balance = serde_json::from_value(serde_json::json!({ "NOT A DENOM": 5 })).unwrap();
        let err = registry.put(bad, true).await.unwrap_err();
        assert!(matches!(err, TreasuryError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn unbounded_rebalance_gap_is_refused_at_initialize() {
        let registry = PoolRegistry::new(Arc::new(InMemoryTreasuryStorage::new()));
        let mut ops = pool("ops", PoolCategory::Operational, 1_000, 0);
        ops.rebalance.min_gap_secs = i64::MAX;
        let err = registry.initialize(vec![ops]).await.unwrap_err();
        assert!(matches!(err, TreasuryError::InvalidInput(_)));
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn frozen_pool_stays_frozen_without_governance() {
        let registry = registry_with(vec![pool("ops", PoolCategory::Operational, 1_000, 0)]).await;
        let id = PoolId::from("ops");
        assert!(registry.freeze(&id, false, Utc::now()).await.is_err());
        let frozen = registry.freeze(&id, true, Utc::now()).await.unwrap();
        assert_eq!(frozen.status, PoolStatus::Frozen);

        let mut thawed = frozen;
        thawed.status = PoolStatus::Active;
        assert!(registry.put(thawed, false).await.is_err());
    }
}
