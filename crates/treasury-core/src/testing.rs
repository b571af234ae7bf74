//! Fixtures shared by the unit tests of this crate.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use ed25519_dalek::SigningKey;
use std::sync::atomic::{AtomicUsize, Ordering};
use treasury_store::{
    BalanceHistoryStore, InMemoryTreasuryStorage, PlanStore, PoolStore, ProposalFilter,
    ProposalStore, QueryWindow, StorageError, StorageResult, TransactionStore,
};
use treasury_types::{
    AccessControl, Allocation, Amount, AutoExecutePolicy, Balance, BalanceSnapshot, Coin, Denom,
    GovernanceProposal, PlanStatus, Pool, PoolCategory, PoolId, PoolStatus, ProposalStatus,
    RebalanceConfig, RebalancePlan, RiskLevel, Role, TransactionAppend, TransactionRecord,
    MINOR_UNITS,
};

pub const BASE: Amount = MINOR_UNITS;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap()
}

pub fn namo(amount: Amount) -> Coin {
    Coin::new(Denom::base(), amount)
}

/// Unrestricted pool: wide corridor, 5% threshold, no gaps, auto-executes
/// any transfer.
pub fn pool(id: &str, category: PoolCategory, target_bps: u32, balance: Amount) -> Pool {
    Pool {
        id: PoolId::from(id),
        label: id.to_string(),
        category,
        allocation: Allocation::new(target_bps, 0, 10_000),
        balance: Balance::single(namo(balance)),
        min_balance: Balance::new(),
        max_balance: Balance::new(),
        rebalance: RebalanceConfig::new(500, Duration::zero(), Duration::zero()),
        access: AccessControl {
            required_signatures: 2,
            authorized_roles: vec![Role::TreasuryManager],
            governance_required: false,
            auto_execute: AutoExecutePolicy::transfers_up_to(Amount::MAX, RiskLevel::High),
        },
        last_rebalance: t0() - Duration::days(365),
        status: PoolStatus::Active,
        created_at: t0() - Duration::days(365),
        updated_at: t0() - Duration::days(365),
    }
}

pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

/// In-memory storage whose next `n` transaction appends fail.
pub struct FlakyStorage {
    inner: InMemoryTreasuryStorage,
    failing_appends: AtomicUsize,
}

impl FlakyStorage {
    pub fn failing_appends(n: usize) -> Self {
        Self {
            inner: InMemoryTreasuryStorage::new(),
            failing_appends: AtomicUsize::new(n),
        }
    }
}

#[async_trait]
impl PoolStore for FlakyStorage {
    async fn get_pool(&self, pool_id: &PoolId) -> StorageResult<Option<Pool>> {
        self.inner.get_pool(pool_id).await
    }

    async fn list_pools(&self) -> StorageResult<Vec<Pool>> {
        self.inner.list_pools().await
    }

    async fn upsert_pool(&self, pool: Pool) -> StorageResult<()> {
        self.inner.upsert_pool(pool).await
    }

    async fn commit_pools(&self, pools: Vec<Pool>) -> StorageResult<()> {
        self.inner.commit_pools(pools).await
    }
}

#[async_trait]
impl PlanStore for FlakyStorage {
    async fn upsert_plan(&self, plan: RebalancePlan) -> StorageResult<()> {
        self.inner.upsert_plan(plan).await
    }

    async fn get_plan(&self, plan_id: &str) -> StorageResult<Option<RebalancePlan>> {
        self.inner.get_plan(plan_id).await
    }

    async fn list_plans(&self, window: QueryWindow) -> StorageResult<Vec<RebalancePlan>> {
        self.inner.list_plans(window).await
    }

    async fn plans_with_status(&self, status: PlanStatus) -> StorageResult<Vec<RebalancePlan>> {
        self.inner.plans_with_status(status).await
    }
}

#[async_trait]
impl ProposalStore for FlakyStorage {
    async fn insert_proposal(&self, proposal: GovernanceProposal) -> StorageResult<()> {
        self.inner.insert_proposal(proposal).await
    }

    async fn update_proposal(
        &self,
        proposal: GovernanceProposal,
        expected_status: ProposalStatus,
    ) -> StorageResult<()> {
        self.inner.update_proposal(proposal, expected_status).await
    }

    async fn get_proposal(&self, proposal_id: &str) -> StorageResult<Option<GovernanceProposal>> {
        self.inner.get_proposal(proposal_id).await
    }

    async fn list_proposals(
        &self,
        filter: &ProposalFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<GovernanceProposal>> {
        self.inner.list_proposals(filter, window).await
    }
}

#[async_trait]
impl TransactionStore for FlakyStorage {
    async fn append_transaction(&self, tx: TransactionAppend) -> StorageResult<TransactionRecord> {
        let armed = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(StorageError::Backend("transaction log unavailable".to_string()));
        }
        self.inner.append_transaction(tx).await
    }

    async fn list_transactions(
        &self,
        window: QueryWindow,
    ) -> StorageResult<Vec<TransactionRecord>> {
        self.inner.list_transactions(window).await
    }

    async fn transactions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<TransactionRecord>> {
        self.inner.transactions_between(from, to).await
    }

    async fn latest_transaction_hash(&self) -> StorageResult<Option<String>> {
        self.inner.latest_transaction_hash().await
    }
}

#[async_trait]
impl BalanceHistoryStore for FlakyStorage {
    async fn record_balance(&self, snapshot: BalanceSnapshot) -> StorageResult<()> {
        self.inner.record_balance(snapshot).await
    }

    async fn balance_history(
        &self,
        pool_id: &PoolId,
        window: QueryWindow,
    ) -> StorageResult<Vec<BalanceSnapshot>> {
        self.inner.balance_history(pool_id, window).await
    }
}
