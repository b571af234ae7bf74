use crate::StorageResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use treasury_types::{
    BalanceSnapshot, GovernanceProposal, PlanStatus, Pool, PoolId, ProposalStatus, ProposalType,
    RebalancePlan, TransactionAppend, TransactionRecord,
};

/// Generic query window for paged reads. `limit == 0` means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

impl QueryWindow {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }

    pub fn apply<T>(self, items: Vec<T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        if self.limit == 0 {
            iter.collect()
        } else {
            iter.take(self.limit).collect()
        }
    }
}

/// Conjunctive proposal filter. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ProposalFilter {
    pub status: Option<ProposalStatus>,
    pub proposal_type: Option<ProposalType>,
    pub proposer: Option<String>,
    pub pool_id: Option<PoolId>,
}

impl ProposalFilter {
    pub fn matches(&self, proposal: &GovernanceProposal) -> bool {
        self.status.map_or(true, |s| proposal.status == s)
            && self
                .proposal_type
                .map_or(true, |t| proposal.proposal_type == t)
            && self
                .proposer
                .as_deref()
                .map_or(true, |p| proposal.proposer == p)
            && self
                .pool_id
                .as_ref()
                .map_or(true, |id| proposal.pool_id.as_ref() == Some(id))
    }
}

/// Pool records keyed by id.
#[async_trait]
pub trait PoolStore: Send + Sync {
    async fn get_pool(&self, pool_id: &PoolId) -> StorageResult<Option<Pool>>;

    /// All pools ordered by id.
    async fn list_pools(&self) -> StorageResult<Vec<Pool>>;

    async fn upsert_pool(&self, pool: Pool) -> StorageResult<()>;

    /// Write several pools as one unit: either all land or none do.
    async fn commit_pools(&self, pools: Vec<Pool>) -> StorageResult<()>;
}

/// Rebalance plans with their actions inline.
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn upsert_plan(&self, plan: RebalancePlan) -> StorageResult<()>;
    async fn get_plan(&self, plan_id: &str) -> StorageResult<Option<RebalancePlan>>;

    /// Newest first.
    async fn list_plans(&self, window: QueryWindow) -> StorageResult<Vec<RebalancePlan>>;

    /// Oldest first, so suspended plans resume in creation order.
    async fn plans_with_status(&self, status: PlanStatus) -> StorageResult<Vec<RebalancePlan>>;
}

/// Governance proposals with signatures and votes inline.
#[async_trait]
pub trait ProposalStore: Send + Sync {
    /// Fails with `Conflict` if the id already exists.
    async fn insert_proposal(&self, proposal: GovernanceProposal) -> StorageResult<()>;

    /// Compare-and-set on status: the stored record must still be in
    /// `expected_status`, otherwise `Conflict`.
    async fn update_proposal(
        &self,
        proposal: GovernanceProposal,
        expected_status: ProposalStatus,
    ) -> StorageResult<()>;

    async fn get_proposal(&self, proposal_id: &str) -> StorageResult<Option<GovernanceProposal>>;

    /// Newest first.
    async fn list_proposals(
        &self,
        filter: &ProposalFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<GovernanceProposal>>;
}

/// Append-only transaction log.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Append and return the canonical, hash-linked stored record.
    async fn append_transaction(&self, tx: TransactionAppend) -> StorageResult<TransactionRecord>;

    /// Newest first.
    async fn list_transactions(&self, window: QueryWindow)
        -> StorageResult<Vec<TransactionRecord>>;

    /// Ascending by sequence, inclusive bounds.
    async fn transactions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<TransactionRecord>>;

    async fn latest_transaction_hash(&self) -> StorageResult<Option<String>>;
}

/// Per-pool balance snapshots.
#[async_trait]
pub trait BalanceHistoryStore: Send + Sync {
    async fn record_balance(&self, snapshot: BalanceSnapshot) -> StorageResult<()>;

    /// Newest first.
    async fn balance_history(
        &self,
        pool_id: &PoolId,
        window: QueryWindow,
    ) -> StorageResult<Vec<BalanceSnapshot>>;
}

/// Unified storage bundle used by the treasury engine.
pub trait TreasuryStorage:
    PoolStore + PlanStore + ProposalStore + TransactionStore + BalanceHistoryStore + Send + Sync
{
}

impl<T> TreasuryStorage for T where
    T: PoolStore + PlanStore + ProposalStore + TransactionStore + BalanceHistoryStore + Send + Sync
{
}
