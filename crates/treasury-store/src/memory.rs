//! In-memory reference implementation of the treasury storage traits.
//!
//! Deterministic and test-friendly. Production deployments should use the
//! PostgreSQL adapter for source-of-truth data.

use crate::chain::compute_transaction_hash;
use crate::traits::{
    BalanceHistoryStore, PlanStore, PoolStore, ProposalFilter, ProposalStore, QueryWindow,
    TransactionStore,
};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use treasury_types::{
    BalanceSnapshot, GovernanceProposal, PlanStatus, Pool, PoolId, ProposalStatus, RebalancePlan,
    TransactionAppend, TransactionRecord,
};
use uuid::Uuid;

/// In-memory treasury storage adapter.
#[derive(Default)]
pub struct InMemoryTreasuryStorage {
    pools: RwLock<BTreeMap<PoolId, Pool>>,
    plans: RwLock<HashMap<String, RebalancePlan>>,
    proposals: RwLock<HashMap<String, GovernanceProposal>>,
    transactions: RwLock<Vec<TransactionRecord>>,
    history: RwLock<HashMap<PoolId, Vec<BalanceSnapshot>>>,
}

impl InMemoryTreasuryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(what: &str) -> StorageError {
    StorageError::Backend(format!("{} lock poisoned", what))
}

#[async_trait]
impl PoolStore for InMemoryTreasuryStorage {
    async fn get_pool(&self, pool_id: &PoolId) -> StorageResult<Option<Pool>> {
        let guard = self.pools.read().map_err(|_| poisoned("pools"))?;
        Ok(guard.get(pool_id).cloned())
    }

    async fn list_pools(&self) -> StorageResult<Vec<Pool>> {
        let guard = self.pools.read().map_err(|_| poisoned("pools"))?;
        Ok(guard.values().cloned().collect())
    }

    async fn upsert_pool(&self, pool: Pool) -> StorageResult<()> {
        let mut guard = self.pools.write().map_err(|_| poisoned("pools"))?;
        guard.insert(pool.id.clone(), pool);
        Ok(())
    }

    async fn commit_pools(&self, pools: Vec<Pool>) -> StorageResult<()> {
        // A single write guard makes the batch atomic for readers.
        let mut guard = self.pools.write().map_err(|_| poisoned("pools"))?;
        for pool in pools {
            guard.insert(pool.id.clone(), pool);
        }
        Ok(())
    }
}

#[async_trait]
impl PlanStore for InMemoryTreasuryStorage {
    async fn upsert_plan(&self, plan: RebalancePlan) -> StorageResult<()> {
        let mut guard = self.plans.write().map_err(|_| poisoned("plans"))?;
        guard.insert(plan.id.clone(), plan);
        Ok(())
    }

    async fn get_plan(&self, plan_id: &str) -> StorageResult<Option<RebalancePlan>> {
        let guard = self.plans.read().map_err(|_| poisoned("plans"))?;
        Ok(guard.get(plan_id).cloned())
    }

    async fn list_plans(&self, window: QueryWindow) -> StorageResult<Vec<RebalancePlan>> {
        let guard = self.plans.read().map_err(|_| poisoned("plans"))?;
        let mut values = guard.values().cloned().collect::<Vec<_>>();
        values.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(window.apply(values))
    }

    async fn plans_with_status(&self, status: PlanStatus) -> StorageResult<Vec<RebalancePlan>> {
        let guard = self.plans.read().map_err(|_| poisoned("plans"))?;
        let mut values = guard
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(values)
    }
}

#[async_trait]
impl ProposalStore for InMemoryTreasuryStorage {
    async fn insert_proposal(&self, proposal: GovernanceProposal) -> StorageResult<()> {
        let mut guard = self.proposals.write().map_err(|_| poisoned("proposals"))?;
        if guard.contains_key(&proposal.id) {
            return Err(StorageError::Conflict(format!(
                "proposal {} already exists",
                proposal.id
            )));
        }
        guard.insert(proposal.id.clone(), proposal);
        Ok(())
    }

    async fn update_proposal(
        &self,
        proposal: GovernanceProposal,
        expected_status: ProposalStatus,
    ) -> StorageResult<()> {
        let mut guard = self.proposals.write().map_err(|_| poisoned("proposals"))?;
        let stored = guard
            .get_mut(&proposal.id)
            .ok_or_else(|| StorageError::NotFound(format!("proposal {} not found", proposal.id)))?;
        if stored.status != expected_status {
            return Err(StorageError::Conflict(format!(
                "proposal {} is {:?}, expected {:?}",
                proposal.id, stored.status, expected_status
            )));
        }
        *stored = proposal;
        Ok(())
    }

    async fn get_proposal(&self, proposal_id: &str) -> StorageResult<Option<GovernanceProposal>> {
        let guard = self.proposals.read().map_err(|_| poisoned("proposals"))?;
        Ok(guard.get(proposal_id).cloned())
    }

    async fn list_proposals(
        &self,
        filter: &ProposalFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<GovernanceProposal>> {
        let guard = self.proposals.read().map_err(|_| poisoned("proposals"))?;
        let mut values = guard
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| {
            b.submitted_at
                .cmp(&a.submitted_at)
                .then(b.id.cmp(&a.id))
        });
        Ok(window.apply(values))
    }
}

#[async_trait]
impl TransactionStore for InMemoryTreasuryStorage {
    async fn append_transaction(&self, tx: TransactionAppend) -> StorageResult<TransactionRecord> {
        let mut guard = self
            .transactions
            .write()
            .map_err(|_| poisoned("transactions"))?;

        let previous_hash = guard.last().map(|r| r.hash.clone());
        let sequence = guard.len() as u64 + 1;
        let hash = compute_transaction_hash(&tx, previous_hash.as_deref(), sequence)?;

        let record = TransactionRecord {
            tx_id: format!("tx-{}", Uuid::new_v4()),
            sequence,
            kind: tx.kind,
            source: tx.source,
            destination: tx.destination,
            amount: tx.amount,
            value: tx.value,
            reference: tx.reference,
            memo: tx.memo,
            timestamp: tx.timestamp,
            previous_hash,
            hash,
        };
        guard.push(record.clone());
        Ok(record)
    }

    async fn list_transactions(
        &self,
        window: QueryWindow,
    ) -> StorageResult<Vec<TransactionRecord>> {
        let guard = self
            .transactions
            .read()
            .map_err(|_| poisoned("transactions"))?;
        let mut values = guard.clone();
        values.reverse();
        Ok(window.apply(values))
    }

    async fn transactions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<TransactionRecord>> {
        let guard = self
            .transactions
            .read()
            .map_err(|_| poisoned("transactions"))?;
        Ok(guard
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp <= to)
            .cloned()
            .collect())
    }

    async fn latest_transaction_hash(&self) -> StorageResult<Option<String>> {
        let guard = self
            .transactions
            .read()
            .map_err(|_| poisoned("transactions"))?;
        Ok(guard.last().map(|r| r.hash.clone()))
    }
}

#[async_trait]
impl BalanceHistoryStore for InMemoryTreasuryStorage {
    async fn record_balance(&self, snapshot: BalanceSnapshot) -> StorageResult<()> {
        let mut guard = self.history.write().map_err(|_| poisoned("history"))?;
        guard
            .entry(snapshot.pool_id.clone())
            .or_default()
            .push(snapshot);
        Ok(())
    }

    async fn balance_history(
        &self,
        pool_id: &PoolId,
        window: QueryWindow,
    ) -> StorageResult<Vec<BalanceSnapshot>> {
        let guard = self.history.read().map_err(|_| poisoned("history"))?;
        let mut values = guard.get(pool_id).cloned().unwrap_or_default();
        values.reverse();
        Ok(window.apply(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::verify_transaction_chain;
    use chrono::Duration;
    use treasury_types::{Balance, Coin, Denom, TransactionKind};

    fn deposit(at: DateTime<Utc>, amount: u64) -> TransactionAppend {
        TransactionAppend {
            kind: TransactionKind::Deposit,
            source: None,
            destination: Some(PoolId::from("operational")),
            amount: Balance::single(Coin::new(Denom::new("namo").unwrap(), amount)),
            value: amount,
            reference: None,
            memo: "inflow".to_string(),
            timestamp: at,
        }
    }

    #[tokio::test]
    async fn transaction_chain_hashes_are_linked() {
        let storage = InMemoryTreasuryStorage::new();
        let now = Utc::now();
        let first = storage.append_transaction(deposit(now, 10)).await.unwrap();
        let second = storage
            .append_transaction(deposit(now + Duration::seconds(1), 20))
            .await
            .unwrap();

        assert_eq!(second.previous_hash, Some(first.hash.clone()));
        assert_eq!(second.sequence, 2);

        let mut ascending = storage
            .list_transactions(QueryWindow::default())
            .await
            .unwrap();
        ascending.reverse();
        verify_transaction_chain(&ascending).unwrap();

        ascending[0].value = 11;
        assert!(verify_transaction_chain(&ascending).is_err());
    }

    #[tokio::test]
    async fn history_is_newest_first_and_windowed() {
        let storage = InMemoryTreasuryStorage::new();
        let pool = PoolId::from("reserve");
        let start = Utc::now();
        for i in 0..5 {
            storage
                .record_balance(BalanceSnapshot {
                    pool_id: pool.clone(),
                    balance: Balance::single(Coin::new(Denom::new("namo").unwrap(), i + 1)),
                    recorded_at: start + Duration::seconds(i as i64),
                })
                .await
                .unwrap();
        }

        let page = storage
            .balance_history(&pool, QueryWindow::new(2, 1))
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[0].recorded_at > page[1].recorded_at);
        assert_eq!(page[0].recorded_at, start + Duration::seconds(3));
    }
}
