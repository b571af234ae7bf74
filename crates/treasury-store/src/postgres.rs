//! PostgreSQL adapter for treasury storage.
//!
//! Records are stored as JSONB next to the columns needed for filtering and
//! ordering. Pool-pair commits and transaction-log appends each run inside a
//! single SQL transaction.

use crate::chain::compute_transaction_hash;
use crate::traits::{
    BalanceHistoryStore, PlanStore, PoolStore, ProposalFilter, ProposalStore, QueryWindow,
    TransactionStore,
};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Acquire, Row};
use treasury_types::{
    Balance, BalanceSnapshot, GovernanceProposal, PlanStatus, Pool, PoolId, ProposalStatus,
    RebalancePlan, TransactionAppend, TransactionKind, TransactionRecord,
};
use uuid::Uuid;

/// PostgreSQL-backed storage adapter.
#[derive(Clone)]
pub struct PostgresTreasuryStorage {
    pool: PgPool,
}

impl PostgresTreasuryStorage {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS treasury_pools (
                pool_id TEXT PRIMARY KEY,
                category TEXT NOT NULL,
                status TEXT NOT NULL,
                record JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS treasury_plans (
                plan_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS treasury_proposals (
                proposal_id TEXT PRIMARY KEY,
                proposal_type TEXT NOT NULL,
                status TEXT NOT NULL,
                proposer TEXT NOT NULL,
                pool_id TEXT,
                record JSONB NOT NULL,
                submitted_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS treasury_transactions (
                tx_id TEXT PRIMARY KEY,
                sequence BIGINT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                source TEXT,
                destination TEXT,
                amount JSONB NOT NULL,
                value BIGINT NOT NULL,
                reference TEXT,
                memo TEXT NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL,
                previous_hash TEXT,
                hash TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS treasury_balance_history (
                id BIGSERIAL PRIMARY KEY,
                pool_id TEXT NOT NULL,
                balance JSONB NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS treasury_balance_history_pool_idx ON treasury_balance_history (pool_id, recorded_at DESC)",
            "CREATE INDEX IF NOT EXISTS treasury_plans_status_idx ON treasury_plans (status, created_at)",
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl PoolStore for PostgresTreasuryStorage {
    async fn get_pool(&self, pool_id: &PoolId) -> StorageResult<Option<Pool>> {
        let row = sqlx::query("SELECT record FROM treasury_pools WHERE pool_id = $1")
            .bind(pool_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(record_from_row).transpose()
    }

    async fn list_pools(&self) -> StorageResult<Vec<Pool>> {
        let rows = sqlx::query("SELECT record FROM treasury_pools ORDER BY pool_id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(record_from_row).collect()
    }

    async fn upsert_pool(&self, pool: Pool) -> StorageResult<()> {
        self.commit_pools(vec![pool]).await
    }

    async fn commit_pools(&self, pools: Vec<Pool>) -> StorageResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let conn = tx
            .acquire()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        for pool in pools {
            let record = to_json(&pool)?;
            sqlx::query(
                r#"
                INSERT INTO treasury_pools (pool_id, category, status, record, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (pool_id) DO UPDATE
                   SET category = EXCLUDED.category,
                       status = EXCLUDED.status,
                       record = EXCLUDED.record,
                       updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(pool.id.as_str())
            .bind(pool.category.name())
            .bind(if pool.is_active() { "active" } else { "frozen" })
            .bind(record)
            .bind(pool.updated_at)
            .execute(&mut *conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl PlanStore for PostgresTreasuryStorage {
    async fn upsert_plan(&self, plan: RebalancePlan) -> StorageResult<()> {
        let record = to_json(&plan)?;
        sqlx::query(
            r#"
            INSERT INTO treasury_plans (plan_id, status, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (plan_id) DO UPDATE
               SET status = EXCLUDED.status,
                   record = EXCLUDED.record,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(plan.id.clone())
        .bind(plan_status_to_str(plan.status))
        .bind(record)
        .bind(plan.created_at)
        .bind(plan.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_plan(&self, plan_id: &str) -> StorageResult<Option<RebalancePlan>> {
        let row = sqlx::query("SELECT record FROM treasury_plans WHERE plan_id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(record_from_row).transpose()
    }

    async fn list_plans(&self, window: QueryWindow) -> StorageResult<Vec<RebalancePlan>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM treasury_plans
             ORDER BY created_at DESC, plan_id DESC
             LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit_of(window)?)
        .bind(to_i64(window.offset)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(record_from_row).collect()
    }

    async fn plans_with_status(&self, status: PlanStatus) -> StorageResult<Vec<RebalancePlan>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM treasury_plans
             WHERE status = $1
             ORDER BY created_at ASC, plan_id ASC
            "#,
        )
        .bind(plan_status_to_str(status))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl ProposalStore for PostgresTreasuryStorage {
    async fn insert_proposal(&self, proposal: GovernanceProposal) -> StorageResult<()> {
        let record = to_json(&proposal)?;
        sqlx::query(
            r#"
            INSERT INTO treasury_proposals
                (proposal_id, proposal_type, status, proposer, pool_id, record, submitted_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(proposal.id.clone())
        .bind(proposal.proposal_type.name())
        .bind(proposal.status.name())
        .bind(proposal.proposer.clone())
        .bind(proposal.pool_id.as_ref().map(|id| id.0.clone()))
        .bind(record)
        .bind(proposal.submitted_at)
        .bind(proposal.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn update_proposal(
        &self,
        proposal: GovernanceProposal,
        expected_status: ProposalStatus,
    ) -> StorageResult<()> {
        let record = to_json(&proposal)?;
        let result = sqlx::query(
            r#"
            UPDATE treasury_proposals
               SET status = $1,
                   record = $2,
                   updated_at = $3
             WHERE proposal_id = $4
               AND status = $5
            "#,
        )
        .bind(proposal.status.name())
        .bind(record)
        .bind(proposal.updated_at)
        .bind(proposal.id.clone())
        .bind(expected_status.name())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            let exists = self.get_proposal(&proposal.id).await?;
            return Err(match exists {
                None => StorageError::NotFound(format!("proposal {} not found", proposal.id)),
                Some(stored) => StorageError::Conflict(format!(
                    "proposal {} is {:?}, expected {:?}",
                    proposal.id, stored.status, expected_status
                )),
            });
        }
        Ok(())
    }

    async fn get_proposal(&self, proposal_id: &str) -> StorageResult<Option<GovernanceProposal>> {
        let row = sqlx::query("SELECT record FROM treasury_proposals WHERE proposal_id = $1")
            .bind(proposal_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(record_from_row).transpose()
    }

    async fn list_proposals(
        &self,
        filter: &ProposalFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<GovernanceProposal>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM treasury_proposals
             WHERE ($1::TEXT IS NULL OR status = $1)
               AND ($2::TEXT IS NULL OR proposal_type = $2)
               AND ($3::TEXT IS NULL OR proposer = $3)
               AND ($4::TEXT IS NULL OR pool_id = $4)
             ORDER BY submitted_at DESC, proposal_id DESC
             LIMIT $5 OFFSET $6
            "#,
        )
        .bind(filter.status.map(|s| s.name()))
        .bind(filter.proposal_type.map(|t| t.name()))
        .bind(filter.proposer.clone())
        .bind(filter.pool_id.as_ref().map(|id| id.0.clone()))
        .bind(limit_of(window)?)
        .bind(to_i64(window.offset)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl TransactionStore for PostgresTreasuryStorage {
    async fn append_transaction(&self, tx: TransactionAppend) -> StorageResult<TransactionRecord> {
        let mut db_tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let conn = db_tx
            .acquire()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        sqlx::query("LOCK TABLE treasury_transactions IN EXCLUSIVE MODE")
            .execute(&mut *conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let last = sqlx::query(
            "SELECT sequence, hash FROM treasury_transactions ORDER BY sequence DESC LIMIT 1",
        )
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let (sequence, previous_hash) = if let Some(row) = last {
            let seq: i64 = row
                .try_get("sequence")
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            let prev: String = row
                .try_get("hash")
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            (seq + 1, Some(prev))
        } else {
            (1_i64, None)
        };

        let hash = compute_transaction_hash(&tx, previous_hash.as_deref(), sequence as u64)?;
        let tx_id = format!("tx-{}", Uuid::new_v4());
        let amount = to_json(&tx.amount)?;
        let value = i64::try_from(tx.value)
            .map_err(|_| StorageError::InvalidInput("transaction value too large".to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO treasury_transactions
                (tx_id, sequence, kind, source, destination, amount, value, reference, memo, timestamp, previous_hash, hash)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(tx_id.clone())
        .bind(sequence)
        .bind(tx.kind.name())
        .bind(tx.source.as_ref().map(|id| id.0.clone()))
        .bind(tx.destination.as_ref().map(|id| id.0.clone()))
        .bind(amount)
        .bind(value)
        .bind(tx.reference.clone())
        .bind(tx.memo.clone())
        .bind(tx.timestamp)
        .bind(previous_hash.clone())
        .bind(hash.clone())
        .execute(&mut *conn)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        db_tx
            .commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(TransactionRecord {
            tx_id,
            sequence: sequence as u64,
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
        })
    }

    async fn list_transactions(
        &self,
        window: QueryWindow,
    ) -> StorageResult<Vec<TransactionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT tx_id, sequence, kind, source, destination, amount, value, reference, memo, timestamp, previous_hash, hash
              FROM treasury_transactions
             ORDER BY sequence DESC
             LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit_of(window)?)
        .bind(to_i64(window.offset)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(transaction_row_to_record).collect()
    }

    async fn transactions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<TransactionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT tx_id, sequence, kind, source, destination, amount, value, reference, memo, timestamp, previous_hash, hash
              FROM treasury_transactions
             WHERE timestamp >= $1 AND timestamp <= $2
             ORDER BY sequence ASC
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(transaction_row_to_record).collect()
    }

    async fn latest_transaction_hash(&self) -> StorageResult<Option<String>> {
        let row =
            sqlx::query("SELECT hash FROM treasury_transactions ORDER BY sequence DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

        row.map(|r| r.try_get::<String, _>("hash"))
            .transpose()
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

#[async_trait]
impl BalanceHistoryStore for PostgresTreasuryStorage {
    async fn record_balance(&self, snapshot: BalanceSnapshot) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO treasury_balance_history (pool_id, balance, recorded_at) VALUES ($1, $2, $3)",
        )
        .bind(snapshot.pool_id.as_str())
        .bind(to_json(&snapshot.balance)?)
        .bind(snapshot.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn balance_history(
        &self,
        pool_id: &PoolId,
        window: QueryWindow,
    ) -> StorageResult<Vec<BalanceSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT pool_id, balance, recorded_at
              FROM treasury_balance_history
             WHERE pool_id = $1
             ORDER BY recorded_at DESC, id DESC
             LIMIT $2 OFFSET $3
            "#,
        )
        .bind(pool_id.as_str())
        .bind(limit_of(window)?)
        .bind(to_i64(window.offset)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let balance_json: serde_json::Value = row
                    .try_get("balance")
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                Ok(BalanceSnapshot {
                    pool_id: PoolId::new(
                        row.try_get::<String, _>("pool_id")
                            .map_err(|e| StorageError::Backend(e.to_string()))?,
                    ),
                    balance: from_json::<Balance>(balance_json)?,
                    recorded_at: row
                        .try_get("recorded_at")
                        .map_err(|e| StorageError::Backend(e.to_string()))?,
                })
            })
            .collect()
    }
}

fn record_from_row<T: DeserializeOwned>(row: PgRow) -> StorageResult<T> {
    let value: serde_json::Value = row
        .try_get("record")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    from_json(value)
}

fn transaction_row_to_record(row: PgRow) -> StorageResult<TransactionRecord> {
    let kind: String = row
        .try_get("kind")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let source: Option<String> = row
        .try_get("source")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let destination: Option<String> = row
        .try_get("destination")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let amount_json: serde_json::Value = row
        .try_get("amount")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    Ok(TransactionRecord {
        tx_id: row
            .try_get("tx_id")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        sequence: row
            .try_get::<i64, _>("sequence")
            .map_err(|e| StorageError::Backend(e.to_string()))? as u64,
        kind: TransactionKind::parse(&kind).ok_or_else(|| {
            StorageError::Serialization(format!("unknown transaction kind '{}'", kind))
        })?,
        source: source.map(PoolId::new),
        destination: destination.map(PoolId::new),
        amount: from_json(amount_json)?,
        value: row
            .try_get::<i64, _>("value")
            .map_err(|e| StorageError::Backend(e.to_string()))? as u64,
        reference: row
            .try_get("reference")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        memo: row
            .try_get("memo")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        timestamp: row
            .try_get("timestamp")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        previous_hash: row
            .try_get("previous_hash")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        hash: row
            .try_get("hash")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
    })
}

fn plan_status_to_str(status: PlanStatus) -> &'static str {
    match status {
        PlanStatus::Planned => "PLANNED",
        PlanStatus::Executing => "EXECUTING",
        PlanStatus::Executed => "EXECUTED",
        PlanStatus::PartiallyExecuted => "PARTIALLY_EXECUTED",
        PlanStatus::Failed => "FAILED",
        PlanStatus::Cancelled => "CANCELLED",
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> StorageResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(value: serde_json::Value) -> StorageResult<T> {
    serde_json::from_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn map_sqlx_conflict(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return StorageError::Conflict(db_err.message().to_string());
        }
    }
    StorageError::Backend(err.to_string())
}

fn to_i64(value: usize) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidInput("window value too large".to_string()))
}

/// `LIMIT NULL` is unbounded in PostgreSQL.
fn limit_of(window: QueryWindow) -> StorageResult<Option<i64>> {
    if window.limit == 0 {
        Ok(None)
    } else {
        to_i64(window.limit).map(Some)
    }
}
