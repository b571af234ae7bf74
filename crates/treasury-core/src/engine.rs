//! Treasury engine: one handle over registry, planner, executor and gate.
//!
//! Every state-changing call takes the writer mutex, so cycles, flows and
//! governance commands are serialized. Queries go straight to storage and
//! never wait on it.

use crate::config::TreasuryConfig;
use crate::deviation::DegenerateStateWarning;
use crate::events::EventSink;
use crate::execution::{active_pool, credited, debited, PlanExecutor};
use crate::governance::{assess_risk, GovernanceGate, ProposalDraft, Signer, SignerRoster};
use crate::ledger::LedgerClient;
use crate::planner::RebalancePlanner;
use crate::pricing::PriceFeed;
use crate::query::TreasuryQueries;
use crate::registry::{validate_pool, PoolRegistry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use treasury_store::TreasuryStorage;
use treasury_types::{
    ActionType, Amount, Balance, Coin, GovernanceProposal, PlanStatus, Pool, PoolCategory, PoolId,
    ProposalPayload, ProposalStatus, ProposalType, RebalancePlan, RiskLevel, Role, TransactionAppend,
    TransactionKind, TransactionRecord, TreasuryError, TreasuryResult, VoteChoice,
};
use uuid::Uuid;

/// What one `run_cycle` did.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub at: DateTime<Utc>,
    /// Proposals whose status the deadline sweep changed.
    pub swept_proposals: Vec<String>,
    /// Suspended plans that were picked up again.
    pub resumed_plans: Vec<String>,
    pub triggers: Vec<String>,
    /// Plan generated this cycle, as persisted after execution.
    pub plan: Option<RebalancePlan>,
    pub warning: Option<DegenerateStateWarning>,
}

/// Result of a withdrawal request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WithdrawalOutcome {
    Executed(TransactionRecord),
    Gated(GovernanceProposal),
}

type Move = (String, String, Coin);

pub struct TreasuryEngine {
    config: RwLock<TreasuryConfig>,
    store: Arc<dyn TreasuryStorage>,
    registry: PoolRegistry,
    gate: Arc<GovernanceGate>,
    executor: PlanExecutor,
    ledger: Arc<dyn LedgerClient>,
    prices: Arc<dyn PriceFeed>,
    writer: Mutex<()>,
}

impl TreasuryEngine {
    pub fn new(
        config: TreasuryConfig,
        store: Arc<dyn TreasuryStorage>,
        ledger: Arc<dyn LedgerClient>,
        prices: Arc<dyn PriceFeed>,
        events: Arc<dyn EventSink>,
        roster: SignerRoster,
    ) -> TreasuryResult<Self> {
        config.validate()?;
        let registry = PoolRegistry::new(store.clone());
        let gate = Arc::new(GovernanceGate::new(
            config.governance.clone(),
            store.clone(),
            roster,
            events.clone(),
        ));
        let executor = PlanExecutor::new(
            store.clone(),
            registry.clone(),
            ledger.clone(),
            prices.clone(),
            events,
            gate.clone(),
        );
        Ok(Self {
            config: RwLock::new(config),
            store,
            registry,
            gate,
            executor,
            ledger,
            prices,
            writer: Mutex::new(()),
        })
    }

    pub fn config(&self) -> TreasuryResult<TreasuryConfig> {
        self.config
            .read()
            .map(|c| c.clone())
            .map_err(|_| TreasuryError::Storage("treasury config lock poisoned".to_string()))
    }

    pub fn registry(&self) -> &PoolRegistry {
        &self.registry
    }

    pub fn gate(&self) -> &GovernanceGate {
        &self.gate
    }

    pub fn queries(&self) -> TreasuryResult<TreasuryQueries> {
        Ok(TreasuryQueries::new(
            self.store.clone(),
            self.prices.clone(),
            self.config()?.rebalance_cost_bps,
        ))
    }

    fn planner(&self) -> TreasuryResult<RebalancePlanner> {
        let config = self.config()?;
        Ok(RebalancePlanner::new(
            config.planner,
            config.base_denom,
            self.prices.clone(),
        ))
    }

    /// Seed the pool set. Only valid once, on an empty store.
    pub async fn initialize(&self, pools: Vec<Pool>) -> TreasuryResult<()> {
        let _guard = self.writer.lock().await;
        self.registry.initialize(pools).await
    }

    /// Sweep proposal deadlines, resume suspended plans whose proposal has
    /// resolved, then plan and execute a fresh rebalance if one is due.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> TreasuryResult<CycleReport> {
        let _guard = self.writer.lock().await;

        let swept_proposals = self
            .gate
            .sweep(now)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();

        let mut resumed_plans = Vec::new();
        for plan in self.store.plans_with_status(PlanStatus::Executing).await? {
            if let Some(proposal_id) = &plan.suspended_on {
                if self.gate.get(proposal_id).await?.status.is_open() {
                    continue;
                }
            }
            match self.executor.execute(&plan.id, now).await {
                Ok(_) => {}
                Err(TreasuryError::PrerequisiteNotMet(reason)) => {
                    warn!(plan_id = %plan.id, %reason, "resumed plan aborted");
                }
                Err(err) => return Err(err),
            }
            resumed_plans.push(plan.id);
        }

        let busy = self.busy_pools().await?;
        let pools = self.registry.list().await?;
        let planner = self.planner()?;
        let analysis = planner.analyze(&pools)?;
        let triggers = planner.rebalance_triggers(&pools, now)?;

        let mut plan = None;
        if !triggers.is_empty() {
            if let Some(generated) = planner.generate_plan(&pools, now, &busy)? {
                if self.store.get_plan(&generated.id).await?.is_some() {
                    warn!(plan_id = %generated.id, "identical snapshot already planned");
                } else {
                    info!(
                        plan_id = %generated.id,
                        actions = generated.actions.len(),
                        reason = %generated.trigger_reason,
                        "rebalance plan created"
                    );
                    let plan_id = generated.id.clone();
                    self.store.upsert_plan(generated).await?;
                    plan = Some(self.executor.execute(&plan_id, now).await?);
                }
            }
        }

        Ok(CycleReport {
            at: now,
            swept_proposals,
            resumed_plans,
            triggers,
            plan,
            warning: analysis.warning,
        })
    }

    /// Pools touched by pending actions of plans still executing.
    async fn busy_pools(&self) -> TreasuryResult<BTreeSet<PoolId>> {
        let mut busy = BTreeSet::new();
        for plan in self.store.plans_with_status(PlanStatus::Executing).await? {
            for action in plan.actions.iter().filter(|a| a.is_pending()) {
                busy.extend(action.touched_pools().into_iter().cloned());
            }
        }
        Ok(busy)
    }

    /// Register an operator-built plan (MINT, BURN, SWAP or hand-picked
    /// transfers). Missing ids are assigned; prerequisites must name actions
    /// of the same plan.
    pub async fn submit_plan(
        &self,
        mut plan: RebalancePlan,
        now: DateTime<Utc>,
    ) -> TreasuryResult<RebalancePlan> {
        let _guard = self.writer.lock().await;
        if plan.actions.is_empty() {
            return Err(TreasuryError::InvalidInput("plan has no actions".to_string()));
        }
        if plan.id.is_empty() {
            plan.id = format!("plan-{}", Uuid::new_v4().simple());
        }
        if self.store.get_plan(&plan.id).await?.is_some() {
            return Err(TreasuryError::InvalidInput(format!(
                "plan {} already exists",
                plan.id
            )));
        }

        let mut ids = BTreeSet::new();
        for (seq, action) in plan.actions.iter_mut().enumerate() {
            if action.id.is_empty() {
                action.id = format!("{}:{:03}", plan.id, seq);
            }
            if !ids.insert(action.id.clone()) {
                return Err(TreasuryError::InvalidInput(format!(
                    "duplicate action id {}",
                    action.id
                )));
            }
            if action.action_type == ActionType::Swap && action.swap_to.is_none() {
                return Err(TreasuryError::InvalidInput(format!(
                    "swap {} names no target denomination",
                    action.id
                )));
            }
        }
        for action in &plan.actions {
            if let Some(missing) = action.prerequisites.iter().find(|p| !ids.contains(*p)) {
                return Err(TreasuryError::InvalidInput(format!(
                    "action {} lists unknown prerequisite {}",
                    action.id, missing
                )));
            }
        }

        plan.status = PlanStatus::Planned;
        plan.cursor = 0;
        plan.suspended_on = None;
        plan.failure = None;
        plan.total_moved = Balance::new();
        plan.risk = plan
            .actions
            .iter()
            .map(|a| a.risk)
            .max()
            .unwrap_or(RiskLevel::Low);
        plan.created_at = now;
        plan.updated_at = now;
        plan.completed_at = None;

        self.store.upsert_plan(plan.clone()).await?;
        info!(plan_id = %plan.id, actions = plan.actions.len(), "manual plan submitted");
        Ok(plan)
    }

    pub async fn execute_plan(&self, plan_id: &str, now: DateTime<Utc>) -> TreasuryResult<RebalancePlan> {
        let _guard = self.writer.lock().await;
        self.executor.execute(plan_id, now).await
    }

    pub async fn cancel_plan(&self, plan_id: &str, now: DateTime<Utc>) -> TreasuryResult<RebalancePlan> {
        let _guard = self.writer.lock().await;
        self.executor.cancel(plan_id, now).await
    }

    /// External inflow from `source` into a pool. Never gated.
    pub async fn deposit(
        &self,
        pool_id: &PoolId,
        amount: Balance,
        source: &str,
        reference: Option<String>,
        now: DateTime<Utc>,
    ) -> TreasuryResult<TransactionRecord> {
        let _guard = self.writer.lock().await;
        if amount.is_empty() {
            return Err(TreasuryError::InvalidInput("deposit of nothing".to_string()));
        }
        let mut pool = active_pool(&self.registry, pool_id).await?;
        for coin in amount.coins() {
            pool.balance = credited(&pool, &coin)?;
        }
        pool.updated_at = now;

        let moves: Vec<Move> = amount
            .coins()
            .into_iter()
            .map(|coin| (source.to_string(), pool_id.to_string(), coin))
            .collect();
        self.settle_moves(&moves, vec![pool.clone()]).await?;

        let record = self
            .executor
            .journal(
                TransactionAppend {
                    kind: TransactionKind::Deposit,
                    source: None,
                    destination: Some(pool_id.clone()),
                    value: self.value_of(&amount)?,
                    amount,
                    reference,
                    memo: format!("deposit from {}", source),
                    timestamp: now,
                },
                &[&pool],
            )
            .await?;
        info!(pool_id = %pool_id, source, tx_id = %record.tx_id, "deposit committed");
        Ok(record)
    }

    /// Pay out of a pool. Runs immediately inside the pool's auto-execute
    /// authority, otherwise opens a WITHDRAWAL proposal.
    pub async fn withdraw(
        &self,
        pool_id: &PoolId,
        recipient: &str,
        amount: Balance,
        proposer: &str,
        now: DateTime<Utc>,
    ) -> TreasuryResult<WithdrawalOutcome> {
        let _guard = self.writer.lock().await;
        if amount.is_empty() {
            return Err(TreasuryError::InvalidInput("withdrawal of nothing".to_string()));
        }
        let pool = active_pool(&self.registry, pool_id).await?;
        let mut after = pool.clone();
        for coin in amount.coins() {
            after.balance = debited(&after, &coin)?;
        }

        let value = self.value_of(&amount)?;
        let pool_value = self.prices.balance_value(&pool.balance)?;
        let risk = assess_risk(ProposalType::Withdrawal, value, Some(pool_value));
        let gated = pool.access.governance_required
            || !pool
                .access
                .auto_execute
                .permits(ActionType::Transfer, u128::from(value), risk);

        if gated {
            let proposal = self
                .gate
                .submit(
                    ProposalDraft {
                        proposal_type: ProposalType::Withdrawal,
                        proposer: proposer.to_string(),
                        title: format!("withdraw {} from {} to {}", value, pool_id, recipient),
                        payload: ProposalPayload::Withdrawal {
                            pool_id: pool_id.clone(),
                            recipient: recipient.to_string(),
                            amount,
                        },
                        pool_id: Some(pool_id.clone()),
                        amount_value: value,
                        pool_value: Some(pool_value),
                        pool_required_signatures: pool.access.required_signatures,
                    },
                    now,
                )
                .await?;
            return Ok(WithdrawalOutcome::Gated(proposal));
        }

        let record = self
            .apply_withdrawal(pool_id, recipient, &amount, now)
            .await?;
        Ok(WithdrawalOutcome::Executed(record))
    }

    async fn apply_withdrawal(
        &self,
        pool_id: &PoolId,
        recipient: &str,
        amount: &Balance,
        now: DateTime<Utc>,
    ) -> TreasuryResult<TransactionRecord> {
        let (entry, pool) = self
            .settle_withdrawal(pool_id, recipient, amount, None, now)
            .await?;
        let record = self.executor.journal(entry, &[&pool]).await?;
        info!(pool_id = %pool_id, recipient, tx_id = %record.tx_id, "withdrawal committed");
        Ok(record)
    }

    /// Debit the pool and pay the recipient. Returns the log entry still to
    /// be written for a payout that has already happened.
    async fn settle_withdrawal(
        &self,
        pool_id: &PoolId,
        recipient: &str,
        amount: &Balance,
        reference: Option<String>,
        now: DateTime<Utc>,
    ) -> TreasuryResult<(TransactionAppend, Pool)> {
        let mut pool = active_pool(&self.registry, pool_id).await?;
        for coin in amount.coins() {
            pool.balance = debited(&pool, &coin)?;
        }
        pool.updated_at = now;
        let entry = TransactionAppend {
            kind: TransactionKind::Withdrawal,
            source: Some(pool_id.clone()),
            destination: None,
            amount: amount.clone(),
            value: self.value_of(amount)?,
            reference,
            memo: format!("withdrawal to {}", recipient),
            timestamp: now,
        };

        let moves: Vec<Move> = amount
            .coins()
            .into_iter()
            .map(|coin| (pool_id.to_string(), recipient.to_string(), coin))
            .collect();
        self.settle_moves(&moves, vec![pool.clone()]).await?;
        Ok((entry, pool))
    }

    /// Split incoming revenue across active pools pro rata to their target
    /// allocation. Integer remainders go to the first reserve pool, or the
    /// first pool when there is none.
    pub async fn distribute_revenue(
        &self,
        amount: Balance,
        source: &str,
        now: DateTime<Utc>,
    ) -> TreasuryResult<Vec<TransactionRecord>> {
        let _guard = self.writer.lock().await;
        if amount.is_empty() {
            return Err(TreasuryError::InvalidInput("revenue of nothing".to_string()));
        }
        let pools: Vec<Pool> = self
            .registry
            .list()
            .await?
            .into_iter()
            .filter(|p| p.is_active() && p.allocation.target_bps > 0)
            .collect();
        let total_bps: u128 = pools.iter().map(|p| u128::from(p.allocation.target_bps)).sum();
        if total_bps == 0 {
            return Err(TreasuryError::InvariantViolation(
                "no active pool carries a target allocation".to_string(),
            ));
        }
        let remainder_idx = pools
            .iter()
            .position(|p| p.category == PoolCategory::Reserve)
            .unwrap_or(0);

        let mut shares: BTreeMap<usize, Balance> = BTreeMap::new();
        for coin in amount.coins() {
            let mut handed_out: u128 = 0;
            for (idx, pool) in pools.iter().enumerate() {
                let share =
                    u128::from(coin.amount) * u128::from(pool.allocation.target_bps) / total_bps;
                handed_out += share;
                add_share(&mut shares, idx, &coin, share)?;
            }
            add_share(
                &mut shares,
                remainder_idx,
                &coin,
                u128::from(coin.amount) - handed_out,
            )?;
        }

        let mut touched = Vec::new();
        let mut moves: Vec<Move> = Vec::new();
        for (idx, share) in &shares {
            let mut pool = pools[*idx].clone();
            for coin in share.coins() {
                pool.balance = credited(&pool, &coin)?;
                moves.push((source.to_string(), pool.id.to_string(), coin));
            }
            pool.updated_at = now;
            touched.push(pool);
        }
        self.settle_moves(&moves, touched.clone()).await?;

        let mut records = Vec::new();
        // `touched` was built in `shares` order.
        for (pool, share) in touched.iter().zip(shares.values()) {
            let record = self
                .executor
                .journal(
                    TransactionAppend {
                        kind: TransactionKind::Revenue,
                        source: None,
                        destination: Some(pool.id.clone()),
                        amount: share.clone(),
                        value: self.value_of(share)?,
                        reference: None,
                        memo: format!("revenue share from {}", source),
                        timestamp: now,
                    },
                    &[pool],
                )
                .await?;
            records.push(record);
        }
        info!(source, pools = records.len(), "revenue distributed");
        Ok(records)
    }

    /// Run ledger moves, then commit the pools. Any failure unwinds the
    /// moves already made.
    async fn settle_moves(&self, moves: &[Move], pools: Vec<Pool>) -> TreasuryResult<()> {
        for (done, (from, to, coin)) in moves.iter().enumerate() {
            if let Err(err) = self.ledger.transfer(from, to, coin).await {
                self.unwind(&moves[..done]).await;
                return Err(err);
            }
        }
        if let Err(err) = self.registry.commit(pools).await {
            self.unwind(moves).await;
            return Err(err);
        }
        Ok(())
    }

    async fn unwind(&self, moves: &[Move]) {
        for (from, to, coin) in moves.iter().rev() {
            if let Err(err) = self.ledger.transfer(to, from, coin).await {
                error!(from = %from, to = %to, amount = %coin, error = %err, "ledger compensation failed");
            }
        }
    }

    fn value_of(&self, balance: &Balance) -> TreasuryResult<Amount> {
        Ok(Amount::try_from(self.prices.balance_value(balance)?).unwrap_or(Amount::MAX))
    }

    /// Open a PARAMETER_CHANGE proposal. The change is validated up front
    /// against the current configuration.
    pub async fn propose_parameter_change(
        &self,
        proposer: &str,
        parameter: &str,
        value: serde_json::Value,
        now: DateTime<Utc>,
    ) -> TreasuryResult<GovernanceProposal> {
        let _guard = self.writer.lock().await;
        self.changed_config(parameter, value.clone())?;
        self.gate
            .submit(
                ProposalDraft {
                    proposal_type: ProposalType::ParameterChange,
                    proposer: proposer.to_string(),
                    title: format!("set {}", parameter),
                    payload: ProposalPayload::ParameterChange {
                        parameter: parameter.to_string(),
                        value,
                    },
                    pool_id: None,
                    amount_value: 0,
                    pool_value: None,
                    pool_required_signatures: 0,
                },
                now,
            )
            .await
    }

    /// Open a POOL_CREATION proposal. New pools start empty.
    pub async fn propose_pool_creation(
        &self,
        proposer: &str,
        pool: Pool,
        now: DateTime<Utc>,
    ) -> TreasuryResult<GovernanceProposal> {
        let _guard = self.writer.lock().await;
        validate_pool(&pool)?;
        if !pool.balance.is_empty() {
            return Err(TreasuryError::InvalidInput(format!(
                "new pool {} must start with an empty balance",
                pool.id
            )));
        }
        if self.store.get_pool(&pool.id).await?.is_some() {
            return Err(TreasuryError::InvalidInput(format!(
                "pool {} already exists",
                pool.id
            )));
        }
        self.gate
            .submit(
                ProposalDraft {
                    proposal_type: ProposalType::PoolCreation,
                    proposer: proposer.to_string(),
                    title: format!("create pool {}", pool.id),
                    pool_id: Some(pool.id.clone()),
                    payload: ProposalPayload::PoolCreation {
                        pool: Box::new(pool),
                    },
                    amount_value: 0,
                    pool_value: None,
                    pool_required_signatures: 0,
                },
                now,
            )
            .await
    }

    /// Open a POOL_MODIFICATION proposal for an existing pool. Balances are
    /// not part of a modification; the stored balance is kept on execution.
    pub async fn propose_pool_modification(
        &self,
        proposer: &str,
        pool: Pool,
        now: DateTime<Utc>,
    ) -> TreasuryResult<GovernanceProposal> {
        let _guard = self.writer.lock().await;
        validate_pool(&pool)?;
        let current = self.registry.get(&pool.id).await?;
        self.gate
            .submit(
                ProposalDraft {
                    proposal_type: ProposalType::PoolModification,
                    proposer: proposer.to_string(),
                    title: format!("modify pool {}", pool.id),
                    pool_id: Some(pool.id.clone()),
                    payload: ProposalPayload::PoolModification {
                        pool: Box::new(pool),
                    },
                    amount_value: 0,
                    pool_value: None,
                    pool_required_signatures: current.access.required_signatures,
                },
                now,
            )
            .await
    }

    /// Open a PARAMETER_CHANGE proposal admitting a signer. The key is
    /// checked now so a malformed one never reaches a vote.
    pub async fn propose_signer_addition(
        &self,
        proposer: &str,
        signer_id: &str,
        roles: Vec<Role>,
        public_key: &str,
        now: DateTime<Utc>,
    ) -> TreasuryResult<GovernanceProposal> {
        let _guard = self.writer.lock().await;
        let signer = Signer::from_hex(signer_id, roles, public_key)?;
        self.gate
            .submit(
                ProposalDraft {
                    proposal_type: ProposalType::ParameterChange,
                    proposer: proposer.to_string(),
                    title: format!("admit signer {}", signer.id),
                    payload: ProposalPayload::SignerAddition {
                        signer_id: signer.id,
                        roles: signer.roles,
                        public_key: signer.public_key,
                    },
                    pool_id: None,
                    amount_value: 0,
                    pool_value: None,
                    pool_required_signatures: 0,
                },
                now,
            )
            .await
    }

    pub async fn propose_signer_removal(
        &self,
        proposer: &str,
        signer_id: &str,
        now: DateTime<Utc>,
    ) -> TreasuryResult<GovernanceProposal> {
        let _guard = self.writer.lock().await;
        if self.gate.roster()?.get(signer_id).is_none() {
            return Err(TreasuryError::NotFound(format!("signer {} not found", signer_id)));
        }
        self.gate
            .submit(
                ProposalDraft {
                    proposal_type: ProposalType::ParameterChange,
                    proposer: proposer.to_string(),
                    title: format!("remove signer {}", signer_id),
                    payload: ProposalPayload::SignerRemoval {
                        signer_id: signer_id.to_string(),
                    },
                    pool_id: None,
                    amount_value: 0,
                    pool_value: None,
                    pool_required_signatures: 0,
                },
                now,
            )
            .await
    }

    pub async fn sign_proposal(
        &self,
        proposal_id: &str,
        signer: &str,
        signature_hex: &str,
        now: DateTime<Utc>,
    ) -> TreasuryResult<GovernanceProposal> {
        let _guard = self.writer.lock().await;
        self.gate.sign(proposal_id, signer, signature_hex, now).await
    }

    pub async fn vote(
        &self,
        proposal_id: &str,
        voter: &str,
        choice: VoteChoice,
        now: DateTime<Utc>,
    ) -> TreasuryResult<GovernanceProposal> {
        let _guard = self.writer.lock().await;
        self.gate.vote(proposal_id, voter, choice, now).await
    }

    pub async fn reject_proposal(
        &self,
        proposal_id: &str,
        signer: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> TreasuryResult<GovernanceProposal> {
        let _guard = self.writer.lock().await;
        self.gate.reject(proposal_id, signer, reason, now).await
    }

    pub async fn cancel_proposal(
        &self,
        proposal_id: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> TreasuryResult<GovernanceProposal> {
        let _guard = self.writer.lock().await;
        self.gate.cancel(proposal_id, actor, now).await
    }

    /// Carry out an approved proposal inside its execution window. Plan
    /// actions resume their plan, which marks the proposal itself.
    pub async fn execute_proposal(
        &self,
        proposal_id: &str,
        executor: &str,
        now: DateTime<Utc>,
    ) -> TreasuryResult<GovernanceProposal> {
        let _guard = self.writer.lock().await;
        let proposal = self.gate.get(proposal_id).await?;
        self.gate.ensure_authorized(executor, proposal.proposal_type)?;
        self.gate.begin_execution(proposal_id, now).await?;

        match proposal.payload.clone() {
            ProposalPayload::PlanAction { plan_id, .. } => {
                self.executor.execute(&plan_id, now).await?;
                let after = self.gate.get(proposal_id).await?;
                if after.status == ProposalStatus::Approved {
                    return Err(TreasuryError::InvalidTransition(format!(
                        "plan {} did not reach the action gated by {}",
                        plan_id, proposal_id
                    )));
                }
                return Ok(after);
            }
            ProposalPayload::Withdrawal {
                pool_id,
                recipient,
                amount,
            } => {
                let (entry, pool) = self
                    .settle_withdrawal(&pool_id, &recipient, &amount, Some(proposal_id.to_string()), now)
                    .await?;
                // Paid out: mark the proposal before anything else can fail.
                let executed = self.gate.mark_executed(proposal_id, now).await;
                match self.executor.journal(entry, &[&pool]).await {
                    Ok(record) => {
                        info!(%proposal_id, pool_id = %pool_id, tx_id = %record.tx_id, "gated withdrawal committed")
                    }
                    Err(err) => error!(
                        %proposal_id,
                        error = %err,
                        "gated withdrawal paid out but missing from the transaction log"
                    ),
                }
                return executed;
            }
            ProposalPayload::ParameterChange { parameter, value } => {
                let updated = self.changed_config(&parameter, value)?;
                self.gate.update_config(updated.governance.clone())?;
                let mut slot = self
                    .config
                    .write()
                    .map_err(|_| TreasuryError::Storage("treasury config lock poisoned".to_string()))?;
                *slot = updated;
                info!(%parameter, "treasury parameter changed");
            }
            ProposalPayload::PoolCreation { pool } => {
                self.registry.create(*pool, true).await?;
            }
            ProposalPayload::PoolModification { pool } => {
                let current = self.registry.get(&pool.id).await?;
                let mut pool = *pool;
                pool.balance = current.balance;
                pool.created_at = current.created_at;
                pool.updated_at = now;
                self.registry.put(pool, true).await?;
            }
            ProposalPayload::SignerAddition {
                signer_id,
                roles,
                public_key,
            } => {
                self.gate
                    .add_signer(Signer::from_hex(&signer_id, roles, &public_key)?)?;
            }
            ProposalPayload::SignerRemoval { signer_id } => {
                self.gate.remove_signer(&signer_id)?;
            }
        }
        self.gate.mark_executed(proposal_id, now).await
    }

    fn changed_config(&self, parameter: &str, value: serde_json::Value) -> TreasuryResult<TreasuryConfig> {
        let current = self.config()?;
        let updated = current.with_parameter(parameter, value)?;
        if updated.base_denom != current.base_denom {
            return Err(TreasuryError::InvalidInput(
                "the base denomination cannot be changed".to_string(),
            ));
        }
        Ok(updated)
    }
}

fn add_share(
    shares: &mut BTreeMap<usize, Balance>,
    idx: usize,
    coin: &Coin,
    share: u128,
) -> TreasuryResult<()> {
    let amount = Amount::try_from(share)
        .map_err(|_| TreasuryError::InvariantViolation("revenue share overflow".to_string()))?;
    shares
        .entry(idx)
        .or_default()
        .add(&Coin::new(coin.denom.clone(), amount))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;
    use crate::governance::{sign_digest, Signer};
    use crate::ledger::InMemoryLedger;
    use crate::pricing::StaticPriceFeed;
    use crate::testing::{namo, pool, signing_key, t0, FlakyStorage, BASE};
    use chrono::Duration;
    use treasury_store::{verify_transaction_chain, InMemoryTreasuryStorage, QueryWindow};
    use treasury_types::{ActionStatus, Denom, Role};

    const OFFICERS: u8 = 6;

    struct Harness {
        engine: TreasuryEngine,
        ledger: Arc<InMemoryLedger>,
    }

    async fn harness(pools: Vec<Pool>) -> Harness {
        harness_on(Arc::new(InMemoryTreasuryStorage::new()), pools).await
    }

    async fn harness_on(store: Arc<dyn TreasuryStorage>, pools: Vec<Pool>) -> Harness {
        let ledger = Arc::new(InMemoryLedger::from_pools(&pools).unwrap());
        let roster = SignerRoster::from_signers((1..=OFFICERS).map(|i| {
            Signer::new(
                format!("officer-{i}"),
                vec![
                    Role::TreasuryManager,
                    Role::BoardMember,
                    Role::TechnicalLead,
                    Role::EmergencyResponder,
                ],
                &signing_key(i).verifying_key(),
            )
        }));
        let engine = TreasuryEngine::new(
            TreasuryConfig::default(),
            store,
            ledger.clone(),
            Arc::new(StaticPriceFeed::new(Denom::base())),
            Arc::new(MemoryEventSink::new()),
            roster,
        )
        .unwrap();
        engine.initialize(pools).await.unwrap();
        Harness { engine, ledger }
    }

    async fn balance_of(h: &Harness, id: &str) -> Amount {
        h.engine
            .registry()
            .get(&PoolId::from(id))
            .await
            .unwrap()
            .balance
            .amount_of(&Denom::base())
    }

    async fn sign_all(h: &Harness, proposal: &GovernanceProposal, at: DateTime<Utc>) -> GovernanceProposal {
        let mut latest = proposal.clone();
        for i in 1..=OFFICERS {
            if latest.status != ProposalStatus::Pending && latest.status != ProposalStatus::Voting {
                break;
            }
            if latest.threshold_reached() {
                break;
            }
            latest = h
                .engine
                .sign_proposal(
                    &proposal.id,
                    &format!("officer-{i}"),
                    &sign_digest(&signing_key(i), &proposal.digest),
                    at,
                )
                .await
                .unwrap();
        }
        latest
    }

    #[tokio::test]
    async fn cycle_rebalances_then_goes_quiet() {
        let h = harness(vec![
            pool("development", PoolCategory::Development, 3_000, 100 * BASE),
            pool("operational", PoolCategory::Operational, 3_000, 200 * BASE),
            pool("reserve", PoolCategory::Reserve, 4_000, 700 * BASE),
        ])
        .await;

        let report = h.engine.run_cycle(t0()).await.unwrap();
        let plan = report.plan.expect("plan generated");
        assert_eq!(plan.status, PlanStatus::Executed);
        assert!(!report.triggers.is_empty());
        assert_eq!(balance_of(&h, "reserve").await, 400 * BASE);
        assert_eq!(balance_of(&h, "development").await, 300 * BASE);
        assert_eq!(balance_of(&h, "operational").await, 300 * BASE);

        let again = h.engine.run_cycle(t0() + Duration::hours(1)).await.unwrap();
        assert!(again.plan.is_none());
        assert!(again.triggers.is_empty());

        let queries = h.engine.queries().unwrap();
        let txs = queries.transactions(QueryWindow::default()).await.unwrap();
        assert_eq!(txs.len(), 2);
        let mut ascending = txs.clone();
        ascending.reverse();
        verify_transaction_chain(&ascending).unwrap();
    }

    #[tokio::test]
    async fn empty_treasury_reports_degenerate_state() {
        let h = harness(vec![
            pool("operational", PoolCategory::Operational, 5_000, 0),
            pool("reserve", PoolCategory::Reserve, 5_000, 0),
        ])
        .await;
        let report = h.engine.run_cycle(t0()).await.unwrap();
        assert!(report.plan.is_none());
        assert!(report.warning.is_some());
    }

    #[tokio::test]
    async fn gated_plan_holds_its_pools_and_resumes_after_approval() {
        let mut reserve = pool("reserve", PoolCategory::Reserve, 5_000, 900 * BASE);
        reserve.access.governance_required = true;
        let h = harness(vec![
            pool("operational", PoolCategory::Operational, 5_000, 100 * BASE),
            reserve,
        ])
        .await;

        let first = h.engine.run_cycle(t0()).await.unwrap();
        let plan = first.plan.expect("plan generated");
        assert_eq!(plan.status, PlanStatus::Executing);
        let proposal_id = plan.suspended_on.clone().expect("suspended");

        // Still pending: no second plan over the same pools, nothing resumed.
        let idle = h.engine.run_cycle(t0() + Duration::minutes(5)).await.unwrap();
        assert!(idle.plan.is_none());
        assert!(idle.resumed_plans.is_empty());

        let proposal = h.engine.gate().get(&proposal_id).await.unwrap();
        assert_eq!(proposal.proposal_type, ProposalType::Rebalance);
        let signed = sign_all(&h, &proposal, t0() + Duration::minutes(10)).await;
        assert_eq!(signed.status, ProposalStatus::Approved);

        let resumed = h.engine.run_cycle(t0() + Duration::minutes(20)).await.unwrap();
        assert_eq!(resumed.resumed_plans, vec![plan.id.clone()]);
        let done = h.engine.queries().unwrap().get_plan(&plan.id).await.unwrap();
        assert_eq!(done.status, PlanStatus::Executed);
        assert_eq!(balance_of(&h, "reserve").await, 500 * BASE);
        assert_eq!(balance_of(&h, "operational").await, 500 * BASE);
        let executed = h.engine.gate().get(&proposal_id).await.unwrap();
        assert_eq!(executed.status, ProposalStatus::Executed);
    }

    #[tokio::test]
    async fn emergency_top_up_is_approved_and_restores_the_floor() {
        let mut development = pool("development", PoolCategory::Development, 3_000, 10 * BASE);
        development.min_balance = Balance::single(namo(100 * BASE));
        let mut reserve = pool("reserve", PoolCategory::Reserve, 7_000, 900 * BASE);
        reserve.min_balance = Balance::single(namo(600 * BASE));
        reserve.access.governance_required = true;
        let h = harness(vec![development, reserve]).await;

        let cycle = h.engine.run_cycle(t0()).await.unwrap();
        let plan = cycle.plan.expect("plan generated");
        let top_up = &plan.actions[0];
        assert!(top_up.emergency);
        assert_eq!(top_up.amount, namo(90 * BASE));
        assert_eq!(plan.status, PlanStatus::Executing);
        let proposal_id = plan.suspended_on.clone().expect("suspended on the top-up");
        assert_eq!(balance_of(&h, "development").await, 10 * BASE);

        let proposal = h.engine.gate().get(&proposal_id).await.unwrap();
        assert_eq!(proposal.proposal_type, ProposalType::EmergencyAction);
        let approved = sign_all(&h, &proposal, t0() + Duration::minutes(5)).await;
        assert_eq!(approved.status, ProposalStatus::Approved);

        let executed = h
            .engine
            .execute_proposal(&proposal_id, "officer-3", t0() + Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(executed.status, ProposalStatus::Executed);

        let stored = h.engine.queries().unwrap().get_plan(&plan.id).await.unwrap();
        assert_eq!(stored.actions[0].status, ActionStatus::Executed);
        assert!(balance_of(&h, "development").await >= 100 * BASE);
        assert!(balance_of(&h, "reserve").await >= 600 * BASE);
        let ledger = h.ledger.balance_of("development").await.unwrap();
        assert_eq!(ledger.amount_of(&Denom::base()), balance_of(&h, "development").await);
    }

    #[tokio::test]
    async fn cancelled_plan_keeps_nothing_open() {
        let mut reserve = pool("reserve", PoolCategory::Reserve, 5_000, 900 * BASE);
        reserve.access.governance_required = true;
        let h = harness(vec![
            pool("operational", PoolCategory::Operational, 5_000, 100 * BASE),
            reserve,
        ])
        .await;
        let plan = h.engine.run_cycle(t0()).await.unwrap().plan.unwrap();
        let proposal_id = plan.suspended_on.clone().unwrap();

        let cancelled = h.engine.cancel_plan(&plan.id, t0()).await.unwrap();
        assert_eq!(cancelled.status, PlanStatus::Cancelled);
        assert_eq!(
            h.engine.gate().get(&proposal_id).await.unwrap().status,
            ProposalStatus::Cancelled
        );
        assert!(h.engine.cancel_plan(&plan.id, t0()).await.is_err());
        assert_eq!(balance_of(&h, "reserve").await, 900 * BASE);
    }

    #[tokio::test]
    async fn manual_plan_rejects_unknown_prerequisites_and_runs_in_order() {
        let h = harness(vec![
            pool("operational", PoolCategory::Operational, 5_000, 100 * BASE),
            pool("reserve", PoolCategory::Reserve, 5_000, 100 * BASE),
        ])
        .await;
        let template = RebalancePlan {
            id: String::new(),
            trigger_reason: "operator".to_string(),
            actions: Vec::new(),
            total_moved: Balance::new(),
            risk: RiskLevel::Low,
            status: PlanStatus::Planned,
            cursor: 0,
            suspended_on: None,
            failure: None,
            created_at: t0(),
            updated_at: t0(),
            completed_at: None,
        };

        let mut first = treasury_types::RebalanceAction::transfer(
            PoolId::from("reserve"),
            PoolId::from("operational"),
            namo(10 * BASE),
        );
        first.id = "a".to_string();
        let mut second = treasury_types::RebalanceAction::transfer(
            PoolId::from("operational"),
            PoolId::from("reserve"),
            namo(5 * BASE),
        );
        second.id = "b".to_string();
        second.prerequisites = vec!["ghost".to_string()];

        let mut bad = template.clone();
        bad.actions = vec![first.clone(), second.clone()];
        assert!(matches!(
            h.engine.submit_plan(bad, t0()).await,
            Err(TreasuryError::InvalidInput(_))
        ));

        second.prerequisites = vec!["a".to_string()];
        let mut good = template;
        good.actions = vec![first, second];
        let plan = h.engine.submit_plan(good, t0()).await.unwrap();
        assert!(plan.id.starts_with("plan-"));
        let done = h.engine.execute_plan(&plan.id, t0()).await.unwrap();
        assert_eq!(done.status, PlanStatus::Executed);
        assert!(done.actions.iter().all(|a| a.status == ActionStatus::Executed));
        assert_eq!(balance_of(&h, "reserve").await, 95 * BASE);
    }

    #[tokio::test]
    async fn deposit_and_small_withdrawal_move_the_ledger() {
        let mut ops = pool("operational", PoolCategory::Operational, 5_000, 100 * BASE);
        ops.access.auto_execute =
            treasury_types::AutoExecutePolicy::transfers_up_to(50 * BASE, RiskLevel::High);
        ops.min_balance = Balance::single(namo(20 * BASE));
        let h = harness(vec![ops, pool("reserve", PoolCategory::Reserve, 5_000, 100 * BASE)]).await;
        h.ledger.credit("donor", &namo(40 * BASE)).unwrap();

        let id = PoolId::from("operational");
        h.engine
            .deposit(&id, Balance::single(namo(40 * BASE)), "donor", None, t0())
            .await
            .unwrap();
        assert_eq!(balance_of(&h, "operational").await, 140 * BASE);

        let outcome = h
            .engine
            .withdraw(&id, "vendor", Balance::single(namo(30 * BASE)), "officer-1", t0())
            .await
            .unwrap();
        assert!(matches!(outcome, WithdrawalOutcome::Executed(_)));
        assert_eq!(balance_of(&h, "operational").await, 110 * BASE);
        let vendor = h.ledger.balance_of("vendor").await.unwrap();
        assert_eq!(vendor.amount_of(&Denom::base()), 30 * BASE);

        // Would cross the 20 NAMO floor.
        let err = h
            .engine
            .withdraw(&id, "vendor", Balance::single(namo(95 * BASE)), "officer-1", t0())
            .await
            .unwrap_err();
        assert!(matches!(err, TreasuryError::InvariantViolation(_)));

        let history = h
            .engine
            .queries()
            .unwrap()
            .balance_history(&id, QueryWindow::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].balance.amount_of(&Denom::base()), 110 * BASE);
    }

    #[tokio::test]
    async fn large_withdrawal_waits_for_signatures_and_window() {
        let mut ops = pool("operational", PoolCategory::Operational, 5_000, 1_000 * BASE);
        ops.access.auto_execute =
            treasury_types::AutoExecutePolicy::transfers_up_to(50 * BASE, RiskLevel::High);
        let h = harness(vec![ops, pool("reserve", PoolCategory::Reserve, 5_000, 0)]).await;
        let id = PoolId::from("operational");

        let outcome = h
            .engine
            .withdraw(&id, "vendor", Balance::single(namo(200 * BASE)), "officer-1", t0())
            .await
            .unwrap();
        let WithdrawalOutcome::Gated(proposal) = outcome else {
            panic!("expected a proposal");
        };
        assert_eq!(balance_of(&h, "operational").await, 1_000 * BASE);
        assert!(matches!(
            h.engine.execute_proposal(&proposal.id, "officer-1", t0()).await,
            Err(TreasuryError::InvalidTransition(_))
        ));

        let approved = sign_all(&h, &proposal, t0()).await;
        assert_eq!(approved.status, ProposalStatus::Approved);
        assert!(matches!(
            h.engine.execute_proposal(&proposal.id, "stranger", t0()).await,
            Err(TreasuryError::Unauthorized(_))
        ));

        let executed = h
            .engine
            .execute_proposal(&proposal.id, "officer-2", t0() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(executed.status, ProposalStatus::Executed);
        assert_eq!(balance_of(&h, "operational").await, 800 * BASE);
        assert!(h
            .engine
            .execute_proposal(&proposal.id, "officer-2", t0() + Duration::hours(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn gated_withdrawal_is_marked_executed_when_the_log_write_fails() {
        let mut ops = pool("operational", PoolCategory::Operational, 5_000, 1_000 * BASE);
        ops.access.auto_execute =
            treasury_types::AutoExecutePolicy::transfers_up_to(50 * BASE, RiskLevel::High);
        let h = harness_on(
            Arc::new(FlakyStorage::failing_appends(1)),
            vec![ops, pool("reserve", PoolCategory::Reserve, 5_000, 0)],
        )
        .await;
        let id = PoolId::from("operational");

        let WithdrawalOutcome::Gated(proposal) = h
            .engine
            .withdraw(&id, "vendor", Balance::single(namo(200 * BASE)), "officer-1", t0())
            .await
            .unwrap()
        else {
            panic!("expected a proposal");
        };
        sign_all(&h, &proposal, t0()).await;

        let executed = h
            .engine
            .execute_proposal(&proposal.id, "officer-2", t0())
            .await
            .unwrap();
        assert_eq!(executed.status, ProposalStatus::Executed);
        assert_eq!(balance_of(&h, "operational").await, 800 * BASE);

        assert!(h
            .engine
            .execute_proposal(&proposal.id, "officer-2", t0())
            .await
            .is_err());
        assert_eq!(balance_of(&h, "operational").await, 800 * BASE);
        let vendor = h.ledger.balance_of("vendor").await.unwrap();
        assert_eq!(vendor.amount_of(&Denom::base()), 200 * BASE);
    }

    #[tokio::test]
    async fn revenue_split_follows_targets_with_remainder_to_reserve() {
        let h = harness(vec![
            pool("charity", PoolCategory::Charity, 3_333, 0),
            pool("operational", PoolCategory::Operational, 3_333, 0),
            pool("reserve", PoolCategory::Reserve, 3_334, 0),
        ])
        .await;
        h.ledger.credit("fees", &namo(100)).unwrap();

        let records = h
            .engine
            .distribute_revenue(Balance::single(namo(100)), "fees", t0())
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(balance_of(&h, "charity").await, 33);
        assert_eq!(balance_of(&h, "operational").await, 33);
        assert_eq!(balance_of(&h, "reserve").await, 34);
        let fees = h.ledger.balance_of("fees").await.unwrap();
        assert!(fees.is_empty());
    }

    #[tokio::test]
    async fn parameter_change_needs_a_vote_then_signatures() {
        let h = harness(vec![pool("reserve", PoolCategory::Reserve, 5_000, 100 * BASE)]).await;
        assert!(h
            .engine
            .propose_parameter_change("officer-1", "/planner/nope", serde_json::json!(1), t0())
            .await
            .is_err());

        let proposal = h
            .engine
            .propose_parameter_change(
                "officer-1",
                "/planner/min_transfer",
                serde_json::json!(5 * BASE),
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(proposal.status, ProposalStatus::Voting);

        for i in 1..=OFFICERS {
            h.engine
                .vote(&proposal.id, &format!("officer-{i}"), VoteChoice::Yes, t0())
                .await
                .unwrap();
        }
        let signed = sign_all(&h, &proposal, t0()).await;
        assert_eq!(signed.status, ProposalStatus::Voting);

        let voting_period = Duration::seconds(h.engine.config().unwrap().governance.voting_period_secs);
        let after_vote = t0() + voting_period + Duration::seconds(1);
        let report = h.engine.run_cycle(after_vote).await.unwrap();
        assert_eq!(report.swept_proposals, vec![proposal.id.clone()]);

        h.engine
            .execute_proposal(&proposal.id, "officer-1", after_vote)
            .await
            .unwrap();
        assert_eq!(h.engine.config().unwrap().planner.min_transfer, 5 * BASE);
    }

    /// Vote and sign a voting proposal through, returning a moment inside
    /// its execution window.
    async fn carry(h: &Harness, proposal: &GovernanceProposal) -> DateTime<Utc> {
        for i in 1..=OFFICERS {
            h.engine
                .vote(&proposal.id, &format!("officer-{i}"), VoteChoice::Yes, proposal.submitted_at)
                .await
                .unwrap();
        }
        sign_all(h, proposal, proposal.submitted_at).await;
        let after_vote = proposal.voting_ends_at.expect("voting proposal") + Duration::seconds(1);
        h.engine.run_cycle(after_vote).await.unwrap();
        after_vote
    }

    #[tokio::test]
    async fn signers_join_and_leave_through_governance() {
        let h = harness(vec![pool("reserve", PoolCategory::Reserve, 5_000, 100 * BASE)]).await;
        let newcomer = signing_key(7);
        assert!(matches!(
            h.engine
                .propose_signer_addition("officer-1", "officer-7", vec![Role::BoardMember], "beef", t0())
                .await,
            Err(TreasuryError::InvalidInput(_))
        ));
        assert!(matches!(
            h.engine.propose_signer_removal("officer-1", "ghost", t0()).await,
            Err(TreasuryError::NotFound(_))
        ));

        let admit = h
            .engine
            .propose_signer_addition(
                "officer-1",
                "officer-7",
                vec![Role::BoardMember],
                &crate::governance::public_key_hex(&newcomer),
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(admit.proposal_type, ProposalType::ParameterChange);
        assert!(h.engine.gate().roster().unwrap().get("officer-7").is_none());
        let at = carry(&h, &admit).await;
        let done = h.engine.execute_proposal(&admit.id, "officer-1", at).await.unwrap();
        assert_eq!(done.status, ProposalStatus::Executed);

        // The new member signs like any other.
        let remove = h
            .engine
            .propose_signer_removal("officer-7", "officer-7", at)
            .await
            .unwrap();
        h.engine
            .sign_proposal(&remove.id, "officer-7", &sign_digest(&newcomer, &remove.digest), at)
            .await
            .unwrap();
        let later = carry(&h, &remove).await;
        h.engine.execute_proposal(&remove.id, "officer-2", later).await.unwrap();
        let roster = h.engine.gate().roster().unwrap();
        assert!(roster.get("officer-7").is_none());
        assert_eq!(roster.len(), usize::from(OFFICERS));
    }

    #[tokio::test]
    async fn pool_creation_goes_through_governance() {
        let h = harness(vec![pool("reserve", PoolCategory::Reserve, 5_000, 100 * BASE)]).await;
        let mut grants = pool("grants", PoolCategory::Development, 1_000, 0);
        grants.balance = Balance::new();

        let mut funded = grants.clone();
        funded.balance = Balance::single(namo(1));
        assert!(h
            .engine
            .propose_pool_creation("officer-1", funded, t0())
            .await
            .is_err());

        let proposal = h
            .engine
            .propose_pool_creation("officer-1", grants, t0())
            .await
            .unwrap();
        for i in 1..=OFFICERS {
            h.engine
                .vote(&proposal.id, &format!("officer-{i}"), VoteChoice::Yes, t0())
                .await
                .unwrap();
        }
        sign_all(&h, &proposal, t0()).await;
        let voting_period = Duration::seconds(h.engine.config().unwrap().governance.voting_period_secs);
        let later = t0() + voting_period + Duration::seconds(1);
        h.engine.run_cycle(later).await.unwrap();
        h.engine
            .execute_proposal(&proposal.id, "officer-3", later)
            .await
            .unwrap();
        assert!(h.engine.registry().get(&PoolId::from("grants")).await.is_ok());
    }
}
