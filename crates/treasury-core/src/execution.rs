//! Plan execution against the ledger.
//!
//! Actions run in plan order. An action beyond its source pool's
//! auto-execute authority is routed through a governance proposal and the
//! plan suspends there; its `cursor` and `suspended_on` fields are the
//! resumable state, so a later `execute` call picks up where it stopped.
//! Plans are not atomic across gated actions: committed actions stay
//! committed whatever happens to later ones.

use crate::events::EventSink;
use crate::governance::{GovernanceGate, ProposalDraft};
use crate::ledger::LedgerClient;
use crate::pricing::PriceFeed;
use crate::registry::PoolRegistry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use treasury_store::TreasuryStorage;
use treasury_types::{
    ActionCommitted, ActionStatus, ActionType, Amount, Balance, BalanceSnapshot, Coin, ErrorKind,
    PlanCompleted, PlanStatus, Pool, PoolId, ProposalPayload, ProposalStatus, ProposalType,
    RebalanceAction, RebalancePlan, Rejection, TransactionAppend, TransactionKind,
    TransactionRecord, TreasuryError, TreasuryEvent, TreasuryResult,
};

enum Step {
    Done,
    Suspended(String),
}

pub struct PlanExecutor {
    store: Arc<dyn TreasuryStorage>,
    registry: PoolRegistry,
    ledger: Arc<dyn LedgerClient>,
    prices: Arc<dyn PriceFeed>,
    events: Arc<dyn EventSink>,
    gate: Arc<GovernanceGate>,
}

impl PlanExecutor {
    pub fn new(
        store: Arc<dyn TreasuryStorage>,
        registry: PoolRegistry,
        ledger: Arc<dyn LedgerClient>,
        prices: Arc<dyn PriceFeed>,
        events: Arc<dyn EventSink>,
        gate: Arc<GovernanceGate>,
    ) -> Self {
        Self {
            store,
            registry,
            ledger,
            prices,
            events,
            gate,
        }
    }

    pub async fn load(&self, plan_id: &str) -> TreasuryResult<RebalancePlan> {
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| TreasuryError::NotFound(format!("plan {} not found", plan_id)))
    }

    /// Run (or resume) a plan. Returns the plan as persisted when execution
    /// stopped, either terminal or suspended on a proposal. An unmet
    /// prerequisite aborts the plan and is returned as an error after the
    /// aborted plan has been persisted.
    pub async fn execute(&self, plan_id: &str, now: DateTime<Utc>) -> TreasuryResult<RebalancePlan> {
        let mut plan = self.load(plan_id).await?;
        if plan.status.is_terminal() {
            return Err(TreasuryError::transition(
                &format!("plan {}", plan.id),
                plan.status,
                PlanStatus::Executing,
            ));
        }
        if plan.status == PlanStatus::Planned {
            plan.transition(PlanStatus::Executing, now)?;
            info!(plan_id = %plan.id, actions = plan.actions.len(), "plan execution started");
        }
        plan.suspended_on = None;

        let mut idx = plan.cursor;
        while idx < plan.actions.len() {
            if !plan.actions[idx].is_pending() {
                idx += 1;
                continue;
            }
            if let Some(missing) = unmet_prerequisite(&plan, idx) {
                let reason = format!(
                    "action {} requires {} to be executed first",
                    plan.actions[idx].id, missing
                );
                warn!(plan_id = %plan.id, %reason, "plan aborted");
                plan.cursor = idx;
                plan.failure = Some(Rejection::new(ErrorKind::PrerequisiteNotMet, reason.clone()));
                let status = if plan.count_with(ActionStatus::Executed) > 0 {
                    PlanStatus::PartiallyExecuted
                } else {
                    PlanStatus::Failed
                };
                plan.transition(status, now)?;
                self.save(&plan, now).await?;
                return Err(TreasuryError::PrerequisiteNotMet(reason));
            }

            match self.step(&mut plan, idx, now).await? {
                Step::Done => {
                    idx += 1;
                    plan.cursor = idx;
                    plan.updated_at = now;
                    self.store.upsert_plan(plan.clone()).await?;
                }
                Step::Suspended(proposal_id) => {
                    plan.cursor = idx;
                    plan.suspended_on = Some(proposal_id.clone());
                    plan.updated_at = now;
                    info!(plan_id = %plan.id, %proposal_id, "plan suspended on governance");
                    self.save(&plan, now).await?;
                    return Ok(plan);
                }
            }
        }

        let status = plan.settled_status();
        plan.cursor = plan.actions.len();
        plan.transition(status, now)?;
        info!(plan_id = %plan.id, status = ?status, "plan execution finished");
        self.save(&plan, now).await?;
        Ok(plan)
    }

    /// Explicit, terminal abandonment. Open proposals gating the plan are
    /// cancelled; executed actions are not rolled back.
    pub async fn cancel(&self, plan_id: &str, now: DateTime<Utc>) -> TreasuryResult<RebalancePlan> {
        let mut plan = self.load(plan_id).await?;
        if plan.status.is_terminal() {
            return Err(TreasuryError::transition(
                &format!("plan {}", plan.id),
                plan.status,
                PlanStatus::Cancelled,
            ));
        }
        let system = self.gate.config()?.system_proposer;
        for action in plan.actions.iter().filter(|a| a.is_pending()) {
            let Some(proposal_id) = &action.proposal_id else {
                continue;
            };
            let proposal = self.gate.get(proposal_id).await?;
            if proposal.status.is_open() || proposal.status == ProposalStatus::Approved {
                self.gate.cancel(proposal_id, &system, now).await?;
            }
        }
        plan.transition(PlanStatus::Cancelled, now)?;
        plan.failure = Some(Rejection::new(ErrorKind::Cancelled, "plan cancelled by operator"));
        info!(plan_id = %plan.id, "plan cancelled");
        self.save(&plan, now).await?;
        Ok(plan)
    }

    async fn step(
        &self,
        plan: &mut RebalancePlan,
        idx: usize,
        now: DateTime<Utc>,
    ) -> TreasuryResult<Step> {
        let action = plan.actions[idx].clone();

        if let Some(proposal_id) = &action.proposal_id {
            let proposal = self.gate.get(proposal_id).await?;
            match proposal.status {
                ProposalStatus::Pending | ProposalStatus::Voting => {
                    return Ok(Step::Suspended(proposal_id.clone()));
                }
                ProposalStatus::Approved => match self.gate.begin_execution(proposal_id, now).await {
                    Ok(_) => {
                        let committed = self.commit(plan, idx, now).await?;
                        if committed {
                            if let Err(err) = self.gate.mark_executed(proposal_id, now).await {
                                error!(
                                    %proposal_id,
                                    error = %err,
                                    "gated action executed but its proposal was not marked"
                                );
                            }
                        } else {
                            let system = self.gate.config()?.system_proposer;
                            self.gate.cancel(proposal_id, &system, now).await?;
                        }
                        return Ok(Step::Done);
                    }
                    Err(err @ TreasuryError::ProposalExpired(_)) => {
                        fail_action(plan, idx, err.rejection(), now);
                        return Ok(Step::Done);
                    }
                    Err(err) => return Err(err),
                },
                ProposalStatus::Rejected
                | ProposalStatus::Expired
                | ProposalStatus::Cancelled
                | ProposalStatus::Executed => {
                    let rejection = proposal.resolution.clone().unwrap_or_else(|| {
                        Rejection::new(
                            ErrorKind::InvalidTransition,
                            format!("gating proposal is {}", proposal.status.name()),
                        )
                    });
                    fail_action(plan, idx, rejection, now);
                    return Ok(Step::Done);
                }
            }
        }

        match self.needs_governance(&action).await {
            Ok(true) => {
                let draft = self.draft_for(&plan.id, &action).await?;
                let proposal = self.gate.submit(draft, now).await?;
                plan.actions[idx].proposal_id = Some(proposal.id.clone());
                Ok(Step::Suspended(proposal.id))
            }
            Ok(false) => {
                self.commit(plan, idx, now).await?;
                Ok(Step::Done)
            }
            Err(err) if is_action_local(&err) => {
                fail_action(plan, idx, err.rejection(), now);
                Ok(Step::Done)
            }
            Err(err) => Err(err),
        }
    }

    /// Apply one action and record its outcome on the plan. Returns whether
    /// it committed; only storage-level failures propagate.
    async fn commit(
        &self,
        plan: &mut RebalancePlan,
        idx: usize,
        now: DateTime<Utc>,
    ) -> TreasuryResult<bool> {
        let action = plan.actions[idx].clone();
        match self.apply(&action, now).await {
            Ok(settled) => {
                // Funds have moved: the action is executed whatever happens
                // to the writes below, and must never be applied again.
                let slot = &mut plan.actions[idx];
                slot.status = ActionStatus::Executed;
                slot.executed_at = Some(now);
                match plan.moved_so_far() {
                    Ok(total) => plan.total_moved = total,
                    Err(err) => warn!(plan_id = %plan.id, error = %err, "total moved not recomputed"),
                }
                plan.updated_at = now;
                if let Err(err) = self.store.upsert_plan(plan.clone()).await {
                    error!(
                        plan_id = %plan.id,
                        action_id = %action.id,
                        error = %err,
                        "executed action not persisted on its plan"
                    );
                }
                let refs: Vec<&Pool> = settled.touched.iter().collect();
                if let Err(err) = self.journal(settled.entry, &refs).await {
                    error!(
                        action_id = %action.id,
                        error = %err,
                        "committed action missing from the transaction log"
                    );
                }
                self.events
                    .emit(TreasuryEvent::ActionCommitted(ActionCommitted {
                        action_id: action.id.clone(),
                        action_type: action.action_type,
                        source_pool: action.source.clone(),
                        dest_pool: action.destination.clone(),
                        amount: action.amount.clone(),
                        timestamp: now,
                    }))
                    .await;
                Ok(true)
            }
            Err(err) if is_action_local(&err) => {
                fail_action(plan, idx, err.rejection(), now);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn apply(&self, action: &RebalanceAction, now: DateTime<Utc>) -> TreasuryResult<Settled> {
        if action.amount.is_zero() {
            return Err(TreasuryError::InvalidInput(format!(
                "action {} moves nothing",
                action.id
            )));
        }
        match action.action_type {
            ActionType::Transfer => self.apply_transfer(action, now).await,
            ActionType::Mint => self.apply_mint(action, now).await,
            ActionType::Burn => self.apply_burn(action, now).await,
            ActionType::Swap => self.apply_swap(action, now).await,
        }
    }

    async fn apply_transfer(&self, action: &RebalanceAction, now: DateTime<Utc>) -> TreasuryResult<Settled> {
        let (Some(source_id), Some(dest_id)) = (&action.source, &action.destination) else {
            return Err(TreasuryError::InvalidInput(format!(
                "transfer {} needs a source and a destination",
                action.id
            )));
        };
        if source_id == dest_id {
            return Err(TreasuryError::InvalidInput(format!(
                "transfer {} has the same source and destination",
                action.id
            )));
        }
        let coin = &action.amount;
        let mut source = active_pool(&self.registry, source_id).await?;
        let mut dest = active_pool(&self.registry, dest_id).await?;
        source.balance = debited(&source, coin)?;
        dest.balance = credited(&dest, coin)?;
        let value = self.value_u64(coin)?;

        self.ledger
            .transfer(source_id.as_str(), dest_id.as_str(), coin)
            .await?;
        for pool in [&mut source, &mut dest] {
            pool.last_rebalance = now;
            pool.updated_at = now;
        }
        if let Err(err) = self.registry.commit(vec![source.clone(), dest.clone()]).await {
            if let Err(undo) = self.ledger.transfer(dest_id.as_str(), source_id.as_str(), coin).await {
                error!(action_id = %action.id, error = %undo, "ledger compensation failed");
            }
            return Err(err);
        }

        info!(action_id = %action.id, source = %source_id, dest = %dest_id, amount = %coin, "transfer committed");
        Ok(Settled {
            entry: TransactionAppend {
                kind: TransactionKind::Rebalance,
                source: Some(source_id.clone()),
                destination: Some(dest_id.clone()),
                amount: Balance::single(coin.clone()),
                value,
                reference: Some(action.id.clone()),
                memo: action.reason.clone(),
                timestamp: now,
            },
            touched: vec![source, dest],
        })
    }

    async fn apply_mint(&self, action: &RebalanceAction, now: DateTime<Utc>) -> TreasuryResult<Settled> {
        let target_id = action
            .destination
            .as_ref()
            .or(action.source.as_ref())
            .ok_or_else(|| TreasuryError::InvalidInput(format!("mint {} has no pool", action.id)))?;
        let coin = &action.amount;
        let mut target = active_pool(&self.registry, target_id).await?;
        target.balance = credited(&target, coin)?;
        let value = self.value_u64(coin)?;

        self.ledger.mint(target_id.as_str(), coin).await?;
        target.updated_at = now;
        if let Err(err) = self.registry.commit(vec![target.clone()]).await {
            if let Err(undo) = self.ledger.burn(target_id.as_str(), coin).await {
                error!(action_id = %action.id, error = %undo, "ledger compensation failed");
            }
            return Err(err);
        }

        Ok(Settled {
            entry: TransactionAppend {
                kind: TransactionKind::Mint,
                source: None,
                destination: Some(target_id.clone()),
                amount: Balance::single(coin.clone()),
                value,
                reference: Some(action.id.clone()),
                memo: action.reason.clone(),
                timestamp: now,
            },
            touched: vec![target],
        })
    }

    async fn apply_burn(&self, action: &RebalanceAction, now: DateTime<Utc>) -> TreasuryResult<Settled> {
        let source_id = action
            .source
            .as_ref()
            .ok_or_else(|| TreasuryError::InvalidInput(format!("burn {} has no source", action.id)))?;
        let coin = &action.amount;
        let mut source = active_pool(&self.registry, source_id).await?;
        source.balance = debited(&source, coin)?;
        let value = self.value_u64(coin)?;

        self.ledger.burn(source_id.as_str(), coin).await?;
        source.updated_at = now;
        if let Err(err) = self.registry.commit(vec![source.clone()]).await {
            if let Err(undo) = self.ledger.mint(source_id.as_str(), coin).await {
                error!(action_id = %action.id, error = %undo, "ledger compensation failed");
            }
            return Err(err);
        }

        Ok(Settled {
            entry: TransactionAppend {
                kind: TransactionKind::Burn,
                source: Some(source_id.clone()),
                destination: None,
                amount: Balance::single(coin.clone()),
                value,
                reference: Some(action.id.clone()),
                memo: action.reason.clone(),
                timestamp: now,
            },
            touched: vec![source],
        })
    }

    /// Burn `amount` in the source, mint the equal-value amount of
    /// `swap_to` into the destination (or back into the source).
    async fn apply_swap(&self, action: &RebalanceAction, now: DateTime<Utc>) -> TreasuryResult<Settled> {
        let source_id = action
            .source
            .as_ref()
            .ok_or_else(|| TreasuryError::InvalidInput(format!("swap {} has no source", action.id)))?;
        let target_denom = action.swap_to.clone().ok_or_else(|| {
            TreasuryError::InvalidInput(format!("swap {} has no target denomination", action.id))
        })?;
        let coin = &action.amount;
        if target_denom == coin.denom {
            return Err(TreasuryError::InvalidInput(format!(
                "swap {} converts {} into itself",
                action.id, target_denom
            )));
        }
        let value = self.prices.value_of(coin)?;
        let out = Coin::new(
            target_denom.clone(),
            self.prices.amount_for_value(&target_denom, value)?,
        );
        if out.is_zero() {
            return Err(TreasuryError::InvariantViolation(format!(
                "swap {} yields no {}",
                action.id, target_denom
            )));
        }
        let target_id = action.destination.clone().unwrap_or_else(|| source_id.clone());

        let mut source = active_pool(&self.registry, source_id).await?;
        source.balance = debited(&source, coin)?;
        let mut target = if target_id == *source_id {
            None
        } else {
            Some(active_pool(&self.registry, &target_id).await?)
        };
        match target.as_mut() {
            Some(pool) => pool.balance = credited(pool, &out)?,
            None => source.balance = credited(&source, &out)?,
        }

        let mut moved = Balance::single(coin.clone());
        moved.add(&out)?;

        self.ledger.burn(source_id.as_str(), coin).await?;
        if let Err(err) = self.ledger.mint(target_id.as_str(), &out).await {
            if let Err(undo) = self.ledger.mint(source_id.as_str(), coin).await {
                error!(action_id = %action.id, error = %undo, "swap compensation failed");
            }
            return Err(err);
        }

        source.updated_at = now;
        let mut touched = vec![source];
        if let Some(mut pool) = target {
            pool.updated_at = now;
            touched.push(pool);
        }
        if let Err(err) = self.registry.commit(touched.clone()).await {
            let undo = async {
                self.ledger.burn(target_id.as_str(), &out).await?;
                self.ledger.mint(source_id.as_str(), coin).await
            };
            if let Err(undo) = undo.await {
                error!(action_id = %action.id, error = %undo, "swap compensation failed");
            }
            return Err(err);
        }

        Ok(Settled {
            entry: TransactionAppend {
                kind: TransactionKind::Swap,
                source: Some(source_id.clone()),
                destination: Some(target_id),
                amount: moved,
                value: u64::try_from(value).unwrap_or(u64::MAX),
                reference: Some(action.id.clone()),
                memo: format!("{} -> {}", coin, out),
                timestamp: now,
            },
            touched,
        })
    }

    /// Needs a proposal: every MINT, BURN and SWAP, and transfers out of a
    /// governed pool or beyond its auto-execute policy.
    pub async fn needs_governance(&self, action: &RebalanceAction) -> TreasuryResult<bool> {
        match action.action_type {
            ActionType::Mint | ActionType::Burn | ActionType::Swap => return Ok(true),
            ActionType::Transfer => {}
        }
        let Some(source_id) = &action.source else {
            return Ok(true);
        };
        let source = self.registry.get(source_id).await?;
        if source.access.governance_required {
            return Ok(true);
        }
        let value = self.prices.value_of(&action.amount)?;
        Ok(!source
            .access
            .auto_execute
            .permits(action.action_type, value, action.risk))
    }

    async fn draft_for(&self, plan_id: &str, action: &RebalanceAction) -> TreasuryResult<ProposalDraft> {
        let source = match &action.source {
            Some(id) => Some(self.registry.get(id).await?),
            None => None,
        };
        let pool_value = match &source {
            Some(pool) => Some(self.prices.balance_value(&pool.balance)?),
            None => None,
        };
        let proposal_type = if action.emergency {
            ProposalType::EmergencyAction
        } else {
            ProposalType::Rebalance
        };
        let title = if action.reason.is_empty() {
            format!("{:?} action {}", action.action_type, action.id)
        } else {
            action.reason.clone()
        };
        Ok(ProposalDraft {
            proposal_type,
            proposer: self.gate.config()?.system_proposer,
            title,
            payload: ProposalPayload::PlanAction {
                plan_id: plan_id.to_string(),
                action_id: action.id.clone(),
                action_type: action.action_type,
                source: action.source.clone(),
                destination: action.destination.clone(),
                amount: action.amount.clone(),
            },
            pool_id: action.source.clone(),
            amount_value: self.value_u64(&action.amount)?,
            pool_value,
            pool_required_signatures: source.map_or(0, |p| p.access.required_signatures),
        })
    }

    /// Append the transaction and balance snapshots for the touched pools.
    pub(crate) async fn journal(
        &self,
        entry: TransactionAppend,
        touched: &[&Pool],
    ) -> TreasuryResult<TransactionRecord> {
        let recorded_at = entry.timestamp;
        let record = self.store.append_transaction(entry).await?;
        for pool in touched {
            self.store
                .record_balance(BalanceSnapshot {
                    pool_id: pool.id.clone(),
                    balance: pool.balance.clone(),
                    recorded_at,
                })
                .await?;
        }
        Ok(record)
    }

    pub(crate) fn value_u64(&self, coin: &Coin) -> TreasuryResult<Amount> {
        Ok(Amount::try_from(self.prices.value_of(coin)?).unwrap_or(Amount::MAX))
    }

    async fn save(&self, plan: &RebalancePlan, now: DateTime<Utc>) -> TreasuryResult<()> {
        self.store.upsert_plan(plan.clone()).await?;
        self.events
            .emit(TreasuryEvent::PlanCompleted(PlanCompleted {
                plan_id: plan.id.clone(),
                status: plan.status,
                actions_executed: plan.count_with(ActionStatus::Executed),
                actions_pending: plan.count_with(ActionStatus::Pending),
                actions_failed: plan.count_with(ActionStatus::Failed),
                total_moved: plan.total_moved.clone(),
                timestamp: now,
            }))
            .await;
        Ok(())
    }
}

/// Ledger and registry are committed; only the audit trail is left to write.
struct Settled {
    entry: TransactionAppend,
    touched: Vec<Pool>,
}

/// Errors that fail one action but leave the plan running.
fn is_action_local(err: &TreasuryError) -> bool {
    matches!(
        err,
        TreasuryError::InvariantViolation(_)
            | TreasuryError::Ledger(_)
            | TreasuryError::NotFound(_)
            | TreasuryError::InvalidInput(_)
    )
}

fn fail_action(plan: &mut RebalancePlan, idx: usize, rejection: Rejection, now: DateTime<Utc>) {
    let action = &mut plan.actions[idx];
    warn!(
        plan_id = %plan.id,
        action_id = %action.id,
        kind = ?rejection.kind,
        reason = %rejection.reason,
        "rebalance action failed"
    );
    action.status = ActionStatus::Failed;
    action.failure = Some(rejection);
    plan.updated_at = now;
}

fn unmet_prerequisite(plan: &RebalancePlan, idx: usize) -> Option<String> {
    plan.actions[idx]
        .prerequisites
        .iter()
        .find(|id| {
            plan.action(id)
                .map_or(true, |a| a.status != ActionStatus::Executed)
        })
        .cloned()
}

pub(crate) async fn active_pool(registry: &PoolRegistry, id: &PoolId) -> TreasuryResult<Pool> {
    let pool = registry.get(id).await?;
    if !pool.is_active() {
        return Err(TreasuryError::InvariantViolation(format!(
            "pool {} is frozen",
            id
        )));
    }
    Ok(pool)
}

/// Balance after removing `coin`, refusing to cross the pool's floor.
pub(crate) fn debited(pool: &Pool, coin: &Coin) -> TreasuryResult<Balance> {
    let mut balance = pool.balance.clone();
    balance.sub(coin).map_err(|_| {
        TreasuryError::InvariantViolation(format!(
            "pool {} holds {} {}, cannot debit {}",
            pool.id,
            pool.balance.amount_of(&coin.denom),
            coin.denom,
            coin
        ))
    })?;
    let floor = pool.min_balance.amount_of(&coin.denom);
    if balance.amount_of(&coin.denom) < floor {
        return Err(TreasuryError::InvariantViolation(format!(
            "debiting {} would take pool {} below its minimum of {} {}",
            coin, pool.id, floor, coin.denom
        )));
    }
    Ok(balance)
}

/// Balance after adding `coin`, refusing to cross a configured ceiling.
pub(crate) fn credited(pool: &Pool, coin: &Coin) -> TreasuryResult<Balance> {
    let mut balance = pool.balance.clone();
    balance.add(coin)?;
    if pool.max_balance.contains_denom(&coin.denom) {
        let cap = pool.max_balance.amount_of(&coin.denom);
        if balance.amount_of(&coin.denom) > cap {
            return Err(TreasuryError::InvariantViolation(format!(
                "crediting {} would take pool {} above its maximum of {} {}",
                coin, pool.id, cap, coin.denom
            )));
        }
    }
    Ok(balance)
}
