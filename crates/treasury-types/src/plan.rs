use crate::amount::{Amount, Balance, Coin, Denom};
use crate::error::{Rejection, TreasuryError, TreasuryResult};
use crate::pool::PoolId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered Low < Medium < High.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Risk of moving `amount` out of a pool holding `source_balance`:
    /// half or more is HIGH, a quarter or more is MEDIUM.
    pub fn of_source_fraction(amount: Amount, source_balance: Amount) -> Self {
        let amount = u128::from(amount);
        let source = u128::from(source_balance);
        if source == 0 || amount * 2 >= source {
            Self::High
        } else if amount * 4 >= source {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Transfer,
    Mint,
    Burn,
    Swap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Pending,
    Executed,
    Failed,
}

/// Unit of fund movement inside a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceAction {
    pub id: String,
    pub action_type: ActionType,
    pub source: Option<PoolId>,
    pub destination: Option<PoolId>,
    pub amount: Coin,
    /// Output denomination of a SWAP.
    #[serde(default)]
    pub swap_to: Option<Denom>,
    /// Lower runs first.
    pub priority: u32,
    pub risk: RiskLevel,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub emergency: bool,
    pub reason: String,
    pub status: ActionStatus,
    #[serde(default)]
    pub proposal_id: Option<String>,
    #[serde(default)]
    pub failure: Option<Rejection>,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
}

impl RebalanceAction {
    pub fn transfer(source: PoolId, destination: PoolId, amount: Coin) -> Self {
        Self {
            id: String::new(),
            action_type: ActionType::Transfer,
            source: Some(source),
            destination: Some(destination),
            amount,
            swap_to: None,
            priority: 100,
            risk: RiskLevel::Low,
            prerequisites: Vec::new(),
            emergency: false,
            reason: String::new(),
            status: ActionStatus::Pending,
            proposal_id: None,
            failure: None,
            executed_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ActionStatus::Pending
    }

    /// Pools whose balance this action changes.
    pub fn touched_pools(&self) -> Vec<&PoolId> {
        self.source.iter().chain(self.destination.iter()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Planned,
    Executing,
    Executed,
    /// Some actions committed, others failed. Nothing is unwound.
    PartiallyExecuted,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Executed | Self::PartiallyExecuted | Self::Failed | Self::Cancelled
        )
    }

    pub fn can_transition_to(self, next: PlanStatus) -> bool {
        matches!(
            (self, next),
            (Self::Planned, Self::Executing)
                | (Self::Planned, Self::Cancelled)
                | (Self::Executing, Self::Executed)
                | (Self::Executing, Self::PartiallyExecuted)
                | (Self::Executing, Self::Failed)
                | (Self::Executing, Self::Cancelled)
        )
    }
}

/// Ordered batch of actions derived from one snapshot.
///
/// The action list is frozen once the plan starts executing; only per-action
/// status and the resume cursor move afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalancePlan {
    pub id: String,
    pub trigger_reason: String,
    pub actions: Vec<RebalanceAction>,
    pub total_moved: Balance,
    pub risk: RiskLevel,
    pub status: PlanStatus,
    /// Index of the next action to process.
    pub cursor: usize,
    /// Proposal the plan is waiting on, if suspended.
    #[serde(default)]
    pub suspended_on: Option<String>,
    #[serde(default)]
    pub failure: Option<Rejection>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RebalancePlan {
    pub fn transition(&mut self, next: PlanStatus, now: DateTime<Utc>) -> TreasuryResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(TreasuryError::transition(
                &format!("plan {}", self.id),
                self.status,
                next,
            ));
        }
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
            self.suspended_on = None;
        }
        Ok(())
    }

    pub fn action(&self, action_id: &str) -> Option<&RebalanceAction> {
        self.actions.iter().find(|a| a.id == action_id)
    }

    pub fn count_with(&self, status: ActionStatus) -> usize {
        self.actions.iter().filter(|a| a.status == status).count()
    }

    /// Sum of amounts of executed actions.
    pub fn moved_so_far(&self) -> TreasuryResult<Balance> {
        let mut moved = Balance::new();
        for action in self
            .actions
            .iter()
            .filter(|a| a.status == ActionStatus::Executed)
        {
            moved.add(&action.amount)?;
        }
        Ok(moved)
    }

    /// Terminal status implied by per-action outcomes.
    pub fn settled_status(&self) -> PlanStatus {
        let executed = self.count_with(ActionStatus::Executed);
        let failed = self.count_with(ActionStatus::Failed);
        match (executed, failed) {
            (_, 0) => PlanStatus::Executed,
            (0, _) => PlanStatus::Failed,
            _ => PlanStatus::PartiallyExecuted,
        }
    }
}
