use crate::amount::{Balance, Coin};
use crate::plan::{ActionType, PlanStatus};
use crate::pool::PoolId;
use crate::proposal::ProposalStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCommitted {
    pub action_id: String,
    pub action_type: ActionType,
    pub source_pool: Option<PoolId>,
    pub dest_pool: Option<PoolId>,
    pub amount: Coin,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalTransition {
    pub proposal_id: String,
    /// `None` on submission.
    pub from_status: Option<ProposalStatus>,
    pub to_status: ProposalStatus,
    pub signer: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Emitted whenever an execution pass over a plan stops, either at a
/// terminal status or suspended on a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanCompleted {
    pub plan_id: String,
    pub status: PlanStatus,
    pub actions_executed: usize,
    pub actions_pending: usize,
    pub actions_failed: usize,
    pub total_moved: Balance,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TreasuryEvent {
    ActionCommitted(ActionCommitted),
    ProposalTransition(ProposalTransition),
    PlanCompleted(PlanCompleted),
}

impl TreasuryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ActionCommitted(_) => "action_committed",
            Self::ProposalTransition(_) => "proposal_transition",
            Self::PlanCompleted(_) => "plan_completed",
        }
    }
}
