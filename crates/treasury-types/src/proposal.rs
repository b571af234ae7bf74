use crate::amount::{Amount, Balance, Coin};
use crate::error::{Rejection, TreasuryError, TreasuryResult};
use crate::plan::{ActionType, RiskLevel};
use crate::pool::{Pool, PoolId, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalType {
    Withdrawal,
    Rebalance,
    ParameterChange,
    PoolCreation,
    PoolModification,
    EmergencyAction,
}

impl ProposalType {
    pub const ALL: [ProposalType; 6] = [
        Self::Withdrawal,
        Self::Rebalance,
        Self::ParameterChange,
        Self::PoolCreation,
        Self::PoolModification,
        Self::EmergencyAction,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Withdrawal => "WITHDRAWAL",
            Self::Rebalance => "REBALANCE",
            Self::ParameterChange => "PARAMETER_CHANGE",
            Self::PoolCreation => "POOL_CREATION",
            Self::PoolModification => "POOL_MODIFICATION",
            Self::EmergencyAction => "EMERGENCY_ACTION",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "WITHDRAWAL" => Some(Self::Withdrawal),
            "REBALANCE" => Some(Self::Rebalance),
            "PARAMETER_CHANGE" => Some(Self::ParameterChange),
            "POOL_CREATION" => Some(Self::PoolCreation),
            "POOL_MODIFICATION" => Some(Self::PoolModification),
            "EMERGENCY_ACTION" => Some(Self::EmergencyAction),
            _ => None,
        }
    }

    /// Types that need an open vote in addition to signatures.
    pub fn requires_voting(self) -> bool {
        matches!(self, Self::ParameterChange | Self::PoolCreation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalStatus {
    Pending,
    Voting,
    Approved,
    Executed,
    Rejected,
    Expired,
    Cancelled,
}

impl ProposalStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Voting => "VOTING",
            Self::Approved => "APPROVED",
            Self::Executed => "EXECUTED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "VOTING" => Some(Self::Voting),
            "APPROVED" => Some(Self::Approved),
            "EXECUTED" => Some(Self::Executed),
            "REJECTED" => Some(Self::Rejected),
            "EXPIRED" => Some(Self::Expired),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Still collecting signatures or votes.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Voting)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Executed | Self::Rejected | Self::Expired | Self::Cancelled
        )
    }

    /// Monotonic lifecycle: nothing leaves a terminal state and EXECUTED is
    /// only reachable from APPROVED.
    pub fn can_transition_to(self, next: ProposalStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved)
                | (Self::Pending, Self::Rejected)
                | (Self::Pending, Self::Cancelled)
                | (Self::Voting, Self::Approved)
                | (Self::Voting, Self::Rejected)
                | (Self::Voting, Self::Cancelled)
                | (Self::Approved, Self::Executed)
                | (Self::Approved, Self::Expired)
                | (Self::Approved, Self::Cancelled)
        )
    }
}

/// What an approved proposal does when executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProposalPayload {
    PlanAction {
        plan_id: String,
        action_id: String,
        action_type: ActionType,
        source: Option<PoolId>,
        destination: Option<PoolId>,
        amount: Coin,
    },
    Withdrawal {
        pool_id: PoolId,
        recipient: String,
        amount: Balance,
    },
    /// `parameter` is a JSON pointer into the treasury configuration.
    ParameterChange {
        parameter: String,
        value: serde_json::Value,
    },
    PoolCreation {
        pool: Box<Pool>,
    },
    PoolModification {
        pool: Box<Pool>,
    },
    /// Admits a signer, or replaces the roles and key of an existing one.
    /// `public_key` is a hex Ed25519 verifying key.
    SignerAddition {
        signer_id: String,
        roles: Vec<Role>,
        public_key: String,
    },
    SignerRemoval {
        signer_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub signer: String,
    pub signed_at: DateTime<Utc>,
    /// Hex Ed25519 signature over the proposal digest.
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteChoice {
    Yes,
    No,
    Abstain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub voter: String,
    pub choice: VoteChoice,
    pub cast_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    pub yes: u32,
    pub no: u32,
    pub abstain: u32,
}

impl VoteTally {
    pub fn turnout(&self) -> u32 {
        self.yes + self.no + self.abstain
    }
}

/// Signature-gated request for something beyond a pool's auto-execute authority.
///
/// Signatures and votes are append-only lists inside the record so a
/// threshold check is a single read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceProposal {
    pub id: String,
    pub proposal_type: ProposalType,
    pub proposer: String,
    pub title: String,
    pub payload: ProposalPayload,
    /// BLAKE3 hex digest of the payload; what signers sign.
    pub digest: String,
    #[serde(default)]
    pub pool_id: Option<PoolId>,
    /// Value moved, in base-denomination minor units.
    pub amount_value: Amount,
    pub risk: RiskLevel,
    pub required_signatures: u32,
    #[serde(default)]
    pub signatures: Vec<SignatureRecord>,
    #[serde(default)]
    pub votes: Vec<VoteRecord>,
    #[serde(default)]
    pub vote_passed: Option<bool>,
    pub status: ProposalStatus,
    pub submitted_at: DateTime<Utc>,
    pub signing_deadline: DateTime<Utc>,
    #[serde(default)]
    pub voting_ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolution: Option<Rejection>,
    pub updated_at: DateTime<Utc>,
}

impl GovernanceProposal {
    pub fn has_signed(&self, signer: &str) -> bool {
        self.signatures.iter().any(|s| s.signer == signer)
    }

    pub fn has_voted(&self, voter: &str) -> bool {
        self.votes.iter().any(|v| v.voter == voter)
    }

    pub fn signature_count(&self) -> u32 {
        u32::try_from(self.signatures.len()).unwrap_or(u32::MAX)
    }

    pub fn threshold_reached(&self) -> bool {
        self.signature_count() >= self.required_signatures
    }

    pub fn tally(&self) -> VoteTally {
        self.votes
            .iter()
            .fold(VoteTally::default(), |mut tally, vote| {
                match vote.choice {
                    VoteChoice::Yes => tally.yes += 1,
                    VoteChoice::No => tally.no += 1,
                    VoteChoice::Abstain => tally.abstain += 1,
                }
                tally
            })
    }

    pub fn transition(&mut self, next: ProposalStatus, now: DateTime<Utc>) -> TreasuryResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(TreasuryError::transition(
                &format!("proposal {}", self.id),
                self.status,
                next,
            ));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}
