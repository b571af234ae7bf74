use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type TreasuryResult<T> = Result<T, TreasuryError>;

/// Treasury runtime errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreasuryError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Prerequisite not met: {0}")]
    PrerequisiteNotMet(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Proposal expired: {0}")]
    ProposalExpired(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Duplicate signature: {0}")]
    DuplicateSignature(String),

    #[error("Duplicate vote: {0}")]
    DuplicateVote(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TreasuryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Self::PrerequisiteNotMet(_) => ErrorKind::PrerequisiteNotMet,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::ProposalExpired(_) => ErrorKind::ProposalExpired,
            Self::InvalidTransition(_) => ErrorKind::InvalidTransition,
            Self::DuplicateSignature(_) => ErrorKind::DuplicateSignature,
            Self::DuplicateVote(_) => ErrorKind::DuplicateVote,
            Self::InvalidSignature(_) => ErrorKind::InvalidSignature,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Ledger(_) => ErrorKind::Ledger,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// The human-readable reason without the kind prefix.
    pub fn reason(&self) -> &str {
        match self {
            Self::NotFound(r)
            | Self::InvariantViolation(r)
            | Self::PrerequisiteNotMet(r)
            | Self::Unauthorized(r)
            | Self::ProposalExpired(r)
            | Self::InvalidTransition(r)
            | Self::DuplicateSignature(r)
            | Self::DuplicateVote(r)
            | Self::InvalidSignature(r)
            | Self::InvalidInput(r)
            | Self::Ledger(r)
            | Self::Storage(r)
            | Self::Serialization(r) => r,
        }
    }

    pub fn rejection(&self) -> Rejection {
        Rejection::new(self.kind(), self.reason())
    }

    pub fn transition(entity: &str, from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Self {
        Self::InvalidTransition(format!(
            "{} cannot move from {:?} to {:?}",
            entity, from, to
        ))
    }
}

/// Stable error classification used in persisted rejections and API payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvariantViolation,
    PrerequisiteNotMet,
    Unauthorized,
    ProposalExpired,
    InvalidTransition,
    DuplicateSignature,
    DuplicateVote,
    InvalidSignature,
    InvalidInput,
    Ledger,
    Storage,
    Serialization,
    /// Zero total treasury value. Reported, never raised.
    DegenerateState,
    /// Proposal rejected by a signer or by a failed vote.
    Rejected,
    Cancelled,
}

/// Audit-facing record of why an action or proposal did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: ErrorKind,
    pub reason: String,
}

impl Rejection {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_keeps_kind_and_reason() {
        let err = TreasuryError::InvariantViolation("reserve would drop below floor".into());
        let rejection = err.rejection();
        assert_eq!(rejection.kind, ErrorKind::InvariantViolation);
        assert_eq!(rejection.reason, "reserve would drop below floor");
        assert_eq!(
            err.to_string(),
            "Invariant violation: reserve would drop below floor"
        );
    }
}
