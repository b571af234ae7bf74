//! Treasury data model.
//!
//! Shared by the storage adapters, the rebalancing core and the service:
//! - multi-asset balances in integer minor units
//! - pools with allocation policy, balance bounds and access control
//! - rebalance plans and their actions
//! - governance proposals with inline signatures and votes
//! - hash-chained transaction records and balance snapshots
//! - telemetry events and the error taxonomy
//!
//! Fractions are carried as basis points so that a snapshot always produces
//! the same arithmetic on every host.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod amount;
mod error;
mod event;
mod plan;
mod pool;
mod proposal;
mod transaction;

pub use amount::{Amount, Balance, Coin, Denom, BASE_DENOM, MINOR_UNITS};
pub use error::{ErrorKind, Rejection, TreasuryError, TreasuryResult};
pub use event::{ActionCommitted, PlanCompleted, ProposalTransition, TreasuryEvent};
pub use plan::{ActionStatus, ActionType, PlanStatus, RebalanceAction, RebalancePlan, RiskLevel};
pub use pool::{
    AccessControl, Allocation, AutoExecutePolicy, Pool, PoolCategory, PoolId, PoolStatus,
    RebalanceConfig, Role, BASIS_POINTS, MAX_REBALANCE_GAP_SECS,
};
pub use proposal::{
    GovernanceProposal, ProposalPayload, ProposalStatus, ProposalType, SignatureRecord,
    VoteChoice, VoteRecord, VoteTally,
};
pub use transaction::{BalanceSnapshot, TransactionAppend, TransactionKind, TransactionRecord};
