//! Treasury storage abstractions.
//!
//! Persisted layout:
//! - one record per pool keyed by id
//! - one record per rebalance plan keyed by id, actions inline
//! - one record per governance proposal keyed by id, signatures and votes inline
//! - an append-only, hash-linked transaction log
//! - per-pool balance snapshots for history queries
//!
//! The in-memory adapter is the reference implementation; the PostgreSQL
//! adapter (feature `postgres`) is the transactional source of truth.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod chain;
mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use chain::{compute_transaction_hash, verify_transaction_chain};
pub use error::{StorageError, StorageResult};
pub use memory::InMemoryTreasuryStorage;
pub use traits::{
    BalanceHistoryStore, PlanStore, PoolStore, ProposalFilter, ProposalStore, QueryWindow,
    TransactionStore, TreasuryStorage,
};
