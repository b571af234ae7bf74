//! Treasury rebalancing engine with a multi-signature execution gate.
//!
//! Components, bottom-up:
//! - [`PoolRegistry`]: canonical pool set, validated typed writes
//! - [`DeviationAnalyzer`]: current share of total value against target
//! - [`RebalancePlanner`]: deviations to an ordered plan of transfers
//! - [`PlanExecutor`] and [`GovernanceGate`]: direct or proposal-gated
//!   execution against the ledger
//!
//! [`TreasuryEngine`] wires them together, runs rebalance cycles and carries
//! the treasury flows (deposits, withdrawals, revenue). Read paths live in
//! [`TreasuryQueries`].
//!
//! The ledger, price source and telemetry sink are injected collaborators
//! ([`LedgerClient`], [`PriceFeed`], [`EventSink`]).

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod config;
mod defaults;
mod deviation;
mod engine;
mod events;
mod execution;
pub mod governance;
mod ledger;
mod planner;
mod pricing;
mod query;
mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{GovernanceConfig, PlannerConfig, SignatureTier, TreasuryConfig};
pub use defaults::{default_pools, DEFAULT_AUTO_EXECUTE_LIMIT};
pub use deviation::{DegenerateStateWarning, Deviation, DeviationAnalyzer, DeviationReport};
pub use engine::{CycleReport, TreasuryEngine, WithdrawalOutcome};
pub use events::{EventSink, MemoryEventSink, TracingEventSink};
pub use execution::PlanExecutor;
pub use governance::{GovernanceGate, ProposalDraft, Signer, SignerRoster};
pub use ledger::{InMemoryLedger, LedgerClient};
pub use planner::{RebalancePlanner, EMERGENCY_PRIORITY};
pub use pricing::{Price, PriceFeed, StaticPriceFeed};
pub use query::{PerformanceReport, PoolPerformance, TreasuryQueries};
pub use registry::{validate_pool, PoolRegistry};
