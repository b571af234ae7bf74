//! Multi-signature governance: tier tables, signer roster and the
//! proposal state machine.

mod gate;
mod roster;
mod tiers;

pub use gate::{proposal_digest, GovernanceGate, ProposalDraft};
pub use roster::{public_key_hex, sign_digest, Signer, SignerRoster};
pub use tiers::{assess_risk, authorized_roles, required_signatures, tier_signatures, type_floor};
