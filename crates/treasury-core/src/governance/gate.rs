//! Governance Gate: multi-signature proposal lifecycle.
//!
//! ```text
//! submit -> PENDING | VOTING -> APPROVED -> EXECUTED
//!                  \                   \-> EXPIRED   (execution window closed)
//!                   \-> REJECTED                     (signer, failed vote, timeout)
//!                   \-> CANCELLED                    (proposer or engine)
//! ```
//!
//! Every write is a compare-and-set on the stored status, so two writers
//! racing on one proposal cannot both move it.

use super::roster::{Signer, SignerRoster};
use super::tiers::{assess_risk, authorized_roles, required_signatures, type_floor};
use crate::config::GovernanceConfig;
use crate::events::EventSink;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use treasury_store::{ProposalFilter, QueryWindow, TreasuryStorage};
use treasury_types::{
    Amount, ErrorKind, GovernanceProposal, PoolId, ProposalPayload, ProposalStatus,
    ProposalTransition, ProposalType, Rejection, Role, SignatureRecord, TreasuryError,
    TreasuryEvent, TreasuryResult, VoteChoice, VoteRecord, BASIS_POINTS,
};
use uuid::Uuid;

/// Everything needed to open a proposal.
#[derive(Debug, Clone)]
pub struct ProposalDraft {
    pub proposal_type: ProposalType,
    pub proposer: String,
    pub title: String,
    pub payload: ProposalPayload,
    pub pool_id: Option<PoolId>,
    /// Value in base minor units.
    pub amount_value: Amount,
    /// Value of the pool drawn from, for the share-of-pool risk rule.
    pub pool_value: Option<u128>,
    pub pool_required_signatures: u32,
}

pub struct GovernanceGate {
    store: Arc<dyn TreasuryStorage>,
    roster: RwLock<SignerRoster>,
    config: RwLock<GovernanceConfig>,
    events: Arc<dyn EventSink>,
}

impl GovernanceGate {
    pub fn new(
        config: GovernanceConfig,
        store: Arc<dyn TreasuryStorage>,
        roster: SignerRoster,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            roster: RwLock::new(roster),
            config: RwLock::new(config),
            events,
        }
    }

    pub fn config(&self) -> TreasuryResult<GovernanceConfig> {
        self.config
            .read()
            .map(|c| c.clone())
            .map_err(|_| TreasuryError::Storage("governance config lock poisoned".to_string()))
    }

    pub fn update_config(&self, config: GovernanceConfig) -> TreasuryResult<()> {
        config.validate()?;
        let mut slot = self
            .config
            .write()
            .map_err(|_| TreasuryError::Storage("governance config lock poisoned".to_string()))?;
        *slot = config;
        Ok(())
    }

    pub fn roster(&self) -> TreasuryResult<SignerRoster> {
        self.with_roster(|r| Ok(r.clone()))
    }

    fn with_roster<T>(&self, f: impl FnOnce(&SignerRoster) -> TreasuryResult<T>) -> TreasuryResult<T> {
        let roster = self
            .roster
            .read()
            .map_err(|_| TreasuryError::Storage("signer roster lock poisoned".to_string()))?;
        f(&roster)
    }

    /// Admit `signer`, replacing any member with the same id.
    pub fn add_signer(&self, signer: Signer) -> TreasuryResult<()> {
        let mut roster = self
            .roster
            .write()
            .map_err(|_| TreasuryError::Storage("signer roster lock poisoned".to_string()))?;
        let replaced = roster.get(&signer.id).is_some();
        info!(signer = %signer.id, roles = ?signer.roles, replaced, "signer admitted");
        roster.insert(signer);
        Ok(())
    }

    /// Drop a signer. Refused when it would leave a proposal type that
    /// can currently reach its signature floor unable to do so.
    pub fn remove_signer(&self, signer_id: &str) -> TreasuryResult<Signer> {
        let mut roster = self
            .roster
            .write()
            .map_err(|_| TreasuryError::Storage("signer roster lock poisoned".to_string()))?;
        let signer = roster
            .get(signer_id)
            .cloned()
            .ok_or_else(|| TreasuryError::NotFound(format!("signer {} not found", signer_id)))?;
        for proposal_type in ProposalType::ALL {
            let roles = authorized_roles(proposal_type);
            if !signer.has_any_role(roles) {
                continue;
            }
            let eligible = roster.eligible(roles).count();
            let floor = type_floor(proposal_type) as usize;
            if eligible >= floor && eligible - 1 < floor {
                return Err(TreasuryError::InvariantViolation(format!(
                    "removing {} leaves {} signers for {}, below its floor of {}",
                    signer_id,
                    eligible - 1,
                    proposal_type.name(),
                    floor
                )));
            }
        }
        roster.remove(signer_id);
        info!(signer = %signer_id, "signer removed");
        Ok(signer)
    }

    pub async fn get(&self, proposal_id: &str) -> TreasuryResult<GovernanceProposal> {
        self.store
            .get_proposal(proposal_id)
            .await?
            .ok_or_else(|| TreasuryError::NotFound(format!("proposal {} not found", proposal_id)))
    }

    pub async fn list(
        &self,
        filter: &ProposalFilter,
        window: QueryWindow,
    ) -> TreasuryResult<Vec<GovernanceProposal>> {
        Ok(self.store.list_proposals(filter, window).await?)
    }

    /// Executors must hold a role authorized for the type; the engine's
    /// own identity always may.
    pub fn ensure_authorized(&self, actor: &str, proposal_type: ProposalType) -> TreasuryResult<()> {
        let config = self.config()?;
        if actor == config.system_proposer {
            return Ok(());
        }
        self.with_roster(|roster| {
            if roster.has_role_in(actor, authorized_roles(proposal_type)) {
                Ok(())
            } else {
                Err(TreasuryError::Unauthorized(format!(
                    "{} holds no role authorized for {}",
                    actor,
                    proposal_type.name()
                )))
            }
        })
    }

    pub async fn submit(
        &self,
        draft: ProposalDraft,
        now: DateTime<Utc>,
    ) -> TreasuryResult<GovernanceProposal> {
        let config = self.config()?;
        self.ensure_authorized(&draft.proposer, draft.proposal_type)?;

        let id = format!("prop-{}", Uuid::new_v4());
        let digest = proposal_digest(&id, draft.proposal_type, &draft.payload)?;
        let risk = assess_risk(draft.proposal_type, draft.amount_value, draft.pool_value);
        let required = required_signatures(
            &config,
            draft.proposal_type,
            draft.amount_value,
            risk,
            draft.pool_required_signatures,
        );

        let voting = draft.proposal_type.requires_voting();
        let voting_ends_at = after(now, config.voting_period_secs)?;
        let signing_opens = if voting { voting_ends_at } else { now };
        let signing_deadline = after(signing_opens, config.signing_period_secs)?;

        let proposal = GovernanceProposal {
            id,
            proposal_type: draft.proposal_type,
            proposer: draft.proposer,
            title: draft.title,
            payload: draft.payload,
            digest,
            pool_id: draft.pool_id,
            amount_value: draft.amount_value,
            risk,
            required_signatures: required,
            signatures: Vec::new(),
            votes: Vec::new(),
            vote_passed: None,
            status: if voting {
                ProposalStatus::Voting
            } else {
                ProposalStatus::Pending
            },
            submitted_at: now,
            signing_deadline,
            voting_ends_at: voting.then_some(voting_ends_at),
            approved_at: None,
            execution_deadline: None,
            executed_at: None,
            resolution: None,
            updated_at: now,
        };

        self.store.insert_proposal(proposal.clone()).await?;
        info!(
            proposal_id = %proposal.id,
            proposal_type = proposal.proposal_type.name(),
            proposer = %proposal.proposer,
            required = proposal.required_signatures,
            risk = ?proposal.risk,
            "governance proposal submitted"
        );
        self.emit(&proposal, None, None, now).await;
        Ok(proposal)
    }

    /// Record one signature. Reaching the threshold approves the proposal
    /// unless it still waits on a vote.
    pub async fn sign(
        &self,
        proposal_id: &str,
        signer: &str,
        signature_hex: &str,
        now: DateTime<Utc>,
    ) -> TreasuryResult<GovernanceProposal> {
        let config = self.config()?;
        let mut proposal = self.get(proposal_id).await?;
        self.ensure_open(&mut proposal, now).await?;

        let pool_roles = self.withdrawal_pool_roles(&proposal).await?;
        self.with_roster(|roster| {
            if !roster.has_role_in(signer, authorized_roles(proposal.proposal_type)) {
                return Err(TreasuryError::Unauthorized(format!(
                    "{} may not sign {} proposals",
                    signer,
                    proposal.proposal_type.name()
                )));
            }
            if let Some(roles) = &pool_roles {
                if !roles.is_empty() && !roster.has_role_in(signer, roles) {
                    return Err(TreasuryError::Unauthorized(format!(
                        "{} holds no role authorized on the source pool",
                        signer
                    )));
                }
            }
            Ok(())
        })?;

        if proposal.has_signed(signer) {
            warn!(proposal_id, signer, "duplicate signature refused");
            return Err(TreasuryError::DuplicateSignature(format!(
                "{} already signed proposal {}",
                signer, proposal_id
            )));
        }
        self.with_roster(|roster| roster.verify(signer, &proposal.digest, signature_hex))?;

        let from = proposal.status;
        proposal.signatures.push(SignatureRecord {
            signer: signer.to_string(),
            signed_at: now,
            payload: signature_hex.to_string(),
        });
        proposal.updated_at = now;
        let eligible = self.eligible_voters(proposal.proposal_type)?;
        settle(&mut proposal, &config, eligible, now)?;

        self.store.update_proposal(proposal.clone(), from).await?;
        info!(
            proposal_id,
            signer,
            collected = proposal.signature_count(),
            required = proposal.required_signatures,
            "proposal signed"
        );
        if proposal.status != from {
            self.emit(&proposal, Some(from), Some(signer), now).await;
        }
        Ok(proposal)
    }

    pub async fn vote(
        &self,
        proposal_id: &str,
        voter: &str,
        choice: VoteChoice,
        now: DateTime<Utc>,
    ) -> TreasuryResult<GovernanceProposal> {
        let mut proposal = self.get(proposal_id).await?;
        let open = proposal.status == ProposalStatus::Voting
            && proposal.vote_passed.is_none()
            && proposal.voting_ends_at.is_some_and(|ends| now <= ends);
        if !open {
            return Err(TreasuryError::InvalidTransition(format!(
                "proposal {} is not open for voting",
                proposal_id
            )));
        }
        self.with_roster(|roster| {
            if roster.has_role_in(voter, authorized_roles(proposal.proposal_type)) {
                Ok(())
            } else {
                Err(TreasuryError::Unauthorized(format!(
                    "{} is not an eligible voter",
                    voter
                )))
            }
        })?;
        if proposal.has_voted(voter) {
            return Err(TreasuryError::DuplicateVote(format!(
                "{} already voted on proposal {}",
                voter, proposal_id
            )));
        }

        proposal.votes.push(VoteRecord {
            voter: voter.to_string(),
            choice,
            cast_at: now,
        });
        proposal.updated_at = now;
        self.store
            .update_proposal(proposal.clone(), ProposalStatus::Voting)
            .await?;
        Ok(proposal)
    }

    pub async fn reject(
        &self,
        proposal_id: &str,
        signer: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> TreasuryResult<GovernanceProposal> {
        let mut proposal = self.get(proposal_id).await?;
        self.ensure_open(&mut proposal, now).await?;
        self.ensure_authorized(signer, proposal.proposal_type)?;
        let reason = format!("rejected by {}: {}", signer, reason);
        self.resolve(
            proposal,
            ProposalStatus::Rejected,
            Rejection::new(ErrorKind::Rejected, reason),
            Some(signer),
            now,
        )
        .await
    }

    /// Only the proposer (or the engine) may cancel, and only before execution.
    pub async fn cancel(
        &self,
        proposal_id: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> TreasuryResult<GovernanceProposal> {
        let config = self.config()?;
        let proposal = self.get(proposal_id).await?;
        if actor != proposal.proposer && actor != config.system_proposer {
            return Err(TreasuryError::Unauthorized(format!(
                "only the proposer may cancel proposal {}",
                proposal_id
            )));
        }
        self.resolve(
            proposal,
            ProposalStatus::Cancelled,
            Rejection::new(ErrorKind::Cancelled, format!("cancelled by {}", actor)),
            Some(actor),
            now,
        )
        .await
    }

    /// Apply deadlines: open proposals past the signing deadline are
    /// rejected, votes past their end are closed, approvals past their
    /// execution window expire. Returns the proposals that changed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> TreasuryResult<Vec<GovernanceProposal>> {
        let config = self.config()?;
        let mut changed = Vec::new();
        for status in [
            ProposalStatus::Pending,
            ProposalStatus::Voting,
            ProposalStatus::Approved,
        ] {
            let filter = ProposalFilter {
                status: Some(status),
                ..ProposalFilter::default()
            };
            for mut proposal in self.store.list_proposals(&filter, QueryWindow::default()).await? {
                let before = proposal.clone();
                let from = proposal.status;
                if from.is_open() && now > proposal.signing_deadline {
                    proposal.transition(ProposalStatus::Rejected, now)?;
                    proposal.resolution = Some(Rejection::new(
                        ErrorKind::Rejected,
                        "signing deadline passed before the threshold was reached",
                    ));
                } else if from == ProposalStatus::Voting {
                    let eligible = self.eligible_voters(proposal.proposal_type)?;
                    settle(&mut proposal, &config, eligible, now)?;
                } else if from == ProposalStatus::Approved && past_window(&proposal, now) {
                    proposal.transition(ProposalStatus::Expired, now)?;
                    proposal.resolution = Some(expired_rejection());
                }

                if proposal == before {
                    continue;
                }
                match self.store.update_proposal(proposal.clone(), from).await {
                    Ok(()) => {}
                    Err(treasury_store::StorageError::Conflict(reason)) => {
                        warn!(proposal_id = %proposal.id, %reason, "proposal moved during sweep");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
                if proposal.status != from {
                    self.emit(&proposal, Some(from), None, now).await;
                    changed.push(proposal);
                }
            }
        }
        Ok(changed)
    }

    /// Gate for executing an approved proposal. An approval whose window
    /// has closed is marked EXPIRED and refused.
    pub async fn begin_execution(
        &self,
        proposal_id: &str,
        now: DateTime<Utc>,
    ) -> TreasuryResult<GovernanceProposal> {
        let mut proposal = self.get(proposal_id).await?;
        match proposal.status {
            ProposalStatus::Approved => {}
            ProposalStatus::Expired => {
                return Err(TreasuryError::ProposalExpired(format!(
                    "proposal {} expired; resubmit required",
                    proposal_id
                )))
            }
            other => {
                return Err(TreasuryError::InvalidTransition(format!(
                    "proposal {} is {}, not APPROVED",
                    proposal_id,
                    other.name()
                )))
            }
        }
        if past_window(&proposal, now) {
            proposal.transition(ProposalStatus::Expired, now)?;
            proposal.resolution = Some(expired_rejection());
            self.store
                .update_proposal(proposal.clone(), ProposalStatus::Approved)
                .await?;
            warn!(proposal_id, "execution attempted after window closed");
            self.emit(&proposal, Some(ProposalStatus::Approved), None, now).await;
            return Err(TreasuryError::ProposalExpired(format!(
                "execution window of proposal {} closed; resubmit required",
                proposal_id
            )));
        }
        Ok(proposal)
    }

    pub async fn mark_executed(
        &self,
        proposal_id: &str,
        now: DateTime<Utc>,
    ) -> TreasuryResult<GovernanceProposal> {
        let mut proposal = self.begin_execution(proposal_id, now).await?;
        proposal.transition(ProposalStatus::Executed, now)?;
        proposal.executed_at = Some(now);
        self.store
            .update_proposal(proposal.clone(), ProposalStatus::Approved)
            .await?;
        self.emit(&proposal, Some(ProposalStatus::Approved), None, now).await;
        Ok(proposal)
    }

    /// Open check used by signing and explicit rejection. A proposal found
    /// past its signing deadline is rejected on the spot.
    async fn ensure_open(
        &self,
        proposal: &mut GovernanceProposal,
        now: DateTime<Utc>,
    ) -> TreasuryResult<()> {
        if !proposal.status.is_open() {
            return Err(TreasuryError::InvalidTransition(format!(
                "proposal {} is {} and no longer open",
                proposal.id,
                proposal.status.name()
            )));
        }
        if now > proposal.signing_deadline {
            let rejected = self
                .resolve(
                    proposal.clone(),
                    ProposalStatus::Rejected,
                    Rejection::new(ErrorKind::Rejected, "signing deadline passed"),
                    None,
                    now,
                )
                .await?;
            *proposal = rejected;
            return Err(TreasuryError::InvalidTransition(format!(
                "signing period of proposal {} has ended",
                proposal.id
            )));
        }
        Ok(())
    }

    async fn resolve(
        &self,
        mut proposal: GovernanceProposal,
        next: ProposalStatus,
        resolution: Rejection,
        actor: Option<&str>,
        now: DateTime<Utc>,
    ) -> TreasuryResult<GovernanceProposal> {
        let from = proposal.status;
        proposal.transition(next, now)?;
        proposal.resolution = Some(resolution);
        self.store.update_proposal(proposal.clone(), from).await?;
        info!(
            proposal_id = %proposal.id,
            from = from.name(),
            to = next.name(),
            "proposal resolved"
        );
        self.emit(&proposal, Some(from), actor, now).await;
        Ok(proposal)
    }

    async fn withdrawal_pool_roles(
        &self,
        proposal: &GovernanceProposal,
    ) -> TreasuryResult<Option<Vec<Role>>> {
        if proposal.proposal_type != ProposalType::Withdrawal {
            return Ok(None);
        }
        let Some(pool_id) = &proposal.pool_id else {
            return Ok(None);
        };
        Ok(self
            .store
            .get_pool(pool_id)
            .await?
            .map(|pool| pool.access.authorized_roles))
    }

    fn eligible_voters(&self, proposal_type: ProposalType) -> TreasuryResult<usize> {
        self.with_roster(|roster| Ok(roster.eligible(authorized_roles(proposal_type)).count()))
    }

    async fn emit(
        &self,
        proposal: &GovernanceProposal,
        from: Option<ProposalStatus>,
        signer: Option<&str>,
        now: DateTime<Utc>,
    ) {
        self.events
            .emit(TreasuryEvent::ProposalTransition(ProposalTransition {
                proposal_id: proposal.id.clone(),
                from_status: from,
                to_status: proposal.status,
                signer: signer.map(str::to_string),
                timestamp: now,
            }))
            .await;
    }
}

/// BLAKE3 over the proposal id, type and canonical payload JSON. Binding the
/// id keeps a signature from being replayed onto an identical payload.
pub fn proposal_digest(
    proposal_id: &str,
    proposal_type: ProposalType,
    payload: &ProposalPayload,
) -> TreasuryResult<String> {
    let material = serde_json::json!({
        "id": proposal_id,
        "type": proposal_type.name(),
        "payload": payload,
    });
    let bytes =
        serde_json::to_vec(&material).map_err(|e| TreasuryError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// `at + secs`, refusing offsets that leave chrono's range.
pub(crate) fn after(at: DateTime<Utc>, secs: i64) -> TreasuryResult<DateTime<Utc>> {
    Duration::try_seconds(secs)
        .and_then(|delta| at.checked_add_signed(delta))
        .ok_or_else(|| {
            TreasuryError::InvalidInput(format!("{}s past {} is out of range", secs, at))
        })
}

fn past_window(proposal: &GovernanceProposal, now: DateTime<Utc>) -> bool {
    proposal
        .execution_deadline
        .is_some_and(|deadline| now > deadline)
}

fn expired_rejection() -> Rejection {
    Rejection::new(
        ErrorKind::ProposalExpired,
        "execution window closed before execution",
    )
}

/// Close a finished vote, then approve if the signature threshold is met
/// and any required vote has passed.
fn settle(
    proposal: &mut GovernanceProposal,
    config: &GovernanceConfig,
    eligible_voters: usize,
    now: DateTime<Utc>,
) -> TreasuryResult<()> {
    let vote_over = proposal.voting_ends_at.is_some_and(|ends| now > ends);
    if proposal.status == ProposalStatus::Voting && proposal.vote_passed.is_none() && vote_over {
        let tally = proposal.tally();
        let quorum = u128::from(tally.turnout()) * u128::from(BASIS_POINTS)
            >= u128::from(config.quorum_bps) * eligible_voters as u128;
        let passed = quorum && tally.yes > tally.no;
        proposal.vote_passed = Some(passed);
        proposal.updated_at = now;
        if !passed {
            proposal.transition(ProposalStatus::Rejected, now)?;
            proposal.resolution = Some(Rejection::new(
                ErrorKind::Rejected,
                format!(
                    "vote failed: {} yes, {} no, {} abstain of {} eligible",
                    tally.yes, tally.no, tally.abstain, eligible_voters
                ),
            ));
            return Ok(());
        }
    }

    let vote_ok = !proposal.proposal_type.requires_voting() || proposal.vote_passed == Some(true);
    if proposal.status.is_open() && proposal.threshold_reached() && vote_ok {
        proposal.transition(ProposalStatus::Approved, now)?;
        proposal.approved_at = Some(now);
        proposal.execution_deadline = Some(after(now, config.execution_window_secs)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;
    use crate::governance::roster::{sign_digest, Signer};
    use crate::testing::{pool, signing_key, t0, BASE};
    use ed25519_dalek::SigningKey;
    use treasury_store::{InMemoryTreasuryStorage, PoolStore};
    use treasury_types::{Balance, Coin, Denom, PoolCategory};

    struct Fixture {
        gate: GovernanceGate,
        events: Arc<MemoryEventSink>,
        keys: Vec<(String, SigningKey)>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryTreasuryStorage::new());
        let mut treasury = pool("treasury", PoolCategory::Reserve, 5_000, 5_000_000 * BASE);
        treasury.access.authorized_roles = vec![Role::TreasuryManager, Role::BoardMember];
        store.commit_pools(vec![treasury]).await.unwrap();

        let mut keys = Vec::new();
        let mut roster = SignerRoster::new();
        for (i, role) in [
            Role::TreasuryManager,
            Role::TreasuryManager,
            Role::BoardMember,
            Role::BoardMember,
            Role::BoardMember,
            Role::TechnicalLead,
        ]
        .into_iter()
        .enumerate()
        {
            let id = format!("signer-{i}");
            let key = signing_key(i as u8 + 1);
            roster.insert(Signer::new(&id, vec![role], &key.verifying_key()));
            keys.push((id, key));
        }
        roster.insert(Signer::new(
            "pool-manager",
            vec![Role::PoolManager],
            &signing_key(42).verifying_key(),
        ));

        let events = Arc::new(MemoryEventSink::new());
        let gate = GovernanceGate::new(GovernanceConfig::default(), store, roster, events.clone());
        Fixture { gate, events, keys }
    }

    #[tokio::test]
    async fn roster_changes_keep_every_reachable_floor() {
        let f = fixture().await;
        let newcomer = signing_key(77);
        f.gate
            .add_signer(Signer::new("signer-new", vec![Role::FinancialOfficer], &newcomer.verifying_key()))
            .unwrap();
        f.gate.ensure_authorized("signer-new", ProposalType::Rebalance).unwrap();

        f.gate.remove_signer("signer-5").unwrap();
        f.gate.remove_signer("signer-4").unwrap();
        // Four left for PARAMETER_CHANGE and POOL_CREATION: the floor.
        assert!(matches!(
            f.gate.remove_signer("signer-3"),
            Err(TreasuryError::InvariantViolation(_))
        ));
        assert!(f.gate.roster().unwrap().get("signer-3").is_some());
        assert!(matches!(f.gate.remove_signer("ghost"), Err(TreasuryError::NotFound(_))));

        assert!(matches!(
            f.gate.ensure_authorized("signer-5", ProposalType::ParameterChange),
            Err(TreasuryError::Unauthorized(_))
        ));
        // Two treasury managers and the new financial officer: exactly the
        // REBALANCE floor.
        assert!(matches!(
            f.gate.remove_signer("signer-new"),
            Err(TreasuryError::InvariantViolation(_))
        ));
    }

    fn withdrawal(amount: Amount) -> ProposalDraft {
        ProposalDraft {
            proposal_type: ProposalType::Withdrawal,
            proposer: "signer-0".to_string(),
            title: "grant payout".to_string(),
            payload: ProposalPayload::Withdrawal {
                pool_id: PoolId::from("treasury"),
                recipient: "grantee".to_string(),
                amount: Balance::single(Coin::new(Denom::base(), amount)),
            },
            pool_id: Some(PoolId::from("treasury")),
            amount_value: amount,
            pool_value: Some(u128::from(5_000_000 * BASE)),
            pool_required_signatures: 2,
        }
    }

    impl Fixture {
        async fn sign_as(
            &self,
            idx: usize,
            proposal: &GovernanceProposal,
            at: DateTime<Utc>,
        ) -> TreasuryResult<GovernanceProposal> {
            let (id, key) = &self.keys[idx];
            self.gate
                .sign(&proposal.id, id, &sign_digest(key, &proposal.digest), at)
                .await
        }
    }

    #[tokio::test]
    async fn withdrawal_over_100k_needs_four_distinct_signatures() {
        let f = fixture().await;
        let proposal = f.gate.submit(withdrawal(500_000 * BASE), t0()).await.unwrap();
        assert_eq!(proposal.status, ProposalStatus::Pending);
        assert_eq!(proposal.required_signatures, 4);

        f.sign_as(0, &proposal, t0()).await.unwrap();
        f.sign_as(1, &proposal, t0()).await.unwrap();
        let third = f.sign_as(2, &proposal, t0()).await.unwrap();
        assert_eq!(third.status, ProposalStatus::Pending);
        assert_eq!(third.signature_count(), 3);

        let dup = f.sign_as(2, &proposal, t0()).await.unwrap_err();
        assert!(matches!(dup, TreasuryError::DuplicateSignature(_)));
        assert_eq!(f.gate.get(&proposal.id).await.unwrap().signature_count(), 3);

        let fourth = f.sign_as(3, &proposal, t0()).await.unwrap();
        assert_eq!(fourth.status, ProposalStatus::Approved);
        assert_eq!(
            fourth.execution_deadline,
            Some(t0() + Duration::hours(48))
        );

        let transitions: Vec<_> = f
            .events
            .events()
            .into_iter()
            .filter_map(|e| match e {
                TreasuryEvent::ProposalTransition(t) => Some((t.from_status, t.to_status)),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                (None, ProposalStatus::Pending),
                (Some(ProposalStatus::Pending), ProposalStatus::Approved)
            ]
        );
    }

    #[tokio::test]
    async fn unauthorized_and_forged_signatures_change_nothing() {
        let f = fixture().await;
        let proposal = f.gate.submit(withdrawal(5 * BASE), t0()).await.unwrap();

        // Technical leads cannot sign withdrawals.
        let err = f.sign_as(5, &proposal, t0()).await.unwrap_err();
        assert!(matches!(err, TreasuryError::Unauthorized(_)));

        // Pool-level roles narrow withdrawal signers further.
        let pm_sig = sign_digest(&signing_key(42), &proposal.digest);
        let err = f
            .gate
            .sign(&proposal.id, "pool-manager", &pm_sig, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, TreasuryError::Unauthorized(_)));

        let forged = sign_digest(&f.keys[1].1, &proposal.digest);
        let err = f
            .gate
            .sign(&proposal.id, "signer-0", &forged, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, TreasuryError::InvalidSignature(_)));
        assert_eq!(f.gate.get(&proposal.id).await.unwrap().signature_count(), 0);
    }

    #[tokio::test]
    async fn approval_expires_after_window_and_blocks_execution() {
        let f = fixture().await;
        let proposal = f.gate.submit(withdrawal(5 * BASE), t0()).await.unwrap();
        f.sign_as(0, &proposal, t0()).await.unwrap();
        let approved = f.sign_as(2, &proposal, t0()).await.unwrap();
        assert_eq!(approved.status, ProposalStatus::Approved);

        let late = t0() + Duration::hours(49);
        let err = f.gate.begin_execution(&proposal.id, late).await.unwrap_err();
        assert!(matches!(err, TreasuryError::ProposalExpired(_)));
        let stored = f.gate.get(&proposal.id).await.unwrap();
        assert_eq!(stored.status, ProposalStatus::Expired);
        assert!(f.gate.mark_executed(&proposal.id, late).await.is_err());
    }

    #[tokio::test]
    async fn sweep_rejects_stale_and_expires_unused_approvals() {
        let f = fixture().await;
        let stale = f.gate.submit(withdrawal(5 * BASE), t0()).await.unwrap();
        let approved = f.gate.submit(withdrawal(6 * BASE), t0()).await.unwrap();
        f.sign_as(0, &approved, t0()).await.unwrap();
        f.sign_as(2, &approved, t0()).await.unwrap();

        let changed = f.gate.sweep(t0() + Duration::days(8)).await.unwrap();
        assert_eq!(changed.len(), 2);
        assert_eq!(f.gate.get(&stale.id).await.unwrap().status, ProposalStatus::Rejected);
        assert_eq!(
            f.gate.get(&approved.id).await.unwrap().status,
            ProposalStatus::Expired
        );
        assert!(f.gate.sweep(t0() + Duration::days(9)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn parameter_change_needs_a_passed_vote_before_approval() {
        let f = fixture().await;
        let draft = ProposalDraft {
            proposal_type: ProposalType::ParameterChange,
            proposer: "signer-5".to_string(),
            title: "raise dust floor".to_string(),
            payload: ProposalPayload::ParameterChange {
                parameter: "/planner/min_transfer".to_string(),
                value: serde_json::json!(10),
            },
            pool_id: None,
            amount_value: 0,
            pool_value: None,
            pool_required_signatures: 0,
        };
        let proposal = f.gate.submit(draft, t0()).await.unwrap();
        assert_eq!(proposal.status, ProposalStatus::Voting);
        assert_eq!(proposal.required_signatures, 5);

        for idx in 0..5 {
            let signed = f.sign_as(idx, &proposal, t0()).await.unwrap();
            assert_eq!(signed.status, ProposalStatus::Voting);
        }
        for voter in ["signer-0", "signer-2", "signer-3", "signer-5"] {
            f.gate.vote(&proposal.id, voter, VoteChoice::Yes, t0()).await.unwrap();
        }
        let err = f
            .gate
            .vote(&proposal.id, "signer-0", VoteChoice::No, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, TreasuryError::DuplicateVote(_)));

        let after_vote = t0() + Duration::days(3) + Duration::seconds(1);
        let changed = f.gate.sweep(after_vote).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, ProposalStatus::Approved);
        assert_eq!(changed[0].vote_passed, Some(true));
    }

    #[tokio::test]
    async fn failed_vote_rejects() {
        let f = fixture().await;
        let draft = ProposalDraft {
            proposal_type: ProposalType::ParameterChange,
            proposer: "signer-5".to_string(),
            title: "drop quorum".to_string(),
            payload: ProposalPayload::ParameterChange {
                parameter: "/governance/quorum_bps".to_string(),
                value: serde_json::json!(0),
            },
            pool_id: None,
            amount_value: 0,
            pool_value: None,
            pool_required_signatures: 0,
        };
        let proposal = f.gate.submit(draft, t0()).await.unwrap();
        f.gate.vote(&proposal.id, "signer-0", VoteChoice::No, t0()).await.unwrap();

        let after_vote = t0() + Duration::days(4);
        f.gate.sweep(after_vote).await.unwrap();
        let stored = f.gate.get(&proposal.id).await.unwrap();
        assert_eq!(stored.status, ProposalStatus::Rejected);
        assert_eq!(stored.resolution.unwrap().kind, ErrorKind::Rejected);
    }

    #[tokio::test]
    async fn cancel_is_reserved_to_the_proposer() {
        let f = fixture().await;
        let proposal = f.gate.submit(withdrawal(5 * BASE), t0()).await.unwrap();
        assert!(matches!(
            f.gate.cancel(&proposal.id, "signer-1", t0()).await,
            Err(TreasuryError::Unauthorized(_))
        ));
        let cancelled = f.gate.cancel(&proposal.id, "signer-0", t0()).await.unwrap();
        assert_eq!(cancelled.status, ProposalStatus::Cancelled);
        assert!(f.sign_as(1, &proposal, t0()).await.is_err());
    }

    #[test]
    fn deadlines_out_of_chrono_range_are_errors() {
        assert_eq!(after(t0(), 3600).unwrap(), t0() + Duration::hours(1));
        assert!(matches!(
            after(t0(), 1_000_000_000_000_000),
            Err(TreasuryError::InvalidInput(_))
        ));
        assert!(after(t0(), i64::MAX).is_err());
    }
}
