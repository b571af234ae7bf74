#![deny(unsafe_code)]

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::info;
use treasury_core::{
    default_pools, CycleReport, InMemoryLedger, PerformanceReport, Price, Signer, SignerRoster,
    StaticPriceFeed, TracingEventSink, TreasuryConfig, TreasuryEngine, WithdrawalOutcome,
};
use treasury_store::postgres::PostgresTreasuryStorage;
use treasury_store::{
    InMemoryTreasuryStorage, PoolStore, ProposalFilter, QueryWindow, StorageError,
    TreasuryStorage,
};
use treasury_types::{
    Balance, BalanceSnapshot, Denom, ErrorKind, GovernanceProposal, Pool, PoolId, ProposalStatus,
    ProposalType, RebalancePlan, Role, TransactionRecord, TreasuryError, VoteChoice,
};

#[derive(Debug, Clone)]
pub enum StorageConfig {
    Memory,
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    fn backend(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// Contents of the optional JSON bootstrap file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BootstrapFile {
    pub config: TreasuryConfig,
    pub signers: Vec<Signer>,
    /// Genesis pools for an empty store. The standard set when absent.
    pub pools: Option<Vec<Pool>>,
    /// Prices of non-base denominations in base minor units.
    pub prices: BTreeMap<Denom, Price>,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
    pub bootstrap: BootstrapFile,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Memory,
            bootstrap: BootstrapFile::default(),
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<TreasuryEngine>,
    /// Process-local ledger mirroring pool accounts.
    pub ledger: Arc<InMemoryLedger>,
    pub storage_backend: &'static str,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig { storage, bootstrap } = config;
        let storage_backend = storage.backend();
        let store: Arc<dyn TreasuryStorage> = match storage {
            StorageConfig::Memory => Arc::new(InMemoryTreasuryStorage::new()),
            StorageConfig::Postgres {
                database_url,
                max_connections,
            } => Arc::new(
                PostgresTreasuryStorage::connect_with_options(&database_url, max_connections, 5)
                    .await?,
            ),
        };

        let existing = store.list_pools().await?;
        let ledger = Arc::new(InMemoryLedger::from_pools(&existing)?);

        let mut prices = StaticPriceFeed::new(bootstrap.config.base_denom.clone());
        for (denom, price) in bootstrap.prices {
            prices = prices.with_price(denom, price);
        }

        let engine = TreasuryEngine::new(
            bootstrap.config,
            store,
            ledger.clone(),
            Arc::new(prices),
            Arc::new(TracingEventSink),
            SignerRoster::from_signers(bootstrap.signers),
        )?;

        if existing.is_empty() {
            let pools = bootstrap
                .pools
                .unwrap_or_else(|| default_pools(Utc::now()));
            for pool in &pools {
                for coin in pool.balance.coins() {
                    ledger.credit(pool.id.as_str(), &coin)?;
                }
            }
            engine.initialize(pools).await?;
            info!("treasury initialized with genesis pools");
        }

        Ok(Self {
            engine: Arc::new(engine),
            ledger,
            storage_backend,
        })
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/pools", get(list_pools))
        .route("/v1/pools/:pool_id", get(get_pool))
        .route("/v1/pools/:pool_id/history", get(pool_history))
        .route("/v1/pools/:pool_id/deposit", post(deposit))
        .route("/v1/pools/:pool_id/withdraw", post(withdraw))
        .route("/v1/revenue", post(distribute_revenue))
        .route("/v1/cycle", post(run_cycle))
        .route("/v1/plans", get(list_plans).post(submit_plan))
        .route("/v1/plans/:plan_id", get(get_plan))
        .route("/v1/plans/:plan_id/execute", post(execute_plan))
        .route("/v1/plans/:plan_id/cancel", post(cancel_plan))
        .route("/v1/proposals", get(list_proposals).post(submit_proposal))
        .route("/v1/proposals/:proposal_id", get(get_proposal))
        .route("/v1/proposals/:proposal_id/sign", post(sign_proposal))
        .route("/v1/proposals/:proposal_id/vote", post(vote_proposal))
        .route("/v1/proposals/:proposal_id/reject", post(reject_proposal))
        .route("/v1/proposals/:proposal_id/cancel", post(cancel_proposal))
        .route("/v1/proposals/:proposal_id/execute", post(execute_proposal))
        .route("/v1/signers", get(list_signers))
        .route("/v1/transactions", get(list_transactions))
        .route("/v1/reports/performance", get(performance_report))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core engine error: {0}")]
    Core(#[from] TreasuryError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] TreasuryError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
        ErrorKind::InvalidInput | ErrorKind::InvalidSignature | ErrorKind::Serialization => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::InvalidTransition
        | ErrorKind::DuplicateSignature
        | ErrorKind::DuplicateVote
        | ErrorKind::ProposalExpired
        | ErrorKind::Rejected
        | ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::InvariantViolation
        | ErrorKind::PrerequisiteNotMet
        | ErrorKind::DegenerateState => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Ledger => StatusCode::BAD_GATEWAY,
        ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Core(err) => {
                let kind = err.kind();
                (
                    status_for(kind),
                    Json(serde_json::json!({ "error": err.reason(), "kind": kind })),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PageQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

impl PageQuery {
    fn window(&self) -> QueryWindow {
        QueryWindow::new(self.limit.unwrap_or(100).min(1000), self.offset.unwrap_or(0))
    }
}

#[derive(Debug, Clone, Serialize)]
struct Page<T> {
    returned: usize,
    items: Vec<T>,
}

impl<T> From<Vec<T>> for Page<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            returned: items.len(),
            items,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage: &'static str,
    pools: usize,
}

async fn health(State(state): State<ServiceState>) -> Result<Json<HealthResponse>, ApiError> {
    let pools = state.engine.registry().list().await?.len();
    Ok(Json(HealthResponse {
        status: "ok",
        service: "treasury-service",
        storage: state.storage_backend,
        pools,
    }))
}

async fn list_pools(State(state): State<ServiceState>) -> Result<Json<Page<Pool>>, ApiError> {
    Ok(Json(state.engine.queries()?.list_pools().await?.into()))
}

async fn get_pool(
    Path(pool_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Pool>, ApiError> {
    Ok(Json(
        state.engine.queries()?.get_pool(&PoolId::new(pool_id)).await?,
    ))
}

async fn pool_history(
    Path(pool_id): Path<String>,
    State(state): State<ServiceState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<BalanceSnapshot>>, ApiError> {
    let history = state
        .engine
        .queries()?
        .balance_history(&PoolId::new(pool_id), page.window())
        .await?;
    Ok(Json(history.into()))
}

#[derive(Debug, Clone, Deserialize)]
struct DepositRequest {
    amount: Balance,
    source: String,
    reference: Option<String>,
}

async fn deposit(
    Path(pool_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<DepositRequest>,
) -> Result<Json<TransactionRecord>, ApiError> {
    let record = state
        .engine
        .deposit(
            &PoolId::new(pool_id),
            request.amount,
            &request.source,
            request.reference,
            Utc::now(),
        )
        .await?;
    Ok(Json(record))
}

#[derive(Debug, Clone, Deserialize)]
struct WithdrawRequest {
    recipient: String,
    amount: Balance,
    proposer: String,
}

async fn withdraw(
    Path(pool_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<WithdrawRequest>,
) -> Result<Json<WithdrawalOutcome>, ApiError> {
    let outcome = state
        .engine
        .withdraw(
            &PoolId::new(pool_id),
            &request.recipient,
            request.amount,
            &request.proposer,
            Utc::now(),
        )
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Clone, Deserialize)]
struct RevenueRequest {
    amount: Balance,
    source: String,
}

async fn distribute_revenue(
    State(state): State<ServiceState>,
    Json(request): Json<RevenueRequest>,
) -> Result<Json<Page<TransactionRecord>>, ApiError> {
    let records = state
        .engine
        .distribute_revenue(request.amount, &request.source, Utc::now())
        .await?;
    Ok(Json(records.into()))
}

async fn run_cycle(State(state): State<ServiceState>) -> Result<Json<CycleReport>, ApiError> {
    Ok(Json(state.engine.run_cycle(Utc::now()).await?))
}

async fn list_plans(
    State(state): State<ServiceState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<RebalancePlan>>, ApiError> {
    Ok(Json(
        state.engine.queries()?.list_plans(page.window()).await?.into(),
    ))
}

async fn get_plan(
    Path(plan_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<RebalancePlan>, ApiError> {
    Ok(Json(state.engine.queries()?.get_plan(&plan_id).await?))
}

async fn submit_plan(
    State(state): State<ServiceState>,
    Json(plan): Json<RebalancePlan>,
) -> Result<Json<RebalancePlan>, ApiError> {
    Ok(Json(state.engine.submit_plan(plan, Utc::now()).await?))
}

async fn execute_plan(
    Path(plan_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<RebalancePlan>, ApiError> {
    Ok(Json(state.engine.execute_plan(&plan_id, Utc::now()).await?))
}

async fn cancel_plan(
    Path(plan_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<RebalancePlan>, ApiError> {
    Ok(Json(state.engine.cancel_plan(&plan_id, Utc::now()).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct ProposalsQuery {
    status: Option<String>,
    #[serde(rename = "type")]
    proposal_type: Option<String>,
    proposer: Option<String>,
    pool_id: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl ProposalsQuery {
    fn filter(&self) -> Result<ProposalFilter, ApiError> {
        let status = match self.status.as_deref() {
            None => None,
            Some(value) => Some(ProposalStatus::parse(value).ok_or_else(|| {
                ApiError::bad_request(format!("invalid proposal status '{}'", value))
            })?),
        };
        let proposal_type = match self.proposal_type.as_deref() {
            None => None,
            Some(value) => Some(ProposalType::parse(value).ok_or_else(|| {
                ApiError::bad_request(format!("invalid proposal type '{}'", value))
            })?),
        };
        Ok(ProposalFilter {
            status,
            proposal_type,
            proposer: self.proposer.clone(),
            pool_id: self.pool_id.clone().map(PoolId::new),
        })
    }
}

async fn list_proposals(
    State(state): State<ServiceState>,
    Query(query): Query<ProposalsQuery>,
) -> Result<Json<Page<GovernanceProposal>>, ApiError> {
    let filter = query.filter()?;
    let window = PageQuery {
        limit: query.limit,
        offset: query.offset,
    }
    .window();
    Ok(Json(
        state.engine.queries()?.proposals(&filter, window).await?.into(),
    ))
}

async fn get_proposal(
    Path(proposal_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<GovernanceProposal>, ApiError> {
    Ok(Json(
        state.engine.queries()?.get_proposal(&proposal_id).await?,
    ))
}

/// Proposals opened directly. Plan actions and withdrawals open theirs
/// through execution and the withdraw endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ProposalRequest {
    ParameterChange {
        proposer: String,
        parameter: String,
        value: serde_json::Value,
    },
    PoolCreation {
        proposer: String,
        pool: Box<Pool>,
    },
    PoolModification {
        proposer: String,
        pool: Box<Pool>,
    },
    SignerAddition {
        proposer: String,
        signer_id: String,
        roles: Vec<Role>,
        /// Hex Ed25519 verifying key.
        public_key: String,
    },
    SignerRemoval {
        proposer: String,
        signer_id: String,
    },
}

async fn submit_proposal(
    State(state): State<ServiceState>,
    Json(request): Json<ProposalRequest>,
) -> Result<Json<GovernanceProposal>, ApiError> {
    let now = Utc::now();
    let proposal = match request {
        ProposalRequest::ParameterChange {
            proposer,
            parameter,
            value,
        } => {
            state
                .engine
                .propose_parameter_change(&proposer, &parameter, value, now)
                .await?
        }
        ProposalRequest::PoolCreation { proposer, pool } => {
            state
                .engine
                .propose_pool_creation(&proposer, *pool, now)
                .await?
        }
        ProposalRequest::PoolModification { proposer, pool } => {
            state
                .engine
                .propose_pool_modification(&proposer, *pool, now)
                .await?
        }
        ProposalRequest::SignerAddition {
            proposer,
            signer_id,
            roles,
            public_key,
        } => {
            state
                .engine
                .propose_signer_addition(&proposer, &signer_id, roles, &public_key, now)
                .await?
        }
        ProposalRequest::SignerRemoval {
            proposer,
            signer_id,
        } => {
            state
                .engine
                .propose_signer_removal(&proposer, &signer_id, now)
                .await?
        }
    };
    Ok(Json(proposal))
}

async fn list_signers(State(state): State<ServiceState>) -> Result<Json<Vec<Signer>>, ApiError> {
    let roster = state.engine.gate().roster()?;
    Ok(Json(roster.signers().cloned().collect()))
}

#[derive(Debug, Clone, Deserialize)]
struct SignRequest {
    signer: String,
    /// Hex Ed25519 signature over the proposal digest.
    signature: String,
}

async fn sign_proposal(
    Path(proposal_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<SignRequest>,
) -> Result<Json<GovernanceProposal>, ApiError> {
    let proposal = state
        .engine
        .sign_proposal(&proposal_id, &request.signer, &request.signature, Utc::now())
        .await?;
    Ok(Json(proposal))
}

#[derive(Debug, Clone, Deserialize)]
struct VoteRequest {
    voter: String,
    choice: VoteChoice,
}

async fn vote_proposal(
    Path(proposal_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<VoteRequest>,
) -> Result<Json<GovernanceProposal>, ApiError> {
    let proposal = state
        .engine
        .vote(&proposal_id, &request.voter, request.choice, Utc::now())
        .await?;
    Ok(Json(proposal))
}

#[derive(Debug, Clone, Deserialize)]
struct RejectRequest {
    signer: String,
    reason: String,
}

async fn reject_proposal(
    Path(proposal_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<RejectRequest>,
) -> Result<Json<GovernanceProposal>, ApiError> {
    let proposal = state
        .engine
        .reject_proposal(&proposal_id, &request.signer, &request.reason, Utc::now())
        .await?;
    Ok(Json(proposal))
}

#[derive(Debug, Clone, Deserialize)]
struct ActorRequest {
    actor: String,
}

async fn cancel_proposal(
    Path(proposal_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<ActorRequest>,
) -> Result<Json<GovernanceProposal>, ApiError> {
    let proposal = state
        .engine
        .cancel_proposal(&proposal_id, &request.actor, Utc::now())
        .await?;
    Ok(Json(proposal))
}

async fn execute_proposal(
    Path(proposal_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<ActorRequest>,
) -> Result<Json<GovernanceProposal>, ApiError> {
    let proposal = state
        .engine
        .execute_proposal(&proposal_id, &request.actor, Utc::now())
        .await?;
    Ok(Json(proposal))
}

async fn list_transactions(
    State(state): State<ServiceState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Page<TransactionRecord>>, ApiError> {
    Ok(Json(
        state
            .engine
            .queries()?
            .transactions(page.window())
            .await?
            .into(),
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct ReportQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

async fn performance_report(
    State(state): State<ServiceState>,
    Query(query): Query<ReportQuery>,
) -> Result<Json<PerformanceReport>, ApiError> {
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or(to - Duration::days(30));
    Ok(Json(
        state.engine.queries()?.performance_report(from, to).await?,
    ))
}
