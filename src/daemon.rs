//! Loopback HTTP front-end for the suggestion pipeline.
//!
//! Keeps the provider (and its pooled connections) resident between hotkey
//! presses. Each pipeline call runs in its own task so a client hanging up
//! mid-request does not cancel the audit write.

use crate::audit::{AuditEntry, AuditLog, AuditStats};
use crate::config::Config;
use crate::context::ContextCollector;
use crate::http_client::ReqwestHttpClient;
use crate::orchestrator::{
    ExecutionReport, Orchestrator, OrchestratorError, OrchestratorSettings, RequestOrigin,
};
use crate::provider::{self, CandidateCommand};
use crate::safety::RiskTier;
use anyhow::{bail, Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

const STATUS_CHECK_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_RECENT_LIMIT: usize = 20;
const MAX_RECENT_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct SuggestRequest {
    pub goal: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub shell: Option<String>,
}

/// `/suggest` reply. A blocked suggestion never carries `command`; the
/// refused text is only echoed back as `rejected_command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestResponse {
    pub command: Option<String>,
    pub risk_tier: RiskTier,
    pub risk_score: f32,
    pub blocked: bool,
    pub hardened: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_command: Option<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl From<CandidateCommand> for SuggestResponse {
    fn from(candidate: CandidateCommand) -> Self {
        let (command, rejected_command) = if candidate.blocked {
            (None, Some(candidate.text))
        } else {
            (Some(candidate.text), None)
        };
        Self {
            command,
            risk_tier: candidate.risk_tier,
            risk_score: candidate.risk_score,
            blocked: candidate.blocked,
            hardened: candidate.hardened,
            reason: candidate.block_reason,
            rejected_command,
            notes: candidate.notes,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExplainRequest {
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplainResponse {
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub provider_kind: String,
    pub provider_name: String,
    pub provider_reachable: bool,
    pub audit_log_path: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

/// Error body shared by every endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error_kind: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, error_kind: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error_kind: error_kind.to_string(),
                message: message.into(),
            },
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }

    fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }
}

/// HTTP status for an orchestrator failure.
pub fn status_for(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::EmptyGoal
        | OrchestratorError::GoalTooLong { .. }
        | OrchestratorError::EmptyCommand => StatusCode::BAD_REQUEST,
        OrchestratorError::ProviderRateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        OrchestratorError::ProviderAuthFailure(_)
        | OrchestratorError::ProviderMalformedResponse(_) => StatusCode::BAD_GATEWAY,
        OrchestratorError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::ProviderTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self::new(status_for(&err), err.kind(), err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::invalid_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::invalid_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Everything the handlers share. Built once at startup, read-only after.
pub struct DaemonState {
    orchestrator: Arc<Orchestrator>,
    provider_kind: String,
    limiter: Arc<Semaphore>,
    request_timeout: Duration,
    started: Instant,
}

impl DaemonState {
    pub fn new(
        orchestrator: Orchestrator,
        provider_kind: impl Into<String>,
        request_timeout: Duration,
        max_concurrent_requests: usize,
    ) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            provider_kind: provider_kind.into(),
            limiter: Arc::new(Semaphore::new(max_concurrent_requests.max(1))),
            request_timeout,
            started: Instant::now(),
        }
    }

    /// Wires the production pipeline described by `config`.
    pub fn from_config(config: &Config) -> Self {
        let provider_config = config.provider_config();
        let http = Arc::new(ReqwestHttpClient::new());
        let provider = provider::from_config(&provider_config, config.use_mock, http);
        let audit = Arc::new(AuditLog::new(config.audit_log_path()));
        let orchestrator = Orchestrator::new(
            provider,
            ContextCollector::new(),
            audit,
            OrchestratorSettings::from_config(config),
        );
        let provider_kind = if config.use_mock { "mock" } else { provider_config.kind.as_str() };
        Self::new(
            orchestrator,
            provider_kind,
            config.request_timeout(),
            config.daemon.max_concurrent_requests,
        )
    }

    fn audit(&self) -> &Arc<AuditLog> {
        self.orchestrator.audit()
    }

    /// Runs `job` on its own task under the concurrency limit and the
    /// request deadline. The task owns its place in the queue: on expiry it
    /// keeps waiting for a slot, runs, and writes its audit entry.
    async fn run<T, F, Fut>(&self, job: F) -> Result<T, ApiError>
    where
        F: FnOnce(Arc<Orchestrator>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, OrchestratorError>> + Send + 'static,
        T: Send + 'static,
    {
        let limiter = Arc::clone(&self.limiter);
        let orchestrator = Arc::clone(&self.orchestrator);
        let handle = tokio::spawn(async move {
            let _permit = limiter
                .acquire_owned()
                .await
                .map_err(|_| OrchestratorError::Internal("daemon is shutting down".to_string()))?;
            job(orchestrator).await
        });

        match tokio::time::timeout(self.request_timeout, handle).await {
            Ok(Ok(result)) => result.map_err(ApiError::from),
            Ok(Err(e)) => {
                error!("Request task failed: {}", e);
                Err(ApiError::internal("request task failed"))
            }
            Err(_) => {
                warn!("Request exceeded {:?}", self.request_timeout);
                Err(OrchestratorError::ProviderTimeout(format!(
                    "request did not complete within {:?}",
                    self.request_timeout
                ))
                .into())
            }
        }
    }
}

pub fn router(state: Arc<DaemonState>) -> Router {
    Router::new()
        .route("/suggest", post(suggest))
        .route("/explain", post(explain))
        .route("/executed", post(executed))
        .route("/status", get(status))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/audit/recent", get(recent))
        .with_state(state)
}

async fn suggest(
    State(state): State<Arc<DaemonState>>,
    payload: Result<Json<SuggestRequest>, JsonRejection>,
) -> Result<Json<SuggestResponse>, ApiError> {
    let Json(request) = payload?;
    let origin = RequestOrigin {
        cwd: request.cwd,
        shell: request.shell,
    };
    let goal = request.goal;
    let candidate = state
        .run(move |orchestrator| async move { orchestrator.suggest_in(&goal, &origin).await })
        .await?;
    Ok(Json(SuggestResponse::from(candidate)))
}

async fn explain(
    State(state): State<Arc<DaemonState>>,
    payload: Result<Json<ExplainRequest>, JsonRejection>,
) -> Result<Json<ExplainResponse>, ApiError> {
    let Json(request) = payload?;
    let command = request.command;
    let explanation = state
        .run(move |orchestrator| async move { orchestrator.explain(&command).await })
        .await?;
    Ok(Json(ExplainResponse { explanation }))
}

async fn executed(
    State(state): State<Arc<DaemonState>>,
    payload: Result<Json<ExecutionReport>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(report) = payload?;
    state.orchestrator.record_execution(&report)?;
    Ok(Json(serde_json::json!({"recorded": true})))
}

async fn status(State(state): State<Arc<DaemonState>>) -> Json<StatusResponse> {
    let provider = state.orchestrator.provider();
    let reachable = provider.is_reachable(STATUS_CHECK_TIMEOUT).await;
    Json(StatusResponse {
        provider_kind: state.provider_kind.clone(),
        provider_name: provider.name().to_string(),
        provider_reachable: reachable,
        audit_log_path: state.audit().path().display().to_string(),
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

async fn health(State(state): State<Arc<DaemonState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "provider": state.orchestrator.provider().name(),
    }))
}

async fn stats(State(state): State<Arc<DaemonState>>) -> Result<Json<AuditStats>, ApiError> {
    state
        .audit()
        .stats()
        .map(Json)
        .map_err(|e| ApiError::internal(e.to_string()))
}

async fn recent(
    State(state): State<Arc<DaemonState>>,
    query: Result<Query<RecentQuery>, QueryRejection>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    let Query(query) = query?;
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT).min(MAX_RECENT_LIMIT);
    state
        .audit()
        .recent(limit)
        .map(Json)
        .map_err(|e| ApiError::internal(e.to_string()))
}

/// Serves on `listener` until `shutdown` resolves. Refuses non-loopback
/// listeners.
pub async fn serve_on<S>(listener: TcpListener, state: Arc<DaemonState>, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("Listener has no local address")?;
    if !addr.ip().is_loopback() {
        bail!("Refusing to serve on non-loopback address {}", addr);
    }

    info!("aishelld listening on http://{}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Daemon server error")?;
    info!("aishelld stopped");
    Ok(())
}

/// Binds the configured address and serves until Ctrl-C or SIGTERM.
pub async fn serve(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let state = Arc::new(DaemonState::from_config(&config));
    info!(
        "Provider {} ({}), audit log {}",
        state.orchestrator.provider().name(),
        state.provider_kind,
        state.audit().path().display()
    );

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    serve_on(listener, state, shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, finishing in-flight requests");
}
