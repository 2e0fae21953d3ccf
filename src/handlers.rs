// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! HTTP handlers for the counter ledger service.
//!
//! Public routes record hits and create counters; admin routes require a
//! bearer session token obtained from `/admin/login`.

use crate::auth::{verify_password, SessionStore};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{LedgerError, Result as LedgerResult};
use crate::ledger::{HitOutcome, Ledger};
use crate::limiter::{LockoutLimiter, WindowDecision, WindowLimiter};
use crate::metrics::{self, Metrics};
use crate::models::{Counter, CounterPage, CounterPatch, CounterView, ListQuery, NewCounter};
use crate::store::Store;
use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinError;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Limiter key for callers without a usable address.
const ANONYMOUS: &str = "anonymous";

/// Shared application state.
pub struct AppState {
    pub ledger: Ledger,
    pub creation_limiter: WindowLimiter,
    pub login_limiter: LockoutLimiter,
    pub sessions: SessionStore,
    pub metrics: Metrics,
    pub config: Config,
}

impl AppState {
    /// Wire the ledger, limiters and sessions around one clock.
    pub fn new(config: Config, store: Store, clock: Arc<dyn Clock>) -> prometheus::Result<Self> {
        Ok(Self {
            ledger: Ledger::new(store, clock.clone(), config.ledger.clone()),
            creation_limiter: WindowLimiter::new(config.creation_limit.clone(), clock.clone()),
            login_limiter: LockoutLimiter::new(config.login_limit.clone(), clock.clone()),
            sessions: SessionStore::new(
                std::time::Duration::from_secs(config.admin.session_ttl_secs),
                clock,
            ),
            metrics: Metrics::new()?,
            config,
        })
    }

    /// Periodic housekeeping: evict idle limiter entries and expired
    /// sessions, and apply hit retention.
    pub async fn sweep(&self) {
        let creation = self.creation_limiter.sweep().await;
        let login = self.login_limiter.sweep().await;
        let sessions = self.sessions.sweep().await;
        let ledger = self.ledger.clone();
        let purge = tokio::task::spawn_blocking(move || ledger.purge_expired_hits());
        let purged = match purge.await {
            Ok(Ok(purged)) => purged,
            Ok(Err(err)) => {
                error!(error = %err, "Hit retention purge failed");
                0
            }
            Err(err) => {
                error!(error = %err, "Hit retention purge task failed");
                0
            }
        };
        debug!(creation, login, sessions, purged, "Sweep complete");
    }
}

/// Run a ledger call on the blocking pool.
///
/// SQLite I/O and the store mutex must not stall a runtime worker.
async fn with_ledger<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Ledger) -> LedgerResult<T> + Send + 'static,
    T: Send + 'static,
{
    let ledger = state.ledger.clone();
    Ok(tokio::task::spawn_blocking(move || f(&ledger)).await??)
}

/// Build the service router.
pub fn router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/api/counters", post(create_counter))
        .route("/api/counters/:id", get(get_counter))
        .route("/api/counters/:id/hit", post(record_hit))
        .route("/admin/login", post(login))
        .route("/admin/logout", post(logout))
        .route("/admin/counters", get(list_counters).delete(delete_counters))
        .route(
            "/admin/counters/:id",
            patch(update_counter).delete(delete_counter),
        )
        .route("/admin/counters/:id/value", put(set_counter_value))
        .route("/admin/hits/purge", post(purge_hits));

    if state.config.metrics.enabled {
        router = router.route(&state.config.metrics.path, get(render_metrics));
    }

    // Counters are embedded on third-party pages
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    router
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

/// Failures surfaced to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Counter not found")]
    NotFound,

    #[error("Too many attempts, retry later")]
    RateLimited { retry_after_secs: u64 },

    #[error("Too many failed logins, temporarily locked")]
    Locked { retry_after_secs: u64 },

    #[error("Invalid or missing credentials")]
    Unauthorized,

    #[error("Admin login is not configured")]
    LoginDisabled,

    #[error("Background task failed: {0}")]
    Task(#[from] JoinError),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, Option<u64>) {
        match self {
            Self::Ledger(LedgerError::Validation(_)) => {
                (StatusCode::BAD_REQUEST, "invalid_input", None)
            }
            Self::Ledger(LedgerError::Storage(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "storage_failure", None)
            }
            Self::Ledger(LedgerError::IdSpaceExhausted(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "id_space_exhausted", None)
            }
            Self::NotFound => (StatusCode::NOT_FOUND, "not_found", None),
            Self::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                Some(*retry_after_secs),
            ),
            Self::Locked { retry_after_secs } => {
                (StatusCode::TOO_MANY_REQUESTS, "locked", Some(*retry_after_secs))
            }
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            Self::LoginDisabled => (StatusCode::NOT_FOUND, "login_disabled", None),
            Self::Task(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, retry_after_secs) = self.parts();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "Request failed");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code,
            retry_after_secs,
        });

        match retry_after_secs {
            Some(secs) => (status, [(header::RETRY_AFTER, secs.to_string())], body).into_response(),
            None => (status, body).into_response(),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

/// Hit response for the embed script.
#[derive(Debug, Serialize)]
pub struct HitResponse {
    pub value: u64,
    pub label: String,
    pub incremented: bool,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_in_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct SetValueRequest {
    pub value: i64,
}

#[derive(Debug, Deserialize)]
pub struct DeleteCountersQuery {
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PurgeRequest {
    pub older_than_days: u32,
}

#[derive(Debug, Serialize)]
pub struct AffectedResponse {
    pub affected: u64,
}

/// Resolve the caller's identity: the first `X-Forwarded-For` entry when
/// trusted, else the socket address. An unparseable forwarded address
/// (e.g. "unknown" from an anonymizing proxy) yields no identity.
pub fn client_identity(
    config: &Config,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> Option<String> {
    if config.trust_forwarded_for {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            let first = forwarded.split(',').next().unwrap_or_default().trim();
            return first.parse::<IpAddr>().ok().map(|ip| ip.to_string());
        }
    }

    peer.map(|addr| addr.ip().to_string())
}

fn peer_addr(connect: Option<ConnectInfo<SocketAddr>>) -> Option<SocketAddr> {
    connect.map(|ConnectInfo(addr)| addr)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    match bearer_token(headers) {
        Some(token) if state.sessions.validate(token).await => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "counter-ledger",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Create a counter, throttled per client IP.
pub async fn create_counter(
    State(state): State<Arc<AppState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(req): Json<NewCounter>,
) -> Result<(StatusCode, Json<Counter>), ApiError> {
    let identity = client_identity(&state.config, &headers, peer_addr(connect));
    let key = identity.as_deref().unwrap_or(ANONYMOUS);

    if let WindowDecision::Limited { retry_after_secs } =
        state.creation_limiter.check_and_record(key).await
    {
        state.metrics.record_rate_limited(metrics::LIMITER_CREATION);
        return Err(ApiError::RateLimited { retry_after_secs });
    }

    let counter = with_ledger(&state, move |ledger| ledger.create_counter(&req)).await?;
    state.metrics.record_counter_created();
    Ok((StatusCode::CREATED, Json(counter)))
}

/// Record a hit from the caller.
pub async fn record_hit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Json<HitResponse>, ApiError> {
    let identity = client_identity(&state.config, &headers, peer_addr(connect));

    let outcome =
        with_ledger(&state, move |ledger| ledger.record_hit(&id, identity.as_deref())).await?;
    match outcome {
        HitOutcome::Recorded {
            counter,
            incremented,
        } => {
            state.metrics.record_hit(if incremented {
                metrics::HIT_INCREMENTED
            } else {
                metrics::HIT_DEDUPLICATED
            });
            Ok(Json(HitResponse {
                value: counter.value,
                label: counter.label,
                incremented,
            }))
        }
        HitOutcome::CounterNotFound => {
            state.metrics.record_hit(metrics::HIT_NOT_FOUND);
            Err(ApiError::NotFound)
        }
    }
}

/// Counter with activity data.
pub async fn get_counter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CounterView>, ApiError> {
    with_ledger(&state, move |ledger| ledger.counter_view(&id))
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

/// Admin login guarded by the lockout limiter.
pub async fn login(
    State(state): State<Arc<AppState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let identity = client_identity(&state.config, &headers, peer_addr(connect));
    let key = identity.as_deref().unwrap_or(ANONYMOUS);

    let lock = state.login_limiter.check_blocked(key).await;
    if lock.blocked {
        info!(identity = key, retry_after_secs = lock.retry_after_secs, "Login attempt while locked");
        state.metrics.record_rate_limited(metrics::LIMITER_LOGIN);
        return Err(ApiError::Locked {
            retry_after_secs: lock.retry_after_secs,
        });
    }

    let Some(hash) = state.config.admin.password_hash.clone() else {
        return Err(ApiError::LoginDisabled);
    };

    // Argon2 verification is CPU-bound
    let verified =
        tokio::task::spawn_blocking(move || verify_password(&hash, &req.password)).await?;
    if verified {
        state.login_limiter.record_success(key).await;
        let token = state.sessions.issue().await;
        info!(identity = key, "Admin logged in");
        return Ok(Json(LoginResponse {
            token,
            expires_in_secs: state.config.admin.session_ttl_secs,
        }));
    }

    let lock = state.login_limiter.record_failure(key).await;
    warn!(identity = key, failures = lock.failures, "Admin login failed");
    if lock.blocked {
        state.metrics.record_rate_limited(metrics::LIMITER_LOGIN);
        return Err(ApiError::Locked {
            retry_after_secs: lock.retry_after_secs,
        });
    }
    Err(ApiError::Unauthorized)
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let token = bearer_token(&headers).ok_or(ApiError::Unauthorized)?;
    if state.sessions.revoke(token).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::Unauthorized)
    }
}

pub async fn list_counters(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<CounterPage>, ApiError> {
    require_admin(&state, &headers).await?;
    let page = with_ledger(&state, move |ledger| ledger.list_counters(&query)).await?;
    Ok(Json(page))
}

pub async fn update_counter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(patch): Json<CounterPatch>,
) -> Result<Json<Counter>, ApiError> {
    require_admin(&state, &headers).await?;
    with_ledger(&state, move |ledger| ledger.update_metadata(&id, &patch))
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

pub async fn set_counter_value(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SetValueRequest>,
) -> Result<StatusCode, ApiError> {
    require_admin(&state, &headers).await?;
    if with_ledger(&state, move |ledger| ledger.set_value(&id, req.value)).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

pub async fn delete_counter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    require_admin(&state, &headers).await?;
    if with_ledger(&state, move |ledger| ledger.delete_counter(&id)).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

/// Delete all counters, or only those of `?mode=`.
pub async fn delete_counters(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<DeleteCountersQuery>,
) -> Result<Json<AffectedResponse>, ApiError> {
    require_admin(&state, &headers).await?;
    let affected = with_ledger(&state, move |ledger| match query.mode.as_deref() {
        Some(mode) => ledger.delete_counters_by_mode(mode),
        None => ledger.delete_all_counters(),
    })
    .await?;
    Ok(Json(AffectedResponse { affected }))
}

pub async fn purge_hits(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PurgeRequest>,
) -> Result<Json<AffectedResponse>, ApiError> {
    require_admin(&state, &headers).await?;
    let days = req.older_than_days;
    let affected =
        with_ledger(&state, move |ledger| ledger.purge_hits_older_than(days)).await?;
    Ok(Json(AffectedResponse { affected }))
}

pub async fn render_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
