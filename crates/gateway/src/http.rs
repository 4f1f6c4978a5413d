use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use pik_auth::PasskeyEngine;
use pik_contracts::{EventRecord, SESSION_TOKEN_HEX_LEN};
use pik_ledger::{SourceRow, Store, StoreError};
use pik_progression::Tunables;
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::config::{GatewayConfig, RuntimeEnv, StartupError};
use crate::events::EventBus;
use crate::metrics;
use crate::rate_limit::RateLimiter;

mod auth;
mod config_api;
mod consent;
mod gear;
mod ingest;
mod loot;
mod sources;
mod stream;
mod users;

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    pub store: Store,
    pub bus: EventBus,
    pub passkeys: Arc<PasskeyEngine>,
    pub limiter: RateLimiter,
}

#[derive(Debug, Serialize)]
pub struct OkEnvelope<T: Serialize> {
    status: &'static str,
    data: T,
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    status: &'static str,
    message: String,
}

pub(crate) type ApiError = (StatusCode, Json<ErrorEnvelope>);
pub(crate) type ApiResult = Result<Json<OkEnvelope<serde_json::Value>>, ApiError>;

pub(crate) fn ok(data: serde_json::Value) -> Json<OkEnvelope<serde_json::Value>> {
    Json(OkEnvelope {
        status: "ok",
        data,
    })
}

pub(crate) fn json_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorEnvelope {
            status: "error",
            message: message.into(),
        }),
    )
}

pub(crate) fn bad_request(message: impl Into<String>) -> ApiError {
    json_error(StatusCode::BAD_REQUEST, message)
}

pub(crate) fn unauthorized(message: impl Into<String>) -> ApiError {
    json_error(StatusCode::UNAUTHORIZED, message)
}

pub(crate) fn forbidden(message: impl Into<String>) -> ApiError {
    json_error(StatusCode::FORBIDDEN, message)
}

pub(crate) fn not_found(message: impl Into<String>) -> ApiError {
    json_error(StatusCode::NOT_FOUND, message)
}

pub(crate) fn conflict(message: impl Into<String>) -> ApiError {
    json_error(StatusCode::CONFLICT, message)
}

pub(crate) fn internal_error() -> ApiError {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

pub(crate) fn store_error(err: StoreError) -> ApiError {
    tracing::error!(error = %err, "store.error");
    internal_error()
}

pub async fn router(config: GatewayConfig) -> Result<(Router, AppState), StartupError> {
    let store = Store::connect_and_migrate(
        &config.db_url,
        Duration::from_millis(config.store_write_timeout_ms),
    )
    .await
    .map_err(|err| StartupError {
        code: "ERR_STORE_UNAVAILABLE",
        message: format!("failed to initialize store: {}", err),
    })?;

    let passkeys = PasskeyEngine::new(&config.webauthn).map_err(|err| StartupError {
        code: "ERR_WEBAUTHN_CONFIG",
        message: err.message.clone(),
    })?;

    let bus = EventBus::new(config.event_buffer);
    let limiter = RateLimiter::new(Duration::from_secs(60), 4096);

    let state = AppState {
        config,
        store,
        bus,
        passkeys: Arc::new(passkeys),
        limiter,
    };

    let cors = cors_layer(&state.config);

    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/users/enroll", post(users::enroll))
        .route("/api/users", get(users::list_users))
        .route("/api/users/{root_id}", get(users::get_user))
        .route("/api/users/{root_id}/timeline", get(users::timeline))
        .route("/api/users/{root_id}/profile", put(users::update_profile))
        .route(
            "/api/users/{root_id}/equipped-title",
            put(users::set_equipped_title),
        )
        .route(
            "/api/users/{root_id}/links",
            post(consent::grant_link).get(consent::list_links),
        )
        .route(
            "/api/users/{root_id}/links/{link_id}",
            delete(consent::revoke_link),
        )
        .route("/api/users/{root_id}/caches", post(loot::grant_cache))
        .route(
            "/api/users/{root_id}/caches/{cache_id}/open",
            post(loot::open_cache),
        )
        .route("/api/users/{root_id}/inventory", get(gear::inventory))
        .route(
            "/api/users/{root_id}/equipment",
            get(gear::equipment).post(gear::equip),
        )
        .route("/api/users/{root_id}/equipment/{slot}", delete(gear::unequip))
        .route("/api/ingest", post(ingest::ingest))
        .route("/api/auth/register/options", post(auth::register_options))
        .route("/api/auth/register/verify", post(auth::register_verify))
        .route(
            "/api/auth/authenticate/options",
            post(auth::authenticate_options),
        )
        .route(
            "/api/auth/authenticate/verify",
            post(auth::authenticate_verify),
        )
        .route("/api/auth/keys", get(auth::list_keys))
        .route("/api/auth/keys/rotate", post(auth::rotate_options))
        .route("/api/auth/keys/rotate/verify", post(auth::rotate_verify))
        .route("/api/auth/keys/{key_id}/revoke", post(auth::revoke_key))
        .route("/api/auth/impersonate/{root_id}", post(auth::impersonate))
        .route(
            "/api/config",
            get(config_api::get_config).post(config_api::update_config),
        )
        .route(
            "/api/sources",
            get(sources::list_sources).post(sources::create_source),
        )
        .route("/api/sources/{source_id}", get(sources::get_source))
        .route("/api/sources/{source_id}/rotate-key", post(sources::rotate_key))
        .route("/api/sources/{source_id}/status", post(sources::set_status))
        .route("/api/events/stream", get(stream::stream))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_mw))
        .layer(middleware::from_fn(track_metrics))
        .layer(middleware::from_fn(run_detached))
        .layer(cors)
        .with_state(state.clone());

    Ok((router, state))
}

fn cors_layer(config: &GatewayConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    if config.env == RuntimeEnv::Production {
        let origins = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse::<HeaderValue>().ok())
            .collect::<Vec<_>>();
        layer.allow_origin(AllowOrigin::list(origins))
    } else {
        layer.allow_origin(Any)
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_endpoint() -> Response {
    match metrics::render() {
        Ok((buffer, content_type)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type)],
            buffer,
        )
            .into_response(),
        Err(_) => internal_error().into_response(),
    }
}

/// A client disconnect must not cancel an in-flight transaction: the rest of
/// the request runs as its own task, so the write completes and only the
/// response is discarded.
async fn run_detached(req: Request, next: Next) -> Response {
    match tokio::spawn(next.run(req)).await {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = %err, "handler.join_failed");
            internal_error().into_response()
        }
    }
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let method = req.method().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    metrics::observe_http_request(&route, &method, response.status().as_u16(), start.elapsed());
    response
}

async fn rate_limit_mw(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let (policy, limit) = route_policy(&state.config, req.uri().path());
    if limit == 0 {
        return next.run(req).await;
    }

    let client = client_identity(req.headers(), addr);
    if state.limiter.allow(policy, &client, limit) {
        return next.run(req).await;
    }

    metrics::inc_rate_limited(policy);
    tracing::warn!(policy, client = %client, "rate_limit.rejected");

    let mut response = json_error(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded")
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&state.limiter.window_secs().to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

fn route_policy(config: &GatewayConfig, path: &str) -> (&'static str, u32) {
    if path == "/healthz" || path == "/metrics" {
        ("health", 0)
    } else if path == "/api/ingest" {
        ("ingest", config.rate_ingest_per_min)
    } else if path.starts_with("/api/auth/") {
        ("auth", config.rate_auth_per_min)
    } else {
        ("default", config.rate_default_per_min)
    }
}

fn client_identity(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(|| addr.ip().to_string())
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    let authz = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| unauthorized("Missing session token"))?;

    let token = authz
        .strip_prefix("Bearer ")
        .or_else(|| authz.strip_prefix("bearer "))
        .ok_or_else(|| unauthorized("Authorization must be a Bearer token"))?;

    let token = token.trim();
    if token.len() != SESSION_TOKEN_HEX_LEN {
        return Err(unauthorized("Invalid session token"));
    }
    Ok(token.to_string())
}

/// Resolves the Bearer session to its root id; 401 on anything else.
pub(crate) async fn session_root(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let token = bearer_token(headers)?;
    let hash = pik_auth::sha256_hex(token.as_bytes());
    state
        .store
        .resolve_session_token(&hash)
        .await
        .map_err(store_error)?
        .ok_or_else(|| unauthorized("Invalid or expired session token"))
}

/// Session-bound routes: the session's root must match the path root.
pub(crate) async fn require_session_for(
    state: &AppState,
    headers: &HeaderMap,
    root_id: &str,
) -> Result<(), ApiError> {
    let session = session_root(state, headers).await?;
    if session != root_id {
        return Err(forbidden("Session does not belong to this identity"));
    }
    Ok(())
}

/// API-key guard. The reply is deliberately identical for missing, unknown
/// and suspended keys.
pub(crate) async fn resolve_source(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<SourceRow, ApiError> {
    let presented = headers
        .get(pik_contracts::API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| forbidden("Invalid API key"))?;

    let hash = pik_auth::sha256_hex(presented.as_bytes());
    state
        .store
        .find_active_source_by_key_hash(&hash)
        .await
        .map_err(store_error)?
        .ok_or_else(|| forbidden("Invalid API key"))
}

pub(crate) struct KernelSettings {
    pub tunables: Tunables,
    pub session_token_ttl_secs: u64,
    pub default_link_scope: String,
}

/// Reads the tunables fresh from the config table so updates apply on the
/// next request; unparsable values fall back to the seeded defaults.
pub(crate) async fn kernel_settings(state: &AppState) -> Result<KernelSettings, ApiError> {
    let rows = state.store.config_all().await.map_err(store_error)?;
    let mut defaults = Tunables::default();
    let mut session_token_ttl_secs = 3600u64;
    let mut default_link_scope = "progression.write".to_string();

    for row in rows {
        let value = row.config_value.trim();
        match row.config_key.as_str() {
            "xp_per_session_normal" => opt_parse(value, &mut defaults.xp_per_session_normal),
            "xp_per_session_hard" => opt_parse(value, &mut defaults.xp_per_session_hard),
            "xp_boss_tier_pct" => opt_parse(value, &mut defaults.xp_boss_tier_pct),
            "xp_node_completion" => opt_parse(value, &mut defaults.xp_node_completion),
            "event_xp_multiplier" => opt_parse(value, &mut defaults.event_xp_multiplier),
            "xp_base_threshold" => opt_parse(value, &mut defaults.xp_base_threshold),
            "xp_level_multiplier" => opt_parse(value, &mut defaults.xp_level_multiplier),
            "session_token_ttl_secs" => opt_parse(value, &mut session_token_ttl_secs),
            "default_link_scope" => {
                if !value.is_empty() {
                    default_link_scope = value.to_string();
                }
            }
            _ => {}
        }
    }

    Ok(KernelSettings {
        tunables: defaults,
        session_token_ttl_secs,
        default_link_scope,
    })
}

fn opt_parse<T: std::str::FromStr>(value: &str, slot: &mut T) {
    if let Ok(parsed) = value.parse::<T>() {
        *slot = parsed;
    }
}

pub(crate) fn publish_events(state: &AppState, events: &[EventRecord]) {
    for event in events {
        metrics::observe_event_published(&event.event_type);
        state.bus.publish(event.clone());
    }
}
