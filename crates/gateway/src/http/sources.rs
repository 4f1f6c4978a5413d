use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use pik_auth::{new_api_key, sha256_hex};
use pik_contracts::{SourceStatus, is_valid_source_id};
use serde::Deserialize;
use serde_json::json;

use super::{ApiResult, AppState, bad_request, conflict, not_found, ok, store_error};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct CreateSourceRequest {
    source_id: String,
    source_name: String,
}

pub(super) async fn create_source(
    State(state): State<AppState>,
    req: Result<Json<CreateSourceRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = req.map_err(|_| bad_request("invalid JSON body"))?;

    let source_id = req.source_id.trim();
    if !is_valid_source_id(source_id) {
        return Err(bad_request(
            "source_id must be 4-50 chars of lowercase letters, digits and dashes, starting and ending alphanumeric",
        ));
    }
    let source_name = req.source_name.trim();
    if source_name.is_empty() {
        return Err(bad_request("source_name must be non-empty"));
    }

    let api_key = new_api_key();
    let source = state
        .store
        .create_source(source_id, source_name, &sha256_hex(api_key.as_bytes()))
        .await
        .map_err(|err| {
            if err.is_unique_violation() {
                conflict("Source already exists")
            } else {
                store_error(err)
            }
        })?;

    tracing::info!(source_id = %source.source_id, "sources.created");

    // The plaintext key appears in this response and nowhere else.
    Ok(ok(json!({
        "source_id": source.source_id,
        "source_name": source.source_name,
        "status": source.status,
        "api_key": api_key,
        "created_at": source.created_at,
    })))
}

pub(super) async fn list_sources(State(state): State<AppState>) -> ApiResult {
    let sources = state.store.list_sources().await.map_err(store_error)?;
    Ok(ok(json!(sources
        .iter()
        .map(|s| json!({
            "source_id": s.source_id,
            "source_name": s.source_name,
            "status": s.status,
            "created_at": s.created_at,
        }))
        .collect::<Vec<_>>())))
}

pub(super) async fn get_source(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
) -> ApiResult {
    let source = state
        .store
        .get_source(&source_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("Unknown source"))?;

    Ok(ok(json!({
        "source_id": source.source_id,
        "source_name": source.source_name,
        "status": source.status,
        "created_at": source.created_at,
    })))
}

pub(super) async fn rotate_key(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
) -> ApiResult {
    let api_key = new_api_key();
    let rotated = state
        .store
        .rotate_source_key(&source_id, &sha256_hex(api_key.as_bytes()))
        .await
        .map_err(store_error)?;

    if !rotated {
        return Err(not_found("Unknown source"));
    }

    tracing::info!(source_id = %source_id, "sources.key_rotated");

    Ok(ok(json!({
        "source_id": source_id,
        "api_key": api_key,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct StatusRequest {
    status: String,
}

pub(super) async fn set_status(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
    req: Result<Json<StatusRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = req.map_err(|_| bad_request("invalid JSON body"))?;

    let status = SourceStatus::parse(req.status.trim())
        .ok_or_else(|| bad_request("status must be active, suspended or deactivated"))?;

    let current = state
        .store
        .get_source(&source_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("Unknown source"))?;

    // Deactivation is terminal.
    if current.status == SourceStatus::Deactivated.as_str()
        && status != SourceStatus::Deactivated
    {
        return Err(bad_request("Deactivated sources cannot be reactivated"));
    }

    let source = state
        .store
        .set_source_status(&source_id, status)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("Unknown source"))?;

    tracing::info!(source_id = %source_id, status = %source.status, "sources.status_changed");

    Ok(ok(json!({
        "source_id": source.source_id,
        "source_name": source.source_name,
        "status": source.status,
    })))
}
