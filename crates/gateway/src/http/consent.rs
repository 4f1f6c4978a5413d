use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use pik_ledger::RevokeLinkOutcome;
use serde::Deserialize;
use serde_json::json;

use super::{
    ApiResult, AppState, bad_request, conflict, kernel_settings, not_found, ok, publish_events,
    store_error,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct GrantLinkRequest {
    source_id: String,
    granted_by: String,
    scope: Option<String>,
}

pub(super) async fn grant_link(
    State(state): State<AppState>,
    Path(root_id): Path<String>,
    req: Result<Json<GrantLinkRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = req.map_err(|_| bad_request("invalid JSON body"))?;

    let granted_by = req.granted_by.trim();
    if granted_by.is_empty() {
        return Err(bad_request("granted_by must be non-empty"));
    }

    let root = state
        .store
        .get_root(&root_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("Unknown root identity"))?;
    if !root.is_active() {
        return Err(bad_request("Identity is not active"));
    }

    let source = state
        .store
        .get_source(&req.source_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("Unknown source"))?;
    if !source.is_active() {
        return Err(bad_request("Source is not active"));
    }

    if state
        .store
        .active_link(&root_id, &source.source_id)
        .await
        .map_err(store_error)?
        .is_some()
    {
        return Err(conflict("Active link already exists"));
    }

    let scope = match req.scope.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(scope) => scope.to_string(),
        None => kernel_settings(&state).await?.default_link_scope,
    };

    let (link, events) = state
        .store
        .grant_link(&root_id, &source.source_id, &scope, granted_by)
        .await
        .map_err(|err| {
            if err.is_unique_violation() {
                conflict("Active link already exists")
            } else {
                store_error(err)
            }
        })?;

    publish_events(&state, &events);
    tracing::info!(root_id = %root_id, source_id = %source.source_id, link_id = %link.link_id, "consent.granted");

    Ok(ok(json!({
        "link_id": link.link_id,
        "root_id": link.root_id,
        "source_id": link.source_id,
        "scope": link.scope,
        "status": link.status,
        "granted_by": link.granted_by,
        "granted_at": link.granted_at,
    })))
}

pub(super) async fn list_links(
    State(state): State<AppState>,
    Path(root_id): Path<String>,
) -> ApiResult {
    state
        .store
        .get_root(&root_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("Unknown root identity"))?;

    let links = state.store.links(&root_id).await.map_err(store_error)?;
    Ok(ok(json!(links
        .iter()
        .map(|l| json!({
            "link_id": l.link_id,
            "source_id": l.source_id,
            "scope": l.scope,
            "status": l.status,
            "granted_by": l.granted_by,
            "granted_at": l.granted_at,
            "revoked_at": l.revoked_at,
            "revoked_by": l.revoked_by,
        }))
        .collect::<Vec<_>>())))
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct RevokeLinkRequest {
    revoked_by: Option<String>,
}

/// Revocation blocks only future ingest; recorded progression stays.
pub(super) async fn revoke_link(
    State(state): State<AppState>,
    Path((root_id, link_id)): Path<(String, String)>,
    req: Option<Json<RevokeLinkRequest>>,
) -> ApiResult {
    let req = req.map(|Json(r)| r).unwrap_or_default();

    match state
        .store
        .revoke_link(&root_id, &link_id, req.revoked_by.as_deref())
        .await
        .map_err(store_error)?
    {
        RevokeLinkOutcome::Revoked { link, events } => {
            publish_events(&state, &events);
            tracing::info!(root_id = %root_id, link_id = %link_id, "consent.revoked");
            Ok(ok(json!({
                "link_id": link.link_id,
                "source_id": link.source_id,
                "status": link.status,
                "revoked_at": link.revoked_at,
                "revoked_by": link.revoked_by,
            })))
        }
        RevokeLinkOutcome::NotActive => Err(conflict("Link is not active")),
        RevokeLinkOutcome::NotFound => Err(not_found("Unknown link")),
    }
}
