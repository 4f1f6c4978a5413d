use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use pik_contracts::event_types;
use pik_ledger::{EnrollmentWrite, EquipTitleOutcome, LedgerRow, LinkSpec, ProfileUpdate};
use pik_progression::cumulative_threshold;
use serde::Deserialize;
use serde_json::json;

use super::{
    ApiResult, AppState, bad_request, kernel_settings, not_found, ok, publish_events,
    require_session_for, store_error,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct EnrollRequest {
    hero_name: String,
    fate_alignment: String,
    origin: Option<String>,
    enrolled_by: String,
    source_id: Option<String>,
}

pub(super) async fn enroll(
    State(state): State<AppState>,
    req: Result<Json<EnrollRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = req.map_err(|_| bad_request("invalid JSON body"))?;

    let hero_name = req.hero_name.trim();
    let fate_alignment = req.fate_alignment.trim();
    let enrolled_by = req.enrolled_by.trim();
    if hero_name.is_empty() || fate_alignment.is_empty() || enrolled_by.is_empty() {
        return Err(bad_request(
            "hero_name, fate_alignment and enrolled_by must be non-empty",
        ));
    }

    let mut link_scope = String::new();
    let link = match req.source_id.as_deref() {
        Some(source_id) => {
            let source = state
                .store
                .get_source(source_id)
                .await
                .map_err(store_error)?
                .ok_or_else(|| not_found("Unknown source"))?;
            if !source.is_active() {
                return Err(bad_request("Source is not active"));
            }
            link_scope = kernel_settings(&state).await?.default_link_scope;
            Some(LinkSpec {
                source_id,
                granted_by: enrolled_by,
                scope: &link_scope,
            })
        }
        None => None,
    };

    let record = state
        .store
        .enroll(EnrollmentWrite {
            hero_name,
            fate_alignment,
            origin: req.origin.as_deref().map(str::trim).filter(|o| !o.is_empty()),
            enrolled_by,
            link,
        })
        .await
        .map_err(store_error)?;

    publish_events(&state, &record.events);
    tracing::info!(root_id = %record.root_id, hero_name, "users.enrolled");

    Ok(ok(json!({
        "root_id": record.root_id,
        "persona_id": record.persona_id,
        "hero_name": hero_name,
        "fate_alignment": fate_alignment,
        "link_id": record.link_id,
        "enrolled_at": record.enrolled_at,
    })))
}

pub(super) async fn list_users(State(state): State<AppState>) -> ApiResult {
    let users = state.store.list_users().await.map_err(store_error)?;
    let data = users
        .into_iter()
        .map(|u| {
            json!({
                "root_id": u.root_id,
                "hero_name": u.hero_name,
                "fate_alignment": u.fate_alignment,
                "fate_xp": u.fate_xp,
                "fate_level": u.fate_level,
                "status": u.status,
                "active_sources": u.active_sources,
            })
        })
        .collect::<Vec<_>>();
    Ok(ok(json!(data)))
}

pub(super) async fn get_user(
    State(state): State<AppState>,
    Path(root_id): Path<String>,
) -> ApiResult {
    let root = state
        .store
        .get_root(&root_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("Unknown root identity"))?;

    let personas = state.store.personas(&root_id).await.map_err(store_error)?;
    let titles = state.store.user_titles(&root_id).await.map_err(store_error)?;
    let markers = state.store.fate_markers(&root_id).await.map_err(store_error)?;
    let links = state.store.links(&root_id).await.map_err(store_error)?;
    let recent = state
        .store
        .recent_events(&root_id, 20)
        .await
        .map_err(store_error)?;
    let caches = state.store.caches(&root_id).await.map_err(store_error)?;
    let total_sessions = state
        .store
        .count_by_type(&root_id, event_types::SESSION_COMPLETED)
        .await
        .map_err(store_error)?;

    let settings = kernel_settings(&state).await?;
    let next_threshold = cumulative_threshold(&settings.tunables, root.fate_level);
    let floor = cumulative_threshold(&settings.tunables, root.fate_level - 1);
    let xp_in_current_level = (root.fate_xp - floor).max(0);
    let xp_needed_for_next = (next_threshold - root.fate_xp).max(0);

    let primary_persona = personas.iter().find(|p| p.is_primary).or(personas.first());

    Ok(ok(json!({
        "identity": {
            "root_id": root.root_id,
            "hero_name": root.hero_name,
            "fate_alignment": root.fate_alignment,
            "origin": root.origin,
            "status": root.status,
            "enrolled_by": root.enrolled_by,
            "enrolled_at": root.enrolled_at,
            "equipped_title_id": root.equipped_title_id,
        },
        "persona": primary_persona.map(|p| json!({
            "persona_id": p.persona_id,
            "display_name": p.display_name,
            "is_primary": p.is_primary,
            "created_at": p.created_at,
        })),
        "progression": {
            "fate_xp": root.fate_xp,
            "fate_level": root.fate_level,
            "xp_in_current_level": xp_in_current_level,
            "xp_needed_for_next": xp_needed_for_next,
            "total_sessions": total_sessions,
            "titles": titles.iter().map(|t| t.title_id.clone()).collect::<Vec<_>>(),
            "titles_detail": titles.iter().map(|t| json!({
                "title_id": t.title_id,
                "title_name": t.title_name,
                "description": t.description,
                "granted_at": t.granted_at,
            })).collect::<Vec<_>>(),
            "fate_markers": markers.iter().map(|m| json!({
                "marker_id": m.marker_id,
                "marker": m.marker,
                "source_id": m.source_id,
                "created_at": m.created_at,
            })).collect::<Vec<_>>(),
        },
        "source_links": links.iter().map(|l| json!({
            "link_id": l.link_id,
            "source_id": l.source_id,
            "scope": l.scope,
            "status": l.status,
            "granted_by": l.granted_by,
            "granted_at": l.granted_at,
            "revoked_at": l.revoked_at,
        })).collect::<Vec<_>>(),
        "recent_events": recent.iter().map(ledger_row_json).collect::<Vec<_>>(),
        "fate_caches": caches.iter().map(|c| json!({
            "cache_id": c.cache_id,
            "cache_type": c.cache_type,
            "rarity": c.rarity,
            "status": c.status,
            "trigger": c.trigger_label,
            "granted_at": c.granted_at,
            "opened_at": c.opened_at,
            "reward_type": c.reward_type,
            "reward_value": c.reward_value,
            "reward_name": c.reward_name,
        })).collect::<Vec<_>>(),
    })))
}

pub(super) async fn timeline(
    State(state): State<AppState>,
    Path(root_id): Path<String>,
) -> ApiResult {
    state
        .store
        .get_root(&root_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("Unknown root identity"))?;

    let rows = state.store.timeline(&root_id).await.map_err(store_error)?;
    Ok(ok(json!(rows.iter().map(ledger_row_json).collect::<Vec<_>>())))
}

fn ledger_row_json(row: &LedgerRow) -> serde_json::Value {
    json!({
        "event_id": row.event_id,
        "event_type": row.event_type,
        "source_id": row.source_id,
        "source_name": row.source_name,
        "payload": row.payload,
        "changes_applied": row.changes_applied,
        "created_at": row.created_at,
    })
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct ProfileRequest {
    hero_name: Option<String>,
    fate_alignment: Option<String>,
    origin: Option<String>,
}

pub(super) async fn update_profile(
    State(state): State<AppState>,
    Path(root_id): Path<String>,
    headers: HeaderMap,
    req: Result<Json<ProfileRequest>, JsonRejection>,
) -> ApiResult {
    require_session_for(&state, &headers, &root_id).await?;

    let Json(req) = req.map_err(|_| bad_request("invalid JSON body"))?;
    let hero_name = req.hero_name.as_deref().map(str::trim);
    let fate_alignment = req.fate_alignment.as_deref().map(str::trim);
    let origin = req.origin.as_deref().map(str::trim);

    if hero_name.is_none() && fate_alignment.is_none() && origin.is_none() {
        return Err(bad_request("no profile fields to update"));
    }
    if hero_name.is_some_and(|v| v.is_empty()) || fate_alignment.is_some_and(|v| v.is_empty()) {
        return Err(bad_request("hero_name and fate_alignment must be non-empty"));
    }

    let updated = state
        .store
        .update_profile(
            &root_id,
            ProfileUpdate {
                hero_name,
                fate_alignment,
                origin,
            },
        )
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("Unknown root identity"))?;

    let (row, events) = updated;
    publish_events(&state, &events);

    Ok(ok(json!({
        "root_id": row.root_id,
        "hero_name": row.hero_name,
        "fate_alignment": row.fate_alignment,
        "origin": row.origin,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct EquippedTitleRequest {
    title_id: Option<String>,
}

pub(super) async fn set_equipped_title(
    State(state): State<AppState>,
    Path(root_id): Path<String>,
    headers: HeaderMap,
    req: Result<Json<EquippedTitleRequest>, JsonRejection>,
) -> ApiResult {
    require_session_for(&state, &headers, &root_id).await?;

    let Json(req) = req.map_err(|_| bad_request("invalid JSON body"))?;
    let title_id = req.title_id.as_deref().map(str::trim).filter(|t| !t.is_empty());

    match state
        .store
        .set_equipped_title(&root_id, title_id)
        .await
        .map_err(store_error)?
    {
        EquipTitleOutcome::Updated {
            equipped_title_id,
            events,
        } => {
            publish_events(&state, &events);
            Ok(ok(json!({
                "root_id": root_id,
                "equipped_title_id": equipped_title_id,
            })))
        }
        EquipTitleOutcome::TitleNotHeld => Err(bad_request("Title is not held by this identity")),
        EquipTitleOutcome::RootNotFound => Err(not_found("Unknown root identity")),
    }
}
