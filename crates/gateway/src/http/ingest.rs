use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use pik_contracts::{CacheType, Difficulty, IngestPayload, event_types};
use pik_ledger::{RootIdentityRow, SourceRow, TitleGrant, XpEventWrite};
use pik_progression::{
    Tunables, apply_xp, boss_title, level_title, node_completion_xp, roll_rarity, scaled_xp,
    session_breakdown,
};
use rand::Rng;
use serde::Deserialize;
use serde_json::json;

use crate::metrics;

use super::{
    ApiResult, AppState, bad_request, forbidden, kernel_settings, not_found, ok, publish_events,
    resolve_source, store_error,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct IngestRequest {
    root_id: String,
    event_type: String,
    payload: serde_json::Value,
    #[serde(default)]
    session_ref: Option<String>,
}

/// Single entry point for source mutations: API-key guard, consent gate,
/// event-type dispatch.
pub(super) async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<IngestRequest>, JsonRejection>,
) -> ApiResult {
    let source = resolve_source(&state, &headers).await?;
    let Json(req) = req.map_err(|_| bad_request("invalid JSON body"))?;

    let root = state
        .store
        .get_root(&req.root_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("Unknown root identity"))?;

    let link = state
        .store
        .active_link(&root.root_id, &source.source_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| forbidden("No active consent link"))?;

    let parsed = IngestPayload::parse(&req.event_type, &req.payload).map_err(|err| {
        metrics::observe_ingest(&req.event_type, "rejected");
        bad_request(err.message)
    })?;

    let settings = kernel_settings(&state).await?;

    // The original payload object is stored verbatim; the connector-supplied
    // session_ref rides along when present.
    let mut stored_payload = req.payload.clone();
    if let (Some(obj), Some(session_ref)) = (stored_payload.as_object_mut(), &req.session_ref) {
        obj.insert("session_ref".to_string(), json!(session_ref));
    }

    tracing::info!(
        root_id = %root.root_id,
        source_id = %source.source_id,
        link_id = %link.link_id,
        event_type = %req.event_type,
        "ingest.received"
    );

    let data = match parsed {
        IngestPayload::SessionCompleted {
            difficulty,
            nodes_completed,
            boss_damage_pct,
        } => {
            session_completed(
                &state,
                &root,
                &source,
                &settings.tunables,
                stored_payload,
                difficulty,
                nodes_completed,
                boss_damage_pct,
            )
            .await?
        }
        IngestPayload::XpGranted { xp } => {
            let delta = scaled_xp(&settings.tunables, xp);
            xp_event(
                &state,
                &root,
                &source,
                &settings.tunables,
                event_types::XP_GRANTED,
                stored_payload,
                delta,
                json!({ "total_xp": delta }),
            )
            .await?
        }
        IngestPayload::NodeCompleted { node_id } => {
            let delta = node_completion_xp(&settings.tunables);
            xp_event(
                &state,
                &root,
                &source,
                &settings.tunables,
                event_types::NODE_COMPLETED,
                stored_payload,
                delta,
                json!({ "total_xp": delta, "node_id": node_id }),
            )
            .await?
        }
        IngestPayload::TitleGranted { title_id } => {
            title_granted(&state, &root, &source, stored_payload, &title_id).await?
        }
        IngestPayload::FateMarker { marker } => {
            let (marker_id, events) = state
                .store
                .insert_marker(
                    &root.root_id,
                    Some(&source.source_id),
                    &marker,
                    stored_payload,
                )
                .await
                .map_err(store_error)?;
            let event_id = events[0].event_id.clone();
            publish_events(&state, &events);
            json!({
                "event_id": event_id,
                "event_type": event_types::FATE_MARKER,
                "changes_applied": { "marker": marker, "marker_id": marker_id },
            })
        }
    };

    metrics::observe_ingest(&req.event_type, "success");
    Ok(ok(data))
}

#[allow(clippy::too_many_arguments)]
async fn session_completed(
    state: &AppState,
    root: &RootIdentityRow,
    source: &SourceRow,
    tunables: &Tunables,
    payload: serde_json::Value,
    difficulty: Difficulty,
    nodes_completed: u32,
    boss_damage_pct: f64,
) -> Result<serde_json::Value, super::ApiError> {
    let breakdown = session_breakdown(tunables, difficulty, nodes_completed, boss_damage_pct);
    let outcome = apply_xp(tunables, root.fate_xp, root.fate_level, breakdown.total_xp);

    let mut changes = json!({
        "session_xp": breakdown.session_xp,
        "boss_bonus_xp": breakdown.boss_bonus_xp,
        "node_xp": breakdown.node_xp,
        "total_xp": breakdown.total_xp,
    });
    if outcome.leveled_up() {
        changes["level_up"] = json!({ "from": root.fate_level, "to": outcome.level });
    }

    let events = state
        .store
        .apply_xp_event(XpEventWrite {
            root_id: &root.root_id,
            event_type: event_types::SESSION_COMPLETED,
            source_id: Some(&source.source_id),
            payload,
            changes: changes.clone(),
            new_xp: outcome.xp,
            new_level: outcome.level,
        })
        .await
        .map_err(store_error)?;
    let event_id = events[0].event_id.clone();
    publish_events(state, &events);

    // Side-grants run after the primary commit and are best-effort: a failed
    // grant is logged and skipped, never rolled back.
    let mut titles_granted = Vec::new();
    let mut caches_granted = Vec::new();

    for level in &outcome.levels_gained {
        if let Some(title_id) = level_title(*level) {
            side_grant_title(state, root, source, title_id, "level", &mut titles_granted).await;
        }
    }
    if let Some(title_id) = boss_title(boss_damage_pct) {
        side_grant_title(state, root, source, title_id, "boss", &mut titles_granted).await;
    }

    if outcome.leveled_up() {
        side_grant_cache(
            state,
            root,
            source,
            CacheType::LevelUp,
            None,
            format!("level_up:{}", outcome.level),
            outcome.level,
            &mut caches_granted,
        )
        .await;
    }
    if boss_damage_pct >= 50.0 {
        side_grant_cache(
            state,
            root,
            source,
            CacheType::BossKill,
            Some(boss_damage_pct),
            format!("boss_kill:{}", boss_damage_pct as i64),
            outcome.level,
            &mut caches_granted,
        )
        .await;
    }

    if !titles_granted.is_empty() {
        changes["titles_granted"] = json!(titles_granted);
    }
    if !caches_granted.is_empty() {
        changes["caches_granted"] = json!(caches_granted);
    }

    Ok(json!({
        "event_id": event_id,
        "event_type": event_types::SESSION_COMPLETED,
        "changes_applied": changes,
    }))
}

#[allow(clippy::too_many_arguments)]
async fn xp_event(
    state: &AppState,
    root: &RootIdentityRow,
    source: &SourceRow,
    tunables: &Tunables,
    event_type: &str,
    payload: serde_json::Value,
    delta: i64,
    mut changes: serde_json::Value,
) -> Result<serde_json::Value, super::ApiError> {
    let outcome = apply_xp(tunables, root.fate_xp, root.fate_level, delta);
    if outcome.leveled_up() {
        changes["level_up"] = json!({ "from": root.fate_level, "to": outcome.level });
    }

    let events = state
        .store
        .apply_xp_event(XpEventWrite {
            root_id: &root.root_id,
            event_type,
            source_id: Some(&source.source_id),
            payload,
            changes: changes.clone(),
            new_xp: outcome.xp,
            new_level: outcome.level,
        })
        .await
        .map_err(store_error)?;
    let event_id = events[0].event_id.clone();
    publish_events(state, &events);

    let mut titles_granted = Vec::new();
    for level in &outcome.levels_gained {
        if let Some(title_id) = level_title(*level) {
            side_grant_title(state, root, source, title_id, "level", &mut titles_granted).await;
        }
    }
    if !titles_granted.is_empty() {
        changes["titles_granted"] = json!(titles_granted);
    }

    Ok(json!({
        "event_id": event_id,
        "event_type": event_type,
        "changes_applied": changes,
    }))
}

async fn title_granted(
    state: &AppState,
    root: &RootIdentityRow,
    source: &SourceRow,
    payload: serde_json::Value,
    title_id: &str,
) -> Result<serde_json::Value, super::ApiError> {
    let grant = state
        .store
        .grant_title(&root.root_id, title_id, Some(&source.source_id), payload, true)
        .await
        .map_err(store_error)?;

    let (already_held, events) = match grant {
        TitleGrant::Granted { events } => (false, events),
        TitleGrant::AlreadyHeld { events } => (true, events),
        TitleGrant::UnknownTitle => return Err(bad_request("Unknown title")),
    };

    let event_id = events.first().map(|e| e.event_id.clone());
    publish_events(state, &events);

    Ok(json!({
        "event_id": event_id,
        "event_type": event_types::TITLE_GRANTED,
        "changes_applied": { "title_id": title_id, "already_held": already_held },
    }))
}

async fn side_grant_title(
    state: &AppState,
    root: &RootIdentityRow,
    source: &SourceRow,
    title_id: &str,
    via: &str,
    granted: &mut Vec<String>,
) {
    let payload = json!({ "title_id": title_id, "via": via });
    match state
        .store
        .grant_title(&root.root_id, title_id, Some(&source.source_id), payload, false)
        .await
    {
        Ok(TitleGrant::Granted { events }) => {
            publish_events(state, &events);
            granted.push(title_id.to_string());
        }
        Ok(TitleGrant::AlreadyHeld { .. }) => {}
        Ok(TitleGrant::UnknownTitle) => {
            tracing::warn!(title_id, "ingest.side_grant_unknown_title");
        }
        Err(err) => {
            tracing::warn!(error = %err, title_id, "ingest.side_grant_title_failed");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn side_grant_cache(
    state: &AppState,
    root: &RootIdentityRow,
    source: &SourceRow,
    cache_type: CacheType,
    boss_damage_pct: Option<f64>,
    trigger: String,
    level: i64,
    granted: &mut Vec<serde_json::Value>,
) {
    let roll = rand::thread_rng().gen_range(0.0..100.0);
    let rarity = roll_rarity(level, cache_type, boss_damage_pct, roll);

    match state
        .store
        .grant_cache(
            &root.root_id,
            cache_type,
            rarity,
            &trigger,
            Some(&source.source_id),
        )
        .await
    {
        Ok((cache, events)) => {
            publish_events(state, &events);
            granted.push(json!({
                "cache_id": cache.cache_id,
                "cache_type": cache.cache_type,
                "rarity": cache.rarity,
            }));
        }
        Err(err) => {
            tracing::warn!(error = %err, cache_type = cache_type.as_str(), "ingest.side_grant_cache_failed");
        }
    }
}
