use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use pik_contracts::{CacheType, Rarity, RewardType};
use pik_ledger::{OpenCacheWrite, OpenedCache};
use pik_progression::{roll_rarity, total_weight, weighted_index};
use rand::Rng;
use serde::Deserialize;
use serde_json::json;

use super::{
    ApiResult, AppState, bad_request, conflict, internal_error, not_found, ok, publish_events,
    require_session_for, store_error,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct GrantCacheRequest {
    cache_type: String,
    rarity: Option<String>,
    trigger: Option<String>,
}

/// Operator/manual cache grant; a forced rarity overrides the roll.
pub(super) async fn grant_cache(
    State(state): State<AppState>,
    Path(root_id): Path<String>,
    req: Result<Json<GrantCacheRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = req.map_err(|_| bad_request("invalid JSON body"))?;

    let cache_type = CacheType::parse(req.cache_type.trim())
        .ok_or_else(|| bad_request("cache_type must be level_up, boss_kill or milestone"))?;

    let forced = match req.rarity.as_deref().map(str::trim) {
        Some(raw) => Some(
            Rarity::parse(raw)
                .ok_or_else(|| bad_request("rarity must be common, uncommon, rare, epic or legendary"))?,
        ),
        None => None,
    };

    let root = state
        .store
        .get_root(&root_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("Unknown root identity"))?;

    let rarity = forced.unwrap_or_else(|| {
        let roll = rand::thread_rng().gen_range(0.0..100.0);
        roll_rarity(root.fate_level, cache_type, None, roll)
    });
    let trigger = req
        .trigger
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("manual")
        .to_string();

    let (cache, events) = state
        .store
        .grant_cache(&root_id, cache_type, rarity, &trigger, None)
        .await
        .map_err(store_error)?;

    publish_events(&state, &events);
    tracing::info!(root_id = %root_id, cache_id = %cache.cache_id, rarity = %cache.rarity, "loot.cache_granted");

    Ok(ok(json!({
        "cache_id": cache.cache_id,
        "cache_type": cache.cache_type,
        "rarity": cache.rarity,
        "status": cache.status,
        "trigger": cache.trigger_label,
        "granted_at": cache.granted_at,
    })))
}

/// Opens a sealed cache: draws from the level-eligible pool for its cache
/// type and applies the reward.
pub(super) async fn open_cache(
    State(state): State<AppState>,
    Path((root_id, cache_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult {
    require_session_for(&state, &headers, &root_id).await?;

    let cache = state
        .store
        .get_cache(&cache_id)
        .await
        .map_err(store_error)?
        .filter(|c| c.root_id == root_id)
        .ok_or_else(|| not_found("Unknown cache"))?;
    if !cache.is_sealed() {
        return Err(conflict("Cache already opened"));
    }

    let root = state
        .store
        .get_root(&root_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("Unknown root identity"))?;

    let entries = state
        .store
        .loot_entries(&cache.cache_type, root.fate_level)
        .await
        .map_err(store_error)?;
    if entries.is_empty() {
        tracing::error!(cache_type = %cache.cache_type, level = root.fate_level, "loot.empty_pool");
        return Err(internal_error());
    }

    let weights = entries.iter().map(|e| e.weight).collect::<Vec<_>>();
    let total = total_weight(&weights);
    let roll = rand::thread_rng().gen_range(0..total);
    let entry = weighted_index(&weights, roll)
        .map(|idx| &entries[idx])
        .ok_or_else(internal_error)?;

    let reward_type = RewardType::parse(&entry.reward_type).ok_or_else(|| {
        tracing::error!(entry_id = %entry.entry_id, "loot.invalid_reward_type");
        internal_error()
    })?;

    if reward_type == RewardType::Gear
        && state
            .store
            .get_gear(&entry.reward_value)
            .await
            .map_err(store_error)?
            .is_none()
    {
        tracing::error!(entry_id = %entry.entry_id, gear_id = %entry.reward_value, "loot.unknown_gear");
        return Err(internal_error());
    }

    let opened = state
        .store
        .open_cache(OpenCacheWrite {
            cache_id: &cache_id,
            root_id: &root_id,
            reward_type,
            reward_value: &entry.reward_value,
            reward_name: &entry.display_name,
        })
        .await
        .map_err(store_error)?;

    match opened {
        OpenedCache::Opened { reward, events } => {
            publish_events(&state, &events);
            tracing::info!(root_id = %root_id, cache_id = %cache_id, "loot.cache_opened");
            Ok(ok(json!({
                "cache_id": cache_id,
                "cache_type": cache.cache_type,
                "rarity": cache.rarity,
                "status": "opened",
                "reward": reward,
            })))
        }
        OpenedCache::AlreadyOpened => Err(conflict("Cache already opened")),
    }
}
