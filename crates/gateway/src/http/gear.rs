use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use pik_contracts::GearSlot;
use serde::Deserialize;
use serde_json::json;

use super::{
    ApiResult, AppState, bad_request, not_found, ok, publish_events, require_session_for,
    store_error,
};

pub(super) async fn inventory(
    State(state): State<AppState>,
    Path(root_id): Path<String>,
) -> ApiResult {
    state
        .store
        .get_root(&root_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("Unknown root identity"))?;

    let items = state.store.inventory(&root_id).await.map_err(store_error)?;
    Ok(ok(json!(items
        .iter()
        .map(|i| json!({
            "inventory_id": i.inventory_id,
            "gear_id": i.gear_id,
            "gear_name": i.gear_name,
            "slot": i.slot,
            "rarity": i.rarity,
            "modifiers": i.modifiers,
            "acquired_via": i.acquired_via,
            "acquired_at": i.acquired_at,
        }))
        .collect::<Vec<_>>())))
}

pub(super) async fn equipment(
    State(state): State<AppState>,
    Path(root_id): Path<String>,
) -> ApiResult {
    state
        .store
        .get_root(&root_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("Unknown root identity"))?;

    let rows = state.store.equipment(&root_id).await.map_err(store_error)?;
    Ok(ok(json!(rows
        .iter()
        .map(|e| json!({
            "slot": e.slot,
            "inventory_id": e.inventory_id,
            "gear_id": e.gear_id,
            "gear_name": e.gear_name,
            "equipped_at": e.equipped_at,
        }))
        .collect::<Vec<_>>())))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct EquipRequest {
    inventory_id: String,
    slot: String,
}

pub(super) async fn equip(
    State(state): State<AppState>,
    Path(root_id): Path<String>,
    headers: HeaderMap,
    req: Result<Json<EquipRequest>, JsonRejection>,
) -> ApiResult {
    require_session_for(&state, &headers, &root_id).await?;
    let Json(req) = req.map_err(|_| bad_request("invalid JSON body"))?;

    let slot = GearSlot::parse(req.slot.trim())
        .ok_or_else(|| bad_request("slot must be weapon, helm, chest, arms, legs or rune"))?;

    let item = state
        .store
        .get_inventory_item(&root_id, req.inventory_id.trim())
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("Unknown inventory item"))?;

    if item.slot != slot.as_str() {
        return Err(bad_request("Gear does not fit that slot"));
    }

    let events = state
        .store
        .equip(&root_id, &item.inventory_id, slot, &item.gear_id)
        .await
        .map_err(store_error)?;
    publish_events(&state, &events);

    Ok(ok(json!({
        "root_id": root_id,
        "slot": slot.as_str(),
        "inventory_id": item.inventory_id,
        "gear_id": item.gear_id,
    })))
}

pub(super) async fn unequip(
    State(state): State<AppState>,
    Path((root_id, slot)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult {
    require_session_for(&state, &headers, &root_id).await?;

    let slot = GearSlot::parse(slot.trim())
        .ok_or_else(|| bad_request("slot must be weapon, helm, chest, arms, legs or rune"))?;

    let events = state
        .store
        .unequip(&root_id, slot)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("Nothing equipped in that slot"))?;
    publish_events(&state, &events);

    Ok(ok(json!({ "root_id": root_id, "slot": slot.as_str() })))
}
