use chrono::{DateTime, Utc};
use pik_contracts::{CacheStatus, EventRecord, GearSlot, RewardType, event_types};
use ulid::Ulid;

use crate::{Store, StoreError, append_event_tx};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CacheRow {
    pub cache_id: String,
    pub root_id: String,
    pub cache_type: String,
    pub rarity: String,
    pub status: String,
    pub trigger_label: String,
    pub source_id: Option<String>,
    pub granted_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub reward_type: Option<String>,
    pub reward_value: Option<String>,
    pub reward_name: Option<String>,
}

impl CacheRow {
    pub fn is_sealed(&self) -> bool {
        self.status == CacheStatus::Sealed.as_str()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LootTableRow {
    pub entry_id: String,
    pub cache_type: String,
    pub reward_type: String,
    pub reward_value: String,
    pub display_name: String,
    pub weight: i64,
    pub rarity: String,
    pub min_level: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MarkerRow {
    pub marker_id: String,
    pub root_id: String,
    pub source_id: Option<String>,
    pub marker: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GearItemRow {
    pub gear_id: String,
    pub gear_name: String,
    pub slot: String,
    pub rarity: String,
    pub modifiers: serde_json::Value,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InventoryRow {
    pub inventory_id: String,
    pub root_id: String,
    pub gear_id: String,
    pub gear_name: String,
    pub slot: String,
    pub rarity: String,
    pub modifiers: serde_json::Value,
    pub acquired_via: Option<String>,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EquipmentRow {
    pub slot: String,
    pub inventory_id: String,
    pub gear_id: String,
    pub gear_name: String,
    pub equipped_at: DateTime<Utc>,
}

pub struct OpenCacheWrite<'a> {
    pub cache_id: &'a str,
    pub root_id: &'a str,
    pub reward_type: RewardType,
    pub reward_value: &'a str,
    pub reward_name: &'a str,
}

pub enum OpenedCache {
    Opened {
        reward: serde_json::Value,
        events: Vec<EventRecord>,
    },
    AlreadyOpened,
}

impl Store {
    pub async fn caches(&self, root_id: &str) -> Result<Vec<CacheRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, CacheRow>(
                "SELECT * FROM pik_fate_caches WHERE root_id = $1 ORDER BY granted_at DESC",
            )
            .bind(root_id)
            .fetch_all(&self.pool),
        )
        .await
    }

    pub async fn get_cache(&self, cache_id: &str) -> Result<Option<CacheRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, CacheRow>("SELECT * FROM pik_fate_caches WHERE cache_id = $1")
                .bind(cache_id)
                .fetch_optional(&self.pool),
        )
        .await
    }

    pub async fn loot_entries(
        &self,
        cache_type: &str,
        level: i64,
    ) -> Result<Vec<LootTableRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, LootTableRow>(
                "SELECT * FROM pik_loot_table WHERE cache_type = $1 AND min_level <= $2 ORDER BY entry_id ASC",
            )
            .bind(cache_type)
            .bind(level)
            .fetch_all(&self.pool),
        )
        .await
    }

    pub async fn fate_markers(&self, root_id: &str) -> Result<Vec<MarkerRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, MarkerRow>(
                "SELECT * FROM pik_fate_markers WHERE root_id = $1 ORDER BY created_at DESC",
            )
            .bind(root_id)
            .fetch_all(&self.pool),
        )
        .await
    }

    pub async fn get_gear(&self, gear_id: &str) -> Result<Option<GearItemRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, GearItemRow>("SELECT * FROM pik_gear_items WHERE gear_id = $1")
                .bind(gear_id)
                .fetch_optional(&self.pool),
        )
        .await
    }

    /// Seals → opened exactly once: the status-guarded update claims the
    /// cache, then the drawn reward is applied and recorded in the same
    /// transaction. A title collision falls back to a flat XP boost.
    pub async fn open_cache(&self, write: OpenCacheWrite<'_>) -> Result<OpenedCache, StoreError> {
        self.timed(async {
            let mut tx = self.pool.begin().await?;

            let cache = sqlx::query_as::<_, CacheRow>(
                "UPDATE pik_fate_caches SET status = 'opened', opened_at = now() \
                 WHERE cache_id = $1 AND root_id = $2 AND status = 'sealed' RETURNING *",
            )
            .bind(write.cache_id)
            .bind(write.root_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(cache) = cache else {
                return Ok(OpenedCache::AlreadyOpened);
            };

            let mut reward_type = write.reward_type;
            let mut reward_value = write.reward_value.to_string();
            let mut reward_name = write.reward_name.to_string();
            let mut fallback = false;

            match write.reward_type {
                RewardType::XpBoost => {
                    let delta: i64 = write.reward_value.parse().unwrap_or(0);
                    sqlx::query(
                        "UPDATE pik_root_identities SET fate_xp = fate_xp + $2 WHERE root_id = $1",
                    )
                    .bind(write.root_id)
                    .bind(delta)
                    .execute(&mut *tx)
                    .await?;
                }
                RewardType::Title => {
                    let inserted = sqlx::query(
                        "INSERT INTO pik_user_titles (root_id, title_id) VALUES ($1, $2) ON CONFLICT (root_id, title_id) DO NOTHING",
                    )
                    .bind(write.root_id)
                    .bind(write.reward_value)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();

                    if inserted == 0 {
                        // Already held: the drop degrades to +100 XP.
                        fallback = true;
                        reward_type = RewardType::XpBoost;
                        reward_value = "100".to_string();
                        reward_name = "Fate Infusion (duplicate title)".to_string();
                        sqlx::query(
                            "UPDATE pik_root_identities SET fate_xp = fate_xp + 100 WHERE root_id = $1",
                        )
                        .bind(write.root_id)
                        .execute(&mut *tx)
                        .await?;
                    }
                }
                RewardType::Marker => {
                    let marker_id = Ulid::new().to_string();
                    sqlx::query(
                        "INSERT INTO pik_fate_markers (marker_id, root_id, source_id, marker) VALUES ($1, $2, $3, $4)",
                    )
                    .bind(&marker_id)
                    .bind(write.root_id)
                    .bind(Option::<&str>::None)
                    .bind(write.reward_value)
                    .execute(&mut *tx)
                    .await?;
                }
                RewardType::Gear => {
                    let inventory_id = Ulid::new().to_string();
                    sqlx::query(
                        "INSERT INTO pik_player_inventory (inventory_id, root_id, gear_id, acquired_via) VALUES ($1, $2, $3, $4)",
                    )
                    .bind(&inventory_id)
                    .bind(write.root_id)
                    .bind(write.reward_value)
                    .bind(format!("cache:{}", write.cache_id))
                    .execute(&mut *tx)
                    .await?;
                }
            }

            sqlx::query(
                "UPDATE pik_fate_caches SET reward_type = $2, reward_value = $3, reward_name = $4 WHERE cache_id = $1",
            )
            .bind(write.cache_id)
            .bind(reward_type.as_str())
            .bind(&reward_value)
            .bind(&reward_name)
            .execute(&mut *tx)
            .await?;

            let reward = serde_json::json!({
                "reward_type": reward_type.as_str(),
                "reward_value": reward_value,
                "reward_name": reward_name,
                "fallback": fallback,
            });

            let event = append_event_tx(
                &mut tx,
                write.root_id,
                event_types::CACHE_OPENED,
                None,
                serde_json::json!({
                    "cache_id": write.cache_id,
                    "cache_type": cache.cache_type,
                    "rarity": cache.rarity,
                }),
                Some(reward.clone()),
            )
            .await?;

            tx.commit().await?;
            Ok(OpenedCache::Opened {
                reward,
                events: vec![event],
            })
        })
        .await
    }

    pub async fn inventory(&self, root_id: &str) -> Result<Vec<InventoryRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, InventoryRow>(
                "SELECT i.inventory_id, i.root_id, i.gear_id, g.gear_name, g.slot, g.rarity, g.modifiers, i.acquired_via, i.acquired_at \
                 FROM pik_player_inventory i JOIN pik_gear_items g ON g.gear_id = i.gear_id \
                 WHERE i.root_id = $1 ORDER BY i.acquired_at DESC",
            )
            .bind(root_id)
            .fetch_all(&self.pool),
        )
        .await
    }

    pub async fn get_inventory_item(
        &self,
        root_id: &str,
        inventory_id: &str,
    ) -> Result<Option<InventoryRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, InventoryRow>(
                "SELECT i.inventory_id, i.root_id, i.gear_id, g.gear_name, g.slot, g.rarity, g.modifiers, i.acquired_via, i.acquired_at \
                 FROM pik_player_inventory i JOIN pik_gear_items g ON g.gear_id = i.gear_id \
                 WHERE i.root_id = $1 AND i.inventory_id = $2",
            )
            .bind(root_id)
            .bind(inventory_id)
            .fetch_optional(&self.pool),
        )
        .await
    }

    pub async fn equipment(&self, root_id: &str) -> Result<Vec<EquipmentRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, EquipmentRow>(
                "SELECT e.slot, e.inventory_id, i.gear_id, g.gear_name, e.equipped_at \
                 FROM pik_player_equipment e \
                 JOIN pik_player_inventory i ON i.inventory_id = e.inventory_id \
                 JOIN pik_gear_items g ON g.gear_id = i.gear_id \
                 WHERE e.root_id = $1 ORDER BY e.slot ASC",
            )
            .bind(root_id)
            .fetch_all(&self.pool),
        )
        .await
    }

    /// Upsert on `(root_id, slot)`: equipping into an occupied slot replaces
    /// the previous item.
    pub async fn equip(
        &self,
        root_id: &str,
        inventory_id: &str,
        slot: GearSlot,
        gear_id: &str,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.timed(async {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                "INSERT INTO pik_player_equipment (root_id, slot, inventory_id) VALUES ($1, $2, $3) \
                 ON CONFLICT (root_id, slot) DO UPDATE SET inventory_id = EXCLUDED.inventory_id, equipped_at = now()",
            )
            .bind(root_id)
            .bind(slot.as_str())
            .bind(inventory_id)
            .execute(&mut *tx)
            .await?;

            let event = append_event_tx(
                &mut tx,
                root_id,
                event_types::GEAR_EQUIPPED,
                None,
                serde_json::json!({
                    "inventory_id": inventory_id,
                    "gear_id": gear_id,
                    "slot": slot.as_str(),
                }),
                None,
            )
            .await?;

            tx.commit().await?;
            Ok(vec![event])
        })
        .await
    }

    pub async fn unequip(
        &self,
        root_id: &str,
        slot: GearSlot,
    ) -> Result<Option<Vec<EventRecord>>, StoreError> {
        self.timed(async {
            let mut tx = self.pool.begin().await?;

            let removed = sqlx::query(
                "DELETE FROM pik_player_equipment WHERE root_id = $1 AND slot = $2",
            )
            .bind(root_id)
            .bind(slot.as_str())
            .execute(&mut *tx)
            .await?;

            if removed.rows_affected() == 0 {
                return Ok(None);
            }

            let event = append_event_tx(
                &mut tx,
                root_id,
                event_types::GEAR_UNEQUIPPED,
                None,
                serde_json::json!({ "slot": slot.as_str() }),
                None,
            )
            .await?;

            tx.commit().await?;
            Ok(Some(vec![event]))
        })
        .await
    }
}
