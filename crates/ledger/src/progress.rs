use chrono::{DateTime, Utc};
use pik_contracts::{CacheType, EventRecord, Rarity, event_types};
use ulid::Ulid;

use crate::loot::CacheRow;
use crate::{Store, StoreError, append_event_tx};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConfigRow {
    pub config_key: String,
    pub config_value: String,
    pub updated_at: DateTime<Utc>,
}

pub struct XpEventWrite<'a> {
    pub root_id: &'a str,
    pub event_type: &'a str,
    pub source_id: Option<&'a str>,
    pub payload: serde_json::Value,
    pub changes: serde_json::Value,
    pub new_xp: i64,
    pub new_level: i64,
}

pub enum TitleGrant {
    Granted { events: Vec<EventRecord> },
    AlreadyHeld { events: Vec<EventRecord> },
    UnknownTitle,
}

impl Store {
    /// Writes the progression scalars and the top-level ledger row together.
    /// Concurrent ingests for one root are last-writer-wins on the scalars;
    /// the ledger keeps every event.
    pub async fn apply_xp_event(
        &self,
        write: XpEventWrite<'_>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.timed(async {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                "UPDATE pik_root_identities SET fate_xp = $2, fate_level = $3 WHERE root_id = $1",
            )
            .bind(write.root_id)
            .bind(write.new_xp)
            .bind(write.new_level)
            .execute(&mut *tx)
            .await?;

            let event = append_event_tx(
                &mut tx,
                write.root_id,
                write.event_type,
                write.source_id,
                write.payload,
                Some(write.changes),
            )
            .await?;

            tx.commit().await?;
            Ok(vec![event])
        })
        .await
    }

    /// Grant-if-absent: the unique `(root_id, title_id)` pair turns a
    /// re-grant into a no-op reported as `AlreadyHeld`. When `record_noop` is
    /// set the attempt still lands in the ledger (top-level ingest events);
    /// side-grants pass `false` and stay silent on repeats.
    pub async fn grant_title(
        &self,
        root_id: &str,
        title_id: &str,
        source_id: Option<&str>,
        payload: serde_json::Value,
        record_noop: bool,
    ) -> Result<TitleGrant, StoreError> {
        self.timed(async {
            let mut tx = self.pool.begin().await?;

            let known = sqlx::query_scalar::<_, i64>(
                "SELECT count(*) FROM pik_titles WHERE title_id = $1",
            )
            .bind(title_id)
            .fetch_one(&mut *tx)
            .await?;
            if known == 0 {
                return Ok(TitleGrant::UnknownTitle);
            }

            let inserted = sqlx::query(
                "INSERT INTO pik_user_titles (root_id, title_id) VALUES ($1, $2) ON CONFLICT (root_id, title_id) DO NOTHING",
            )
            .bind(root_id)
            .bind(title_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if inserted == 0 {
                let mut events = Vec::new();
                if record_noop {
                    events.push(
                        append_event_tx(
                            &mut tx,
                            root_id,
                            event_types::TITLE_GRANTED,
                            source_id,
                            payload,
                            Some(serde_json::json!({ "title_id": title_id, "already_held": true })),
                        )
                        .await?,
                    );
                }
                tx.commit().await?;
                return Ok(TitleGrant::AlreadyHeld { events });
            }

            let event = append_event_tx(
                &mut tx,
                root_id,
                event_types::TITLE_GRANTED,
                source_id,
                payload,
                Some(serde_json::json!({ "title_id": title_id, "already_held": false })),
            )
            .await?;

            tx.commit().await?;
            Ok(TitleGrant::Granted {
                events: vec![event],
            })
        })
        .await
    }

    pub async fn insert_marker(
        &self,
        root_id: &str,
        source_id: Option<&str>,
        marker: &str,
        payload: serde_json::Value,
    ) -> Result<(String, Vec<EventRecord>), StoreError> {
        let marker_id = Ulid::new().to_string();

        self.timed(async {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                "INSERT INTO pik_fate_markers (marker_id, root_id, source_id, marker) VALUES ($1, $2, $3, $4)",
            )
            .bind(&marker_id)
            .bind(root_id)
            .bind(source_id)
            .bind(marker)
            .execute(&mut *tx)
            .await?;

            let event = append_event_tx(
                &mut tx,
                root_id,
                event_types::FATE_MARKER,
                source_id,
                payload,
                Some(serde_json::json!({ "marker": marker, "marker_id": marker_id })),
            )
            .await?;

            tx.commit().await?;
            Ok((marker_id.clone(), vec![event]))
        })
        .await
    }

    pub async fn grant_cache(
        &self,
        root_id: &str,
        cache_type: CacheType,
        rarity: Rarity,
        trigger: &str,
        source_id: Option<&str>,
    ) -> Result<(CacheRow, Vec<EventRecord>), StoreError> {
        let cache_id = Ulid::new().to_string();

        self.timed(async {
            let mut tx = self.pool.begin().await?;

            let cache = sqlx::query_as::<_, CacheRow>(
                "INSERT INTO pik_fate_caches (cache_id, root_id, cache_type, rarity, trigger_label, source_id) VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
            )
            .bind(&cache_id)
            .bind(root_id)
            .bind(cache_type.as_str())
            .bind(rarity.as_str())
            .bind(trigger)
            .bind(source_id)
            .fetch_one(&mut *tx)
            .await?;

            let event = append_event_tx(
                &mut tx,
                root_id,
                event_types::CACHE_GRANTED,
                source_id,
                serde_json::json!({
                    "cache_id": cache_id,
                    "cache_type": cache_type.as_str(),
                    "rarity": rarity.as_str(),
                    "trigger": trigger,
                }),
                None,
            )
            .await?;

            tx.commit().await?;
            Ok((cache, vec![event]))
        })
        .await
    }

    pub async fn config_all(&self) -> Result<Vec<ConfigRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, ConfigRow>("SELECT * FROM pik_config ORDER BY config_key ASC")
                .fetch_all(&self.pool),
        )
        .await
    }

    /// Keys are pre-seeded; an update that matches no row means the key is
    /// unknown and the write is rejected upstream.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.timed(async {
            let result = sqlx::query(
                "UPDATE pik_config SET config_value = $2, updated_at = now() WHERE config_key = $1",
            )
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }
}
