use chrono::{DateTime, Utc};
use pik_contracts::EventRecord;

use crate::{Store, StoreError, append_event_tx};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LedgerRow {
    pub event_id: String,
    pub root_id: String,
    pub event_type: String,
    pub source_id: Option<String>,
    pub source_name: Option<String>,
    pub payload: serde_json::Value,
    pub changes_applied: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Standalone append for events with no companion table write
    /// (e.g. operator impersonation).
    pub async fn append_event(
        &self,
        root_id: &str,
        event_type: &str,
        source_id: Option<&str>,
        payload: serde_json::Value,
        changes: Option<serde_json::Value>,
    ) -> Result<EventRecord, StoreError> {
        self.timed(async {
            let mut tx = self.pool.begin().await?;
            let event =
                append_event_tx(&mut tx, root_id, event_type, source_id, payload, changes).await?;
            tx.commit().await?;
            Ok(event)
        })
        .await
    }

    /// Newest-first; ties on the wall clock break on the lexicographic
    /// event id (ULIDs are time-ordered).
    pub async fn timeline(&self, root_id: &str) -> Result<Vec<LedgerRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, LedgerRow>(
                "SELECT e.event_id, e.root_id, e.event_type, e.source_id, s.source_name, e.payload, e.changes_applied, e.created_at \
                 FROM pik_identity_events e LEFT JOIN pik_sources s ON s.source_id = e.source_id \
                 WHERE e.root_id = $1 ORDER BY e.created_at DESC, e.event_id DESC",
            )
            .bind(root_id)
            .fetch_all(&self.pool),
        )
        .await
    }

    pub async fn recent_events(
        &self,
        root_id: &str,
        limit: i64,
    ) -> Result<Vec<LedgerRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, LedgerRow>(
                "SELECT e.event_id, e.root_id, e.event_type, e.source_id, s.source_name, e.payload, e.changes_applied, e.created_at \
                 FROM pik_identity_events e LEFT JOIN pik_sources s ON s.source_id = e.source_id \
                 WHERE e.root_id = $1 ORDER BY e.created_at DESC, e.event_id DESC LIMIT $2",
            )
            .bind(root_id)
            .bind(limit)
            .fetch_all(&self.pool),
        )
        .await
    }

    pub async fn count_by_type(&self, root_id: &str, event_type: &str) -> Result<i64, StoreError> {
        self.timed(
            sqlx::query_scalar::<_, i64>(
                "SELECT count(*) FROM pik_identity_events WHERE root_id = $1 AND event_type = $2",
            )
            .bind(root_id)
            .bind(event_type)
            .fetch_one(&self.pool),
        )
        .await
    }

    pub async fn total_events(&self) -> Result<i64, StoreError> {
        self.timed(
            sqlx::query_scalar::<_, i64>("SELECT count(*) FROM pik_identity_events")
                .fetch_one(&self.pool),
        )
        .await
    }

    pub async fn counts_by_type(&self) -> Result<Vec<(String, i64)>, StoreError> {
        self.timed(
            sqlx::query_as::<_, (String, i64)>(
                "SELECT event_type, count(*) FROM pik_identity_events GROUP BY event_type ORDER BY event_type",
            )
            .fetch_all(&self.pool),
        )
        .await
    }
}
