use chrono::{DateTime, Utc};
use pik_contracts::SourceStatus;

use crate::{Store, StoreError};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SourceRow {
    pub source_id: String,
    pub source_name: String,
    pub status: String,
    pub api_key_hash: String,
    pub created_at: DateTime<Utc>,
}

impl SourceRow {
    pub fn is_active(&self) -> bool {
        self.status == SourceStatus::Active.as_str()
    }
}

impl Store {
    pub async fn create_source(
        &self,
        source_id: &str,
        source_name: &str,
        api_key_hash: &str,
    ) -> Result<SourceRow, StoreError> {
        self.timed(
            sqlx::query_as::<_, SourceRow>(
                "INSERT INTO pik_sources (source_id, source_name, api_key_hash) VALUES ($1, $2, $3) RETURNING *",
            )
            .bind(source_id)
            .bind(source_name)
            .bind(api_key_hash)
            .fetch_one(&self.pool),
        )
        .await
    }

    pub async fn get_source(&self, source_id: &str) -> Result<Option<SourceRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, SourceRow>("SELECT * FROM pik_sources WHERE source_id = $1")
                .bind(source_id)
                .fetch_optional(&self.pool),
        )
        .await
    }

    pub async fn list_sources(&self) -> Result<Vec<SourceRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, SourceRow>("SELECT * FROM pik_sources ORDER BY created_at ASC")
                .fetch_all(&self.pool),
        )
        .await
    }

    /// Atomic hash swap: the previous key stops authenticating at commit.
    pub async fn rotate_source_key(
        &self,
        source_id: &str,
        api_key_hash: &str,
    ) -> Result<bool, StoreError> {
        self.timed(async {
            let result = sqlx::query("UPDATE pik_sources SET api_key_hash = $2 WHERE source_id = $1")
                .bind(source_id)
                .bind(api_key_hash)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    pub async fn set_source_status(
        &self,
        source_id: &str,
        status: SourceStatus,
    ) -> Result<Option<SourceRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, SourceRow>(
                "UPDATE pik_sources SET status = $2 WHERE source_id = $1 RETURNING *",
            )
            .bind(source_id)
            .bind(status.as_str())
            .fetch_optional(&self.pool),
        )
        .await
    }

    /// API-key guard lookup: full-hash index match, active sources only.
    pub async fn find_active_source_by_key_hash(
        &self,
        api_key_hash: &str,
    ) -> Result<Option<SourceRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, SourceRow>(
                "SELECT * FROM pik_sources WHERE api_key_hash = $1 AND status = 'active'",
            )
            .bind(api_key_hash)
            .fetch_optional(&self.pool),
        )
        .await
    }
}
