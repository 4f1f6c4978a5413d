use chrono::{DateTime, Utc};
use pik_contracts::{EventRecord, LinkStatus, event_types};
use ulid::Ulid;

use crate::{Store, StoreError, append_event_tx};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SourceLinkRow {
    pub link_id: String,
    pub root_id: String,
    pub source_id: String,
    pub scope: String,
    pub status: String,
    pub granted_by: String,
    pub granted_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by: Option<String>,
}

impl SourceLinkRow {
    pub fn is_active(&self) -> bool {
        self.status == LinkStatus::Active.as_str()
    }
}

pub enum RevokeLinkOutcome {
    Revoked {
        link: SourceLinkRow,
        events: Vec<EventRecord>,
    },
    NotActive,
    NotFound,
}

impl Store {
    /// The partial unique index on `(root_id, source_id) WHERE status =
    /// 'active'` turns a racing duplicate grant into a unique violation the
    /// caller maps to a conflict.
    pub async fn grant_link(
        &self,
        root_id: &str,
        source_id: &str,
        scope: &str,
        granted_by: &str,
    ) -> Result<(SourceLinkRow, Vec<EventRecord>), StoreError> {
        let link_id = Ulid::new().to_string();

        self.timed(async {
            let mut tx = self.pool.begin().await?;

            let link = sqlx::query_as::<_, SourceLinkRow>(
                "INSERT INTO pik_source_links (link_id, root_id, source_id, scope, granted_by) VALUES ($1, $2, $3, $4, $5) RETURNING *",
            )
            .bind(&link_id)
            .bind(root_id)
            .bind(source_id)
            .bind(scope)
            .bind(granted_by)
            .fetch_one(&mut *tx)
            .await?;

            let event = append_event_tx(
                &mut tx,
                root_id,
                event_types::SOURCE_LINK_GRANTED,
                Some(source_id),
                serde_json::json!({
                    "link_id": link_id,
                    "scope": scope,
                    "granted_by": granted_by,
                }),
                None,
            )
            .await?;

            tx.commit().await?;
            Ok((link, vec![event]))
        })
        .await
    }

    pub async fn revoke_link(
        &self,
        root_id: &str,
        link_id: &str,
        revoked_by: Option<&str>,
    ) -> Result<RevokeLinkOutcome, StoreError> {
        self.timed(async {
            let mut tx = self.pool.begin().await?;

            let existing = sqlx::query_as::<_, SourceLinkRow>(
                "SELECT * FROM pik_source_links WHERE link_id = $1 AND root_id = $2 FOR UPDATE",
            )
            .bind(link_id)
            .bind(root_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(existing) = existing else {
                return Ok(RevokeLinkOutcome::NotFound);
            };
            if !existing.is_active() {
                return Ok(RevokeLinkOutcome::NotActive);
            }

            let link = sqlx::query_as::<_, SourceLinkRow>(
                "UPDATE pik_source_links SET status = 'revoked', revoked_at = now(), revoked_by = $2 WHERE link_id = $1 RETURNING *",
            )
            .bind(link_id)
            .bind(revoked_by)
            .fetch_one(&mut *tx)
            .await?;

            let event = append_event_tx(
                &mut tx,
                root_id,
                event_types::SOURCE_LINK_REVOKED,
                Some(&existing.source_id),
                serde_json::json!({
                    "link_id": link_id,
                    "revoked_by": revoked_by,
                }),
                None,
            )
            .await?;

            tx.commit().await?;
            Ok(RevokeLinkOutcome::Revoked {
                link,
                events: vec![event],
            })
        })
        .await
    }

    /// Consent probe run before every source mutation.
    pub async fn active_link(
        &self,
        root_id: &str,
        source_id: &str,
    ) -> Result<Option<SourceLinkRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, SourceLinkRow>(
                "SELECT * FROM pik_source_links WHERE root_id = $1 AND source_id = $2 AND status = 'active'",
            )
            .bind(root_id)
            .bind(source_id)
            .fetch_optional(&self.pool),
        )
        .await
    }

    pub async fn links(&self, root_id: &str) -> Result<Vec<SourceLinkRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, SourceLinkRow>(
                "SELECT * FROM pik_source_links WHERE root_id = $1 ORDER BY granted_at DESC",
            )
            .bind(root_id)
            .fetch_all(&self.pool),
        )
        .await
    }
}
