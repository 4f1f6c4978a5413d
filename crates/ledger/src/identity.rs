use chrono::{DateTime, Utc};
use pik_contracts::{EventRecord, IdentityStatus, event_types};
use ulid::Ulid;

use crate::{Store, StoreError, append_event_tx};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RootIdentityRow {
    pub root_id: String,
    pub hero_name: String,
    pub fate_alignment: String,
    pub origin: Option<String>,
    pub fate_xp: i64,
    pub fate_level: i64,
    pub status: String,
    pub enrolled_by: String,
    pub enrolled_at: DateTime<Utc>,
    pub equipped_title_id: Option<String>,
}

impl RootIdentityRow {
    pub fn is_active(&self) -> bool {
        self.status == IdentityStatus::Active.as_str()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserSummaryRow {
    pub root_id: String,
    pub hero_name: String,
    pub fate_alignment: String,
    pub fate_xp: i64,
    pub fate_level: i64,
    pub status: String,
    pub active_sources: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PersonaRow {
    pub persona_id: String,
    pub root_id: String,
    pub display_name: String,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserTitleRow {
    pub title_id: String,
    pub title_name: String,
    pub description: Option<String>,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct LinkSpec<'a> {
    pub source_id: &'a str,
    pub granted_by: &'a str,
    pub scope: &'a str,
}

pub struct EnrollmentWrite<'a> {
    pub hero_name: &'a str,
    pub fate_alignment: &'a str,
    pub origin: Option<&'a str>,
    pub enrolled_by: &'a str,
    pub link: Option<LinkSpec<'a>>,
}

pub struct EnrollmentRecord {
    pub root_id: String,
    pub persona_id: String,
    pub link_id: Option<String>,
    pub enrolled_at: DateTime<Utc>,
    pub events: Vec<EventRecord>,
}

pub struct ProfileUpdate<'a> {
    pub hero_name: Option<&'a str>,
    pub fate_alignment: Option<&'a str>,
    pub origin: Option<&'a str>,
}

pub enum EquipTitleOutcome {
    Updated {
        equipped_title_id: Option<String>,
        events: Vec<EventRecord>,
    },
    TitleNotHeld,
    RootNotFound,
}

impl Store {
    pub async fn enroll(&self, write: EnrollmentWrite<'_>) -> Result<EnrollmentRecord, StoreError> {
        let root_id = Ulid::new().to_string();
        let persona_id = Ulid::new().to_string();
        let enrolled_at = Utc::now();

        self.timed(async {
            let mut tx = self.pool.begin().await?;
            let mut events = Vec::new();

            sqlx::query(
                "INSERT INTO pik_root_identities (root_id, hero_name, fate_alignment, origin, enrolled_by, enrolled_at) VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&root_id)
            .bind(write.hero_name)
            .bind(write.fate_alignment)
            .bind(write.origin)
            .bind(write.enrolled_by)
            .bind(enrolled_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO pik_personas (persona_id, root_id, display_name, is_primary) VALUES ($1, $2, $3, TRUE)",
            )
            .bind(&persona_id)
            .bind(&root_id)
            .bind(write.hero_name)
            .execute(&mut *tx)
            .await?;

            events.push(
                append_event_tx(
                    &mut tx,
                    &root_id,
                    event_types::IDENTITY_ENROLLED,
                    None,
                    serde_json::json!({
                        "hero_name": write.hero_name,
                        "fate_alignment": write.fate_alignment,
                        "origin": write.origin,
                        "enrolled_by": write.enrolled_by,
                    }),
                    None,
                )
                .await?,
            );

            let mut link_id = None;
            if let Some(link) = write.link {
                let id = Ulid::new().to_string();
                sqlx::query(
                    "INSERT INTO pik_source_links (link_id, root_id, source_id, scope, granted_by) VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(&id)
                .bind(&root_id)
                .bind(link.source_id)
                .bind(link.scope)
                .bind(link.granted_by)
                .execute(&mut *tx)
                .await?;

                events.push(
                    append_event_tx(
                        &mut tx,
                        &root_id,
                        event_types::SOURCE_LINK_GRANTED,
                        Some(link.source_id),
                        serde_json::json!({
                            "link_id": id,
                            "scope": link.scope,
                            "granted_by": link.granted_by,
                        }),
                        None,
                    )
                    .await?,
                );
                link_id = Some(id);
            }

            tx.commit().await?;

            Ok(EnrollmentRecord {
                root_id: root_id.clone(),
                persona_id: persona_id.clone(),
                link_id,
                enrolled_at,
                events,
            })
        })
        .await
    }

    pub async fn get_root(&self, root_id: &str) -> Result<Option<RootIdentityRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, RootIdentityRow>(
                "SELECT * FROM pik_root_identities WHERE root_id = $1",
            )
            .bind(root_id)
            .fetch_optional(&self.pool),
        )
        .await
    }

    pub async fn list_users(&self) -> Result<Vec<UserSummaryRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, UserSummaryRow>(
                "SELECT r.root_id, r.hero_name, r.fate_alignment, r.fate_xp, r.fate_level, r.status, \
                 (SELECT count(*) FROM pik_source_links l WHERE l.root_id = r.root_id AND l.status = 'active') AS active_sources \
                 FROM pik_root_identities r ORDER BY r.enrolled_at DESC",
            )
            .fetch_all(&self.pool),
        )
        .await
    }

    pub async fn personas(&self, root_id: &str) -> Result<Vec<PersonaRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, PersonaRow>(
                "SELECT * FROM pik_personas WHERE root_id = $1 ORDER BY created_at ASC",
            )
            .bind(root_id)
            .fetch_all(&self.pool),
        )
        .await
    }

    pub async fn user_titles(&self, root_id: &str) -> Result<Vec<UserTitleRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, UserTitleRow>(
                "SELECT ut.title_id, t.title_name, t.description, ut.granted_at \
                 FROM pik_user_titles ut JOIN pik_titles t ON t.title_id = ut.title_id \
                 WHERE ut.root_id = $1 ORDER BY ut.granted_at ASC",
            )
            .bind(root_id)
            .fetch_all(&self.pool),
        )
        .await
    }

    pub async fn update_profile(
        &self,
        root_id: &str,
        update: ProfileUpdate<'_>,
    ) -> Result<Option<(RootIdentityRow, Vec<EventRecord>)>, StoreError> {
        self.timed(async {
            let mut tx = self.pool.begin().await?;

            let row = sqlx::query_as::<_, RootIdentityRow>(
                "UPDATE pik_root_identities SET \
                 hero_name = COALESCE($2, hero_name), \
                 fate_alignment = COALESCE($3, fate_alignment), \
                 origin = COALESCE($4, origin) \
                 WHERE root_id = $1 RETURNING *",
            )
            .bind(root_id)
            .bind(update.hero_name)
            .bind(update.fate_alignment)
            .bind(update.origin)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };

            let event = append_event_tx(
                &mut tx,
                root_id,
                event_types::IDENTITY_PROFILE_UPDATED,
                None,
                serde_json::json!({
                    "hero_name": update.hero_name,
                    "fate_alignment": update.fate_alignment,
                    "origin": update.origin,
                }),
                None,
            )
            .await?;

            tx.commit().await?;
            Ok(Some((row, vec![event])))
        })
        .await
    }

    pub async fn set_equipped_title(
        &self,
        root_id: &str,
        title_id: Option<&str>,
    ) -> Result<EquipTitleOutcome, StoreError> {
        self.timed(async {
            let mut tx = self.pool.begin().await?;

            if let Some(title_id) = title_id {
                let held = sqlx::query_scalar::<_, i64>(
                    "SELECT count(*) FROM pik_user_titles WHERE root_id = $1 AND title_id = $2",
                )
                .bind(root_id)
                .bind(title_id)
                .fetch_one(&mut *tx)
                .await?;

                if held == 0 {
                    return Ok(EquipTitleOutcome::TitleNotHeld);
                }
            }

            let updated = sqlx::query(
                "UPDATE pik_root_identities SET equipped_title_id = $2 WHERE root_id = $1",
            )
            .bind(root_id)
            .bind(title_id)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                return Ok(EquipTitleOutcome::RootNotFound);
            }

            let event = append_event_tx(
                &mut tx,
                root_id,
                event_types::IDENTITY_TITLE_EQUIPPED,
                None,
                serde_json::json!({ "title_id": title_id }),
                None,
            )
            .await?;

            tx.commit().await?;
            Ok(EquipTitleOutcome::Updated {
                equipped_title_id: title_id.map(|t| t.to_string()),
                events: vec![event],
            })
        })
        .await
    }
}
