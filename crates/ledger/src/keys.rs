use chrono::{DateTime, Utc};
use pik_contracts::{ChallengeKind, EventRecord, KeyStatus, event_types};
use ulid::Ulid;

use crate::identity::LinkSpec;
use crate::{Store, StoreError, append_event_tx};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChallengeRow {
    pub challenge: String,
    pub challenge_type: String,
    pub root_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub expires_at: DateTime<Utc>,
}

impl ChallengeRow {
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }

    pub fn kind(&self) -> Option<ChallengeKind> {
        ChallengeKind::parse(&self.challenge_type)
    }
}

pub struct NewChallenge<'a> {
    pub challenge: &'a str,
    pub kind: ChallengeKind,
    pub root_id: Option<&'a str>,
    pub metadata: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuthKeyRow {
    pub key_id: String,
    pub root_id: String,
    pub credential_id: String,
    pub passkey_json: serde_json::Value,
    pub sign_count: i64,
    pub device_type: Option<String>,
    pub backed_up: bool,
    pub transports: serde_json::Value,
    pub friendly_name: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl AuthKeyRow {
    pub fn is_active(&self) -> bool {
        self.status == KeyStatus::Active.as_str()
    }
}

pub struct NewAuthKey<'a> {
    pub credential_id: &'a str,
    pub passkey_json: &'a serde_json::Value,
    pub sign_count: i64,
    pub device_type: Option<&'a str>,
    pub transports: &'a serde_json::Value,
    pub friendly_name: Option<&'a str>,
}

pub struct FirstTimeEnrollment<'a> {
    pub hero_name: &'a str,
    pub fate_alignment: &'a str,
    pub origin: Option<&'a str>,
    pub enrolled_by: &'a str,
    pub link: Option<LinkSpec<'a>>,
}

pub enum RegistrationTarget<'a> {
    NewIdentity(FirstTimeEnrollment<'a>),
    Existing(&'a str),
}

pub struct RegistrationRecord {
    pub root_id: String,
    pub persona_id: Option<String>,
    pub key_id: String,
    pub link_id: Option<String>,
    pub events: Vec<EventRecord>,
}

pub enum RevokeKeyOutcome {
    Revoked { events: Vec<EventRecord> },
    LastActiveKey,
    AlreadyRevoked,
    NotFound,
}

impl Store {
    pub async fn create_challenge(&self, write: NewChallenge<'_>) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query(
                "INSERT INTO pik_webauthn_challenges (challenge, challenge_type, root_id, metadata, expires_at) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(write.challenge)
            .bind(write.kind.as_str())
            .bind(write.root_id)
            .bind(&write.metadata)
            .bind(write.expires_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Consumes a challenge: at most one caller ever receives the row.
    pub async fn take_challenge(&self, challenge: &str) -> Result<Option<ChallengeRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, ChallengeRow>(
                "DELETE FROM pik_webauthn_challenges WHERE challenge = $1 RETURNING *",
            )
            .bind(challenge)
            .fetch_optional(&self.pool),
        )
        .await
    }

    pub async fn register_key(
        &self,
        target: RegistrationTarget<'_>,
        key: NewAuthKey<'_>,
    ) -> Result<RegistrationRecord, StoreError> {
        let key_id = Ulid::new().to_string();

        self.timed(async {
            let mut tx = self.pool.begin().await?;
            let mut events = Vec::new();
            let mut persona_id = None;
            let mut link_id = None;

            let root_id = match &target {
                RegistrationTarget::Existing(root_id) => root_id.to_string(),
                RegistrationTarget::NewIdentity(enroll) => {
                    let root_id = Ulid::new().to_string();
                    let new_persona_id = Ulid::new().to_string();

                    sqlx::query(
                        "INSERT INTO pik_root_identities (root_id, hero_name, fate_alignment, origin, enrolled_by) VALUES ($1, $2, $3, $4, $5)",
                    )
                    .bind(&root_id)
                    .bind(enroll.hero_name)
                    .bind(enroll.fate_alignment)
                    .bind(enroll.origin)
                    .bind(enroll.enrolled_by)
                    .execute(&mut *tx)
                    .await?;

                    sqlx::query(
                        "INSERT INTO pik_personas (persona_id, root_id, display_name, is_primary) VALUES ($1, $2, $3, TRUE)",
                    )
                    .bind(&new_persona_id)
                    .bind(&root_id)
                    .bind(enroll.hero_name)
                    .execute(&mut *tx)
                    .await?;

                    events.push(
                        append_event_tx(
                            &mut tx,
                            &root_id,
                            event_types::IDENTITY_ENROLLED,
                            None,
                            serde_json::json!({
                                "hero_name": enroll.hero_name,
                                "fate_alignment": enroll.fate_alignment,
                                "origin": enroll.origin,
                                "enrolled_by": enroll.enrolled_by,
                            }),
                            None,
                        )
                        .await?,
                    );

                    persona_id = Some(new_persona_id);
                    root_id
                }
            };

            sqlx::query(
                "INSERT INTO pik_auth_keys (key_id, root_id, credential_id, passkey_json, sign_count, device_type, transports, friendly_name) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(&key_id)
            .bind(&root_id)
            .bind(key.credential_id)
            .bind(key.passkey_json)
            .bind(key.sign_count)
            .bind(key.device_type)
            .bind(key.transports)
            .bind(key.friendly_name)
            .execute(&mut *tx)
            .await?;

            events.push(
                append_event_tx(
                    &mut tx,
                    &root_id,
                    event_types::KEY_REGISTERED,
                    None,
                    serde_json::json!({
                        "key_id": key_id,
                        "credential_id": key.credential_id,
                        "friendly_name": key.friendly_name,
                    }),
                    None,
                )
                .await?,
            );

            if let RegistrationTarget::NewIdentity(enroll) = &target
                && let Some(link) = enroll.link
            {
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

            Ok(RegistrationRecord {
                root_id,
                persona_id,
                key_id: key_id.clone(),
                link_id,
                events,
            })
        })
        .await
    }

    pub async fn active_keys(&self, root_id: &str) -> Result<Vec<AuthKeyRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, AuthKeyRow>(
                "SELECT * FROM pik_auth_keys WHERE root_id = $1 AND status = 'active' ORDER BY created_at DESC",
            )
            .bind(root_id)
            .fetch_all(&self.pool),
        )
        .await
    }

    pub async fn list_keys(&self, root_id: &str) -> Result<Vec<AuthKeyRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, AuthKeyRow>(
                "SELECT * FROM pik_auth_keys WHERE root_id = $1 ORDER BY created_at DESC",
            )
            .bind(root_id)
            .fetch_all(&self.pool),
        )
        .await
    }

    pub async fn find_key_by_credential(
        &self,
        credential_id: &str,
    ) -> Result<Option<AuthKeyRow>, StoreError> {
        self.timed(
            sqlx::query_as::<_, AuthKeyRow>(
                "SELECT * FROM pik_auth_keys WHERE credential_id = $1",
            )
            .bind(credential_id)
            .fetch_optional(&self.pool),
        )
        .await
    }

    /// Persists the post-assertion credential state and the
    /// `identity.authenticated` ledger row in one transaction.
    pub async fn record_authentication(
        &self,
        key_id: &str,
        root_id: &str,
        passkey_json: &serde_json::Value,
        sign_count: i64,
        backed_up: bool,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.timed(async {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                "UPDATE pik_auth_keys SET passkey_json = $2, sign_count = $3, backed_up = $4, last_used_at = now() WHERE key_id = $1",
            )
            .bind(key_id)
            .bind(passkey_json)
            .bind(sign_count)
            .bind(backed_up)
            .execute(&mut *tx)
            .await?;

            let event = append_event_tx(
                &mut tx,
                root_id,
                event_types::IDENTITY_AUTHENTICATED,
                None,
                serde_json::json!({ "key_id": key_id, "method": "passkey" }),
                None,
            )
            .await?;

            tx.commit().await?;
            Ok(vec![event])
        })
        .await
    }

    /// Refuses to leave an active identity without any active key.
    pub async fn revoke_key(
        &self,
        root_id: &str,
        key_id: &str,
    ) -> Result<RevokeKeyOutcome, StoreError> {
        self.timed(async {
            let mut tx = self.pool.begin().await?;

            let keys = sqlx::query_as::<_, AuthKeyRow>(
                "SELECT * FROM pik_auth_keys WHERE root_id = $1 FOR UPDATE",
            )
            .bind(root_id)
            .fetch_all(&mut *tx)
            .await?;

            let Some(target) = keys.iter().find(|k| k.key_id == key_id) else {
                return Ok(RevokeKeyOutcome::NotFound);
            };
            if !target.is_active() {
                return Ok(RevokeKeyOutcome::AlreadyRevoked);
            }
            if keys.iter().filter(|k| k.is_active()).count() <= 1 {
                return Ok(RevokeKeyOutcome::LastActiveKey);
            }

            sqlx::query(
                "UPDATE pik_auth_keys SET status = 'revoked', revoked_at = now() WHERE key_id = $1",
            )
            .bind(key_id)
            .execute(&mut *tx)
            .await?;

            let event = append_event_tx(
                &mut tx,
                root_id,
                event_types::KEY_REVOKED,
                None,
                serde_json::json!({ "key_id": key_id }),
                None,
            )
            .await?;

            tx.commit().await?;
            Ok(RevokeKeyOutcome::Revoked {
                events: vec![event],
            })
        })
        .await
    }

    pub async fn insert_session_token(
        &self,
        token_hash: &str,
        root_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query(
                "INSERT INTO pik_session_tokens (token_hash, root_id, expires_at) VALUES ($1, $2, $3)",
            )
            .bind(token_hash)
            .bind(root_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn resolve_session_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<String>, StoreError> {
        self.timed(
            sqlx::query_scalar::<_, String>(
                "SELECT root_id FROM pik_session_tokens WHERE token_hash = $1 AND expires_at > now()",
            )
            .bind(token_hash)
            .fetch_optional(&self.pool),
        )
        .await
    }

    /// Reaper sweep: drops expired challenges and session tokens. Returns the
    /// deleted counts.
    pub async fn delete_expired(&self) -> Result<(u64, u64), StoreError> {
        self.timed(async {
            let challenges =
                sqlx::query("DELETE FROM pik_webauthn_challenges WHERE expires_at < now()")
                    .execute(&self.pool)
                    .await?
                    .rows_affected();
            let tokens = sqlx::query("DELETE FROM pik_session_tokens WHERE expires_at < now()")
                .execute(&self.pool)
                .await?
                .rows_affected();
            Ok((challenges, tokens))
        })
        .await
    }
}
