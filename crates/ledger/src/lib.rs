use std::time::Duration;

use chrono::Utc;
use pik_contracts::EventRecord;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use ulid::Ulid;

mod consent;
mod events;
mod identity;
mod keys;
mod loot;
mod progress;
mod sources;

pub use consent::{RevokeLinkOutcome, SourceLinkRow};
pub use events::LedgerRow;
pub use identity::{
    EnrollmentRecord, EnrollmentWrite, EquipTitleOutcome, LinkSpec, PersonaRow, ProfileUpdate,
    RootIdentityRow, UserSummaryRow, UserTitleRow,
};
pub use keys::{
    AuthKeyRow, ChallengeRow, FirstTimeEnrollment, NewAuthKey, NewChallenge, RegistrationRecord,
    RegistrationTarget, RevokeKeyOutcome,
};
pub use loot::{
    CacheRow, EquipmentRow, GearItemRow, InventoryRow, LootTableRow, MarkerRow, OpenCacheWrite,
    OpenedCache,
};
pub use progress::{ConfigRow, TitleGrant, XpEventWrite};
pub use sources::SourceRow;

#[derive(Debug)]
pub enum StoreError {
    Timeout,
    Sqlx(sqlx::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Timeout => write!(f, "store operation timed out"),
            StoreError::Sqlx(err) => write!(f, "store sql error: {}", err),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Sqlx(value)
    }
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        match self {
            StoreError::Sqlx(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}

/// Transactional persistence for the identity kernel. Every choreography that
/// touches more than one table is a single method owning a single
/// transaction; callers publish the returned `EventRecord`s only after the
/// method returns.
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: PgPool,
    write_timeout: Duration,
}

impl Store {
    pub async fn connect(db_url: &str, write_timeout: Duration) -> Result<Self, StoreError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(Self {
            pool,
            write_timeout,
        })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        write_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let store = Self::connect(db_url, write_timeout).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) async fn timed<T>(
        &self,
        fut: impl Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.write_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(StoreError::from)
    }
}

/// Appends one ledger row inside the caller's transaction and returns the
/// projection to publish after commit.
pub(crate) async fn append_event_tx(
    tx: &mut Transaction<'_, Postgres>,
    root_id: &str,
    event_type: &str,
    source_id: Option<&str>,
    payload: serde_json::Value,
    changes: Option<serde_json::Value>,
) -> Result<EventRecord, sqlx::Error> {
    let event_id = Ulid::new().to_string();
    let created_at = Utc::now();

    sqlx::query(
        "INSERT INTO pik_identity_events (event_id, root_id, event_type, source_id, payload, changes_applied, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(&event_id)
    .bind(root_id)
    .bind(event_type)
    .bind(source_id)
    .bind(&payload)
    .bind(&changes)
    .bind(created_at)
    .execute(&mut **tx)
    .await?;

    Ok(EventRecord {
        event_id,
        root_id: root_id.to_string(),
        event_type: event_type.to_string(),
        source_id: source_id.map(|s| s.to_string()),
        payload,
        changes,
        created_at,
    })
}

pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn migrate_url(db_url: &str) -> Result<(), sqlx::Error> {
    let pool = PgPool::connect(db_url).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}
