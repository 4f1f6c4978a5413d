use std::time::Duration;

use pik_contracts::ChallengeKind;
use pik_ledger::{
    EnrollmentWrite, NewAuthKey, NewChallenge, RegistrationTarget, RevokeKeyOutcome, Store,
};

fn test_db_url() -> Option<String> {
    std::env::var("PIK_TEST_DB_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn schema_db_url(base: &str, schema: &str) -> String {
    let separator = if base.contains('?') { "&" } else { "?" };
    format!("{base}{separator}options=-csearch_path%3D{schema}")
}

async fn create_test_schema(base_db_url: &str) -> (sqlx::PgPool, String, String) {
    let schema = format!("pik_test_{}", ulid::Ulid::new()).to_lowercase();
    let pool = sqlx::PgPool::connect(base_db_url)
        .await
        .expect("DB connect should succeed");

    let create_schema = format!("CREATE SCHEMA {}", schema);
    sqlx::query(&create_schema)
        .execute(&pool)
        .await
        .expect("create schema should succeed");

    let schema_url = schema_db_url(base_db_url, &schema);
    (pool, schema, schema_url)
}

async fn drop_test_schema(pool: &sqlx::PgPool, schema: &str) {
    let drop_schema = format!("DROP SCHEMA {} CASCADE", schema);
    let _ = sqlx::query(&drop_schema).execute(pool).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn migrations_apply_idempotently_and_ledger_is_append_only() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB migration test; set PIK_TEST_DB_URL to enable");
        return;
    };

    let (admin_pool, schema, schema_url) = create_test_schema(&db_url).await;

    let store = Store::connect_and_migrate(&schema_url, Duration::from_millis(2000))
        .await
        .expect("store init should succeed");
    store.migrate().await.expect("migrations should be idempotent");

    let record = store
        .enroll(EnrollmentWrite {
            hero_name: "Mira",
            fate_alignment: "Order",
            origin: None,
            enrolled_by: "test",
            link: None,
        })
        .await
        .expect("enroll should succeed");
    assert_eq!(record.events.len(), 1);
    let event_id = record.events[0].event_id.clone();

    assert_eq!(store.total_events().await.expect("total"), 1);
    assert_eq!(
        store
            .count_by_type(&record.root_id, "identity.enrolled")
            .await
            .expect("count by type"),
        1
    );
    let counts = store.counts_by_type().await.expect("counts by type");
    assert_eq!(counts, vec![("identity.enrolled".to_string(), 1)]);

    let timeline = store.timeline(&record.root_id).await.expect("timeline");
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].event_id, event_id);

    let update_err = sqlx::query(
        "UPDATE pik_identity_events SET event_type = 'tampered' WHERE event_id = $1",
    )
    .bind(&event_id)
    .execute(store.pool())
    .await
    .expect_err("ledger update must be rejected");
    assert!(
        format!("{update_err:?}").contains("append-only table"),
        "expected append-only error, got: {update_err:?}"
    );

    let delete_err = sqlx::query("DELETE FROM pik_identity_events WHERE event_id = $1")
        .bind(&event_id)
        .execute(store.pool())
        .await
        .expect_err("ledger delete must be rejected");
    assert!(
        format!("{delete_err:?}").contains("append-only table"),
        "expected append-only error, got: {delete_err:?}"
    );

    store.close().await;
    drop_test_schema(&admin_pool, &schema).await;
    admin_pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_active_link_per_pair_is_enforced() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB consent test; set PIK_TEST_DB_URL to enable");
        return;
    };

    let (admin_pool, schema, schema_url) = create_test_schema(&db_url).await;
    let store = Store::connect_and_migrate(&schema_url, Duration::from_millis(2000))
        .await
        .expect("store init should succeed");

    let record = store
        .enroll(EnrollmentWrite {
            hero_name: "Mira",
            fate_alignment: "Order",
            origin: None,
            enrolled_by: "test",
            link: None,
        })
        .await
        .expect("enroll should succeed");

    store
        .create_source("src-test-0001", "Test Source", &"0".repeat(64))
        .await
        .expect("source create should succeed");

    store
        .grant_link(&record.root_id, "src-test-0001", "progression.write", "test")
        .await
        .expect("first grant should succeed");

    let err = store
        .grant_link(&record.root_id, "src-test-0001", "progression.write", "test")
        .await
        .expect_err("duplicate active grant must fail");
    assert!(err.is_unique_violation(), "expected unique violation, got: {err:?}");

    // After revocation the pair can be granted again.
    let links = store.links(&record.root_id).await.expect("links read");
    let link_id = links[0].link_id.clone();
    store
        .revoke_link(&record.root_id, &link_id, Some("test"))
        .await
        .expect("revoke should succeed");
    store
        .grant_link(&record.root_id, "src-test-0001", "progression.write", "test")
        .await
        .expect("re-grant after revocation should succeed");

    store.close().await;
    drop_test_schema(&admin_pool, &schema).await;
    admin_pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn revoking_the_last_active_key_is_refused() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB key test; set PIK_TEST_DB_URL to enable");
        return;
    };

    let (admin_pool, schema, schema_url) = create_test_schema(&db_url).await;
    let store = Store::connect_and_migrate(&schema_url, Duration::from_millis(2000))
        .await
        .expect("store init should succeed");

    let record = store
        .enroll(EnrollmentWrite {
            hero_name: "Mira",
            fate_alignment: "Order",
            origin: None,
            enrolled_by: "test",
            link: None,
        })
        .await
        .expect("enroll should succeed");

    let passkey_json = serde_json::json!({"stub": true});
    let transports = serde_json::json!(["internal"]);
    let mut key_ids = Vec::new();
    for idx in 0..2 {
        let credential_id = format!("cred-{}-{}", ulid::Ulid::new(), idx);
        let registered = store
            .register_key(
                RegistrationTarget::Existing(&record.root_id),
                NewAuthKey {
                    credential_id: &credential_id,
                    passkey_json: &passkey_json,
                    sign_count: 0,
                    device_type: None,
                    transports: &transports,
                    friendly_name: Some("test key"),
                },
            )
            .await
            .expect("key registration should succeed");
        key_ids.push(registered.key_id);
    }

    match store
        .revoke_key(&record.root_id, &key_ids[0])
        .await
        .expect("first revoke should run")
    {
        RevokeKeyOutcome::Revoked { events } => assert_eq!(events.len(), 1),
        _ => panic!("revoking one of two keys must succeed"),
    }

    match store
        .revoke_key(&record.root_id, &key_ids[1])
        .await
        .expect("second revoke should run")
    {
        RevokeKeyOutcome::LastActiveKey => {}
        _ => panic!("revoking the last active key must be refused"),
    }

    let keys = store.list_keys(&record.root_id).await.expect("list keys");
    assert_eq!(keys.iter().filter(|k| k.is_active()).count(), 1);

    match store
        .revoke_key(&record.root_id, &key_ids[0])
        .await
        .expect("repeat revoke should run")
    {
        RevokeKeyOutcome::AlreadyRevoked => {}
        _ => panic!("re-revoking a revoked key must report it"),
    }

    store.close().await;
    drop_test_schema(&admin_pool, &schema).await;
    admin_pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn challenge_take_is_single_use() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB challenge test; set PIK_TEST_DB_URL to enable");
        return;
    };

    let (admin_pool, schema, schema_url) = create_test_schema(&db_url).await;
    let store = Store::connect_and_migrate(&schema_url, Duration::from_millis(2000))
        .await
        .expect("store init should succeed");

    let challenge = format!("chal_{}", ulid::Ulid::new());
    store
        .create_challenge(NewChallenge {
            challenge: &challenge,
            kind: ChallengeKind::Registration,
            root_id: None,
            metadata: serde_json::json!({"purpose": "enroll"}),
            expires_at: chrono::Utc::now() + chrono::Duration::minutes(5),
        })
        .await
        .expect("challenge create should succeed");

    let first = store
        .take_challenge(&challenge)
        .await
        .expect("first take should succeed");
    assert!(first.is_some());
    assert_eq!(first.unwrap().challenge_type, "registration");

    let second = store
        .take_challenge(&challenge)
        .await
        .expect("second take should succeed");
    assert!(second.is_none(), "a consumed challenge must stay consumed");

    store.close().await;
    drop_test_schema(&admin_pool, &schema).await;
    admin_pool.close().await;
}
