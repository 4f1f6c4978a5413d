use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use sqlx::PgPool;

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

async fn create_test_schema(base_db_url: &str) -> (PgPool, String, String) {
    let schema = format!("pik_e2e_{}", ulid::Ulid::new()).to_lowercase();
    let pool = PgPool::connect(base_db_url)
        .await
        .expect("db should be reachable for schema create");

    let create_schema = format!("CREATE SCHEMA {}", schema);
    sqlx::query(&create_schema)
        .execute(&pool)
        .await
        .expect("create schema should succeed");

    let schema_url = schema_db_url(base_db_url, &schema);
    (pool, schema, schema_url)
}

async fn drop_test_schema(pool: &PgPool, schema: &str) {
    let drop_schema = format!("DROP SCHEMA {} CASCADE", schema);
    let _ = sqlx::query(&drop_schema).execute(pool).await;
}

async fn spawn_gateway(schema_url: &str) -> (SocketAddr, pik_gateway::http::AppState) {
    let config = pik_gateway::config::GatewayConfig::from_kv(&HashMap::from([
        ("DATABASE_URL".to_string(), schema_url.to_string()),
        ("PIK_RATE_DEFAULT_PER_MIN".to_string(), "0".to_string()),
        ("PIK_RATE_INGEST_PER_MIN".to_string(), "0".to_string()),
        ("PIK_RATE_AUTH_PER_MIN".to_string(), "0".to_string()),
    ]))
    .expect("gateway config should parse");

    let (app, state) = pik_gateway::http::router(config)
        .await
        .expect("router should initialize");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("ephemeral bind should succeed");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await;
    });

    (addr, state)
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    body: serde_json::Value,
) -> (u16, serde_json::Value) {
    let response = client
        .post(url)
        .json(&body)
        .send()
        .await
        .expect("request should send");
    let status = response.status().as_u16();
    let body = response.json::<serde_json::Value>().await.unwrap_or_default();
    (status, body)
}

async fn get_json(client: &reqwest::Client, url: &str) -> (u16, serde_json::Value) {
    let response = client.get(url).send().await.expect("request should send");
    let status = response.status().as_u16();
    let body = response.json::<serde_json::Value>().await.unwrap_or_default();
    (status, body)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_enroll_ingest_revoke_and_open_cache() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping e2e smoke test; set PIK_TEST_DB_URL to enable");
        return;
    };

    let (admin_pool, schema, schema_url) = create_test_schema(&db_url).await;
    let (addr, _state) = spawn_gateway(&schema_url).await;
    let base = format!("http://{addr}");
    let client = reqwest::Client::new();

    // Register a source; the plaintext API key is only returned here.
    let (status, body) = post_json(
        &client,
        &format!("{base}/api/sources"),
        serde_json::json!({
            "source_id": "src-heroes-veritas-01",
            "source_name": "Heroes' Veritas",
        }),
    )
    .await;
    assert_eq!(status, 200, "source create failed: {body}");
    let api_key = body["data"]["api_key"].as_str().expect("api_key").to_string();
    assert!(api_key.starts_with("pik_"));

    // Operator enrollment with an initial consent link.
    let (status, body) = post_json(
        &client,
        &format!("{base}/api/users/enroll"),
        serde_json::json!({
            "hero_name": "Mira",
            "fate_alignment": "Order",
            "enrolled_by": "ops-console",
            "source_id": "src-heroes-veritas-01",
        }),
    )
    .await;
    assert_eq!(status, 200, "enroll failed: {body}");
    let root_id = body["data"]["root_id"].as_str().expect("root_id").to_string();
    let link_id = body["data"]["link_id"].as_str().expect("link_id").to_string();

    // Subscribe to the live stream before mutating.
    let sse_buffer = Arc::new(Mutex::new(String::new()));
    {
        let sse_buffer = sse_buffer.clone();
        let stream_url = format!("{base}/api/events/stream");
        let sse_client = reqwest::Client::new();
        tokio::spawn(async move {
            let Ok(response) = sse_client.get(&stream_url).send().await else {
                return;
            };
            let mut stream = response.bytes_stream();
            while let Some(Ok(chunk)) = stream.next().await {
                let mut buffer = sse_buffer.lock().expect("sse buffer lock");
                buffer.push_str(&String::from_utf8_lossy(&chunk));
            }
        });
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Seed 195 XP, then complete a plain session: 100 XP and a level-up.
    let (status, body) = client
        .post(format!("{base}/api/ingest"))
        .header("X-PIK-API-Key", &api_key)
        .json(&serde_json::json!({
            "root_id": root_id,
            "event_type": "progression.xp_granted",
            "payload": { "xp": 195 },
        }))
        .send()
        .await
        .map(|r| (r.status().as_u16(), r.json::<serde_json::Value>()))
        .expect("ingest should send");
    let body = body.await.unwrap_or_default();
    assert_eq!(status, 200, "xp ingest failed: {body}");
    assert_eq!(body["data"]["changes_applied"]["total_xp"], 195);

    let (status, body) = client
        .post(format!("{base}/api/ingest"))
        .header("X-PIK-API-Key", &api_key)
        .json(&serde_json::json!({
            "root_id": root_id,
            "event_type": "progression.session_completed",
            "session_ref": "hv-session-0001",
            "payload": { "difficulty": "normal", "nodes_completed": 0, "boss_damage_pct": 0 },
        }))
        .send()
        .await
        .map(|r| (r.status().as_u16(), r.json::<serde_json::Value>()))
        .expect("ingest should send");
    let body = body.await.unwrap_or_default();
    assert_eq!(status, 200, "session ingest failed: {body}");
    let changes = &body["data"]["changes_applied"];
    assert_eq!(changes["session_xp"], 100);
    assert_eq!(changes["boss_bonus_xp"], 0);
    assert_eq!(changes["node_xp"], 0);
    assert_eq!(changes["total_xp"], 100);
    assert_eq!(changes["level_up"]["from"], 1);
    assert_eq!(changes["level_up"]["to"], 2);

    // The user is now level 2, holds the level title, and owns a sealed cache.
    let (status, body) = get_json(&client, &format!("{base}/api/users/{root_id}")).await;
    assert_eq!(status, 200);
    let progression = &body["data"]["progression"];
    assert_eq!(progression["fate_xp"], 295);
    assert_eq!(progression["fate_level"], 2);
    assert!(
        progression["titles"]
            .as_array()
            .expect("titles")
            .iter()
            .any(|t| t == "title_fate_awakened"),
        "expected level title, got: {progression}"
    );
    let caches = body["data"]["fate_caches"].as_array().expect("caches");
    let sealed = caches
        .iter()
        .find(|c| c["cache_type"] == "level_up" && c["status"] == "sealed")
        .expect("sealed level_up cache");
    let cache_id = sealed["cache_id"].as_str().expect("cache_id").to_string();

    // The subscriber observed the session event.
    let mut observed = false;
    for _ in 0..20 {
        if sse_buffer
            .lock()
            .expect("sse buffer lock")
            .contains("progression.session_completed")
        {
            observed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(observed, "SSE subscriber never saw the session event");
    assert!(
        sse_buffer
            .lock()
            .expect("sse buffer lock")
            .contains("event: connected"),
        "SSE stream is missing the connected preamble"
    );

    // Revoking consent blocks the very next ingest.
    let response = client
        .delete(format!("{base}/api/users/{root_id}/links/{link_id}"))
        .json(&serde_json::json!({ "revoked_by": "ops-console" }))
        .send()
        .await
        .expect("revoke should send");
    assert_eq!(response.status().as_u16(), 200);

    let (status, body) = client
        .post(format!("{base}/api/ingest"))
        .header("X-PIK-API-Key", &api_key)
        .json(&serde_json::json!({
            "root_id": root_id,
            "event_type": "progression.session_completed",
            "payload": { "difficulty": "normal", "nodes_completed": 0, "boss_damage_pct": 0 },
        }))
        .send()
        .await
        .map(|r| (r.status().as_u16(), r.json::<serde_json::Value>()))
        .expect("ingest should send");
    let body = body.await.unwrap_or_default();
    assert_eq!(status, 403, "ingest after revocation must be forbidden");
    assert_eq!(body["status"], "error");
    assert_eq!(body["message"], "No active consent link");

    // A bogus API key is indistinguishable from a suspended one.
    let (status, body) = client
        .post(format!("{base}/api/ingest"))
        .header("X-PIK-API-Key", format!("pik_{}", "0".repeat(48)))
        .json(&serde_json::json!({
            "root_id": root_id,
            "event_type": "progression.xp_granted",
            "payload": { "xp": 1 },
        }))
        .send()
        .await
        .map(|r| (r.status().as_u16(), r.json::<serde_json::Value>()))
        .expect("ingest should send");
    let body = body.await.unwrap_or_default();
    assert_eq!(status, 403);
    assert_eq!(body["message"], "Invalid API key");

    // Impersonate (development mode) to open the level-up cache.
    let (status, body) = post_json(
        &client,
        &format!("{base}/api/auth/impersonate/{root_id}"),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, 200, "impersonation failed: {body}");
    let session_token = body["data"]["session_token"]
        .as_str()
        .expect("session_token")
        .to_string();

    let (status, body) = client
        .post(format!("{base}/api/users/{root_id}/caches/{cache_id}/open"))
        .bearer_auth(&session_token)
        .send()
        .await
        .map(|r| (r.status().as_u16(), r.json::<serde_json::Value>()))
        .expect("open should send");
    let body = body.await.unwrap_or_default();
    assert_eq!(status, 200, "cache open failed: {body}");
    assert_eq!(body["data"]["status"], "opened");
    assert!(body["data"]["reward"]["reward_type"].is_string());

    // Opening twice conflicts.
    let (status, body) = client
        .post(format!("{base}/api/users/{root_id}/caches/{cache_id}/open"))
        .bearer_auth(&session_token)
        .send()
        .await
        .map(|r| (r.status().as_u16(), r.json::<serde_json::Value>()))
        .expect("open should send");
    let body = body.await.unwrap_or_default();
    assert_eq!(status, 409, "second open must conflict: {body}");

    drop_test_schema(&admin_pool, &schema).await;
    admin_pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_config_updates_reach_the_next_ingest() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping e2e config test; set PIK_TEST_DB_URL to enable");
        return;
    };

    let (admin_pool, schema, schema_url) = create_test_schema(&db_url).await;
    let (addr, _state) = spawn_gateway(&schema_url).await;
    let base = format!("http://{addr}");
    let client = reqwest::Client::new();

    let (status, body) = post_json(
        &client,
        &format!("{base}/api/config"),
        serde_json::json!({ "config_key": "xp_per_session_normal", "config_value": "40" }),
    )
    .await;
    assert_eq!(status, 200, "config update failed: {body}");

    let (status, body) = post_json(
        &client,
        &format!("{base}/api/config"),
        serde_json::json!({ "config_key": "xp_per_session_extreme", "config_value": "1" }),
    )
    .await;
    assert_eq!(status, 400, "unknown config key must be rejected: {body}");

    let (status, body) = get_json(&client, &format!("{base}/api/config")).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["xp_per_session_normal"], 40);
    assert_eq!(body["data"]["default_link_scope"], "progression.write");

    let (_, body) = post_json(
        &client,
        &format!("{base}/api/sources"),
        serde_json::json!({ "source_id": "src-cfg-check", "source_name": "Config Check" }),
    )
    .await;
    let api_key = body["data"]["api_key"].as_str().expect("api_key").to_string();

    let (_, body) = post_json(
        &client,
        &format!("{base}/api/users/enroll"),
        serde_json::json!({
            "hero_name": "Quill",
            "fate_alignment": "Chaos",
            "enrolled_by": "ops-console",
            "source_id": "src-cfg-check",
        }),
    )
    .await;
    let root_id = body["data"]["root_id"].as_str().expect("root_id").to_string();

    let (status, body) = client
        .post(format!("{base}/api/ingest"))
        .header("X-PIK-API-Key", &api_key)
        .json(&serde_json::json!({
            "root_id": root_id,
            "event_type": "progression.session_completed",
            "payload": { "difficulty": "normal", "nodes_completed": 0, "boss_damage_pct": 0 },
        }))
        .send()
        .await
        .map(|r| (r.status().as_u16(), r.json::<serde_json::Value>()))
        .expect("ingest should send");
    let body = body.await.unwrap_or_default();
    assert_eq!(status, 200);
    assert_eq!(body["data"]["changes_applied"]["session_xp"], 40);

    drop_test_schema(&admin_pool, &schema).await;
    admin_pool.close().await;
}
