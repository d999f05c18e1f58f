//! HTTP integration tests for the query/notification surface (§6).
//!
//! Each test spins up the real axum router on a random port with an
//! in-memory SQLite database, seeds it directly via `sqlx`, and makes actual
//! HTTP requests via `reqwest` — catching request-routing and JSON-shape
//! bugs that handler-level unit tests cannot.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use vantage_core::ws::hub::WsHub;
use vantage_core::{api, config, db};

async fn spawn_test_server() -> (String, sqlx::SqlitePool) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind random port");
    let addr = listener.local_addr().expect("failed to get local address");
    let base_url = format!("http://{addr}");

    let pool = db::init(":memory:").await.expect("in-memory DB init failed");
    let config = config::AppConfig::default();
    let state = api::AppState::new(pool.clone(), config, Arc::new(WsHub::new()), None);
    let app = api::router(state);

    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .expect("server error");
    });

    (base_url, pool)
}

async fn seed_device(pool: &sqlx::SqlitePool, id: &str, ip: &str) {
    sqlx::query(
        r#"INSERT INTO devices (id, primary_ip, first_seen_ms, last_seen_ms, flow_count, bytes_in, bytes_out, threat_score)
           VALUES (?, ?, 1000, 2000, 1, 100, 200, 0)"#,
    )
    .bind(id)
    .bind(ip)
    .execute(pool)
    .await
    .unwrap();
    sqlx::query("INSERT INTO device_ips (device_id, ip) VALUES (?, ?)")
        .bind(id)
        .bind(ip)
        .execute(pool)
        .await
        .unwrap();
}

async fn seed_flow(pool: &sqlx::SqlitePool, id: &str, local_device_id: &str, bytes: i64) {
    sqlx::query(
        r#"INSERT INTO flows (
            id, first_seen_ms, last_seen_ms, protocol, src_ip, src_port, dst_ip, dst_port,
            src_bytes, dst_bytes, src_packets, dst_packets, tcp_state, retransmissions,
            local_device_id, threat_score
        ) VALUES (?, 1000, 2000, 6, '10.0.0.2', 51000, '93.184.216.34', 443, ?, 0, 1, 1, 'Established', 0, ?, 0)"#,
    )
    .bind(id)
    .bind(bytes)
    .bind(local_device_id)
    .execute(pool)
    .await
    .unwrap();
}

async fn seed_threat(pool: &sqlx::SqlitePool, id: &str, device_id: &str) {
    sqlx::query(
        r#"INSERT INTO threats (id, created_ms, severity, category, device_id, score, summary, bucket_ms)
           VALUES (?, 1000, 'high', 'port_scan', ?, 60, 'scanned many ports', 0)"#,
    )
    .bind(id)
    .bind(device_id)
    .execute(pool)
    .await
    .unwrap();
}

#[tokio::test]
async fn health_reports_not_running_without_a_capture_pipeline() {
    let (base_url, _pool) = spawn_test_server().await;
    let resp = reqwest::get(format!("{base_url}/api/v1/health")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["running"], false);
    assert_eq!(body["active_flows"], 0);
}

#[tokio::test]
async fn devices_lists_seeded_devices_with_their_ips() {
    let (base_url, pool) = spawn_test_server().await;
    seed_device(&pool, "mac:aabbcc", "10.0.0.2").await;

    let resp = reqwest::get(format!("{base_url}/api/v1/devices")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    let devices = body.as_array().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0]["id"], "mac:aabbcc");
    assert_eq!(devices[0]["ips"][0], "10.0.0.2");
}

#[tokio::test]
async fn flows_filters_by_min_bytes() {
    let (base_url, pool) = spawn_test_server().await;
    seed_device(&pool, "mac:aabbcc", "10.0.0.2").await;
    seed_flow(&pool, "flow-small", "mac:aabbcc", 100).await;
    seed_flow(&pool, "flow-big", "mac:aabbcc", 50_000).await;

    let resp = reqwest::get(format!("{base_url}/api/v1/flows?min_bytes=10000")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    let flows = body.as_array().unwrap();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0]["id"], "flow-big");
}

#[tokio::test]
async fn flows_filters_by_device_id() {
    let (base_url, pool) = spawn_test_server().await;
    seed_device(&pool, "mac:aabbcc", "10.0.0.2").await;
    seed_device(&pool, "mac:ddeeff", "10.0.0.3").await;
    seed_flow(&pool, "flow-a", "mac:aabbcc", 100).await;
    seed_flow(&pool, "flow-b", "mac:ddeeff", 100).await;

    let resp = reqwest::get(format!("{base_url}/api/v1/flows?device_id=mac:ddeeff"))
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    let flows = body.as_array().unwrap();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0]["id"], "flow-b");
}

#[tokio::test]
async fn threats_lists_and_dismiss_marks_dismissed() {
    let (base_url, pool) = spawn_test_server().await;
    seed_threat(&pool, "t1", "mac:aabbcc").await;

    let resp = reqwest::get(format!("{base_url}/api/v1/threats")).await.unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert!(body[0]["dismissed_ms"].is_null());

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base_url}/api/v1/threats/t1/dismiss"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let resp = reqwest::get(format!("{base_url}/api/v1/threats?dismissed=false")).await.unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn dismiss_unknown_threat_returns_404() {
    let (base_url, _pool) = spawn_test_server().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base_url}/api/v1/threats/does-not-exist/dismiss"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn top_rejects_unknown_group_by() {
    let (base_url, _pool) = spawn_test_server().await;
    let resp = reqwest::get(format!("{base_url}/api/v1/top?by=bogus")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}
