//! GET /api/v1/devices — list devices (§6 query surface: "list devices").

use axum::{extract::State, Json};
use serde::Serialize;
use sqlx::Row;

use super::{AppError, AppState};

#[derive(Debug, Serialize)]
pub struct DeviceView {
    pub id: String,
    pub mac: Option<String>,
    pub primary_ip: String,
    pub ips: Vec<String>,
    pub vendor: Option<String>,
    pub hostname: Option<String>,
    pub device_type: String,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub flow_count: i64,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub threat_score: i64,
}

impl DeviceView {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            mac: row.try_get("mac")?,
            primary_ip: row.try_get("primary_ip")?,
            ips: Vec::new(), // filled in after the IP query below
            vendor: row.try_get("vendor")?,
            hostname: row.try_get("hostname")?,
            device_type: row.try_get("device_type")?,
            first_seen_ms: row.try_get("first_seen_ms")?,
            last_seen_ms: row.try_get("last_seen_ms")?,
            flow_count: row.try_get("flow_count")?,
            bytes_in: row.try_get("bytes_in")?,
            bytes_out: row.try_get("bytes_out")?,
            threat_score: row.try_get("threat_score")?,
        })
    }
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<DeviceView>>, AppError> {
    let rows = sqlx::query(
        r#"SELECT id, mac, primary_ip, vendor, hostname, device_type,
                  first_seen_ms, last_seen_ms, flow_count, bytes_in, bytes_out, threat_score
           FROM devices ORDER BY last_seen_ms DESC"#,
    )
    .fetch_all(&state.db)
    .await?;

    let mut devices: Vec<DeviceView> = rows
        .iter()
        .map(DeviceView::from_row)
        .collect::<Result<_, _>>()?;

    if !devices.is_empty() {
        let ip_rows = sqlx::query("SELECT device_id, ip FROM device_ips")
            .fetch_all(&state.db)
            .await?;
        for device in &mut devices {
            device.ips = ip_rows
                .iter()
                .filter(|r| r.get::<String, _>("device_id") == device.id)
                .map(|r| r.get::<String, _>("ip"))
                .collect();
        }
    }

    Ok(Json(devices))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::ws::hub::WsHub;
    use std::sync::Arc;

    async fn seeded_state() -> AppState {
        let pool = crate::db::init(":memory:").await.unwrap();
        sqlx::query(
            r#"INSERT INTO devices (id, mac, primary_ip, vendor, device_type, first_seen_ms, last_seen_ms, flow_count, bytes_in, bytes_out, threat_score)
               VALUES ('mac:aabbccddeeff', 'AA:BB:CC:DD:EE:FF', '10.0.0.2', 'Acme', 'generic', 0, 0, 3, 100, 200, 10)"#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO device_ips (device_id, ip) VALUES ('mac:aabbccddeeff', '10.0.0.2')")
            .execute(&pool)
            .await
            .unwrap();

        AppState {
            db: pool,
            config: AppConfig::default(),
            ws_hub: Arc::new(WsHub::new()),
            pipeline: None,
        }
    }

    #[tokio::test]
    async fn list_returns_device_with_its_ips() {
        let state = seeded_state().await;
        let Json(devices) = list(State(state)).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].ips, vec!["10.0.0.2".to_string()]);
        assert_eq!(devices[0].flow_count, 3);
    }
}
