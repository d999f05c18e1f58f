//! GET /api/v1/flows — list flows with filters (§6 query surface: "list
//! flows with filters (time range, device, protocol, country, application,
//! min bytes, SNI substring, connection state)").

use axum::{extract::Query, extract::State, Json};
use serde::{Deserialize, Serialize};
use sqlx::QueryBuilder;

use super::{AppError, AppState};

#[derive(Debug, Deserialize, Default)]
pub struct FlowFilter {
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
    pub device_id: Option<String>,
    pub protocol: Option<u8>,
    pub country: Option<String>,
    pub application: Option<String>,
    pub min_bytes: Option<i64>,
    pub sni: Option<String>,
    pub state: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct FlowView {
    pub id: String,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub protocol: i64,
    pub src_ip: String,
    pub src_port: i64,
    pub dst_ip: String,
    pub dst_port: i64,
    pub src_bytes: i64,
    pub dst_bytes: i64,
    pub src_packets: i64,
    pub dst_packets: i64,
    pub tcp_state: String,
    pub retransmissions: i64,
    pub avg_rtt_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub application: Option<String>,
    pub server_name: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub asn: Option<i64>,
    pub local_device_id: Option<String>,
    pub remote_device_id: Option<String>,
    pub threat_score: i64,
}

const DEFAULT_LIMIT: i64 = 200;
const MAX_LIMIT: i64 = 2_000;

pub async fn list(
    State(state): State<AppState>,
    Query(filter): Query<FlowFilter>,
) -> Result<Json<Vec<FlowView>>, AppError> {
    let limit = filter.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let mut qb = QueryBuilder::new(
        r#"SELECT id, first_seen_ms, last_seen_ms, protocol, src_ip, src_port, dst_ip, dst_port,
                  src_bytes, dst_bytes, src_packets, dst_packets, tcp_state, retransmissions,
                  avg_rtt_ms, jitter_ms, application, server_name, country, city, asn,
                  local_device_id, remote_device_id, threat_score
           FROM flows WHERE 1 = 1"#,
    );

    if let Some(start_ms) = filter.start_ms {
        qb.push(" AND last_seen_ms >= ").push_bind(start_ms);
    }
    if let Some(end_ms) = filter.end_ms {
        qb.push(" AND first_seen_ms <= ").push_bind(end_ms);
    }
    if let Some(device_id) = &filter.device_id {
        qb.push(" AND (local_device_id = ").push_bind(device_id.clone());
        qb.push(" OR remote_device_id = ").push_bind(device_id.clone());
        qb.push(")");
    }
    if let Some(protocol) = filter.protocol {
        qb.push(" AND protocol = ").push_bind(protocol as i64);
    }
    if let Some(country) = &filter.country {
        qb.push(" AND country = ").push_bind(country.clone());
    }
    if let Some(application) = &filter.application {
        qb.push(" AND application = ").push_bind(application.clone());
    }
    if let Some(min_bytes) = filter.min_bytes {
        qb.push(" AND (src_bytes + dst_bytes) >= ").push_bind(min_bytes);
    }
    if let Some(sni) = &filter.sni {
        let pattern = format!("%{}%", sni.replace('%', "\\%").replace('_', "\\_"));
        qb.push(" AND server_name LIKE ").push_bind(pattern).push(" ESCAPE '\\'");
    }
    if let Some(tcp_state) = &filter.state {
        qb.push(" AND tcp_state = ").push_bind(tcp_state.clone());
    }

    qb.push(" ORDER BY last_seen_ms DESC LIMIT ").push_bind(limit);

    let flows: Vec<FlowView> = qb.build_query_as().fetch_all(&state.db).await?;
    Ok(Json(flows))
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
            r#"INSERT INTO flows (
                id, first_seen_ms, last_seen_ms, protocol, src_ip, src_port, dst_ip, dst_port,
                src_bytes, dst_bytes, src_packets, dst_packets, tcp_state, retransmissions,
                application, server_name, country, threat_score
            ) VALUES ('f1', 1000, 2000, 6, '10.0.0.2', 51000, '93.184.216.34', 443,
                500, 1500, 3, 4, 'Established', 0, 'https', 'example.com', 'US', 0)"#,
        )
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
    async fn filters_by_min_bytes() {
        let state = seeded_state().await;
        let filter = FlowFilter { min_bytes: Some(1_000_000), ..Default::default() };
        let Json(flows) = list(State(state.clone()), Query(filter)).await.unwrap();
        assert!(flows.is_empty());

        let filter = FlowFilter { min_bytes: Some(100), ..Default::default() };
        let Json(flows) = list(State(state), Query(filter)).await.unwrap();
        assert_eq!(flows.len(), 1);
    }

    #[tokio::test]
    async fn filters_by_sni_substring() {
        let state = seeded_state().await;
        let filter = FlowFilter { sni: Some("example".to_string()), ..Default::default() };
        let Json(flows) = list(State(state.clone()), Query(filter)).await.unwrap();
        assert_eq!(flows.len(), 1);

        let filter = FlowFilter { sni: Some("nope".to_string()), ..Default::default() };
        let Json(flows) = list(State(state), Query(filter)).await.unwrap();
        assert!(flows.is_empty());
    }
}
