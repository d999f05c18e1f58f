//! GET /api/v1/health — capture health (§6: `{running, packets_captured,
//! packets_dropped, queue_drops, active_flows, avg_process_ns}`).

use axum::{extract::State, Json};

use crate::pipeline::HealthSnapshot;

use super::AppState;

pub async fn health(State(state): State<AppState>) -> Json<HealthSnapshot> {
    let snapshot = match &state.pipeline {
        Some(handles) => handles.health_snapshot(),
        None => HealthSnapshot {
            running: false,
            packets_captured: 0,
            packets_dropped: 0,
            queue_drops: 0,
            active_flows: 0,
            avg_process_ns: 0,
            degraded: false,
        },
    };
    Json(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::ws::hub::WsHub;
    use std::sync::Arc;

    #[tokio::test]
    async fn reports_not_running_without_a_live_pipeline() {
        let pool = crate::db::init(":memory:").await.unwrap();
        let state = AppState {
            db: pool,
            config: AppConfig::default(),
            ws_hub: Arc::new(WsHub::new()),
            pipeline: None,
        };
        let Json(snapshot) = health(State(state)).await;
        assert!(!snapshot.running);
        assert_eq!(snapshot.active_flows, 0);
    }
}
