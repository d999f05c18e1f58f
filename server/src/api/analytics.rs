//! GET /api/v1/top — top-N aggregations over `buckets_minute` (§6 query
//! surface: "top-N aggregations over buckets_minute").

use axum::{extract::Query, extract::State, Json};
use serde::{Deserialize, Serialize};

use super::{AppError, AppState};

#[derive(Debug, Deserialize)]
pub struct TopFilter {
    /// Group the aggregation by `device` or `protocol`. Defaults to `device`.
    pub by: Option<String>,
    /// How far back to aggregate, in minutes. Defaults to 60.
    pub window_minutes: Option<i64>,
    /// Row cap. Defaults to 10, capped at 100.
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct TopRow {
    pub key: String,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub packets: i64,
    pub flow_count: i64,
}

const DEFAULT_WINDOW_MINUTES: i64 = 60;
const DEFAULT_LIMIT: i64 = 10;
const MAX_LIMIT: i64 = 100;

pub async fn top(
    State(state): State<AppState>,
    Query(filter): Query<TopFilter>,
) -> Result<Json<Vec<TopRow>>, AppError> {
    let group_col = match filter.by.as_deref() {
        Some("protocol") => "protocol",
        Some("device") | None => "device_id",
        Some(other) => {
            return Err(AppError::Validation(format!(
                "`by` must be `device` or `protocol`, got `{other}`"
            )))
        }
    };
    let window_minutes = filter.window_minutes.unwrap_or(DEFAULT_WINDOW_MINUTES).max(1);
    let limit = filter.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let sql = format!(
        r#"SELECT {group_col} AS key, SUM(bytes_in) AS bytes_in, SUM(bytes_out) AS bytes_out,
                  SUM(packets) AS packets, SUM(flow_count) AS flow_count
           FROM buckets_minute
           WHERE minute_epoch >= ((strftime('%s', 'now') / 60) - ?)
           GROUP BY {group_col}
           ORDER BY (bytes_in + bytes_out) DESC
           LIMIT ?"#
    );

    let rows: Vec<TopRow> = sqlx::query_as(&sql)
        .bind(window_minutes)
        .bind(limit)
        .fetch_all(&state.db)
        .await?;
    Ok(Json(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::ws::hub::WsHub;
    use std::sync::Arc;

    async fn seeded_state() -> AppState {
        let pool = crate::db::init(":memory:").await.unwrap();
        let now_minute = chrono::Utc::now().timestamp() / 60;
        sqlx::query(
            r#"INSERT INTO buckets_minute (minute_epoch, device_id, protocol, bytes_in, bytes_out, packets, flow_count)
               VALUES (?, 'mac:aabbcc', 6, 1000, 2000, 10, 1)"#,
        )
        .bind(now_minute)
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
    async fn top_by_device_returns_aggregated_row() {
        let state = seeded_state().await;
        let filter = TopFilter { by: Some("device".to_string()), window_minutes: Some(60), limit: Some(5) };
        let Json(rows) = top(State(state), Query(filter)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "mac:aabbcc");
        assert_eq!(rows[0].bytes_in, 1000);
    }

    #[tokio::test]
    async fn rejects_unknown_group_by() {
        let state = seeded_state().await;
        let filter = TopFilter { by: Some("bogus".to_string()), window_minutes: None, limit: None };
        let err = top(State(state), Query(filter)).await;
        assert!(matches!(err, Err(AppError::Validation(_))));
    }
}
