//! GET /api/v1/threats, POST /api/v1/threats/:id/dismiss (§6 query surface:
//! "list threats with filter and dismiss"; §3 "mutated only to set
//! `dismissed_at` via the query surface").

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::QueryBuilder;

use super::{AppError, AppState};

#[derive(Debug, Deserialize, Default)]
pub struct ThreatFilter {
    pub severity: Option<String>,
    pub category: Option<String>,
    pub device_id: Option<String>,
    pub dismissed: Option<bool>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ThreatView {
    pub id: String,
    pub created_ms: i64,
    pub severity: String,
    pub category: String,
    pub device_id: String,
    pub flow_id: Option<String>,
    pub score: i64,
    pub summary: String,
    pub evidence_json: String,
    pub dismissed_ms: Option<i64>,
}

const DEFAULT_LIMIT: i64 = 200;
const MAX_LIMIT: i64 = 2_000;

pub async fn list(
    State(state): State<AppState>,
    Query(filter): Query<ThreatFilter>,
) -> Result<Json<Vec<ThreatView>>, AppError> {
    let limit = filter.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let mut qb = QueryBuilder::new(
        r#"SELECT id, created_ms, severity, category, device_id, flow_id, score, summary,
                  evidence_json, dismissed_ms
           FROM threats WHERE 1 = 1"#,
    );

    if let Some(severity) = &filter.severity {
        qb.push(" AND severity = ").push_bind(severity.clone());
    }
    if let Some(category) = &filter.category {
        qb.push(" AND category = ").push_bind(category.clone());
    }
    if let Some(device_id) = &filter.device_id {
        qb.push(" AND device_id = ").push_bind(device_id.clone());
    }
    match filter.dismissed {
        Some(true) => {
            qb.push(" AND dismissed_ms IS NOT NULL");
        }
        Some(false) => {
            qb.push(" AND dismissed_ms IS NULL");
        }
        None => {}
    }

    qb.push(" ORDER BY created_ms DESC LIMIT ").push_bind(limit);

    let threats: Vec<ThreatView> = qb.build_query_as().fetch_all(&state.db).await?;
    Ok(Json(threats))
}

pub async fn dismiss(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let result = sqlx::query("UPDATE threats SET dismissed_ms = ? WHERE id = ? AND dismissed_ms IS NULL")
        .bind(now_ms)
        .bind(&id)
        .execute(&state.db)
        .await?;

    if result.rows_affected() == 0 {
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM threats WHERE id = ?")
            .bind(&id)
            .fetch_optional(&state.db)
            .await?;
        if exists.is_none() {
            return Err(AppError::NotFound);
        }
    }

    Ok(Json(serde_json::json!({"id": id, "dismissed_ms": now_ms})))
}
