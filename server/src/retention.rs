//! Age-based retention trim for the persisted schema (§6 "retained ...
//! days, configurable"). Runs hourly, deleting flows, threats and
//! `buckets_minute` rows older than `retention_days`, plus devices that
//! haven't been seen in that window. Devices are trimmed last so that
//! `flows.local_device_id`/`remote_device_id` foreign references never
//! dangle mid-cycle.

use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{error, info};

use crate::config::RetentionConfig;

/// Run one cleanup cycle. Returns the counts of deleted rows per table.
pub async fn run_cleanup(pool: &SqlitePool, config: &RetentionConfig) -> (u64, u64, u64, u64) {
    let flows = delete_old_flows(pool, config.retention_days).await;
    let threats = delete_old_threats(pool, config.retention_days).await;
    let buckets = delete_old_buckets(pool, config.retention_days).await;
    let devices = delete_stale_devices(pool, config.retention_days).await;
    (flows, threats, buckets, devices)
}

async fn delete_old_flows(pool: &SqlitePool, days: u32) -> u64 {
    let interval = format!("-{days} days");
    match sqlx::query(
        r#"DELETE FROM flows WHERE last_seen_ms < (strftime('%s', 'now', ?) * 1000)"#,
    )
    .bind(&interval)
    .execute(pool)
    .await
    {
        Ok(r) => r.rows_affected(),
        Err(e) => {
            error!("retention: failed to delete old flows: {e}");
            0
        }
    }
}

async fn delete_old_threats(pool: &SqlitePool, days: u32) -> u64 {
    let interval = format!("-{days} days");
    match sqlx::query(
        r#"DELETE FROM threats WHERE created_ms < (strftime('%s', 'now', ?) * 1000)"#,
    )
    .bind(&interval)
    .execute(pool)
    .await
    {
        Ok(r) => r.rows_affected(),
        Err(e) => {
            error!("retention: failed to delete old threats: {e}");
            0
        }
    }
}

async fn delete_old_buckets(pool: &SqlitePool, days: u32) -> u64 {
    let cutoff_minutes = i64::from(days) * 24 * 60;
    match sqlx::query(
        r#"DELETE FROM buckets_minute WHERE minute_epoch < ((strftime('%s', 'now') / 60) - ?)"#,
    )
    .bind(cutoff_minutes)
    .execute(pool)
    .await
    {
        Ok(r) => r.rows_affected(),
        Err(e) => {
            error!("retention: failed to delete old buckets_minute rows: {e}");
            0
        }
    }
}

/// Devices with no activity in the retention window. `device_ips` rows
/// cascade via the application, not a DB foreign-key cascade, since the
/// donor schema style keeps cascades explicit rather than implicit.
async fn delete_stale_devices(pool: &SqlitePool, days: u32) -> u64 {
    let interval = format!("-{days} days");
    let stale_ids: Vec<(String,)> = match sqlx::query_as(
        r#"SELECT id FROM devices WHERE last_seen_ms < (strftime('%s', 'now', ?) * 1000)"#,
    )
    .bind(&interval)
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => {
            error!("retention: failed to list stale devices: {e}");
            return 0;
        }
    };

    let mut deleted = 0u64;
    for (id,) in stale_ids {
        if let Err(e) = sqlx::query("DELETE FROM device_ips WHERE device_id = ?")
            .bind(&id)
            .execute(pool)
            .await
        {
            error!("retention: failed to delete device_ips for {id}: {e}");
            continue;
        }
        match sqlx::query("DELETE FROM devices WHERE id = ?")
            .bind(&id)
            .execute(pool)
            .await
        {
            Ok(r) => deleted += r.rows_affected(),
            Err(e) => error!("retention: failed to delete device {id}: {e}"),
        }
    }
    deleted
}

/// Checkpoint and VACUUM the database, reclaiming space freed by the
/// cleanup above. WAL mode requires a checkpoint first (§4.6).
async fn vacuum(pool: &SqlitePool) {
    if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await {
        error!("retention: WAL checkpoint failed: {e}");
        return;
    }
    if let Err(e) = sqlx::query("VACUUM").execute(pool).await {
        error!("retention: VACUUM failed: {e}");
    } else {
        info!("retention: VACUUM completed");
    }
}

/// Starts the background retention task, running every hour (the donor's
/// `tokio::spawn` + `tokio::time::interval` ticker pattern, also used by
/// the janitor in [`crate::pipeline`]).
pub fn start_retention_task(pool: SqlitePool, config: RetentionConfig) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await; // skip the immediate first tick
        let mut cycles = 0u32;
        loop {
            interval.tick().await;
            info!("retention: starting hourly cleanup");
            let (flows, threats, buckets, devices) = run_cleanup(&pool, &config).await;
            if flows + threats + buckets + devices > 0 {
                info!(
                    flows,
                    threats,
                    buckets_minute = buckets,
                    devices,
                    "retention: cleanup completed"
                );
            }
            cycles += 1;
            if cycles % (24 * 7) == 0 {
                vacuum(&pool).await;
            }
        }
    });
}
