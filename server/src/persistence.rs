//! The persistence sink (§4.6): batches finalized flows, device upserts, and
//! threats into periodic transactions against the embedded SQLite database.
//!
//! Batches flush at N=500 records or a 2s ticker, whichever comes first, in
//! a single transaction per batch (WAL already enabled by `db::init`). A
//! failed flush retries with exponential backoff (100ms, 200ms, 400ms,
//! 800ms, 1.6s); if every attempt fails the batch is held in a bounded
//! overflow buffer (10,000 rows) with older rows dropped (and counted) once
//! full, rather than blocking upstream stages.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::device::Device;
use crate::flow::Flow;
use crate::threat::Threat;

const BATCH_MAX: usize = 500;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const OVERFLOW_CAPACITY: usize = 10_000;
const BACKOFF_STEPS_MS: [u64; 5] = [100, 200, 400, 800, 1600];

/// A finalized flow plus the one bit of pipeline context the row needs that
/// isn't on `Flow` itself: which canonical side (`a` or `b`) is the local
/// device, for the `buckets_minute` in/out split.
pub struct FlowRecord {
    pub flow: Flow,
    pub local_is_a: bool,
}

pub enum PersistRecord {
    Flow(FlowRecord),
    Device(Device),
    Threat(Threat),
}

fn millis(t: std::time::SystemTime) -> i64 {
    t.duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Default)]
pub struct SinkHealth {
    pub rows_written: AtomicU64,
    pub rows_dropped: AtomicU64,
    pub degraded: std::sync::atomic::AtomicBool,
}

pub struct PersistenceSink {
    pool: SqlitePool,
    health: Arc<SinkHealth>,
}

impl PersistenceSink {
    pub fn new(pool: SqlitePool, health: Arc<SinkHealth>) -> Self {
        Self { pool, health }
    }

    /// Drives the batch loop until `rx` closes (reader + workers shut down),
    /// then flushes whatever remains once before returning.
    pub async fn run(mut self, mut rx: mpsc::Receiver<PersistRecord>) {
        let mut batch: Vec<PersistRecord> = Vec::with_capacity(BATCH_MAX);
        let mut overflow: VecDeque<PersistRecord> = VecDeque::new();
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_record = rx.recv() => {
                    match maybe_record {
                        Some(record) => {
                            batch.push(record);
                            if batch.len() >= BATCH_MAX {
                                self.flush_with_retry(&mut batch, &mut overflow).await;
                            }
                        }
                        None => {
                            self.flush_with_retry(&mut batch, &mut overflow).await;
                            info!("persistence sink: channel closed, final flush complete");
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.flush_with_retry(&mut batch, &mut overflow).await;
                }
            }
        }
    }

    async fn flush_with_retry(
        &mut self,
        batch: &mut Vec<PersistRecord>,
        overflow: &mut VecDeque<PersistRecord>,
    ) {
        // Retry whatever's still held from a prior failed flush first.
        if !overflow.is_empty() && batch.is_empty() {
            batch.extend(overflow.drain(..));
        }
        if batch.is_empty() {
            return;
        }

        for (attempt, delay_ms) in std::iter::once(0).chain(BACKOFF_STEPS_MS).enumerate() {
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            match flush_batch(&self.pool, batch).await {
                Ok(count) => {
                    self.health.rows_written.fetch_add(count as u64, Ordering::Relaxed);
                    self.health.degraded.store(false, Ordering::Relaxed);
                    batch.clear();
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "persistence batch flush failed, retrying");
                }
            }
        }

        error!("persistence sink degraded: all retries exhausted, buffering batch");
        self.health.degraded.store(true, Ordering::Relaxed);
        for record in batch.drain(..) {
            if overflow.len() >= OVERFLOW_CAPACITY {
                overflow.pop_front();
                self.health.rows_dropped.fetch_add(1, Ordering::Relaxed);
            }
            overflow.push_back(record);
        }
    }
}

async fn flush_batch(pool: &SqlitePool, batch: &[PersistRecord]) -> Result<usize, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let mut count = 0usize;

    for record in batch {
        match record {
            PersistRecord::Flow(fr) => {
                insert_flow(&mut tx, fr).await?;
                upsert_bucket(&mut tx, fr).await?;
            }
            PersistRecord::Device(device) => {
                upsert_device(&mut tx, device).await?;
            }
            PersistRecord::Threat(threat) => {
                upsert_threat(&mut tx, threat).await?;
            }
        }
        count += 1;
    }

    tx.commit().await?;
    Ok(count)
}

async fn insert_flow(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    fr: &FlowRecord,
) -> Result<(), sqlx::Error> {
    let flow = &fr.flow;
    let tcp_state = format!("{:?}", flow.tcp_state);
    sqlx::query(
        "INSERT OR REPLACE INTO flows (
            id, first_seen_ms, last_seen_ms, protocol,
            src_ip, src_port, dst_ip, dst_port,
            src_bytes, dst_bytes, src_packets, dst_packets,
            tcp_state, retransmissions, avg_rtt_ms, jitter_ms,
            application, server_name, country, city, asn,
            local_device_id, remote_device_id, threat_score
        ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
    )
    .bind(flow.id.to_string())
    .bind(millis(flow.first_seen))
    .bind(millis(flow.finalized_at.unwrap_or(flow.last_seen)))
    .bind(flow.key.protocol as i64)
    .bind(flow.key.a.ip.to_string())
    .bind(flow.key.a.port as i64)
    .bind(flow.key.b.ip.to_string())
    .bind(flow.key.b.port as i64)
    .bind(flow.fwd.bytes as i64)
    .bind(flow.rev.bytes as i64)
    .bind(flow.fwd.packets as i64)
    .bind(flow.rev.packets as i64)
    .bind(tcp_state)
    .bind((flow.fwd.retransmissions + flow.rev.retransmissions) as i64)
    .bind(if flow.rtt.avg_ms > 0.0 { Some(flow.rtt.avg_ms) } else { None })
    .bind(flow.fwd.jitter_ms.max(flow.rev.jitter_ms))
    .bind(&flow.enrichment.application)
    .bind(&flow.enrichment.server_name)
    .bind(&flow.enrichment.country)
    .bind(&flow.enrichment.city)
    .bind(flow.enrichment.asn.map(|a| a as i64))
    .bind(&flow.enrichment.local_device_id)
    .bind(&flow.enrichment.remote_device_id)
    .bind(flow.threat_score as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_bucket(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    fr: &FlowRecord,
) -> Result<(), sqlx::Error> {
    let flow = &fr.flow;
    let Some(device_id) = flow.enrichment.local_device_id.as_deref() else {
        return Ok(());
    };
    let (bytes_out, bytes_in) = if fr.local_is_a {
        (flow.fwd.bytes, flow.rev.bytes)
    } else {
        (flow.rev.bytes, flow.fwd.bytes)
    };
    let minute_epoch = millis(flow.finalized_at.unwrap_or(flow.last_seen)) / 60_000;

    sqlx::query(
        "INSERT INTO buckets_minute (minute_epoch, device_id, protocol, bytes_in, bytes_out, packets, flow_count)
         VALUES (?, ?, ?, ?, ?, ?, 1)
         ON CONFLICT(minute_epoch, device_id, protocol) DO UPDATE SET
            bytes_in = bytes_in + excluded.bytes_in,
            bytes_out = bytes_out + excluded.bytes_out,
            packets = packets + excluded.packets,
            flow_count = flow_count + 1",
    )
    .bind(minute_epoch)
    .bind(device_id)
    .bind(flow.key.protocol as i64)
    .bind(bytes_in as i64)
    .bind(bytes_out as i64)
    .bind((flow.fwd.packets + flow.rev.packets) as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_device(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    device: &Device,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO devices (
            id, mac, primary_ip, vendor, hostname, device_type,
            first_seen_ms, last_seen_ms, flow_count, bytes_in, bytes_out, threat_score
        ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?)
        ON CONFLICT(id) DO UPDATE SET
            primary_ip = excluded.primary_ip,
            vendor = excluded.vendor,
            hostname = excluded.hostname,
            device_type = excluded.device_type,
            last_seen_ms = excluded.last_seen_ms,
            flow_count = excluded.flow_count,
            bytes_in = excluded.bytes_in,
            bytes_out = excluded.bytes_out,
            threat_score = MAX(devices.threat_score, excluded.threat_score)",
    )
    .bind(&device.id)
    .bind(device.mac.map(|m| m.to_string()))
    .bind(device.primary_ip.to_string())
    .bind(&device.vendor)
    .bind(&device.hostname)
    .bind(&device.device_type)
    .bind(millis(device.first_seen))
    .bind(millis(device.last_seen))
    .bind(device.flow_count as i64)
    .bind(device.bytes_in as i64)
    .bind(device.bytes_out as i64)
    .bind(device.threat_score as i64)
    .execute(&mut **tx)
    .await?;

    for ip in &device.all_ips {
        sqlx::query("INSERT OR IGNORE INTO device_ips (device_id, ip) VALUES (?, ?)")
            .bind(&device.id)
            .bind(ip.to_string())
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

async fn upsert_threat(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    threat: &Threat,
) -> Result<(), sqlx::Error> {
    let bucket_ms = millis(threat.created_at) / 300_000 * 300_000;
    sqlx::query(
        "INSERT INTO threats (
            id, created_ms, severity, category, device_id, flow_id,
            score, summary, evidence_json, dismissed_ms, bucket_ms
        ) VALUES (?,?,?,?,?,?,?,?,?,?,?)
        ON CONFLICT(device_id, category, bucket_ms) DO UPDATE SET
            score = MAX(threats.score, excluded.score),
            summary = excluded.summary,
            evidence_json = excluded.evidence_json",
    )
    .bind(threat.id.to_string())
    .bind(millis(threat.created_at))
    .bind(threat.severity.as_str())
    .bind(threat.category.as_str())
    .bind(&threat.device_id)
    .bind(threat.flow_id.map(|id| id.to_string()))
    .bind(threat.score as i64)
    .bind(&threat.summary)
    .bind(threat.evidence.to_string())
    .bind(threat.dismissed_at.map(millis))
    .bind(bucket_ms)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceObservation, DeviceRegistry};
    use crate::flow::{Endpoint, FlowKey};
    use crate::parser::Protocol;
    use crate::threat::{Category, Severity};
    use std::time::SystemTime;
    use uuid::Uuid;

    fn sample_flow() -> Flow {
        let key = FlowKey::canonical(
            Protocol::Tcp,
            Endpoint { ip: "10.0.0.5".parse().unwrap(), port: 51000 },
            Endpoint { ip: "93.184.216.34".parse().unwrap(), port: 443 },
        )
        .0;
        let mut flow = Flow::new(key, SystemTime::now());
        flow.fwd.bytes = 1200;
        flow.fwd.packets = 4;
        flow.rev.bytes = 4000;
        flow.rev.packets = 6;
        flow.enrichment.local_device_id = Some("ip:10.0.0.5".to_string());
        flow.enrichment.application = Some("https".to_string());
        flow.finalize(SystemTime::now());
        flow
    }

    #[tokio::test]
    async fn flush_batch_writes_flow_device_and_bucket_rows() {
        let pool = crate::db::init(":memory:").await.unwrap();
        let flow = sample_flow();
        let flow_id = flow.id;

        let registry = DeviceRegistry::new();
        let device = registry.observe(DeviceObservation {
            ip: "10.0.0.5".parse().unwrap(),
            mac: None,
            hostname: None,
            remote_port: 443,
            bytes_in: 4000,
            bytes_out: 1200,
            threat_score: 0,
            now: SystemTime::now(),
        });

        let batch = vec![
            PersistRecord::Flow(FlowRecord { flow, local_is_a: true }),
            PersistRecord::Device(device),
        ];
        let count = flush_batch(&pool, &batch).await.unwrap();
        assert_eq!(count, 2);

        let flow_row: Option<String> = sqlx::query_scalar("SELECT id FROM flows WHERE id = ?")
            .bind(flow_id.to_string())
            .fetch_optional(&pool)
            .await
            .unwrap();
        assert_eq!(flow_row, Some(flow_id.to_string()));

        let bucket_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM buckets_minute")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(bucket_count, 1);
    }

    #[tokio::test]
    async fn threat_upsert_keeps_monotonic_max_score() {
        let pool = crate::db::init(":memory:").await.unwrap();
        let now = SystemTime::now();
        let make = |score: u32| Threat {
            id: Uuid::new_v4(),
            created_at: now,
            severity: Severity::from_score(score),
            category: Category::Exfiltration,
            device_id: "ip:10.0.0.5".to_string(),
            flow_id: None,
            score,
            summary: "test".to_string(),
            evidence: serde_json::json!({}),
            dismissed_at: None,
        };

        flush_batch(&pool, &[PersistRecord::Threat(make(40))]).await.unwrap();
        flush_batch(&pool, &[PersistRecord::Threat(make(20))]).await.unwrap();

        let score: i64 = sqlx::query_scalar("SELECT score FROM threats WHERE device_id = 'ip:10.0.0.5'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(score, 40, "a lower later score must not overwrite the stored max");
    }

    #[tokio::test]
    async fn sink_run_flushes_remaining_batch_when_channel_closes() {
        let pool = crate::db::init(":memory:").await.unwrap();
        let health = Arc::new(SinkHealth::default());
        let sink = PersistenceSink::new(pool.clone(), health.clone());
        let (tx, rx) = mpsc::channel(8);

        let flow = sample_flow();
        tx.send(PersistRecord::Flow(FlowRecord { flow, local_is_a: true })).await.unwrap();
        drop(tx);

        sink.run(rx).await;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM flows").fetch_one(&pool).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(health.rows_written.load(Ordering::Relaxed), 1);
    }
}
