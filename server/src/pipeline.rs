//! Wires the capture-to-storage data path together (§2's control flow):
//! reader → parser → dedup/sample → flow-table update → (on finalize)
//! enrichment → threat evaluation → persistence sink, with a periodic
//! janitor finalizing idle flows and a bounded queue decoupling each stage
//! (§5).
//!
//! The reader runs on its own dedicated thread ([`crate::capture`]); parsing
//! and flow updates run on a small pool of tokio tasks sized to
//! `max(1, cores-1)`, fanned out over the reader's channel; the persistence
//! sink and the janitor each run on their own task. This mirrors the
//! donor's `tokio::spawn` + ticker pattern for its background tasks
//! (scanner, retention, netflow), generalized to a staged pipeline instead
//! of one-shot periodic jobs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use ipnetwork::IpNetwork;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::{CaptureHealth, PacketSource, ReconnectFn, RawFrame};
use crate::config::AppConfig;
use crate::dedup::Deduplicator;
use crate::device::{DeviceObservation, DeviceRegistry};
use crate::enrichment::{self, AppClassifier, DnsCache, GeoCache, MacLearner, NullGeoResolver, SniCache};
use crate::flow::table::{Admission, FlowTable};
use crate::flow::{Endpoint, FlowKey};
use crate::parser::{self, ParseError, Protocol};
use crate::persistence::{FlowRecord, PersistRecord, PersistenceSink, SinkHealth};
use crate::threat::ThreatEngine;
use crate::ws::hub::{EventKind, WsHub};

const FLOW_QUEUE_CAPACITY: usize = 1_024;
const FRAME_QUEUE_CAPACITY: usize = 4_096;
const JANITOR_TICK: Duration = Duration::from_secs(1);
const DEGRADED_WINDOW: Duration = Duration::from_secs(60);
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Packet-stage health counters not already owned by [`CaptureHealth`] or
/// [`crate::flow::table::TableHealth`] (§6 capture-health contract plus
/// the packet-level error counters of §7). The reader→worker backpressure
/// counter lives on `CaptureHealth` instead, since it's produced by the
/// reader thread rather than a worker.
#[derive(Default)]
pub struct PipelineHealth {
    pub dedup_drops: AtomicU64,
    pub sampled_out: AtomicU64,
    pub malformed_short: AtomicU64,
    pub parse_rejected: AtomicU64,
    process_ns_total: AtomicU64,
    process_count: AtomicU64,
}

impl PipelineHealth {
    fn record_process_time(&self, elapsed: Duration) {
        self.process_ns_total.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.process_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_process_ns(&self) -> u64 {
        let count = self.process_count.load(Ordering::Relaxed);
        if count == 0 {
            0
        } else {
            self.process_ns_total.load(Ordering::Relaxed) / count
        }
    }
}

/// The capture-health snapshot served by the query surface (§6).
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSnapshot {
    pub running: bool,
    pub packets_captured: u64,
    pub packets_dropped: u64,
    pub queue_drops: u64,
    pub active_flows: u64,
    pub avg_process_ns: u64,
    pub degraded: bool,
}

/// Cloneable handles into the running pipeline's health counters, held by
/// the query surface so it can serve the capture-health endpoint (§6)
/// without owning the pipeline itself.
#[derive(Clone)]
pub struct PipelineHandles {
    flow_table: Arc<FlowTable>,
    capture_health: Arc<CaptureHealth>,
    pipeline_health: Arc<PipelineHealth>,
    sink_health: Arc<SinkHealth>,
}

impl PipelineHandles {
    pub fn health_snapshot(&self) -> HealthSnapshot {
        snapshot(&self.capture_health, &self.pipeline_health, &self.flow_table, &self.sink_health)
    }

    pub fn flow_table(&self) -> Arc<FlowTable> {
        self.flow_table.clone()
    }
}

fn snapshot(
    capture_health: &CaptureHealth,
    pipeline_health: &PipelineHealth,
    flow_table: &FlowTable,
    sink_health: &SinkHealth,
) -> HealthSnapshot {
    use std::sync::atomic::Ordering::Relaxed;
    HealthSnapshot {
        running: capture_health.running.load(Relaxed),
        packets_captured: capture_health.packets_captured.load(Relaxed),
        packets_dropped: capture_health.packets_dropped.load(Relaxed),
        queue_drops: capture_health.queue_drops.load(Relaxed),
        active_flows: flow_table.active_flow_count() as u64,
        avg_process_ns: pipeline_health.avg_process_ns(),
        degraded: sink_health.degraded.load(Relaxed),
    }
}

/// Shared, already-constructed state every worker and the janitor read from
/// and write to. Grouped into one struct so it can be cloned cheaply (all
/// fields are `Arc`s) into each spawned task.
#[derive(Clone)]
struct Shared {
    flow_table: Arc<FlowTable>,
    device_registry: Arc<DeviceRegistry>,
    threat_engine: Arc<ThreatEngine>,
    dns_cache: Arc<AsyncMutex<DnsCache>>,
    sni_cache: Arc<AsyncMutex<SniCache>>,
    geo_cache: Arc<AsyncMutex<GeoCache>>,
    mac_learner: Arc<AsyncMutex<MacLearner>>,
    app_classifier: Arc<AppClassifier>,
    dedup: Arc<AsyncMutex<Deduplicator>>,
    local_subnets: Arc<Vec<IpNetwork>>,
    persist_tx: mpsc::Sender<PersistRecord>,
    ws_hub: Arc<WsHub>,
    capture_health: Arc<CaptureHealth>,
    pipeline_health: Arc<PipelineHealth>,
}

/// The constructed-but-not-yet-running pipeline. Built from configuration;
/// [`Pipeline::spawn`] starts the reader, worker pool, janitor and sink.
pub struct Pipeline {
    shared: Shared,
    sink: PersistenceSink,
    persist_rx: mpsc::Receiver<PersistRecord>,
    sink_health: Arc<SinkHealth>,
}

impl Pipeline {
    pub fn new(config: &AppConfig, pool: SqlitePool, ws_hub: Arc<WsHub>) -> Self {
        let geo: Box<dyn enrichment::GeoResolver> = Box::new(NullGeoResolver);
        let sink_health = Arc::new(SinkHealth::default());
        let (persist_tx, persist_rx) = mpsc::channel(FLOW_QUEUE_CAPACITY);

        let shared = Shared {
            flow_table: Arc::new(FlowTable::new(config.flow.clone())),
            device_registry: Arc::new(DeviceRegistry::new()),
            threat_engine: Arc::new(ThreatEngine::new(
                config.rule_thresholds.clone(),
                config.high_risk_countries.clone(),
            )),
            dns_cache: Arc::new(AsyncMutex::new(DnsCache::new())),
            sni_cache: Arc::new(AsyncMutex::new(SniCache::default())),
            geo_cache: Arc::new(AsyncMutex::new(GeoCache::new(geo))),
            mac_learner: Arc::new(AsyncMutex::new(MacLearner::new())),
            app_classifier: Arc::new(AppClassifier::with_defaults()),
            dedup: Arc::new(AsyncMutex::new(Deduplicator::new(config.sampling_rate))),
            local_subnets: Arc::new(config.local_subnets()),
            persist_tx,
            ws_hub,
            capture_health: Arc::new(CaptureHealth::default()),
            pipeline_health: Arc::new(PipelineHealth::default()),
        };

        let sink = PersistenceSink::new(pool, sink_health.clone());

        Self { shared, sink, persist_rx, sink_health }
    }

    pub fn flow_table(&self) -> Arc<FlowTable> {
        self.shared.flow_table.clone()
    }

    pub fn capture_health(&self) -> Arc<CaptureHealth> {
        self.shared.capture_health.clone()
    }

    pub fn pipeline_health(&self) -> Arc<PipelineHealth> {
        self.shared.pipeline_health.clone()
    }

    /// Starts the reader on its own thread, the worker pool, the janitor
    /// ticker and the persistence sink, returning a handle that can later
    /// drive an orderly shutdown. `reconnect`, when given, lets the reader
    /// reopen the interface after it disappears at runtime (§7); synthetic
    /// test sources pass `None` and the reader simply stops on any error.
    pub fn spawn(
        self,
        source: Box<dyn PacketSource>,
        worker_count: usize,
        reconnect: Option<ReconnectFn>,
    ) -> RunningPipeline {
        let Pipeline { shared, sink, persist_rx, sink_health } = self;

        let (frame_rx, reader_stop) = crate::capture::spawn_reader(
            source,
            FRAME_QUEUE_CAPACITY,
            shared.capture_health.clone(),
            reconnect,
        );
        let frame_rx = Arc::new(AsyncMutex::new(frame_rx));

        let worker_count = worker_count.max(1);
        let mut worker_handles = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let shared = shared.clone();
            let frame_rx = frame_rx.clone();
            worker_handles.push(tokio::spawn(async move {
                worker_loop(id, frame_rx, shared).await;
            }));
        }

        let janitor_stop = reader_stop.clone();
        let janitor_shared = shared.clone();
        let janitor_handle = tokio::spawn(async move {
            janitor_loop(janitor_shared, janitor_stop).await;
        });

        let sink_handle = tokio::spawn(async move {
            sink.run(persist_rx).await;
        });

        RunningPipeline {
            shared,
            reader_stop,
            worker_handles,
            janitor_handle,
            sink_handle,
            sink_health,
        }
    }
}

/// A spawned, live pipeline. Dropping this without calling [`shutdown`]
/// leaves the background tasks running detached; call `shutdown` to drain
/// and stop them in order.
pub struct RunningPipeline {
    shared: Shared,
    reader_stop: Arc<std::sync::atomic::AtomicBool>,
    worker_handles: Vec<JoinHandle<()>>,
    janitor_handle: JoinHandle<()>,
    sink_handle: JoinHandle<()>,
    sink_health: Arc<SinkHealth>,
}

impl RunningPipeline {
    pub fn flow_table(&self) -> Arc<FlowTable> {
        self.shared.flow_table.clone()
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        snapshot(&self.shared.capture_health, &self.shared.pipeline_health, &self.shared.flow_table, &self.sink_health)
    }

    /// The shared capture-health handle, for callers that only need to
    /// watch `interface_unavailable` (§7) without the full handles bundle.
    pub fn capture_health_for_watch(&self) -> Arc<CaptureHealth> {
        self.shared.capture_health.clone()
    }

    /// Cloneable health handles for the query surface (§6), which outlives
    /// the `RunningPipeline` value itself — `shutdown` below consumes it.
    pub fn handles(&self) -> PipelineHandles {
        PipelineHandles {
            flow_table: self.shared.flow_table.clone(),
            capture_health: self.shared.capture_health.clone(),
            pipeline_health: self.shared.pipeline_health.clone(),
            sink_health: self.sink_health.clone(),
        }
    }

    /// Orderly shutdown (§5): stop the reader, let workers drain the
    /// already-queued frames, finalize every remaining live flow, then
    /// close the persistence channel so the sink does one last flush.
    /// Bounded by a 10s deadline; on expiry the sink is abandoned mid-flush
    /// (it force-flushes whatever it already holds per §4.6).
    pub async fn shutdown(self) {
        info!("pipeline shutdown: stopping interface reader");
        self.reader_stop.store(true, Ordering::SeqCst);

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DEADLINE;

        for handle in self.worker_handles {
            let _ = tokio::time::timeout_at(deadline, handle).await;
        }

        info!("pipeline shutdown: finalizing remaining live flows");
        let remaining = self.shared.flow_table.drain_all(SystemTime::now());
        for flow in remaining {
            finalize_flow(&self.shared, flow).await;
        }

        drop(self.shared.persist_tx);
        let _ = tokio::time::timeout_at(deadline, self.janitor_handle).await;
        let _ = tokio::time::timeout_at(deadline, self.sink_handle).await;
        info!("pipeline shutdown complete");
    }
}

async fn worker_loop(_id: usize, frame_rx: Arc<AsyncMutex<mpsc::Receiver<RawFrame>>>, shared: Shared) {
    loop {
        let frame = {
            let mut rx = frame_rx.lock().await;
            rx.recv().await
        };
        let Some(frame) = frame else { break };
        process_frame(&shared, frame).await;
    }
}

async fn process_frame(shared: &Shared, frame: RawFrame) {
    let start = Instant::now();
    match parser::decode(&frame.data, frame.timestamp) {
        Ok(pkt) => {
            if pkt.protocol == Protocol::Arp {
                shared.pipeline_health.record_process_time(start.elapsed());
                return;
            }

            {
                let mut dedup = shared.dedup.lock().await;
                if !dedup.admit(&pkt) {
                    if dedup.dedup_drops > 0 {
                        shared
                            .pipeline_health
                            .dedup_drops
                            .store(dedup.dedup_drops, Ordering::Relaxed);
                    }
                    shared
                        .pipeline_health
                        .sampled_out
                        .store(dedup.sampled_out, Ordering::Relaxed);
                    shared.pipeline_health.record_process_time(start.elapsed());
                    return;
                }
            }

            if let Some(ip) = pkt.src_ip {
                if enrichment::is_local(ip, &shared.local_subnets) {
                    shared.mac_learner.lock().await.observe(ip, pkt.src_mac);
                }
            }
            if let Some(ip) = pkt.dst_ip {
                if enrichment::is_local(ip, &shared.local_subnets) {
                    shared.mac_learner.lock().await.observe(ip, pkt.dst_mac);
                }
            }

            if !pkt.app.dns_answers.is_empty() {
                let now = Instant::now();
                let mut dns = shared.dns_cache.lock().await;
                for (ip, name, ttl) in &pkt.app.dns_answers {
                    dns.observe_answer(*ip, name.clone(), *ttl, now);
                }
            }

            if let (Some(src), Some(dst)) = (pkt.src_ip, pkt.dst_ip) {
                if let Some(name) = pkt.app.tls_sni.clone().or_else(|| pkt.app.http_host.clone()) {
                    let (key, _) = FlowKey::canonical(
                        pkt.protocol,
                        Endpoint { ip: src, port: pkt.src_port },
                        Endpoint { ip: dst, port: pkt.dst_port },
                    );
                    shared.sni_cache.lock().await.observe(key, name);
                }
            }

            let admission = shared.flow_table.admit(&pkt);
            if matches!(admission, Some(Admission::Created)) {
                if let (Some(src), Some(dst)) = (pkt.src_ip, pkt.dst_ip) {
                    let mac = shared.mac_learner.lock().await.lookup(src);
                    let device_id = DeviceRegistry::id_for(mac, src);
                    let threats = shared.threat_engine.record_flow_open(
                        &device_id,
                        dst,
                        pkt.dst_port,
                        SystemTime::now(),
                    );
                    for threat in threats {
                        broadcast_and_persist_threat(shared, threat).await;
                    }
                }
            }
        }
        Err(ParseError::MalformedShort(_)) => {
            shared.pipeline_health.malformed_short.fetch_add(1, Ordering::Relaxed);
        }
        Err(ParseError::Rejected(_)) => {
            shared.pipeline_health.parse_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }
    shared.pipeline_health.record_process_time(start.elapsed());
}

async fn broadcast_and_persist_threat(shared: &Shared, threat: crate::threat::Threat) {
    shared.ws_hub.broadcast(
        EventKind::NewThreat,
        serde_json::json!({
            "device_id": threat.device_id,
            "category": threat.category.as_str(),
            "severity": threat.severity.as_str(),
            "score": threat.score,
        }),
    );
    if shared.persist_tx.send(PersistRecord::Threat(threat)).await.is_err() {
        warn!("persistence channel closed, dropping threat record");
    }
}

async fn janitor_loop(shared: Shared, stop: Arc<std::sync::atomic::AtomicBool>) {
    let mut ticker = tokio::time::interval(JANITOR_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut window_start = Instant::now();
    let mut window_captured = 0u64;
    let mut window_dropped = 0u64;
    let mut degraded_announced = false;

    loop {
        ticker.tick().await;
        if stop.load(Ordering::Relaxed) {
            debug!("janitor observed stop signal, exiting tick loop");
            return;
        }

        let now = SystemTime::now();
        let mut finalized = shared.flow_table.sweep(now);
        finalized.extend(shared.flow_table.evict_over_capacity(now));
        for flow in finalized {
            finalize_flow(&shared, flow).await;
        }

        if window_start.elapsed() >= DEGRADED_WINDOW {
            let captured = shared.capture_health.packets_captured.load(Ordering::Relaxed);
            let dropped = shared.capture_health.packets_dropped.load(Ordering::Relaxed)
                + shared.capture_health.queue_drops.load(Ordering::Relaxed);
            let delta_captured = captured.saturating_sub(window_captured);
            let delta_dropped = dropped.saturating_sub(window_dropped);
            let total = delta_captured + delta_dropped;
            let degraded = total > 0 && (delta_dropped as f64 / total as f64) > 0.01;
            if degraded && !degraded_announced {
                shared.ws_hub.broadcast(EventKind::CaptureDegraded, serde_json::json!({
                    "dropped": delta_dropped,
                    "captured": delta_captured,
                }));
            }
            degraded_announced = degraded;
            window_start = Instant::now();
            window_captured = captured;
            window_dropped = dropped;
        }
    }
}

/// Applies enrichment and threat evaluation to one finalized flow (§2's
/// "on finalize" step) and hands it, its device observation, and any threats
/// to the persistence sink.
async fn finalize_flow(shared: &Shared, mut flow: crate::flow::Flow) {
    let a_local = enrichment::is_local(flow.key.a.ip, &shared.local_subnets);
    let b_local = enrichment::is_local(flow.key.b.ip, &shared.local_subnets);
    // Prefer whichever single endpoint is local; if both or neither are,
    // default to `a` as the attributed local side (§4.4's open-ended case
    // of transit traffic mirrored past this host).
    let local_is_a = !(b_local && !a_local);

    let (local_ep, remote_ep) = if local_is_a {
        (flow.key.a, flow.key.b)
    } else {
        (flow.key.b, flow.key.a)
    };

    let (local_mac, remote_mac) = {
        let learner = shared.mac_learner.lock().await;
        (learner.lookup(local_ep.ip), learner.lookup(remote_ep.ip))
    };

    {
        let dns = shared.dns_cache.lock().await;
        let sni = shared.sni_cache.lock().await;
        let mut geo = shared.geo_cache.lock().await;
        enrichment::enrich_flow(
            &mut flow,
            remote_ep.ip,
            remote_ep.port,
            &dns,
            &sni,
            &shared.app_classifier,
            &mut geo,
            Instant::now(),
        );
    }

    let local_device_id = DeviceRegistry::id_for(local_mac, local_ep.ip);
    let remote_is_external = !enrichment::is_local(remote_ep.ip, &shared.local_subnets);
    let remote_device_id = if remote_is_external {
        None
    } else {
        Some(DeviceRegistry::id_for(remote_mac, remote_ep.ip))
    };

    flow.enrichment.local_device_id = Some(local_device_id.clone());
    flow.enrichment.remote_device_id = remote_device_id;

    let (bytes_out, bytes_in) = if local_is_a {
        (flow.fwd.bytes, flow.rev.bytes)
    } else {
        (flow.rev.bytes, flow.fwd.bytes)
    };

    let country = flow.enrichment.country.clone();
    let threats = shared.threat_engine.evaluate_finalized(
        &flow,
        &local_device_id,
        remote_is_external,
        remote_ep.port,
        country.as_deref(),
        bytes_out,
    );
    let threat_score = threats.iter().map(|t| t.score).max().unwrap_or(0);
    flow.threat_score = threat_score;
    flow.threat_categories = threats.iter().map(|t| t.category.as_str().to_string()).collect();

    let device = shared.device_registry.observe(DeviceObservation {
        ip: local_ep.ip,
        mac: local_mac,
        hostname: None,
        remote_port: remote_ep.port,
        bytes_in,
        bytes_out,
        threat_score,
        now: flow.finalized_at.unwrap_or(flow.last_seen),
    });

    shared.ws_hub.broadcast(
        EventKind::FlowFinalized,
        serde_json::json!({
            "flow_id": flow.id.to_string(),
            "local_device_id": local_device_id,
            "application": flow.enrichment.application,
        }),
    );
    if device.flow_count == 1 {
        shared.ws_hub.broadcast(
            EventKind::NewDevice,
            serde_json::json!({"device_id": device.id, "primary_ip": device.primary_ip.to_string()}),
        );
    }

    let local_is_a_for_record = local_is_a;
    if shared
        .persist_tx
        .send(PersistRecord::Flow(FlowRecord { flow, local_is_a: local_is_a_for_record }))
        .await
        .is_err()
    {
        warn!("persistence channel closed, dropping finalized flow");
    }
    if shared.persist_tx.send(PersistRecord::Device(device)).await.is_err() {
        warn!("persistence channel closed, dropping device upsert");
    }
    for threat in threats {
        broadcast_and_persist_threat(shared, threat).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{RawFrame, StaticSource};
    use crate::config::AppConfig;

    fn eth_tcp_frame(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut pkt = etherparse::PacketBuilder::ethernet2([0, 1, 2, 3, 4, 5], [6, 7, 8, 9, 10, 11])
            .ipv4(src, dst, 64)
            .tcp(sport, dport, 1, 65535);
        let mut builder = pkt;
        if flags & crate::parser::tcp_flags::SYN != 0 {
            builder = builder.syn();
        }
        if flags & crate::parser::tcp_flags::ACK != 0 {
            builder = builder.ack(1);
        }
        if flags & crate::parser::tcp_flags::FIN != 0 {
            builder = builder.fin();
        }
        let mut out = Vec::new();
        builder.write(&mut out, payload).unwrap();
        out
    }

    #[tokio::test]
    async fn end_to_end_tcp_flow_is_admitted_and_finalized_on_reset() {
        let config = AppConfig::default();
        let pool = crate::db::init(":memory:").await.unwrap();
        let ws_hub = Arc::new(WsHub::new());
        let pipeline = Pipeline::new(&config, pool.clone(), ws_hub);

        let syn = eth_tcp_frame([10, 0, 0, 2], 51000, [10, 0, 0, 3], 80, crate::parser::tcp_flags::SYN, &[]);
        let rst = eth_tcp_frame(
            [10, 0, 0, 3],
            80,
            [10, 0, 0, 2],
            51000,
            crate::parser::tcp_flags::RST,
            &[],
        );
        let frames = vec![
            RawFrame { timestamp: SystemTime::now(), data: syn },
            RawFrame { timestamp: SystemTime::now(), data: rst },
        ];

        let running = pipeline.spawn(Box::new(StaticSource::new(frames)), 1, None);
        tokio::time::sleep(Duration::from_millis(100)).await;
        running.shutdown().await;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM flows")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1, "one TCP flow must have been persisted");

        let state: String = sqlx::query_scalar("SELECT tcp_state FROM flows")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(state, "Reset");
    }

    #[tokio::test]
    async fn idle_udp_flow_is_finalized_by_the_janitor() {
        let mut config = AppConfig::default();
        config.flow.idle_timeout_udp_secs = 0;
        let pool = crate::db::init(":memory:").await.unwrap();
        let ws_hub = Arc::new(WsHub::new());
        let pipeline = Pipeline::new(&config, pool.clone(), ws_hub);

        let mut udp = etherparse::PacketBuilder::ethernet2([0, 1, 2, 3, 4, 5], [6, 7, 8, 9, 10, 11])
            .ipv4([10, 0, 0, 2], [10, 0, 0, 3], 64)
            .udp(1111, 2222);
        let mut out = Vec::new();
        udp.write(&mut out, &[1, 2, 3]).unwrap();

        let frames = vec![RawFrame { timestamp: SystemTime::now(), data: out }];
        let running = pipeline.spawn(Box::new(StaticSource::new(frames)), 1, None);

        // The janitor ticks every second; with idle_timeout_udp_secs = 0 the
        // flow is idle on its very first sweep. Poll for the persisted row
        // *before* shutdown so a passing assertion can only be explained by
        // the janitor sweep, not by shutdown's own drain_all finalization.
        let mut persisted_before_shutdown = false;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM flows WHERE protocol = 17")
                .fetch_one(&pool)
                .await
                .unwrap();
            if count == 1 {
                persisted_before_shutdown = true;
                break;
            }
        }
        assert!(persisted_before_shutdown, "janitor sweep must finalize the idle UDP flow on its own");

        let state: String = sqlx::query_scalar("SELECT tcp_state FROM flows WHERE protocol = 17")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(state, "Closed", "a finalized UDP flow must be recorded as Closed, not Established");

        running.shutdown().await;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM flows WHERE protocol = 17")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1, "shutdown must not persist the same flow a second time");
    }
}
