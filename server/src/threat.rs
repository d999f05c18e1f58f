//! The threat engine (§4.5): rule predicates evaluated against finalized
//! flows and per-device sliding-window counters, emitting `Threat` events
//! with a numeric score and category.
//!
//! Rules are pure functions from inputs to `(score, category, evidence)`
//! (§4.5); the engine's job is bookkeeping the sliding windows those rules
//! read from and deduplicating emitted threats per (device, category,
//! 5-minute bucket) with a monotonic-max score update — the closest existing
//! analogue being the donor's alert-creation-conditional-on-existing-state
//! pattern (create-or-touch within one transaction).

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde_json::json;
use uuid::Uuid;

use crate::config::ThreatThresholds;
use crate::flow::Flow;

const MIB: u64 = 1024 * 1024;
const SCAN_WINDOW: Duration = Duration::from_secs(60);
const RARE_APP_WINDOW: Duration = Duration::from_secs(30 * 24 * 3600);
const DEDUP_BUCKET_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Severity mapping from score (§4.5): <25 low, <50 medium, <75 high, >=75 critical.
    pub fn from_score(score: u32) -> Self {
        if score >= 75 {
            Severity::Critical
        } else if score >= 50 {
            Severity::High
        } else if score >= 25 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Exfiltration,
    SuspiciousPort,
    PortScan,
    HostScan,
    Beaconing,
    GeoHighRisk,
    RareApplication,
    Malformed,
    Anomaly,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Exfiltration => "exfiltration",
            Category::SuspiciousPort => "suspicious_port",
            Category::PortScan => "port_scan",
            Category::HostScan => "host_scan",
            Category::Beaconing => "beaconing",
            Category::GeoHighRisk => "geo_high_risk",
            Category::RareApplication => "rare_application",
            Category::Malformed => "malformed",
            Category::Anomaly => "anomaly",
        }
    }
}

/// A threat event: created by the engine, mutated only to set `dismissed_at`
/// via the query surface (§3).
#[derive(Debug, Clone)]
pub struct Threat {
    pub id: Uuid,
    pub created_at: SystemTime,
    pub severity: Severity,
    pub category: Category,
    pub device_id: String,
    pub flow_id: Option<Uuid>,
    pub score: u32,
    pub summary: String,
    pub evidence: serde_json::Value,
    pub dismissed_at: Option<SystemTime>,
}

/// Sliding-window state tracked per device, independent of any one flow.
#[derive(Default)]
struct DeviceWindows {
    /// (remote_ip -> distinct ports opened) within the scan window.
    ports_per_host: HashMap<IpAddr, (SystemTime, std::collections::HashSet<u16>)>,
    /// distinct remote hosts opened, each with first-seen-in-window timestamp.
    hosts_opened: VecDeque<(SystemTime, IpAddr)>,
    /// (remote_ip, port) -> recent flow-open timestamps, bounded, for beaconing.
    flow_opens: HashMap<(IpAddr, u16), VecDeque<SystemTime>>,
    /// application label -> last time it was seen for this device.
    apps_seen: HashMap<String, SystemTime>,
}

pub struct ThreatEngine {
    thresholds: ThreatThresholds,
    high_risk_countries: Vec<String>,
    windows: DashMap<String, DeviceWindows>,
    dedup: DashMap<(String, &'static str, u64), Threat>,
}

impl ThreatEngine {
    pub fn new(thresholds: ThreatThresholds, high_risk_countries: Vec<String>) -> Self {
        Self {
            thresholds,
            high_risk_countries,
            windows: DashMap::new(),
            dedup: DashMap::new(),
        }
    }

    fn bucket(now: SystemTime) -> u64 {
        now.duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            / DEDUP_BUCKET_SECS
    }

    /// Create-or-touch a threat for (device, category, 5-minute bucket),
    /// taking the monotonic max of score and merging evidence. Returns the
    /// threat as it now stands, for the caller to broadcast.
    fn record(
        &self,
        device_id: &str,
        flow_id: Option<Uuid>,
        category: Category,
        score: u32,
        summary: String,
        evidence: serde_json::Value,
        now: SystemTime,
    ) -> Threat {
        let bucket = Self::bucket(now);
        let key = (device_id.to_string(), category.as_str(), bucket);
        let mut entry = self.dedup.entry(key).or_insert_with(|| Threat {
            id: Uuid::new_v4(),
            created_at: now,
            severity: Severity::from_score(score),
            category,
            device_id: device_id.to_string(),
            flow_id,
            score,
            summary: summary.clone(),
            evidence: evidence.clone(),
            dismissed_at: None,
        });

        if score > entry.score {
            entry.score = score;
            entry.severity = Severity::from_score(entry.score);
            entry.summary = summary;
            entry.evidence = evidence;
        }
        if entry.flow_id.is_none() {
            entry.flow_id = flow_id;
        }
        entry.clone()
    }

    /// Record that `device_id` just opened a new flow to `(dst_ip, dst_port)`,
    /// updating the port-scan/host-scan/beaconing windows. Called at flow
    /// creation (§4.5 "opens flows ... within 60s").
    pub fn record_flow_open(
        &self,
        device_id: &str,
        dst_ip: IpAddr,
        dst_port: u16,
        now: SystemTime,
    ) -> Vec<Threat> {
        let mut out = Vec::new();
        let mut windows = self.windows.entry(device_id.to_string()).or_default();

        // Port scan: distinct ports opened on one destination within 60s.
        let host_entry = windows
            .ports_per_host
            .entry(dst_ip)
            .or_insert_with(|| (now, std::collections::HashSet::new()));
        if now.duration_since(host_entry.0).unwrap_or_default() > SCAN_WINDOW {
            *host_entry = (now, std::collections::HashSet::new());
        }
        host_entry.1.insert(dst_port);
        let distinct_ports = host_entry.1.len() as u32;
        if distinct_ports > self.thresholds.port_scan_distinct_ports {
            out.push(self.record(
                device_id,
                None,
                Category::PortScan,
                50,
                format!("{device_id} opened {distinct_ports} distinct ports on {dst_ip} within 60s"),
                json!({"destination": dst_ip.to_string(), "distinct_ports": distinct_ports}),
                now,
            ));
        }

        // Host scan: distinct destinations within 60s.
        windows.hosts_opened.push_back((now, dst_ip));
        while let Some((ts, _)) = windows.hosts_opened.front() {
            if now.duration_since(*ts).unwrap_or_default() > SCAN_WINDOW {
                windows.hosts_opened.pop_front();
            } else {
                break;
            }
        }
        let distinct_hosts = windows
            .hosts_opened
            .iter()
            .map(|(_, ip)| *ip)
            .collect::<std::collections::HashSet<_>>()
            .len() as u32;
        if distinct_hosts > self.thresholds.host_scan_distinct_hosts {
            out.push(self.record(
                device_id,
                None,
                Category::HostScan,
                50,
                format!("{device_id} opened flows to {distinct_hosts} distinct hosts within 60s"),
                json!({"distinct_hosts": distinct_hosts}),
                now,
            ));
        }

        // Beaconing bookkeeping: remember open times, bounded, for evaluation below.
        let opens = windows.flow_opens.entry((dst_ip, dst_port)).or_default();
        opens.push_back(now);
        while opens.len() > 64 {
            opens.pop_front();
        }
        if opens.len() as u32 >= self.thresholds.beaconing_min_flows {
            if let Some(score) = beaconing_score(opens) {
                out.push(self.record(
                    device_id,
                    None,
                    Category::Beaconing,
                    score,
                    format!("{device_id} beacons to {dst_ip}:{dst_port} at a regular interval"),
                    json!({"remote_ip": dst_ip.to_string(), "remote_port": dst_port, "samples": opens.len()}),
                    now,
                ));
            }
        }

        out
    }

    /// Evaluate the non-windowed rules against a finalized flow: exfiltration,
    /// suspicious port, geo high-risk, rare application, malformed.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate_finalized(
        &self,
        flow: &Flow,
        device_id: &str,
        remote_is_external: bool,
        remote_port: u16,
        country: Option<&str>,
        local_out_bytes: u64,
    ) -> Vec<Threat> {
        let now = flow.finalized_at.unwrap_or(flow.last_seen);
        let mut out = Vec::new();

        let (out_bytes, total_packets, total_retrans) = (
            local_out_bytes,
            flow.fwd.packets + flow.rev.packets,
            flow.fwd.retransmissions + flow.rev.retransmissions,
        );

        if remote_is_external {
            let critical_bytes = self.thresholds.exfiltration_critical_mib * MIB;
            let base_bytes = self.thresholds.exfiltration_mib * MIB;
            if out_bytes > critical_bytes {
                out.push(self.record(
                    device_id,
                    Some(flow.id),
                    Category::Exfiltration,
                    70,
                    format!("{} sent {} bytes to an external host in one flow", device_id, out_bytes),
                    json!({"flow_id": flow.id.to_string(), "bytes": out_bytes}),
                    now,
                ));
            } else if out_bytes > base_bytes {
                out.push(self.record(
                    device_id,
                    Some(flow.id),
                    Category::Exfiltration,
                    40,
                    format!("{} sent {} bytes to an external host in one flow", device_id, out_bytes),
                    json!({"flow_id": flow.id.to_string(), "bytes": out_bytes}),
                    now,
                ));
            }
        }

        if self.thresholds.suspicious_ports.contains(&remote_port) {
            out.push(self.record(
                device_id,
                Some(flow.id),
                Category::SuspiciousPort,
                30,
                format!("{device_id} connected to suspicious port {remote_port}"),
                json!({"flow_id": flow.id.to_string(), "port": remote_port}),
                now,
            ));
        }

        if let Some(country) = country {
            if self.high_risk_countries.iter().any(|c| c.eq_ignore_ascii_case(country)) {
                out.push(self.record(
                    device_id,
                    Some(flow.id),
                    Category::GeoHighRisk,
                    20,
                    format!("{device_id} connected to a high-risk country ({country})"),
                    json!({"flow_id": flow.id.to_string(), "country": country}),
                    now,
                ));
            }
        }

        if let Some(app) = flow.enrichment.application.as_deref() {
            if self.is_rare_application(device_id, app, now) {
                out.push(self.record(
                    device_id,
                    Some(flow.id),
                    Category::RareApplication,
                    10,
                    format!("{device_id} used application `{app}` for the first time in 30 days"),
                    json!({"flow_id": flow.id.to_string(), "application": app}),
                    now,
                ));
            }
        }

        if total_packets > 100 && total_retrans as f64 / total_packets as f64 > 0.3 {
            out.push(self.record(
                device_id,
                Some(flow.id),
                Category::Malformed,
                15,
                format!("{device_id} flow has a high retransmission ratio"),
                json!({
                    "flow_id": flow.id.to_string(),
                    "retransmissions": total_retrans,
                    "packets": total_packets,
                }),
                now,
            ));
        }

        out
    }

    fn is_rare_application(&self, device_id: &str, app: &str, now: SystemTime) -> bool {
        let mut windows = self.windows.entry(device_id.to_string()).or_default();
        match windows.apps_seen.get(app) {
            Some(last_seen) if now.duration_since(*last_seen).unwrap_or_default() <= RARE_APP_WINDOW => {
                windows.apps_seen.insert(app.to_string(), now);
                false
            }
            _ => {
                windows.apps_seen.insert(app.to_string(), now);
                true
            }
        }
    }

    /// Snapshot every threat recorded so far (for the sink to pick up).
    pub fn drain_threats(&self) -> Vec<Threat> {
        self.dedup.iter().map(|e| e.value().clone()).collect()
    }
}

/// Beaconing score: ≥ N flows with inter-flow interval stddev < 10% of the
/// mean (§4.5) yields +35; otherwise `None`.
fn beaconing_score(opens: &VecDeque<SystemTime>) -> Option<u32> {
    if opens.len() < 2 {
        return None;
    }
    let mut intervals: Vec<f64> = Vec::with_capacity(opens.len() - 1);
    for pair in opens.iter().collect::<Vec<_>>().windows(2) {
        let delta = pair[1].duration_since(*pair[0]).ok()?.as_secs_f64();
        intervals.push(delta);
    }
    let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
    if mean <= 0.0 {
        return None;
    }
    let variance = intervals.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / intervals.len() as f64;
    let stddev = variance.sqrt();
    if stddev < 0.10 * mean {
        Some(35)
    } else {
        None
    }
}
