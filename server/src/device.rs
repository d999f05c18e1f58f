//! The device registry (§2 "Device registry", §3 `Device`): upserts `Device`
//! records keyed by a stable `device_id`, tracking first/last seen, hostname
//! candidates, vendor, and device-type classification.
//!
//! Ownership follows §3: the registry exclusively owns `Device` records; the
//! flow table holds only `device_id` handles. Mutation policy follows §5:
//! a single writer (the pipeline's finalize stage) applies updates; readers
//! (the HTTP query surface) only ever see copy-on-read snapshots.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::SystemTime;

use dashmap::DashMap;

use crate::enrichment::classify_device_type;
use crate::flow::MacAddr;

/// A persistent logical network endpoint identity, keyed preferentially by
/// MAC address. Created on first observation, updated on every flow
/// finalize, never deleted (subject only to retention trim by age).
#[derive(Debug, Clone)]
pub struct Device {
    pub id: String,
    pub mac: Option<MacAddr>,
    pub primary_ip: IpAddr,
    pub all_ips: HashSet<IpAddr>,
    pub vendor: Option<String>,
    pub hostname: Option<String>,
    pub device_type: String,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    pub flow_count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub threat_score: u32,
    /// Ports observed across this device's flows; feeds device-type
    /// classification (§4.4) and the threat engine's per-device counters.
    pub observed_ports: HashSet<u16>,
}

impl Device {
    fn new(id: String, ip: IpAddr, mac: Option<MacAddr>, now: SystemTime) -> Self {
        let mut all_ips = HashSet::new();
        all_ips.insert(ip);
        Self {
            id,
            mac,
            primary_ip: ip,
            all_ips,
            vendor: mac.and_then(|m| crate::oui::lookup_bytes(&m).map(str::to_string)),
            hostname: None,
            device_type: "generic".to_string(),
            first_seen: now,
            last_seen: now,
            flow_count: 0,
            bytes_in: 0,
            bytes_out: 0,
            threat_score: 0,
            observed_ports: HashSet::new(),
        }
    }
}

/// One flow's contribution to a device's record, applied at flow finalize.
pub struct DeviceObservation {
    pub ip: IpAddr,
    pub mac: Option<MacAddr>,
    pub hostname: Option<String>,
    pub remote_port: u16,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub threat_score: u32,
    pub now: SystemTime,
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: DashMap<String, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the stable device id for an observation: MAC when observable,
    /// else `ip:<addr>` (§3, §4.4).
    pub fn id_for(mac: Option<MacAddr>, ip: IpAddr) -> String {
        crate::enrichment::device_id_for(mac, ip)
    }

    /// Apply one flow-finalize observation, creating the device record on
    /// first sight. Must only be called from the registry's single writer.
    pub fn observe(&self, obs: DeviceObservation) -> Device {
        let id = Self::id_for(obs.mac, obs.ip);
        let mut entry = self
            .devices
            .entry(id.clone())
            .or_insert_with(|| Device::new(id.clone(), obs.ip, obs.mac, obs.now));

        entry.all_ips.insert(obs.ip);
        entry.last_seen = obs.now;
        entry.flow_count += 1;
        entry.bytes_in = entry.bytes_in.saturating_add(obs.bytes_in);
        entry.bytes_out = entry.bytes_out.saturating_add(obs.bytes_out);
        entry.threat_score = entry.threat_score.max(obs.threat_score);
        entry.observed_ports.insert(obs.remote_port);

        if entry.mac.is_none() {
            entry.mac = obs.mac;
        }
        if entry.vendor.is_none() {
            if let Some(mac) = entry.mac {
                entry.vendor = crate::oui::lookup_bytes(&mac).map(str::to_string);
            }
        }
        if obs.hostname.is_some() {
            entry.hostname = obs.hostname;
        }

        let ports: Vec<u16> = entry.observed_ports.iter().copied().collect();
        entry.device_type =
            classify_device_type(entry.vendor.as_deref(), entry.hostname.as_deref(), &ports);

        entry.clone()
    }

    /// Copy-on-read snapshot of one device, by id.
    pub fn snapshot(&self, id: &str) -> Option<Device> {
        self.devices.get(id).map(|e| e.clone())
    }

    /// Copy-on-read snapshot of every known device.
    pub fn list(&self) -> Vec<Device> {
        self.devices.iter().map(|e| e.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn first_observation_creates_device_keyed_by_mac() {
        let registry = DeviceRegistry::new();
        let mac = MacAddr([0xb8, 0x27, 0xeb, 1, 2, 3]);
        let now = SystemTime::now();
        let device = registry.observe(DeviceObservation {
            ip: ip("10.0.0.5"),
            mac: Some(mac),
            hostname: None,
            remote_port: 443,
            bytes_in: 100,
            bytes_out: 200,
            threat_score: 0,
            now,
        });
        assert_eq!(device.id, mac.to_string());
        assert_eq!(device.vendor.as_deref(), Some("Raspberry Pi Foundation"));
        assert_eq!(device.flow_count, 1);
    }

    #[test]
    fn falls_back_to_ip_identity_when_mac_unobservable() {
        let registry = DeviceRegistry::new();
        let device = registry.observe(DeviceObservation {
            ip: ip("10.0.0.9"),
            mac: None,
            hostname: None,
            remote_port: 80,
            bytes_in: 0,
            bytes_out: 0,
            threat_score: 0,
            now: SystemTime::now(),
        });
        assert_eq!(device.id, "ip:10.0.0.9");
    }

    #[test]
    fn repeated_observations_accumulate_counters() {
        let registry = DeviceRegistry::new();
        let mac = MacAddr([1, 2, 3, 4, 5, 6]);
        let t0 = SystemTime::now();
        registry.observe(DeviceObservation {
            ip: ip("10.0.0.2"),
            mac: Some(mac),
            hostname: None,
            remote_port: 80,
            bytes_in: 10,
            bytes_out: 20,
            threat_score: 0,
            now: t0,
        });
        let device = registry.observe(DeviceObservation {
            ip: ip("10.0.0.2"),
            mac: Some(mac),
            hostname: Some("johns-iphone".to_string()),
            remote_port: 443,
            bytes_in: 10,
            bytes_out: 20,
            threat_score: 30,
            now: t0 + Duration::from_secs(5),
        });
        assert_eq!(device.flow_count, 2);
        assert_eq!(device.bytes_in, 20);
        assert_eq!(device.bytes_out, 40);
        assert_eq!(device.threat_score, 30);
        assert_eq!(device.device_type, "apple_device");
        assert_eq!(device.last_seen, t0 + Duration::from_secs(5));
    }

    #[test]
    fn threat_score_is_monotonic_max_not_overwrite() {
        let registry = DeviceRegistry::new();
        let mac = MacAddr([9, 9, 9, 9, 9, 9]);
        let now = SystemTime::now();
        registry.observe(DeviceObservation {
            ip: ip("10.0.0.3"),
            mac: Some(mac),
            hostname: None,
            remote_port: 1,
            bytes_in: 0,
            bytes_out: 0,
            threat_score: 80,
            now,
        });
        let device = registry.observe(DeviceObservation {
            ip: ip("10.0.0.3"),
            mac: Some(mac),
            hostname: None,
            remote_port: 2,
            bytes_in: 0,
            bytes_out: 0,
            threat_score: 10,
            now,
        });
        assert_eq!(device.threat_score, 80, "score must never decrease");
    }
}
