//! Typed, validated configuration loaded from an optional TOML file.
//!
//! Every field has a default so the process can run unconfigured; the file
//! only needs to override what differs from the defaults. Unknown keys are
//! rejected by `toml`'s strict deserialization, satisfying the "reflective
//! configuration" redesign note: this is a single typed record, not a bag of
//! dynamically-looked-up values.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Capture device name. Defaults to the first non-loopback interface at startup.
    pub interface: Option<String>,

    /// Kernel-level BPF filter, passed verbatim to the capture handle.
    #[serde(default = "default_bpf_filter")]
    pub bpf_filter: String,

    /// Probabilistic admission rate in (0, 1]. 1.0 admits everything.
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,

    /// CIDRs considered "local" for device attribution. Defaults to RFC 1918 + loopback + link-local.
    #[serde(default)]
    pub local_subnets: Vec<String>,

    #[serde(default)]
    pub flow: FlowConfig,

    #[serde(default)]
    pub rule_thresholds: ThreatThresholds,

    /// ISO-2 country codes treated as high-risk by the geo_high_risk rule.
    #[serde(default)]
    pub high_risk_countries: Vec<String>,

    #[serde(default)]
    pub retention: RetentionConfig,

    /// Path to the embedded database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Address to bind the query/notification HTTP surface on. `None` disables it.
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowConfig {
    #[serde(default = "default_idle_tcp")]
    pub idle_timeout_tcp_secs: u64,
    #[serde(default = "default_idle_udp")]
    pub idle_timeout_udp_secs: u64,
    #[serde(default = "default_idle_handshake")]
    pub idle_timeout_handshake_secs: u64,
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,
    #[serde(default = "default_max_flows")]
    pub max_flows: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            idle_timeout_tcp_secs: default_idle_tcp(),
            idle_timeout_udp_secs: default_idle_udp(),
            idle_timeout_handshake_secs: default_idle_handshake(),
            max_duration_secs: default_max_duration(),
            max_flows: default_max_flows(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThreatThresholds {
    #[serde(default = "default_exfil_mib")]
    pub exfiltration_mib: u64,
    #[serde(default = "default_exfil_critical_mib")]
    pub exfiltration_critical_mib: u64,
    #[serde(default = "default_port_scan_ports")]
    pub port_scan_distinct_ports: u32,
    #[serde(default = "default_host_scan_hosts")]
    pub host_scan_distinct_hosts: u32,
    #[serde(default = "default_beaconing_flows")]
    pub beaconing_min_flows: u32,
    #[serde(default)]
    pub suspicious_ports: Vec<u16>,
}

impl Default for ThreatThresholds {
    fn default() -> Self {
        Self {
            exfiltration_mib: default_exfil_mib(),
            exfiltration_critical_mib: default_exfil_critical_mib(),
            port_scan_distinct_ports: default_port_scan_ports(),
            host_scan_distinct_hosts: default_host_scan_hosts(),
            beaconing_min_flows: default_beaconing_flows(),
            suspicious_ports: vec![4444, 5555, 6666, 6667, 31337],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

fn default_bpf_filter() -> String {
    "ip or ip6".to_string()
}
fn default_sampling_rate() -> f64 {
    1.0
}
fn default_idle_tcp() -> u64 {
    300
}
fn default_idle_udp() -> u64 {
    60
}
fn default_idle_handshake() -> u64 {
    30
}
fn default_max_duration() -> u64 {
    3600
}
fn default_max_flows() -> usize {
    100_000
}
fn default_exfil_mib() -> u64 {
    10
}
fn default_exfil_critical_mib() -> u64 {
    100
}
fn default_port_scan_ports() -> u32 {
    50
}
fn default_host_scan_hosts() -> u32 {
    30
}
fn default_beaconing_flows() -> u32 {
    5
}
fn default_retention_days() -> u32 {
    30
}
fn default_db_path() -> String {
    "vantage.db".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            interface: None,
            bpf_filter: default_bpf_filter(),
            sampling_rate: default_sampling_rate(),
            local_subnets: Vec::new(),
            flow: FlowConfig::default(),
            rule_thresholds: ThreatThresholds::default(),
            high_risk_countries: Vec::new(),
            retention: RetentionConfig::default(),
            db_path: default_db_path(),
            listen: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file `{path}`"))?;
        let config: AppConfig = toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file `{path}`"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants not expressible as a plain default.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.sampling_rate) || self.sampling_rate == 0.0 {
            bail!("`sampling_rate` must be in (0, 1], got {}", self.sampling_rate);
        }
        if self.flow.max_flows == 0 {
            bail!("`flow.max_flows` must be greater than 0");
        }
        for cidr in &self.local_subnets {
            cidr.parse::<ipnetwork::IpNetwork>()
                .with_context(|| format!("`local_subnets` entry `{cidr}` is not a valid CIDR"))?;
        }
        for code in &self.high_risk_countries {
            if code.len() != 2 {
                bail!("`high_risk_countries` entry `{code}` is not an ISO-2 code");
            }
        }
        Ok(())
    }

    /// Local subnets, falling back to RFC 1918 + loopback + link-local defaults.
    pub fn local_subnets(&self) -> Vec<ipnetwork::IpNetwork> {
        if self.local_subnets.is_empty() {
            default_local_subnets()
        } else {
            self.local_subnets
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect()
        }
    }
}

fn default_local_subnets() -> Vec<ipnetwork::IpNetwork> {
    [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "fe80::/10",
        "::1/128",
    ]
    .iter()
    .map(|s| s.parse().unwrap())
    .collect()
}
