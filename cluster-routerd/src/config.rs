use std::path::Path;
use serde::Deserialize;
use anyhow::{Context, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub registry: RegistryConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Which registry adapter resolves model services. Required: a daemon
/// without a registry cannot route anything.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RegistryConfig {
    Nacos(NacosConfig),
    Mdns(MdnsRegistryConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct NacosConfig {
    /// Base URL of the Nacos server, e.g. "http://nacos:8848"
    #[serde(default = "default_nacos_server")]
    pub server: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "default_registry_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MdnsRegistryConfig {
    /// Restrict multicast to one interface; all interfaces when unset
    #[serde(default)]
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    Random,
    RoundRobin,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_dispatch_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_selector")]
    pub selector: SelectorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Icmp,
    Tcp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_probe")]
    pub probe: ProbeKind,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// How long `ping` waits for the echo reply (`-W`)
    #[serde(default = "default_echo_wait")]
    pub echo_wait_secs: u64,
    /// Port used by the TCP prober
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,
    /// Targets watched from startup
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_nacos_server() -> String {
    "http://localhost:8848".to_string()
}

fn default_registry_timeout() -> u64 {
    5
}

fn default_dispatch_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_selector() -> SelectorKind {
    SelectorKind::Random
}

fn default_monitor_interval() -> u64 {
    10
}

fn default_probe() -> ProbeKind {
    ProbeKind::Icmp
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_echo_wait() -> u64 {
    1
}

fn default_tcp_port() -> u16 {
    554
}

fn default_max_concurrent_probes() -> usize {
    32
}

fn default_listen() -> String {
    "[::]:8090".to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_dispatch_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            selector: default_selector(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
            probe: default_probe(),
            probe_timeout_ms: default_probe_timeout_ms(),
            echo_wait_secs: default_echo_wait(),
            tcp_port: default_tcp_port(),
            max_concurrent_probes: default_max_concurrent_probes(),
            targets: Vec::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;

        anyhow::ensure!(config.monitor.interval_secs > 0, "monitor.interval_secs must be at least 1");
        anyhow::ensure!(
            config.monitor.max_concurrent_probes > 0,
            "monitor.max_concurrent_probes must be at least 1"
        );

        Ok(config)
    }
}
