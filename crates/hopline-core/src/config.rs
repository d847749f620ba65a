//! Configuration system for hopline.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $HOPLINE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/hopline/config.toml
//!   3. ~/.config/hopline/config.toml
//!
//! The loaded config is handed to each component at construction. Nothing
//! below `main` reads the process environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HoplineConfig {
    pub node: NodeConfig,
    pub cluster: ClusterConfig,
    pub ports: PortsConfig,
    pub relay: RelaySettings,
    pub probe: ProbeSettings,
    pub retry: RetrySettings,
    pub readiness: ReadinessSettings,
    pub aggregator: AggregatorSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Logical name of this node. Also its identity toward the orchestrator.
    pub name: String,
    /// Total memory to report. 0 = query the host.
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Ordered compute node list. The coordinator derives the schedule from it.
    pub nodes: Vec<String>,
    /// Peers this node probes, in order. Set per node by whoever launches agents.
    pub peers: Vec<String>,
    /// Cluster size as seen by an agent. 0 = `nodes.len()`.
    pub num_nodes: usize,
    /// Hostname pattern for a compute node; `{node}` is replaced by the name.
    pub node_host_template: String,
    /// Logical name of the dispatcher, which has its own hostname.
    pub dispatcher_name: String,
    pub dispatcher_host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// Address listeners bind to.
    pub bind_host: String,
    pub orchestrator: u16,
    pub collector: u16,
    pub probe: u16,
    pub data: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Directory holding the named pipes shared with the compute process.
    pub pipe_dir: PathBuf,
    /// Pipes are `to_<suffix>` and `from_<suffix>`.
    pub pipe_suffix: String,
    /// Next hop in the pipeline.
    pub next_node: String,
    /// Messages buffered between the ingress and egress pumps.
    pub queue_capacity: usize,
    pub dial_timeout_ms: u64,
    /// Poll interval while a send pipe waits for its reader.
    pub pipe_poll_ms: u64,
    /// How long to wait for the pumps after shutdown is signalled.
    pub shutdown_grace_ms: u64,
    /// Relay stats log interval. 0 = never.
    pub stats_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub binary: String,
    pub duration_secs: u64,
    pub connect_timeout_ms: u64,
    /// Interface whose IPv4 address the client binds to. Empty = let the OS pick.
    pub interface: String,
    /// Pause after the readiness gate opens, before probing.
    pub settle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Fraction of the interval added or removed at random. 0.0 = none.
    pub jitter: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    /// Shell command polled until it reports ready. Empty = always ready.
    /// `{node}` and `{peer}` are substituted.
    pub gate_command: String,
    pub poll_ms: u64,
    /// File written once the relay is ready to carry data.
    pub signal_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorSettings {
    /// Reports to wait for. 0 = one per cluster node.
    pub expected_reports: usize,
    pub output_path: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            peers: Vec::new(),
            num_nodes: 0,
            node_host_template: "node-{node}.default.svc.cluster.local".to_string(),
            dispatcher_name: "dispatcher".to_string(),
            dispatcher_host: "dispatcher.default.svc.cluster.local".to_string(),
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            orchestrator: 4000,
            collector: 3000,
            probe: 5201,
            data: 8080,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            pipe_dir: PathBuf::from("/io"),
            pipe_suffix: "inference".to_string(),
            next_node: String::new(),
            queue_capacity: 100_000,
            dial_timeout_ms: 10_000,
            pipe_poll_ms: 50,
            shutdown_grace_ms: 5_000,
            stats_interval_secs: 10,
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            binary: "iperf3".to_string(),
            duration_secs: 10,
            connect_timeout_ms: 15_000,
            interface: "eth0".to_string(),
            settle_ms: 500,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_interval_ms: 250,
            max_interval_ms: 5_000,
            jitter: 0.2,
        }
    }
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            gate_command: String::new(),
            poll_ms: 500,
            signal_path: PathBuf::from("/io/ready.json"),
        }
    }
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            expected_reports: 0,
            output_path: PathBuf::from("/config/node_info.json"),
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl ClusterConfig {
    /// Hostname that resolves to `node`.
    pub fn host_for(&self, node: &str) -> String {
        if node == self.dispatcher_name {
            self.dispatcher_host.clone()
        } else {
            self.node_host_template.replace("{node}", node)
        }
    }

    pub fn cluster_size(&self) -> usize {
        if self.num_nodes == 0 {
            self.nodes.len()
        } else {
            self.num_nodes
        }
    }
}

impl RelaySettings {
    /// Pipe the relay writes into (toward the compute process).
    pub fn send_pipe(&self) -> PathBuf {
        self.pipe_dir.join(format!("to_{}", self.pipe_suffix))
    }

    /// Pipe the relay reads from (produced by the compute process).
    pub fn recv_pipe(&self) -> PathBuf {
        self.pipe_dir.join(format!("from_{}", self.pipe_suffix))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn pipe_poll(&self) -> Duration {
        Duration::from_millis(self.pipe_poll_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl AggregatorSettings {
    pub fn expected_for(&self, cluster_size: usize) -> usize {
        if self.expected_reports == 0 {
            cluster_size
        } else {
            self.expected_reports
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("hopline")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("bad value for {0}: {1}")]
    BadOverride(String, String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl HoplineConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit file path, then apply env overrides.
    /// A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            HoplineConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("HOPLINE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing(path: &Path) -> Result<PathBuf, ConfigError> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
            }
            let text = toml::to_string_pretty(&HoplineConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(path, text)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        Ok(path.to_path_buf())
    }

    /// Apply HOPLINE_* overrides. `lookup` maps a variable name to its value.
    /// List values are JSON arrays.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HOPLINE_NODE__NAME") {
            self.node.name = v;
        }
        if let Some(v) = lookup("HOPLINE_NODE__MEMORY_BYTES") {
            self.node.memory_bytes = parse_number("HOPLINE_NODE__MEMORY_BYTES", &v)?;
        }
        if let Some(v) = lookup("HOPLINE_CLUSTER__NODES") {
            self.cluster.nodes = parse_list("HOPLINE_CLUSTER__NODES", &v)?;
        }
        if let Some(v) = lookup("HOPLINE_CLUSTER__PEERS") {
            self.cluster.peers = parse_list("HOPLINE_CLUSTER__PEERS", &v)?;
        }
        if let Some(v) = lookup("HOPLINE_CLUSTER__NUM_NODES") {
            self.cluster.num_nodes = parse_number("HOPLINE_CLUSTER__NUM_NODES", &v)?;
        }
        if let Some(v) = lookup("HOPLINE_RELAY__NEXT_NODE") {
            self.relay.next_node = v;
        }
        if let Some(v) = lookup("HOPLINE_RELAY__PIPE_DIR") {
            self.relay.pipe_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("HOPLINE_RELAY__PIPE_SUFFIX") {
            self.relay.pipe_suffix = v;
        }
        if let Some(v) = lookup("HOPLINE_READINESS__GATE_COMMAND") {
            self.readiness.gate_command = v;
        }
        if let Some(v) = lookup("HOPLINE_READINESS__SIGNAL_PATH") {
            self.readiness.signal_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("HOPLINE_AGGREGATOR__EXPECTED_REPORTS") {
            self.aggregator.expected_reports =
                parse_number("HOPLINE_AGGREGATOR__EXPECTED_REPORTS", &v)?;
        }
        if let Some(v) = lookup("HOPLINE_AGGREGATOR__OUTPUT_PATH") {
            self.aggregator.output_path = PathBuf::from(v);
        }
        Ok(())
    }

    // ── Validation ───────────────────────────────────────────────────────────

    pub fn validate_relay(&self) -> Result<(), ConfigError> {
        self.require_node_name()?;
        self.validate_retry()?;
        if self.relay.next_node.is_empty() {
            return Err(ConfigError::Invalid("relay.next_node is empty".into()));
        }
        if self.relay.queue_capacity == 0 {
            return Err(ConfigError::Invalid("relay.queue_capacity must be > 0".into()));
        }
        Ok(())
    }

    pub fn validate_agent(&self) -> Result<(), ConfigError> {
        self.require_node_name()?;
        self.validate_retry()?;
        let size = self.cluster.cluster_size();
        if size < self.cluster.peers.len() + 1 {
            return Err(ConfigError::Invalid(format!(
                "cluster size {size} is smaller than this node plus its {} peers",
                self.cluster.peers.len()
            )));
        }
        Ok(())
    }

    pub fn validate_coordinator(&self) -> Result<(), ConfigError> {
        if self.cluster.nodes.is_empty() {
            return Err(ConfigError::Invalid("cluster.nodes is empty".into()));
        }
        self.validate_retry()
    }

    pub fn validate_retry(&self) -> Result<(), ConfigError> {
        if self.retry.initial_interval_ms == 0 {
            return Err(ConfigError::Invalid("retry.initial_interval_ms must be > 0".into()));
        }
        if !self.retry.jitter.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "retry.jitter must be a finite number, got {}",
                self.retry.jitter
            )));
        }
        Ok(())
    }

    fn require_node_name(&self) -> Result<(), ConfigError> {
        if self.node.name.is_empty() {
            return Err(ConfigError::Invalid("node.name is empty".into()));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::BadOverride(key.to_string(), e.to_string()))
}

fn parse_list(key: &str, value: &str) -> Result<Vec<String>, ConfigError> {
    serde_json::from_str(value).map_err(|e| ConfigError::BadOverride(key.to_string(), e.to_string()))
}
