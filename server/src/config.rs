//! Server configuration.
//!
//! Loaded from a TOML file; every section has working defaults so the
//! broker also runs with no file at all.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// Broker configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// I/O worker thread configuration
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Listeners; at least one is required
    #[serde(default = "default_listeners")]
    pub listener: Vec<ListenerConfig>,

    /// Per-connection tuning
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: WorkersConfig::default(),
            listener: default_listeners(),
            connection: ConnectionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Worker thread configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Number of I/O threads (default: derived from cpu_affinity or the
    /// number of CPUs)
    pub threads: Option<usize>,

    /// CPU cores to pin I/O threads to, Linux-style (e.g., "0-3,6,8")
    pub cpu_affinity: Option<String>,
}

/// One TCP listener.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Address to listen on
    pub address: SocketAddr,

    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

/// Per-connection resource tuning.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Scratch receive buffer size per I/O thread
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Packet objects each I/O thread keeps pooled for reuse
    #[serde(default = "default_packet_pool")]
    pub packet_pool: usize,

    /// Per-connection cap on packets queued for the processing thread
    #[serde(default = "default_packet_backlog")]
    pub packet_backlog: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
            packet_pool: default_packet_pool(),
            packet_backlog: default_packet_backlog(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter level ("trace" through "error"); RUST_LOG overrides
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "pretty", "json", or "compact"
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include the log target (module path)
    #[serde(default)]
    pub target: bool,

    /// Include thread names
    #[serde(default = "default_true")]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: false,
            thread_names: true,
        }
    }
}

// Default value functions

fn default_listeners() -> Vec<ListenerConfig> {
    vec![ListenerConfig {
        address: "0.0.0.0:4730".parse().unwrap(),
        backlog: default_backlog(),
    }]
}

fn default_backlog() -> u32 {
    4096
}

fn default_read_buffer_size() -> usize {
    16 * 1024
}

fn default_packet_pool() -> usize {
    128
}

fn default_packet_backlog() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Parse a Linux-style CPU list ("0-3,6,8") into sorted unique CPU IDs.
pub fn parse_cpu_list(cpu_list: &str) -> Result<Vec<usize>, String> {
    let mut cpus = Vec::new();

    for part in cpu_list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some((start_str, end_str)) = part.split_once('-') {
            let start: usize = start_str
                .trim()
                .parse()
                .map_err(|_| format!("invalid start of range: {start_str}"))?;
            let end: usize = end_str
                .trim()
                .parse()
                .map_err(|_| format!("invalid end of range: {end_str}"))?;
            if start > end {
                return Err(format!("invalid range: start ({start}) > end ({end})"));
            }
            cpus.extend(start..=end);
        } else {
            let cpu: usize = part
                .parse()
                .map_err(|_| format!("invalid CPU number: {part}"))?;
            cpus.push(cpu);
        }
    }

    if cpus.is_empty() {
        return Err("CPU list cannot be empty".to_string());
    }

    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.listener.is_empty() {
            return Err("at least one listener must be configured".into());
        }

        if self.workers.threads == Some(0) {
            return Err("workers.threads must be at least 1".into());
        }

        if self.connection.packet_backlog == 0 {
            return Err("connection.packet_backlog must be at least 1".into());
        }

        if self.connection.read_buffer_size == 0 {
            return Err("connection.read_buffer_size must be at least 1".into());
        }

        if let Some(ref affinity) = self.workers.cpu_affinity {
            parse_cpu_list(affinity).map_err(|e| format!("invalid cpu_affinity: {e}"))?;
        }

        Ok(())
    }

    /// Get the number of I/O threads.
    pub fn threads(&self) -> usize {
        if let Some(threads) = self.workers.threads {
            return threads;
        }
        if let Some(ref affinity) = self.workers.cpu_affinity
            && let Ok(cpus) = parse_cpu_list(affinity)
        {
            return cpus.len();
        }
        num_cpus::get()
    }

    /// Get the parsed CPU affinity list.
    pub fn cpu_affinity(&self) -> Option<Vec<usize>> {
        self.workers
            .cpu_affinity
            .as_ref()
            .and_then(|s| parse_cpu_list(s).ok())
    }
}
