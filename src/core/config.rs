//! Configuration management for APMRouter.
//!
//! This module provides configuration handling with:
//! - YAML file support
//! - Environment variable and CLI overrides (applied by [`crate::cli`])
//! - Validation and defaults
//! - Live reload of the destination table

use crate::core::{ApmError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete configuration for APMRouter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Agent listener configuration
    pub server: ServerConfig,
    /// Metric catalog configuration
    pub catalog: CatalogConfig,
    /// Conflation queue configuration
    pub conflation: ConflationConfig,
    /// Pattern router configuration
    pub router: RouterConfig,
    /// Ingestion handler configuration
    pub ingest: IngestConfig,
    /// Internal counter reporting
    pub monitoring: MonitoringConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Route destinations
    pub destinations: Vec<DestinationConfig>,
    /// Debug mode
    #[serde(skip)]
    pub debug: bool,
}

/// Agent listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the agent listener
    pub bind_address: IpAddr,
    /// UDP port agents send metrics to
    pub port: u16,
    /// Largest datagram accepted from an agent
    pub max_datagram_size: usize,
}

/// Catalog backing-store selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub backend: CatalogBackend,
}

/// Catalog backing stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogBackend {
    /// Keyed by a 64-bit hash of the FQN, verified on every lookup
    Hashed,
    /// Keyed by the FQN string itself
    Fqn,
}

/// Conflation queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflationConfig {
    /// Route through the conflation queue (false forwards straight to the router)
    pub enabled: bool,
    /// Total pending entries across all open windows
    pub max_queue_size: usize,
    /// Number of drain workers
    pub worker_threads: usize,
    /// Minimum residency of a metric before it is forwarded
    #[serde(with = "humantime_serde")]
    pub conflation_period: Duration,
    /// Sleep between drain passes
    #[serde(with = "humantime_serde")]
    pub drain_interval: Duration,
}

/// Pattern router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Dispatch worker threads
    pub worker_threads: usize,
    /// Bounded batch queue in front of the workers
    pub queue_size: usize,
}

/// Ingestion handler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Minimum gap between two reset requests to the same agent
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    /// How long a reply channel may go unused before it is closed
    #[serde(with = "humantime_serde")]
    pub channel_idle_timeout: Duration,
}

/// Internal counter reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// How often the counters are logged
    #[serde(with = "humantime_serde")]
    pub stats_interval: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Structured logging format
    pub structured: bool,
}

/// A route destination and the patterns it subscribes to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Unique destination name
    pub name: String,
    /// Destination implementation
    #[serde(default)]
    pub kind: DestinationKind,
    /// Regex patterns matched against metric FQNs
    pub patterns: Vec<String>,
    /// Inbox capacity for queue-backed destinations
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

/// Built-in destination implementations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    /// Writes routed metrics to the log
    #[default]
    Log,
    /// Bounded in-process inbox drained by an embedding consumer
    Inbox,
}

/// Log levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

fn default_inbox_capacity() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            catalog: CatalogConfig::default(),
            conflation: ConflationConfig::default(),
            router: RouterConfig::default(),
            ingest: IngestConfig::default(),
            monitoring: MonitoringConfig::default(),
            logging: LoggingConfig::default(),
            destinations: vec![DestinationConfig::log("console", &[".*"])],
            debug: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 2094,
            max_datagram_size: 65_507,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig {
            backend: CatalogBackend::Hashed,
        }
    }
}

impl Default for ConflationConfig {
    fn default() -> Self {
        ConflationConfig {
            enabled: true,
            max_queue_size: 100_000,
            worker_threads: 1,
            conflation_period: Duration::from_secs(1),
            drain_interval: Duration::from_millis(50),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            worker_threads: 5,
            queue_size: 1000,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            reset_timeout: Duration::from_secs(15),
            channel_idle_timeout: Duration::from_secs(60),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            stats_interval: Duration::from_secs(30),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            structured: false,
        }
    }
}

impl DestinationConfig {
    /// A log destination subscribed to `patterns`
    pub fn log(name: &str, patterns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind: DestinationKind::Log,
            patterns: patterns.iter().map(|p| (*p).to_string()).collect(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Result<Self> {
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.max_datagram_size == 0 {
            return Err(ApmError::config("max_datagram_size must be greater than 0"));
        }

        let conflation = &self.conflation;
        if conflation.max_queue_size == 0 {
            return Err(ApmError::config("conflation.max_queue_size must be greater than 0"));
        }
        if conflation.worker_threads == 0 {
            return Err(ApmError::config("conflation.worker_threads must be greater than 0"));
        }
        if conflation.conflation_period.is_zero() {
            return Err(ApmError::config("conflation.conflation_period must be greater than 0"));
        }
        if conflation.drain_interval.is_zero() {
            return Err(ApmError::config("conflation.drain_interval must be greater than 0"));
        }

        if self.ingest.channel_idle_timeout.is_zero() {
            return Err(ApmError::config("ingest.channel_idle_timeout must be greater than 0"));
        }

        if self.router.worker_threads == 0 {
            return Err(ApmError::config("router.worker_threads must be greater than 0"));
        }
        if self.router.queue_size == 0 {
            return Err(ApmError::config("router.queue_size must be greater than 0"));
        }

        let mut names = HashSet::new();
        for destination in &self.destinations {
            if destination.name.trim().is_empty() {
                return Err(ApmError::config("destination name cannot be empty"));
            }
            if !names.insert(destination.name.as_str()) {
                return Err(ApmError::config(format!(
                    "duplicate destination name '{}'",
                    destination.name
                )));
            }
            if destination.patterns.is_empty() {
                return Err(ApmError::config(format!(
                    "destination '{}' has no patterns",
                    destination.name
                )));
            }
            if destination.inbox_capacity == 0 {
                return Err(ApmError::config(format!(
                    "destination '{}' inbox_capacity must be greater than 0",
                    destination.name
                )));
            }
            for pattern in &destination.patterns {
                regex::Regex::new(pattern)?;
            }
        }

        Ok(())
    }

    /// Check if the agent port is available
    pub async fn check_port_available(bind_address: IpAddr, port: u16) -> Result<()> {
        use tokio::net::UdpSocket;

        match UdpSocket::bind((bind_address, port)).await {
            Ok(_) => Ok(()),
            Err(e) => Err(ApmError::config(format!("Port {} is not available: {}", port, e))),
        }
    }
}

impl LogLevel {
    /// Convert to tracing filter string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Configuration builder for programmatic construction
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Load configuration from YAML string
    pub fn from_yaml(mut self, yaml: &str) -> Result<Self> {
        self.config = serde_yaml::from_str(yaml)
            .map_err(|e| ApmError::config(format!("Failed to parse YAML config: {}", e)))?;
        Ok(self)
    }

    /// Load configuration from a YAML file
    pub async fn from_file(self, path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        self.from_yaml(&content)
    }

    /// Set listener bind address
    pub fn bind_address(mut self, address: IpAddr) -> Self {
        self.config.server.bind_address = address;
        self
    }

    /// Set listener port
    pub fn port(mut self, port: u16) -> Self {
        self.config.server.port = port;
        self
    }

    /// Select the catalog backing store
    pub fn catalog_backend(mut self, backend: CatalogBackend) -> Self {
        self.config.catalog.backend = backend;
        self
    }

    /// Enable or bypass the conflation queue
    pub fn conflation_enabled(mut self, enabled: bool) -> Self {
        self.config.conflation.enabled = enabled;
        self
    }

    /// Set conflation period
    pub fn conflation_period(mut self, period: Duration) -> Self {
        self.config.conflation.conflation_period = period;
        self
    }

    /// Set conflation queue capacity
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.config.conflation.max_queue_size = size;
        self
    }

    /// Set router worker count
    pub fn router_workers(mut self, workers: usize) -> Self {
        self.config.router.worker_threads = workers;
        self
    }

    /// Replace the destination table
    pub fn destinations(mut self, destinations: Vec<DestinationConfig>) -> Self {
        self.config.destinations = destinations;
        self
    }

    /// Add one destination
    pub fn destination(mut self, destination: DestinationConfig) -> Self {
        self.config.destinations.push(destination);
        self
    }

    /// Set debug mode
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Watch configuration file for changes
pub struct ConfigWatcher {
    path: PathBuf,
    tx: tokio::sync::watch::Sender<Config>,
    rx: tokio::sync::watch::Receiver<Config>,
}

impl ConfigWatcher {
    /// Create a new configuration watcher
    pub fn new(path: PathBuf, initial: Config) -> Self {
        let (tx, rx) = tokio::sync::watch::channel(initial);
        ConfigWatcher { path, tx, rx }
    }

    /// Get a receiver for configuration updates
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<Config> {
        self.rx.clone()
    }

    /// Start watching for configuration changes
    pub async fn watch(self) -> Result<()> {
        use notify::{RecursiveMode, Watcher};

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .map_err(|e| ApmError::config(format!("Failed to create file watcher: {}", e)))?;

        watcher
            .watch(&self.path, RecursiveMode::NonRecursive)
            .map_err(|e| ApmError::config(format!("Failed to watch config file: {}", e)))?;

        tracing::info!("Watching configuration file: {:?}", self.path);

        while let Some(event) = rx.recv().await {
            let event: notify::Event = event;
            if !matches!(event.kind, notify::EventKind::Modify(_)) {
                continue;
            }
            tracing::info!("Configuration file changed, reloading...");

            let content = match tokio::fs::read_to_string(&self.path).await {
                Ok(content) => content,
                Err(e) => {
                    tracing::error!("Failed to read configuration file: {}", e);
                    continue;
                },
            };

            match serde_yaml::from_str::<Config>(&content) {
                Ok(mut new_config) => {
                    if let Err(e) = new_config.validate() {
                        tracing::error!("Invalid configuration: {}", e);
                        continue;
                    }

                    // Preserve runtime-only settings
                    new_config.debug = self.tx.borrow().debug;

                    if self.tx.send(new_config).is_err() {
                        tracing::debug!("No configuration subscribers left, stopping watcher");
                        break;
                    }

                    tracing::info!("Configuration reloaded successfully");
                },
                Err(e) => {
                    tracing::error!("Failed to parse configuration: {}", e);
                },
            }
        }

        Ok(())
    }
}
