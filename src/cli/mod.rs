//! Command-line interface for APMRouter.
//!
//! Run `apmrouter` with no arguments to listen on the default agent port with
//! a console destination that logs every metric.

use crate::application::Application;
use crate::core::config::{ConfigBuilder, ConfigWatcher};
use crate::core::{ApmError, Config, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Metrics ingestion and routing backbone for APM agents.
#[derive(Parser, Debug)]
#[command(name = "apmrouter")]
#[command(version, about, long_about = None)]
#[command(disable_version_flag = true)]
pub struct Cli {
    /// Configuration file path (default: ~/.config/apmrouter/config.yaml)
    #[arg(short, long, env = "APMROUTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// UDP port agents send metrics to
    #[arg(long, env = "APMROUTER_PORT")]
    pub port: Option<u16>,

    /// Address the agent listener binds to
    #[arg(long, env = "APMROUTER_BIND")]
    pub bind: Option<IpAddr>,

    /// Conflation window length in milliseconds
    #[arg(long, env = "APMROUTER_CONFLATION_PERIOD_MS")]
    pub conflation_period_ms: Option<u64>,

    /// Forward metrics to the router without conflating them
    #[arg(long, env = "APMROUTER_NO_CONFLATION")]
    pub no_conflation: bool,

    /// Reload destinations when the config file changes
    #[arg(long, env = "APMROUTER_WATCH_CONFIG")]
    pub watch_config: bool,

    /// Enable debug logging
    #[arg(short, long, env = "APMROUTER_DEBUG")]
    pub debug: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub check_config: bool,

    /// Show version information
    #[arg(short = 'V', long = "show-version")]
    pub version: bool,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Path of the configuration file, if one should be read.
    ///
    /// An explicit `--config` always wins; otherwise the default location is
    /// used only when it exists.
    pub fn config_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config {
            return Some(path.clone());
        }
        dirs::config_dir()
            .map(|d| d.join("apmrouter").join("config.yaml"))
            .filter(|p| p.exists())
    }

    /// Load configuration with proper precedence:
    /// 1. CLI arguments and environment variables
    /// 2. Config file
    /// 3. Defaults
    pub async fn load_config(&self) -> Result<Config> {
        let mut builder = ConfigBuilder::new();

        if let Some(path) = self.config_path() {
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    builder = builder.from_yaml(&content)?;
                    tracing::info!("Loaded configuration from: {:?}", path);
                },
                Err(e) => {
                    return Err(ApmError::config(format!(
                        "Failed to read config file {:?}: {}",
                        path, e
                    )));
                },
            }
        } else {
            tracing::debug!("No config file found, using defaults");
        }

        self.build_config_from_args(builder)
    }

    fn build_config_from_args(&self, mut builder: ConfigBuilder) -> Result<Config> {
        if let Some(port) = self.port {
            builder = builder.port(port);
        }
        if let Some(address) = self.bind {
            builder = builder.bind_address(address);
        }
        if let Some(ms) = self.conflation_period_ms {
            builder = builder.conflation_period(Duration::from_millis(ms));
        }
        if self.no_conflation {
            builder = builder.conflation_enabled(false);
        }

        builder.debug(self.debug).build()
    }

    /// Initialize logging.
    ///
    /// `RUST_LOG` wins over `APMROUTER_LOG_LEVEL`, which wins over the
    /// configured level. `--debug` forces debug output.
    pub fn init_logging(&self, config: &Config) -> Result<()> {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let log_level = if self.debug {
            "debug".to_string()
        } else {
            std::env::var("APMROUTER_LOG_LEVEL").unwrap_or_else(|_| config.logging.level.as_str().to_string())
        };

        let filter = if self.debug {
            EnvFilter::new(&log_level)
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level))
        };

        let fmt_layer = if config.logging.structured {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .compact()
        } else {
            tracing_subscriber::fmt::layer().with_target(false).compact()
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| ApmError::config(format!("Failed to initialize logging: {}", e)))?;

        Ok(())
    }
}

/// Execute APMRouter.
pub async fn execute(cli: Cli) -> Result<()> {
    if cli.version {
        println!("apmrouter {}", env!("CARGO_PKG_VERSION"));
        println!("Metrics ingestion and routing backbone");
        return Ok(());
    }

    let config = cli.load_config().await?;
    cli.init_logging(&config)?;

    if cli.check_config {
        config.validate()?;
        println!("Configuration is valid!");
        println!("  Listener: udp://{}:{}", config.server.bind_address, config.server.port);
        println!("  Catalog: {:?}", config.catalog.backend);
        if config.conflation.enabled {
            println!("  Conflation period: {:?}", config.conflation.conflation_period);
        } else {
            println!("  Conflation: disabled");
        }
        for destination in &config.destinations {
            println!("  Destination {} ({:?}): {:?}", destination.name, destination.kind, destination.patterns);
        }
        return Ok(());
    }

    Config::check_port_available(config.server.bind_address, config.server.port).await?;

    let watch_path = if cli.watch_config { cli.config_path() } else { None };
    let mut app = Application::new(config.clone()).await?;

    if let Some(path) = watch_path {
        let watcher = ConfigWatcher::new(path, config);
        app = app.with_config_updates(watcher.subscribe());
        tokio::spawn(async move {
            if let Err(e) = watcher.watch().await {
                tracing::error!("Config watcher stopped: {}", e);
            }
        });
    } else if cli.watch_config {
        tracing::warn!("--watch-config given but no config file is in use");
    }

    app.run().await
}
