//! Main application entry point for APMRouter.
//!
//! Wires the catalog, router, conflation service, ingestion handler and
//! listener together from one [`Config`], runs them until shutdown and logs
//! the pipeline counters periodically.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::catalog::{self, MetricCatalog};
use crate::core::config::DestinationConfig;
use crate::core::{Config, Metric, Result};
use crate::receiver::{AgentMetricHandler, HandlerStats, UdpListener};
use crate::router::destination;
use crate::router::{ConflationService, ConflationStats, MetricForwarder, PatternRouter, RouterStats};

type Inboxes = Arc<Mutex<HashMap<String, mpsc::Receiver<Arc<Metric>>>>>;

/// Point-in-time counters of the whole pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub ingest: HandlerStats,
    pub identities: usize,
    pub collisions: u64,
    pub conflation: Option<ConflationStats>,
    pub router: RouterStats,
}

impl StatsSnapshot {
    fn collect(
        catalog: &dyn MetricCatalog,
        router: &PatternRouter,
        conflation: Option<&ConflationService>,
        handler: &AgentMetricHandler,
    ) -> Self {
        Self {
            ingest: handler.stats(),
            identities: catalog.size(),
            collisions: catalog.collisions(),
            conflation: conflation.map(ConflationService::stats),
            router: router.stats(),
        }
    }
}

/// Main application struct that coordinates all components of APMRouter.
pub struct Application {
    config: Config,
    catalog: Arc<dyn MetricCatalog>,
    router: Arc<PatternRouter>,
    conflation: Option<Arc<ConflationService>>,
    handler: Arc<AgentMetricHandler>,
    listener: UdpListener,
    inboxes: Inboxes,
    updates: Option<watch::Receiver<Config>>,
}

impl Application {
    /// Builds the pipeline and binds the agent listener.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let catalog = catalog::from_config(&config.catalog);

        let router = Arc::new(PatternRouter::new(&config.router));
        let inboxes: Inboxes = Arc::new(Mutex::new(HashMap::new()));
        apply_destinations(&router, &inboxes, &config.destinations)?;

        let (conflation, forwarder): (Option<Arc<ConflationService>>, Arc<dyn MetricForwarder>) =
            if config.conflation.enabled {
                let service = Arc::new(ConflationService::new(
                    &config.conflation,
                    Arc::clone(&router) as Arc<dyn MetricForwarder>,
                ));
                (Some(Arc::clone(&service)), service as Arc<dyn MetricForwarder>)
            } else {
                tracing::info!("Conflation disabled, metrics go straight to the router");
                (None, Arc::clone(&router) as Arc<dyn MetricForwarder>)
            };

        let listener = UdpListener::bind(&config.server).await?;
        let handler = Arc::new(AgentMetricHandler::new(
            Arc::clone(&catalog),
            forwarder,
            Arc::new(listener.channel_pool(config.ingest.channel_idle_timeout)),
            config.ingest.reset_timeout,
        ));

        Ok(Self {
            config,
            catalog,
            router,
            conflation,
            handler,
            listener,
            inboxes,
            updates: None,
        })
    }

    /// Applies destination changes from reloaded configurations.
    pub fn with_config_updates(mut self, updates: watch::Receiver<Config>) -> Self {
        self.updates = Some(updates);
        self
    }

    /// Takes the receiving half of an inbox destination's queue.
    pub fn take_inbox(&self, name: &str) -> Option<mpsc::Receiver<Arc<Metric>>> {
        self.inboxes.lock().remove(name)
    }

    /// Address the agent listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn catalog(&self) -> &Arc<dyn MetricCatalog> {
        &self.catalog
    }

    pub fn router(&self) -> &Arc<PatternRouter> {
        &self.router
    }

    pub fn conflation(&self) -> Option<&Arc<ConflationService>> {
        self.conflation.as_ref()
    }

    pub fn handler(&self) -> &Arc<AgentMetricHandler> {
        &self.handler
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot::collect(
            self.catalog.as_ref(),
            &self.router,
            self.conflation.as_deref(),
            &self.handler,
        )
    }

    /// Runs until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
    }

    /// Runs until `signal` completes, then shuts the pipeline down.
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!("Starting APMRouter");

        self.router.start()?;
        if let Some(conflation) = &self.conflation {
            conflation.start();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let stats_handle = tokio::spawn(log_stats(
            self.config.monitoring.stats_interval,
            Arc::clone(&self.catalog),
            Arc::clone(&self.router),
            self.conflation.clone(),
            Arc::clone(&self.handler),
            shutdown_rx.clone(),
        ));

        let reload_handle = self.updates.clone().map(|updates| {
            tokio::spawn(watch_destinations(
                updates,
                Arc::clone(&self.router),
                Arc::clone(&self.inboxes),
                shutdown_rx.clone(),
            ))
        });

        let serve = self.listener.serve(Arc::clone(&self.handler), shutdown_rx);
        tokio::pin!(serve);

        let result = tokio::select! {
            result = &mut serve => result,
            () = signal => {
                tracing::info!("Shutdown requested");
                let _ = shutdown_tx.send(true);
                serve.await
            },
        };

        let _ = shutdown_tx.send(true);
        stats_handle.abort();
        if let Some(handle) = reload_handle {
            handle.abort();
        }

        if let Some(conflation) = &self.conflation {
            conflation.shutdown().await;
            let flushed = conflation.flush();
            tracing::info!("Flushed {} pending metrics", flushed);
        }

        let router = Arc::clone(&self.router);
        tokio::task::spawn_blocking(move || router.shutdown()).await?;

        tracing::info!("APMRouter stopped");
        result
    }
}

/// Registers, updates and removes destinations to match `destinations`.
fn apply_destinations(router: &PatternRouter, inboxes: &Inboxes, destinations: &[DestinationConfig]) -> Result<()> {
    let wanted: Vec<&str> = destinations.iter().map(|d| d.name.as_str()).collect();
    for name in router.destinations() {
        if !wanted.contains(&name.as_str()) {
            router.unregister(&name);
            inboxes.lock().remove(&name);
        }
    }

    for config in destinations {
        if router.binding(&config.name).is_some() {
            router.set_patterns(&config.name, &config.patterns)?;
            continue;
        }
        let (destination, inbox) = destination::from_config(config);
        router.register(destination, &config.patterns)?;
        if let Some(inbox) = inbox {
            inboxes.lock().insert(config.name.clone(), inbox);
        }
    }
    Ok(())
}

async fn watch_destinations(
    mut updates: watch::Receiver<Config>,
    router: Arc<PatternRouter>,
    inboxes: Inboxes,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let destinations = updates.borrow_and_update().destinations.clone();
                match apply_destinations(&router, &inboxes, &destinations) {
                    Ok(()) => tracing::info!("Destinations reloaded: {:?}", router.destinations()),
                    Err(e) => tracing::error!("Failed to apply destination changes: {}", e),
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn log_stats(
    interval: std::time::Duration,
    catalog: Arc<dyn MetricCatalog>,
    router: Arc<PatternRouter>,
    conflation: Option<Arc<ConflationService>>,
    handler: Arc<AgentMetricHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {},
            _ = shutdown.changed() => break,
        }

        let stats = StatsSnapshot::collect(catalog.as_ref(), &router, conflation.as_deref(), &handler);
        let ingest = &stats.ingest;
        tracing::info!(
            received = ingest.metrics_received,
            tokens_sent = ingest.tokens_sent,
            confirms_sent = ingest.confirms_sent,
            lookup_drops = ingest.token_lookup_drops,
            decode_errors = ingest.decode_errors,
            type_mismatches = ingest.type_mismatches,
            "Ingest stats"
        );
        tracing::info!(
            identities = stats.identities,
            collisions = stats.collisions,
            "Catalog stats"
        );
        if let Some(conflation) = &stats.conflation {
            tracing::info!(
                queued = conflation.queued,
                conflated = conflation.conflated,
                dropped = conflation.dropped,
                forwarded = conflation.forwarded,
                failures = conflation.failures,
                pending = conflation.pending,
                "Conflation stats"
            );
        }
        tracing::info!(
            routed = stats.router.routed,
            unmatched = stats.router.unmatched,
            dropped = stats.router.dropped,
            rejected = stats.router.rejected,
            "Router stats"
        );

        if tracing::enabled!(tracing::Level::DEBUG) {
            match serde_json::to_string(&stats) {
                Ok(json) => tracing::debug!("Stats snapshot: {}", json),
                Err(e) => tracing::warn!("Failed to serialize stats: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ConfigBuilder, DestinationKind};

    fn inbox(name: &str, patterns: &[&str]) -> DestinationConfig {
        DestinationConfig {
            kind: DestinationKind::Inbox,
            ..DestinationConfig::log(name, patterns)
        }
    }

    #[test]
    fn test_apply_destinations_diff() {
        let router = PatternRouter::new(&crate::core::config::RouterConfig::default());
        let inboxes: Inboxes = Arc::new(Mutex::new(HashMap::new()));

        apply_destinations(&router, &inboxes, &[inbox("a", &["h1/.*"]), DestinationConfig::log("b", &[".*"])])
            .unwrap();
        assert_eq!(router.destinations(), vec!["a", "b"]);
        assert!(inboxes.lock().contains_key("a"));

        apply_destinations(&router, &inboxes, &[inbox("a", &["h2/.*"])]).unwrap();
        assert_eq!(router.destinations(), vec!["a"]);
        assert_eq!(router.binding("a").unwrap().patterns().patterns(), vec!["h2/.*"]);
        assert!(inboxes.lock().contains_key("a"));
    }

    #[tokio::test]
    async fn test_application_lifecycle() {
        let config = ConfigBuilder::new()
            .bind_address("127.0.0.1".parse().unwrap())
            .port(0)
            .destinations(vec![inbox("feed", &[".*"])])
            .build()
            .unwrap();

        let app = Application::new(config).await.unwrap();
        assert!(app.local_addr().unwrap().port() > 0);
        assert!(app.take_inbox("feed").is_some());
        assert!(app.take_inbox("feed").is_none());
        assert!(app.conflation().is_some());

        let stats = serde_json::to_value(app.stats()).unwrap();
        assert_eq!(stats["identities"], 0);
        assert_eq!(stats["conflation"]["pending"], 0);

        app.run_until(async {}).await.unwrap();
    }
}
