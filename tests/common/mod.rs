//! Common test utilities and fixtures.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use apmrouter::catalog::{HashedKeys, HeapCatalog, MetricCatalog};
use apmrouter::core::config::{ConflationConfig, RouterConfig};
use apmrouter::core::{Metric, MetricType, Result};
use apmrouter::receiver::codec::{IncomingMetric, MetricName};
use apmrouter::receiver::{AgentChannel, AgentMetricHandler, ChannelPool, Reply};
use apmrouter::router::{ConflationService, Destination, MetricForwarder, PatternRouter};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

/// Destination that keeps everything it is given.
pub struct CapturingDestination {
    name: String,
    metrics: Mutex<Vec<Arc<Metric>>>,
}

impl CapturingDestination {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            metrics: Mutex::new(Vec::new()),
        })
    }

    pub fn metrics(&self) -> Vec<Arc<Metric>> {
        self.metrics.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.metrics.lock().len()
    }
}

impl Destination for CapturingDestination {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(&self, metric: Arc<Metric>) -> bool {
        self.metrics.lock().push(metric);
        true
    }
}

/// Agent channel that decodes and records every reply.
pub struct RecordingChannel {
    remote: SocketAddr,
    replies: Arc<Mutex<Vec<Reply>>>,
}

#[async_trait]
impl AgentChannel for RecordingChannel {
    async fn send(&self, frame: Bytes) -> Result<()> {
        self.replies.lock().push(Reply::decode(&frame)?);
        Ok(())
    }

    fn remote(&self) -> SocketAddr {
        self.remote
    }

    fn is_closed(&self) -> bool {
        false
    }
}

/// Catalog, router and handler wired together without a socket.
pub struct Pipeline {
    pub catalog: Arc<dyn MetricCatalog>,
    pub router: Arc<PatternRouter>,
    pub handler: AgentMetricHandler,
    pub replies: Arc<Mutex<Vec<Reply>>>,
}

impl Pipeline {
    /// Handler forwarding straight to the router.
    pub fn new() -> Self {
        Self::build(|router| Arc::clone(router) as Arc<dyn MetricForwarder>)
    }

    /// Handler forwarding through a conflation service in front of the router.
    pub fn conflated(config: &ConflationConfig) -> (Self, Arc<ConflationService>) {
        let mut service = None;
        let pipeline = Self::build(|router| {
            let conflation = Arc::new(ConflationService::new(
                config,
                Arc::clone(router) as Arc<dyn MetricForwarder>,
            ));
            service = Some(Arc::clone(&conflation));
            conflation as Arc<dyn MetricForwarder>
        });
        (pipeline, service.unwrap())
    }

    fn build<F>(forwarder: F) -> Self
    where
        F: FnOnce(&Arc<PatternRouter>) -> Arc<dyn MetricForwarder>,
    {
        let catalog: Arc<dyn MetricCatalog> = Arc::new(HeapCatalog::new(HashedKeys::new()));
        let router = Arc::new(PatternRouter::new(&RouterConfig::default()));
        let replies = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&replies);
        let channels = Arc::new(ChannelPool::with_connector(move |remote| {
            Arc::new(RecordingChannel {
                remote,
                replies: Arc::clone(&recorded),
            }) as Arc<dyn AgentChannel>
        }));
        let handler = AgentMetricHandler::new(
            Arc::clone(&catalog),
            forwarder(&router),
            channels,
            Duration::from_secs(15),
        );

        Self {
            catalog,
            router,
            handler,
            replies,
        }
    }

    /// Registers a capturing destination for `patterns`.
    pub fn capture(&self, name: &str, patterns: &[&str]) -> Arc<CapturingDestination> {
        let sink = CapturingDestination::new(name);
        self.router
            .register(Arc::clone(&sink) as Arc<dyn Destination>, patterns)
            .unwrap();
        sink
    }

    /// Waits until at least `expected` replies have been recorded.
    pub async fn replies(&self, expected: usize) -> Vec<Reply> {
        for _ in 0..200 {
            if self.replies.lock().len() >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.replies.lock().clone()
    }
}

pub fn agent() -> SocketAddr {
    "10.1.1.1:6000".parse().unwrap()
}

pub fn gauge(host: &str, agent: &str, name: &str, time: i64, value: i64) -> IncomingMetric {
    IncomingMetric::long(MetricName::new::<&str>(host, agent, &[], name), MetricType::Gauge, time, value)
}

pub fn delta(host: &str, agent: &str, name: &str, time: i64, value: i64) -> IncomingMetric {
    IncomingMetric::long(MetricName::new::<&str>(host, agent, &[], name), MetricType::Delta, time, value)
}
