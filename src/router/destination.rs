//! Destinations receiving routed metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::core::config::{DestinationConfig, DestinationKind};
use crate::core::time::format_millis;
use crate::core::Metric;

/// Consumer of routed metrics.
///
/// `accept` is called from router worker threads and must not block. A
/// destination that cannot take the metric returns `false`.
pub trait Destination: Send + Sync {
    /// Unique destination name
    fn name(&self) -> &str;

    fn accept(&self, metric: Arc<Metric>) -> bool;
}

/// Bounded in-process inbox.
///
/// The paired receiver is handed to whoever consumes the destination. A full
/// or closed inbox rejects the metric.
pub struct InboxDestination {
    name: String,
    sender: mpsc::Sender<Arc<Metric>>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl InboxDestination {
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Arc<Metric>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let destination = Self {
            name: name.into(),
            sender,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        };
        (destination, receiver)
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl Destination for InboxDestination {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(&self, metric: Arc<Metric>) -> bool {
        match self.sender.try_send(metric) {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                true
            },
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                false
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Inbox for destination {} is closed", self.name);
                false
            },
        }
    }
}

/// Writes every routed metric to the log.
pub struct LogDestination {
    name: String,
}

impl LogDestination {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Destination for LogDestination {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(&self, metric: Arc<Metric>) -> bool {
        tracing::info!(
            destination = %self.name,
            "{} {} ({}) = {}",
            format_millis(metric.time()),
            metric.fqn(),
            metric.metric_type(),
            metric.value()
        );
        true
    }
}

/// Creates the destination described by `config`.
///
/// Inbox destinations also return the receiving half of their inbox.
pub fn from_config(
    config: &DestinationConfig,
) -> (Arc<dyn Destination>, Option<mpsc::Receiver<Arc<Metric>>>) {
    match config.kind {
        DestinationKind::Log => (Arc::new(LogDestination::new(config.name.as_str())), None),
        DestinationKind::Inbox => {
            let (destination, receiver) = InboxDestination::new(config.name.as_str(), config.inbox_capacity);
            (Arc::new(destination), Some(receiver))
        },
    }
}
