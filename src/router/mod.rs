//! Pattern-matched fan-out of metrics to destinations.
//!
//! The router holds a snapshot of destination bindings (destination plus its
//! pattern group). Every metric is tested against every binding; each match is
//! offered to the destination's inbox. Dispatch runs on a fixed pool of worker
//! threads fed by a bounded queue, so a slow destination cannot stall the
//! ingestion side. A full queue drops the batch and counts it.

pub mod conflation;
pub mod destination;
pub mod pattern;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;

use crate::core::config::RouterConfig;
use crate::core::{ApmError, Metric, Result};

pub use conflation::{ConflationService, ConflationStats};
pub use destination::{Destination, InboxDestination, LogDestination};
pub use pattern::{PatternMatch, PatternMatchGroup, PatternRegistry};

/// How long an idle worker waits before re-checking the running flag.
const WORKER_POLL: Duration = Duration::from_millis(100);

type Batch = Vec<Arc<Metric>>;

/// Anything that accepts batches of metrics further down the pipeline.
pub trait MetricForwarder: Send + Sync {
    fn forward(&self, metrics: Vec<Metric>);
}

/// A destination and the patterns it subscribes to.
pub struct RouteBinding {
    destination: Arc<dyn Destination>,
    patterns: PatternMatchGroup,
}

impl RouteBinding {
    pub fn destination(&self) -> &Arc<dyn Destination> {
        &self.destination
    }

    pub fn patterns(&self) -> &PatternMatchGroup {
        &self.patterns
    }
}

/// Router counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    /// Metric deliveries accepted by a destination
    pub routed: u64,
    /// Metrics that matched no destination
    pub unmatched: u64,
    /// Metrics dropped because the dispatch queue was full
    pub dropped: u64,
    /// Deliveries refused by a destination
    pub rejected: u64,
    /// Batches dispatched
    pub batches: u64,
    /// Dispatches that panicked
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    routed: AtomicU64,
    unmatched: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    batches: AtomicU64,
    failures: AtomicU64,
}

struct RouterInner {
    bindings: ArcSwap<Vec<Arc<RouteBinding>>>,
    registry: Arc<PatternRegistry>,
    counters: Counters,
    running: AtomicBool,
}

impl RouterInner {
    /// Matches and delivers one batch. Per destination, delivery order is
    /// batch order.
    fn dispatch(&self, batch: &[Arc<Metric>]) -> usize {
        let bindings = self.bindings.load();
        let mut delivered = 0;

        for metric in batch {
            let mut matched = false;
            for binding in bindings.iter() {
                if !binding.patterns.matches(metric.fqn()) {
                    continue;
                }
                matched = true;
                if binding.destination.accept(Arc::clone(metric)) {
                    delivered += 1;
                } else {
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
            if !matched {
                self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("No destination for [{}]", metric.fqn());
            }
        }

        self.counters.routed.fetch_add(delivered as u64, Ordering::Relaxed);
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    fn worker_loop(&self, receiver: &Receiver<Batch>) {
        while self.running.load(Ordering::Acquire) {
            let batch = match receiver.recv_timeout(WORKER_POLL) {
                Ok(batch) => batch,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            self.dispatch_guarded(&batch);
        }

        // Deliver what was queued before shutdown.
        while let Ok(batch) = receiver.try_recv() {
            self.dispatch_guarded(&batch);
        }
    }

    fn dispatch_guarded(&self, batch: &[Arc<Metric>]) {
        if panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(batch))).is_err() {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!("Routing of a {}-metric batch panicked", batch.len());
        }
    }
}

/// Routes metrics to every destination whose patterns match the metric FQN.
pub struct PatternRouter {
    inner: Arc<RouterInner>,
    sender: Sender<Batch>,
    receiver: Receiver<Batch>,
    worker_threads: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PatternRouter {
    /// Creates a router compiling patterns through the process-wide registry.
    pub fn new(config: &RouterConfig) -> Self {
        Self::with_registry(config, PatternRegistry::global())
    }

    pub fn with_registry(config: &RouterConfig, registry: Arc<PatternRegistry>) -> Self {
        let (sender, receiver) = bounded(config.queue_size.max(1));
        Self {
            inner: Arc::new(RouterInner {
                bindings: ArcSwap::from_pointee(Vec::new()),
                registry,
                counters: Counters::default(),
                running: AtomicBool::new(false),
            }),
            sender,
            receiver,
            worker_threads: config.worker_threads.max(1),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Starts the dispatch workers. Until then, queued batches are routed on
    /// the calling thread.
    pub fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for id in 0..self.worker_threads {
            let inner = Arc::clone(&self.inner);
            let receiver = self.receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("apm-router-{}", id))
                .spawn(move || inner.worker_loop(&receiver))?;
            workers.push(handle);
        }

        tracing::info!("Pattern router started with {} workers", self.worker_threads);
        Ok(())
    }

    /// Stops the workers and waits for them to exit.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("Router worker exited with a panic");
            }
        }
        tracing::debug!("Pattern router stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Adds a destination, replacing any destination with the same name.
    pub fn register<S: AsRef<str>>(&self, destination: Arc<dyn Destination>, patterns: &[S]) -> Result<()> {
        let group = PatternMatchGroup::from_patterns(Arc::clone(&self.inner.registry), patterns)?;
        let binding = Arc::new(RouteBinding {
            destination,
            patterns: group,
        });
        let name = binding.destination.name().to_string();

        self.inner.bindings.rcu(|current| {
            let mut next: Vec<_> = current
                .iter()
                .filter(|b| b.destination.name() != name)
                .cloned()
                .collect();
            next.push(Arc::clone(&binding));
            next
        });

        tracing::info!("Registered destination {} with patterns {:?}", name, binding.patterns.patterns());
        Ok(())
    }

    /// Removes a destination. Returns `false` if it was not registered.
    pub fn unregister(&self, name: &str) -> bool {
        let mut removed = false;
        self.inner.bindings.rcu(|current| {
            let next: Vec<_> = current
                .iter()
                .filter(|b| b.destination.name() != name)
                .cloned()
                .collect();
            removed = next.len() != current.len();
            next
        });
        if removed {
            tracing::info!("Unregistered destination {}", name);
        }
        removed
    }

    /// Replaces the patterns of a registered destination.
    pub fn set_patterns<S: AsRef<str>>(&self, name: &str, patterns: &[S]) -> Result<()> {
        let bindings = self.inner.bindings.load();
        let binding = bindings
            .iter()
            .find(|b| b.destination.name() == name)
            .ok_or_else(|| ApmError::DestinationNotFound(name.to_string()))?;
        binding.patterns.replace(patterns)?;
        tracing::info!("Destination {} now routes {:?}", name, binding.patterns.patterns());
        Ok(())
    }

    /// Registered destination names
    pub fn destinations(&self) -> Vec<String> {
        self.inner
            .bindings
            .load()
            .iter()
            .map(|b| b.destination.name().to_string())
            .collect()
    }

    /// Current binding for `name`
    pub fn binding(&self, name: &str) -> Option<Arc<RouteBinding>> {
        self.inner
            .bindings
            .load()
            .iter()
            .find(|b| b.destination.name() == name)
            .cloned()
    }

    /// Routes a batch on the calling thread. Returns the number of deliveries.
    pub fn route(&self, metrics: &[Arc<Metric>]) -> usize {
        self.inner.dispatch(metrics)
    }

    /// Hands a batch to the worker pool.
    ///
    /// Returns `false` if the queue was full and the batch was dropped.
    pub fn queue(&self, metrics: Vec<Metric>) -> bool {
        if metrics.is_empty() {
            return true;
        }
        let batch: Batch = metrics.into_iter().map(Arc::new).collect();

        if !self.is_running() {
            self.inner.dispatch(&batch);
            return true;
        }

        match self.sender.try_send(batch) {
            Ok(()) => true,
            Err(TrySendError::Full(batch) | TrySendError::Disconnected(batch)) => {
                self.inner
                    .counters
                    .dropped
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                tracing::warn!("Router queue full, dropped {} metrics", batch.len());
                false
            },
        }
    }

    /// Batches waiting for a worker
    pub fn pending(&self) -> usize {
        self.sender.len()
    }

    pub fn stats(&self) -> RouterStats {
        let c = &self.inner.counters;
        RouterStats {
            routed: c.routed.load(Ordering::Relaxed),
            unmatched: c.unmatched.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            batches: c.batches.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }
}

impl MetricForwarder for PatternRouter {
    fn forward(&self, metrics: Vec<Metric>) {
        self.queue(metrics);
    }
}

impl Drop for PatternRouter {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
    }
}
