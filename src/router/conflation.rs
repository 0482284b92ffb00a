//! Time-windowed conflation of metric bursts.
//!
//! Every conflatable metric is filed into the window that expires
//! `conflation_period` after it arrives. A repeat of the same FQN inside an
//! open window is merged into the pending sample instead of being queued
//! again. Drain workers take all expired windows at once, merge their entries
//! by FQN and forward one sample per name.
//!
//! Non-conflatable metrics (text, errors, blobs) skip the queue.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;

use super::MetricForwarder;
use crate::core::config::ConflationConfig;
use crate::core::time::now_millis;
use crate::core::{DelayQueue, Metric};

/// Pending samples sharing one flush deadline.
///
/// `None` once the window has been drained; writers that find it sealed file
/// into a fresh window instead.
struct Window {
    entries: RwLock<Option<DashMap<Arc<str>, Metric>>>,
}

impl Window {
    fn new() -> Self {
        Self {
            entries: RwLock::new(Some(DashMap::new())),
        }
    }

    /// Closes the window and takes its entries. Waits for in-flight writers.
    fn seal(&self) -> Option<DashMap<Arc<str>, Metric>> {
        self.entries.write().take()
    }
}

/// Conflation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConflationStats {
    /// Samples placed in a window
    pub queued: u64,
    /// Samples dropped because the queue was full
    pub dropped: u64,
    /// Samples merged into a pending one
    pub conflated: u64,
    /// Samples handed downstream
    pub forwarded: u64,
    /// Drain passes that panicked
    pub failures: u64,
    /// Samples currently waiting in open windows
    pub pending: usize,
    /// Open windows
    pub windows: usize,
}

struct ConflationInner {
    windows: DelayQueue<Window>,
    forwarder: Arc<dyn MetricForwarder>,
    max_queue_size: usize,
    conflation_period: u64,
    drain_interval: Duration,
    pending: AtomicUsize,
    queued: AtomicU64,
    dropped: AtomicU64,
    conflated: AtomicU64,
    forwarded: AtomicU64,
    failures: AtomicU64,
    running: AtomicBool,
}

impl ConflationInner {
    fn enqueue_at(&self, now: u64, metrics: Vec<Metric>) {
        let deadline = now.saturating_add(self.conflation_period);
        let mut bypass = Vec::new();

        for metric in metrics {
            if metric.metric_type().is_conflatable() {
                self.file(deadline, metric);
            } else {
                bypass.push(metric);
            }
        }

        if !bypass.is_empty() {
            self.forwarded.fetch_add(bypass.len() as u64, Ordering::Relaxed);
            self.forwarder.forward(bypass);
        }
    }

    fn file(&self, deadline: u64, metric: Metric) {
        loop {
            let window = self.windows.get_or_insert_with(deadline, Window::new);
            let guard = window.entries.read();
            let Some(entries) = guard.as_ref() else {
                // Drained between lookup and lock.
                continue;
            };

            match entries.entry(metric.identity().fqn_arc()) {
                Entry::Occupied(mut pending) => match pending.get_mut().conflate(&metric) {
                    Ok(()) => {
                        self.conflated.fetch_add(1, Ordering::Relaxed);
                    },
                    Err(e) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("Dropped metric [{}]: {}", metric.fqn(), e);
                    },
                },
                Entry::Vacant(slot) => {
                    if self.reserve() {
                        slot.insert(metric);
                        self.queued.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("Conflation queue full, dropped [{}]", metric.fqn());
                    }
                },
            }
            return;
        }
    }

    /// Claims one pending slot, never exceeding the cap.
    fn reserve(&self) -> bool {
        let previous = self.pending.fetch_add(1, Ordering::AcqRel);
        if previous >= self.max_queue_size {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    fn drain_at(&self, now: u64) -> usize {
        let expired = self.windows.drain_expired(now);
        if expired.is_empty() {
            return 0;
        }

        let mut index: HashMap<Arc<str>, usize> = HashMap::new();
        let mut forwards: Vec<Metric> = Vec::new();

        for (_, window) in expired {
            let Some(entries) = window.seal() else {
                continue;
            };
            self.pending.fetch_sub(entries.len(), Ordering::AcqRel);

            for (fqn, metric) in entries {
                match index.get(&fqn) {
                    Some(&i) => match forwards[i].conflate(&metric) {
                        Ok(()) => {
                            self.conflated.fetch_add(1, Ordering::Relaxed);
                        },
                        Err(e) => {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!("Dropped metric [{}] while draining: {}", fqn, e);
                        },
                    },
                    None => {
                        index.insert(fqn, forwards.len());
                        forwards.push(metric);
                    },
                }
            }
        }

        let count = forwards.len();
        if count > 0 {
            self.forwarded.fetch_add(count as u64, Ordering::Relaxed);
            self.forwarder.forward(forwards);
        }
        count
    }

    async fn run(&self, id: usize) {
        tracing::debug!("Conflation worker #{} started", id);
        while self.running.load(Ordering::Acquire) {
            match panic::catch_unwind(AssertUnwindSafe(|| self.drain_at(now_millis()))) {
                Ok(0) => {},
                Ok(forwarded) => {
                    tracing::trace!("Conflation worker #{} forwarded {} metrics", id, forwarded);
                },
                Err(_) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!("Conflation worker #{} drain pass panicked, continuing", id);
                },
            }
            tokio::time::sleep(self.drain_interval).await;
        }
        tracing::debug!("Conflation worker #{} stopped", id);
    }
}

/// Conflation queue in front of a [`MetricForwarder`].
pub struct ConflationService {
    inner: Arc<ConflationInner>,
    worker_threads: usize,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
}

impl ConflationService {
    pub fn new(config: &ConflationConfig, forwarder: Arc<dyn MetricForwarder>) -> Self {
        let conflation_period = u64::try_from(config.conflation_period.as_millis()).unwrap_or(u64::MAX);
        Self {
            inner: Arc::new(ConflationInner {
                windows: DelayQueue::new(),
                forwarder,
                max_queue_size: config.max_queue_size,
                conflation_period,
                drain_interval: config.drain_interval,
                pending: AtomicUsize::new(0),
                queued: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                conflated: AtomicU64::new(0),
                forwarded: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                running: AtomicBool::new(false),
            }),
            worker_threads: config.worker_threads.max(1),
            supervisors: Mutex::new(Vec::new()),
        }
    }

    /// Queues metrics using the wall clock.
    pub fn enqueue(&self, metrics: Vec<Metric>) {
        self.inner.enqueue_at(now_millis(), metrics);
    }

    /// Queues metrics as if they arrived at `now` (epoch milliseconds).
    pub fn enqueue_at(&self, now: u64, metrics: Vec<Metric>) {
        self.inner.enqueue_at(now, metrics);
    }

    /// Forwards every window that expired at or before `now`.
    ///
    /// Returns the number of samples forwarded.
    pub fn drain_at(&self, now: u64) -> usize {
        self.inner.drain_at(now)
    }

    /// Forwards everything still pending, regardless of deadline.
    pub fn flush(&self) -> usize {
        self.inner.drain_at(u64::MAX)
    }

    /// Spawns the drain workers on the current tokio runtime.
    ///
    /// A panic inside one drain pass is counted and the worker keeps going;
    /// the samples of that pass are lost. Each worker is also watched by a
    /// supervising task that logs a panic escaping the loop. Dead workers are
    /// not restarted.
    pub fn start(&self) {
        let mut supervisors = self.supervisors.lock();
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }

        for id in 0..self.worker_threads {
            let inner = Arc::clone(&self.inner);
            let worker = tokio::spawn(async move { inner.run(id).await });
            supervisors.push(tokio::spawn(async move {
                if let Err(e) = worker.await {
                    if e.is_panic() {
                        tracing::error!("Conflation worker #{} failed: {}", id, e);
                    }
                }
            }));
        }

        tracing::info!(
            "Conflation service started: {} workers, period {}ms, capacity {}",
            self.worker_threads,
            self.inner.conflation_period,
            self.inner.max_queue_size
        );
    }

    /// Signals the workers to stop without draining.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
    }

    /// Stops the workers and waits for them to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let supervisors: Vec<_> = self.supervisors.lock().drain(..).collect();
        for supervisor in supervisors {
            let _ = supervisor.await;
        }
        tracing::debug!("Conflation service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ConflationStats {
        let inner = &self.inner;
        ConflationStats {
            queued: inner.queued.load(Ordering::Relaxed),
            dropped: inner.dropped.load(Ordering::Relaxed),
            conflated: inner.conflated.load(Ordering::Relaxed),
            forwarded: inner.forwarded.load(Ordering::Relaxed),
            failures: inner.failures.load(Ordering::Relaxed),
            pending: inner.pending.load(Ordering::Relaxed),
            windows: inner.windows.len(),
        }
    }
}

impl MetricForwarder for ConflationService {
    fn forward(&self, metrics: Vec<Metric>) {
        self.enqueue(metrics);
    }
}

impl Drop for ConflationService {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MetricIdentity, MetricType, MetricValue};

    #[derive(Default)]
    struct Capture {
        batches: Mutex<Vec<Vec<Metric>>>,
    }

    impl Capture {
        fn all(&self) -> Vec<Metric> {
            self.batches.lock().iter().flatten().cloned().collect()
        }
    }

    impl MetricForwarder for Capture {
        fn forward(&self, metrics: Vec<Metric>) {
            self.batches.lock().push(metrics);
        }
    }

    fn service(max_queue_size: usize) -> (ConflationService, Arc<Capture>) {
        let capture = Arc::new(Capture::default());
        let config = ConflationConfig {
            max_queue_size,
            conflation_period: Duration::from_millis(1000),
            drain_interval: Duration::from_millis(10),
            ..ConflationConfig::default()
        };
        let forwarder: Arc<dyn MetricForwarder> = Arc::clone(&capture) as Arc<dyn MetricForwarder>;
        (ConflationService::new(&config, forwarder), capture)
    }

    fn metric(name: &str, metric_type: MetricType, value: i64, time: i64) -> Metric {
        let identity = Arc::new(MetricIdentity::new::<&str>("h1", "a1", name, metric_type, &[]));
        Metric::new(identity, time, MetricValue::Long(value))
    }

    #[test]
    fn test_same_window_conflates() {
        let (service, capture) = service(100);
        service.enqueue_at(
            5_000,
            vec![metric("cpu", MetricType::Gauge, 10, 1), metric("cpu", MetricType::Gauge, 42, 2)],
        );
        assert_eq!(service.stats().queued, 1);
        assert_eq!(service.stats().conflated, 1);
        assert_eq!(service.stats().pending, 1);

        // Not due yet.
        assert_eq!(service.drain_at(5_999), 0);
        assert_eq!(service.drain_at(6_000), 1);

        let forwarded = capture.all();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].long_value(), Some(42));
        assert_eq!(service.stats().forwarded, 1);
        assert_eq!(service.stats().pending, 0);
        assert_eq!(service.stats().windows, 0);

        // A new observation after the drain is forwarded independently.
        service.enqueue_at(7_000, vec![metric("cpu", MetricType::Gauge, 7, 3)]);
        assert_eq!(service.drain_at(8_000), 1);
        assert_eq!(capture.all().len(), 2);
    }

    #[test]
    fn test_drain_merges_windows_by_name() {
        let (service, capture) = service(100);
        service.enqueue_at(1_000, vec![metric("requests", MetricType::Delta, 3, 1)]);
        service.enqueue_at(1_001, vec![metric("requests", MetricType::Delta, 4, 2)]);
        service.enqueue_at(1_002, vec![metric("errors", MetricType::Delta, 1, 2)]);
        assert_eq!(service.stats().windows, 3);

        assert_eq!(service.drain_at(2_010), 2);
        let forwarded = capture.all();
        let requests = forwarded.iter().find(|m| m.fqn() == "h1/a1:requests").unwrap();
        assert_eq!(requests.long_value(), Some(7));
        assert_eq!(requests.time(), 2);
        assert_eq!(service.stats().conflated, 1);
        assert_eq!(capture.batches.lock().len(), 1);
    }

    #[test]
    fn test_drop_under_pressure() {
        let n = 5;
        let (service, _) = service(n);
        let metrics: Vec<_> = (0..=n)
            .map(|i| metric(&format!("m{}", i), MetricType::Gauge, 1, 1))
            .collect();
        service.enqueue_at(1_000, metrics);

        let stats = service.stats();
        assert_eq!(stats.queued, n as u64);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.pending, n);

        // Repeats of queued names still conflate at capacity.
        service.enqueue_at(1_000, vec![metric("m0", MetricType::Gauge, 2, 2)]);
        assert_eq!(service.stats().conflated, 1);
        assert_eq!(service.stats().dropped, 1);

        // Draining frees capacity.
        service.drain_at(2_000);
        service.enqueue_at(3_000, vec![metric("late", MetricType::Gauge, 1, 3)]);
        assert_eq!(service.stats().queued, n as u64 + 1);
    }

    #[test]
    fn test_non_conflatable_bypasses_queue() {
        let (service, capture) = service(100);
        let identity = Arc::new(MetricIdentity::new::<&str>("h1", "a1", "status", MetricType::Text, &[]));
        let text = Metric::new(identity, 1, MetricValue::Text("up".into()));
        service.enqueue_at(1_000, vec![text, metric("cpu", MetricType::Gauge, 1, 1)]);

        let forwarded = capture.all();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].fqn(), "h1/a1:status");
        assert_eq!(service.stats().forwarded, 1);
        assert_eq!(service.stats().queued, 1);
    }

    #[test]
    fn test_flush_forwards_everything() {
        let (service, capture) = service(100);
        service.enqueue_at(u64::MAX - 10, vec![metric("cpu", MetricType::Gauge, 1, 1)]);
        service.enqueue_at(1_000, vec![metric("mem", MetricType::Gauge, 1, 1)]);
        assert_eq!(service.flush(), 2);
        assert_eq!(capture.all().len(), 2);
        assert_eq!(service.stats().pending, 0);
    }

    #[test]
    fn test_concurrent_enqueue_respects_cap() {
        let (service, capture) = service(50);
        let service = Arc::new(service);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let service = Arc::clone(&service);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let m = metric(&format!("t{}m{}", t, i), MetricType::Gauge, 1, 1);
                        service.enqueue_at(1_000 + i as u64 % 3, vec![m]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = service.stats();
        assert_eq!(stats.queued, 50);
        assert_eq!(stats.dropped, 350);
        service.flush();
        assert_eq!(capture.all().len(), 50);
    }

    #[tokio::test]
    async fn test_workers_drain_on_wall_clock() {
        let capture = Arc::new(Capture::default());
        let config = ConflationConfig {
            conflation_period: Duration::from_millis(20),
            drain_interval: Duration::from_millis(5),
            worker_threads: 2,
            ..ConflationConfig::default()
        };
        let service = ConflationService::new(&config, Arc::clone(&capture) as Arc<dyn MetricForwarder>);
        service.start();
        assert!(service.is_running());

        service.enqueue(vec![metric("cpu", MetricType::Gauge, 1, 1)]);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while capture.all().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "metric never forwarded");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        service.shutdown().await;
        assert!(!service.is_running());
        assert_eq!(capture.all().len(), 1);
    }

    /// Panics on its first batch, captures the rest.
    #[derive(Default)]
    struct Faulty {
        calls: AtomicUsize,
        capture: Capture,
    }

    impl MetricForwarder for Faulty {
        fn forward(&self, metrics: Vec<Metric>) {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("destination exploded");
            }
            self.capture.forward(metrics);
        }
    }

    #[tokio::test]
    async fn test_worker_survives_panicking_forwarder() {
        let faulty = Arc::new(Faulty::default());
        let config = ConflationConfig {
            conflation_period: Duration::from_millis(20),
            drain_interval: Duration::from_millis(5),
            worker_threads: 1,
            ..ConflationConfig::default()
        };
        let service = ConflationService::new(&config, Arc::clone(&faulty) as Arc<dyn MetricForwarder>);
        service.start();

        service.enqueue(vec![metric("cpu", MetricType::Gauge, 1, 1)]);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while service.stats().failures == 0 {
            assert!(tokio::time::Instant::now() < deadline, "first drain never ran");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        service.enqueue(vec![metric("cpu", MetricType::Gauge, 2, 2)]);
        while faulty.capture.all().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "worker stopped after a failed drain");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        service.shutdown().await;
        let forwarded = faulty.capture.all();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].long_value(), Some(2));

        let stats = service.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.windows, 0);
    }
}
