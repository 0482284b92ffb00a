//! Ingestion of decoded agent frames.
//!
//! For every metric in a frame the handler resolves the identity through the
//! catalog, queues the protocol replies the agent expects, then forwards the
//! whole batch downstream in one call. Replies are written asynchronously;
//! a failed reply is logged and counted, never retried.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use super::channel::ChannelPool;
use super::codec::{decode_frame, DecodedBatch, IncomingMetric, MetricKey, Reply};
use super::opcode::OpCode;
use crate::catalog::MetricCatalog;
use crate::core::time::now_millis;
use crate::core::{DelayQueue, Metric, Result};
use crate::router::MetricForwarder;

/// Ingestion counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HandlerStats {
    pub bytes_received: u64,
    pub metrics_received: u64,
    pub non_tokenized_metrics: u64,
    pub tokens_sent: u64,
    pub confirms_sent: u64,
    pub resets_sent: u64,
    pub reset_confirms_received: u64,
    pub token_lookup_drops: u64,
    pub decode_errors: u64,
    pub reply_failures: u64,
    /// Samples whose value does not fit the catalogued type
    pub type_mismatches: u64,
}

#[derive(Default)]
struct Counters {
    bytes_received: AtomicU64,
    metrics_received: AtomicU64,
    non_tokenized_metrics: AtomicU64,
    tokens_sent: AtomicU64,
    confirms_sent: AtomicU64,
    resets_sent: AtomicU64,
    reset_confirms_received: AtomicU64,
    token_lookup_drops: AtomicU64,
    decode_errors: AtomicU64,
    reply_failures: AtomicU64,
    type_mismatches: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Turns agent frames into routable metrics.
pub struct AgentMetricHandler {
    catalog: Arc<dyn MetricCatalog>,
    forwarder: Arc<dyn MetricForwarder>,
    channels: Arc<ChannelPool>,
    reset_timeout: u64,
    /// Agents sent a reset that has not been confirmed, with the time the
    /// reset may be repeated.
    pending_resets: DashMap<SocketAddr, u64>,
    reset_expiry: DelayQueue<Mutex<Vec<SocketAddr>>>,
    counters: Arc<Counters>,
}

impl AgentMetricHandler {
    pub fn new(
        catalog: Arc<dyn MetricCatalog>,
        forwarder: Arc<dyn MetricForwarder>,
        channels: Arc<ChannelPool>,
        reset_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            forwarder,
            channels,
            reset_timeout: u64::try_from(reset_timeout.as_millis()).unwrap_or(u64::MAX),
            pending_resets: DashMap::new(),
            reset_expiry: DelayQueue::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Decodes and handles one frame received from `remote`.
    pub fn handle_frame(&self, frame: &[u8], remote: Option<SocketAddr>) -> Result<usize> {
        match decode_frame(frame, remote) {
            Ok(batch) => Ok(self.handle(batch)),
            Err(e) => {
                Counters::add(&self.counters.bytes_received, frame.len());
                Counters::incr(&self.counters.decode_errors);
                Err(e)
            },
        }
    }

    /// Submits metrics from inside the process. No replies are sent.
    pub fn submit(&self, metrics: Vec<IncomingMetric>) -> usize {
        self.handle(DecodedBatch::local(metrics))
    }

    /// Handles a decoded batch. Returns the number of metrics forwarded.
    pub fn handle(&self, batch: DecodedBatch) -> usize {
        self.handle_at(now_millis(), batch)
    }

    /// Handles a decoded batch as if it arrived at `now` (epoch milliseconds).
    pub fn handle_at(&self, now: u64, batch: DecodedBatch) -> usize {
        self.expire_resets(now);

        let counters = &self.counters;
        Counters::add(&counters.bytes_received, batch.bytes);
        Counters::add(&counters.decode_errors, batch.malformed);

        if batch.op_code == OpCode::ResetConfirm {
            Counters::incr(&counters.reset_confirms_received);
            if let Some(remote) = batch.remote {
                self.pending_resets.remove(&remote);
                tracing::debug!("Agent {} confirmed token reset", remote);
            }
            return 0;
        }

        let remote = batch.remote;
        let confirm = batch.op_code.wants_confirm() && remote.is_some();
        let mut replies = Vec::new();
        let mut metrics = Vec::with_capacity(batch.metrics.len());

        for incoming in batch.metrics {
            let identity = match &incoming.key {
                MetricKey::Token(token) => match self.catalog.lookup_by_token(*token) {
                    Some(identity) => identity,
                    None => {
                        Counters::incr(&counters.token_lookup_drops);
                        tracing::debug!("Token lookup miss [{}] from {:?}", token, remote);
                        if let Some(remote) = remote {
                            if self.reset_due(remote, now) {
                                replies.push(Reply::Reset);
                            }
                        }
                        continue;
                    },
                },
                MetricKey::Named(name) => {
                    let namespace = name.namespace_refs();
                    let identity = self.catalog.resolve(
                        &name.host,
                        &name.agent,
                        &name.name,
                        incoming.metric_type,
                        &namespace,
                    );
                    Counters::incr(&counters.non_tokenized_metrics);
                    let token = self.catalog.tokenize(&identity);
                    if remote.is_some() {
                        replies.push(Reply::TokenAssign {
                            fqn: identity.fqn().to_string(),
                            token,
                        });
                    }
                    identity
                },
            };

            // The catalogued type wins; a sample that cannot be read as it is dropped.
            if !identity.metric_type().accepts(&incoming.value) {
                Counters::incr(&counters.type_mismatches);
                tracing::debug!(
                    "Dropped [{}] from {:?}: {} value for a {} metric",
                    identity.fqn(),
                    remote,
                    incoming.metric_type,
                    identity.metric_type()
                );
                continue;
            }

            let metric = Metric::new(identity, incoming.time, incoming.value);
            if confirm {
                replies.push(Reply::Confirm {
                    key: metric.confirm_key(),
                });
            }
            metrics.push(metric);
        }

        if let Some(remote) = remote {
            if !replies.is_empty() {
                self.send_replies(remote, replies);
            }
        }

        let count = metrics.len();
        Counters::add(&counters.metrics_received, count);
        if count > 0 {
            self.forwarder.forward(metrics);
        }
        count
    }

    /// Claims the right to send a reset to `remote`.
    fn reset_due(&self, remote: SocketAddr, now: u64) -> bool {
        let expires = now.saturating_add(self.reset_timeout);
        let due = match self.pending_resets.entry(remote) {
            Entry::Occupied(mut pending) => {
                if *pending.get() <= now {
                    pending.insert(expires);
                    true
                } else {
                    false
                }
            },
            Entry::Vacant(slot) => {
                slot.insert(expires);
                true
            },
        };
        if due {
            self.reset_expiry
                .get_or_insert_with(expires, || Mutex::new(Vec::new()))
                .lock()
                .push(remote);
        }
        due
    }

    fn expire_resets(&self, now: u64) {
        for (_, addresses) in self.reset_expiry.drain_expired(now) {
            for remote in addresses.lock().drain(..) {
                self.pending_resets.remove_if(&remote, |_, until| *until <= now);
            }
        }
    }

    /// Agents with an unconfirmed reset
    pub fn pending_resets(&self) -> usize {
        self.pending_resets.len()
    }

    fn send_replies(&self, remote: SocketAddr, replies: Vec<Reply>) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                Counters::add(&self.counters.reply_failures, replies.len());
                tracing::warn!("No runtime to reply to {}, dropped {} replies", remote, replies.len());
                return;
            },
        };

        let channels = Arc::clone(&self.channels);
        let counters = Arc::clone(&self.counters);
        runtime.spawn(async move {
            for reply in replies {
                match channels.send(remote, reply.encode()).await {
                    Ok(()) => match reply {
                        Reply::TokenAssign { .. } => Counters::incr(&counters.tokens_sent),
                        Reply::Confirm { .. } => Counters::incr(&counters.confirms_sent),
                        Reply::Reset => Counters::incr(&counters.resets_sent),
                    },
                    Err(e) => {
                        Counters::incr(&counters.reply_failures);
                        tracing::warn!("Failed to send {:?} to {}: {}", reply, remote, e);
                    },
                }
            }
        });
    }

    pub fn stats(&self) -> HandlerStats {
        let c = &self.counters;
        HandlerStats {
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            metrics_received: c.metrics_received.load(Ordering::Relaxed),
            non_tokenized_metrics: c.non_tokenized_metrics.load(Ordering::Relaxed),
            tokens_sent: c.tokens_sent.load(Ordering::Relaxed),
            confirms_sent: c.confirms_sent.load(Ordering::Relaxed),
            resets_sent: c.resets_sent.load(Ordering::Relaxed),
            reset_confirms_received: c.reset_confirms_received.load(Ordering::Relaxed),
            token_lookup_drops: c.token_lookup_drops.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            reply_failures: c.reply_failures.load(Ordering::Relaxed),
            type_mismatches: c.type_mismatches.load(Ordering::Relaxed),
        }
    }
}
