//! Reverse channels used to reply to agents.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;

use crate::core::time::now_millis;
use crate::core::{ApmError, DelayQueue, Result};

/// Outbound path to one agent.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    /// Writes one reply frame.
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Address of the agent
    fn remote(&self) -> SocketAddr;

    /// True once a write has failed
    fn is_closed(&self) -> bool;
}

/// Replies over the listener's own UDP socket.
pub struct UdpAgentChannel {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    closed: AtomicBool,
}

impl UdpAgentChannel {
    pub fn new(socket: Arc<UdpSocket>, remote: SocketAddr) -> Self {
        Self {
            socket,
            remote,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl AgentChannel for UdpAgentChannel {
    async fn send(&self, frame: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(ApmError::ChannelClosed(self.remote.to_string()));
        }
        match self.socket.send_to(&frame, self.remote).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.closed.store(true, Ordering::Release);
                Err(ApmError::network(format!("reply to {} failed: {}", self.remote, e)))
            },
        }
    }

    fn remote(&self) -> SocketAddr {
        self.remote
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

type Connector = Arc<dyn Fn(SocketAddr) -> Arc<dyn AgentChannel> + Send + Sync>;

/// Channels idle this long are closed unless configured otherwise.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct Pooled {
    channel: Arc<dyn AgentChannel>,
    last_used: AtomicU64,
}

impl Pooled {
    fn new(channel: Arc<dyn AgentChannel>, now: u64) -> Self {
        Self {
            channel,
            last_used: AtomicU64::new(now),
        }
    }

    fn touch(&self, now: u64) {
        self.last_used.fetch_max(now, Ordering::AcqRel);
    }
}

/// Channels keyed by agent address, opened on first use.
///
/// A channel whose write fails is evicted; the next reply opens a new one.
/// A channel unused for the idle timeout is evicted on a later lookup, so
/// agents that come back on a new source port do not pile up.
pub struct ChannelPool {
    channels: DashMap<SocketAddr, Pooled>,
    connector: Option<Connector>,
    idle_timeout: u64,
    expiry: DelayQueue<Mutex<Vec<SocketAddr>>>,
}

impl ChannelPool {
    /// Pool that only serves channels added with [`ChannelPool::insert`].
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            connector: None,
            idle_timeout: millis(DEFAULT_IDLE_TIMEOUT),
            expiry: DelayQueue::new(),
        }
    }

    /// Pool opening [`UdpAgentChannel`]s on a shared socket.
    pub fn udp(socket: Arc<UdpSocket>) -> Self {
        Self::with_connector(move |remote| {
            Arc::new(UdpAgentChannel::new(Arc::clone(&socket), remote)) as Arc<dyn AgentChannel>
        })
    }

    /// Pool opening channels with `connector`.
    pub fn with_connector<F>(connector: F) -> Self
    where
        F: Fn(SocketAddr) -> Arc<dyn AgentChannel> + Send + Sync + 'static,
    {
        Self {
            connector: Some(Arc::new(connector)),
            ..Self::new()
        }
    }

    /// Sets how long a channel may go unused before it is evicted.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = millis(idle_timeout).max(1);
        self
    }

    /// Returns the channel for `remote`, opening one if possible.
    pub fn get(&self, remote: SocketAddr) -> Option<Arc<dyn AgentChannel>> {
        self.get_at(remote, now_millis())
    }

    /// Same as [`ChannelPool::get`] with `now` as the current time (epoch ms).
    pub fn get_at(&self, remote: SocketAddr, now: u64) -> Option<Arc<dyn AgentChannel>> {
        self.evict_idle(now);

        if let Some(pooled) = self.channels.get(&remote) {
            if !pooled.channel.is_closed() {
                pooled.touch(now);
                return Some(Arc::clone(&pooled.channel));
            }
        }
        let connector = self.connector.as_ref()?;
        let channel = match self.channels.entry(remote) {
            Entry::Occupied(mut e) => {
                if e.get().channel.is_closed() {
                    e.insert(Pooled::new(connector(remote), now));
                } else {
                    e.get().touch(now);
                }
                Arc::clone(&e.get().channel)
            },
            Entry::Vacant(e) => Arc::clone(&e.insert(Pooled::new(connector(remote), now)).channel),
        };
        self.schedule(remote, now.saturating_add(self.idle_timeout));
        Some(channel)
    }

    pub fn insert(&self, channel: Arc<dyn AgentChannel>) {
        let now = now_millis();
        let remote = channel.remote();
        self.channels.insert(remote, Pooled::new(channel, now));
        self.schedule(remote, now.saturating_add(self.idle_timeout));
    }

    pub fn evict(&self, remote: &SocketAddr) -> bool {
        self.channels.remove(remote).is_some()
    }

    /// Evicts every channel unused for the idle timeout as of `now`.
    ///
    /// Channels used since they were scheduled are checked again later.
    /// Returns the number of channels evicted.
    pub fn evict_idle(&self, now: u64) -> usize {
        let mut evicted = 0;
        for (_, slot) in self.expiry.drain_expired(now) {
            let remotes = std::mem::take(&mut *slot.lock());
            for remote in remotes {
                let mut due_again = None;
                let removed = self.channels.remove_if(&remote, |_, pooled| {
                    let due = pooled.last_used.load(Ordering::Acquire).saturating_add(self.idle_timeout);
                    if due <= now {
                        return true;
                    }
                    due_again = Some(due);
                    false
                });
                if removed.is_some() {
                    evicted += 1;
                } else if let Some(due) = due_again {
                    self.schedule(remote, due);
                }
            }
        }
        if evicted > 0 {
            tracing::debug!("Evicted {} idle reply channels", evicted);
        }
        evicted
    }

    fn schedule(&self, remote: SocketAddr, deadline: u64) {
        let slot = self.expiry.get_or_insert_with(deadline, || Mutex::new(Vec::new()));
        let mut remotes = slot.lock();
        if !remotes.contains(&remote) {
            remotes.push(remote);
        }
    }

    /// Sends a frame to `remote`, evicting the channel if the write fails.
    pub async fn send(&self, remote: SocketAddr, frame: Bytes) -> Result<()> {
        let channel = self
            .get(remote)
            .ok_or_else(|| ApmError::ChannelClosed(remote.to_string()))?;
        let result = channel.send(frame).await;
        if result.is_err() || channel.is_closed() {
            self.channels.remove_if(&remote, |_, pooled| Arc::ptr_eq(&pooled.channel, &channel));
            tracing::debug!("Evicted reply channel for {}", remote);
        }
        result
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Default for ChannelPool {
    fn default() -> Self {
        Self::new()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
