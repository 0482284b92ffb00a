//! UDP listener for agent frames.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;

use super::channel::ChannelPool;
use super::handler::AgentMetricHandler;
use crate::core::config::ServerConfig;
use crate::core::{ApmError, Result};

/// Receives one frame per datagram and hands it to the handler.
///
/// Replies leave through the same socket, so agents behind NAT see them come
/// from the address they sent to.
pub struct UdpListener {
    socket: Arc<UdpSocket>,
    max_datagram_size: usize,
}

impl UdpListener {
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let address = SocketAddr::new(config.bind_address, config.port);
        let socket = UdpSocket::bind(address)
            .await
            .map_err(|e| ApmError::network(format!("Failed to bind UDP listener on {}: {}", address, e)))?;
        Ok(Self {
            socket: Arc::new(socket),
            max_datagram_size: config.max_datagram_size,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Reply channels sharing this listener's socket, closed after `idle_timeout` unused.
    pub fn channel_pool(&self, idle_timeout: Duration) -> ChannelPool {
        ChannelPool::udp(Arc::clone(&self.socket)).with_idle_timeout(idle_timeout)
    }

    /// Receives frames until `shutdown` flips to `true` or its sender is dropped.
    pub async fn serve(&self, handler: Arc<AgentMetricHandler>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut buf = vec![0u8; self.max_datagram_size];
        tracing::info!("Agent listener on udp://{}", self.local_addr()?);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                },
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, remote)) => {
                        if let Err(e) = handler.handle_frame(&buf[..len], Some(remote)) {
                            tracing::debug!("Dropped frame from {}: {}", remote, e);
                        }
                    },
                    Err(e) => {
                        // ICMP port-unreachable from a previous reply surfaces here on some
                        // platforms; the socket itself is still usable.
                        tracing::warn!("UDP receive failed: {}", e);
                    },
                },
            }
        }

        tracing::info!("Agent listener stopped");
        Ok(())
    }
}
