//! Agent protocol receiver.
//!
//! This module implements the binary agent protocol: frame decoding, the
//! ingestion handler that resolves identities and answers agents, the pooled
//! reply channels and the UDP listener.

pub mod channel;
pub mod codec;
pub mod handler;
pub mod opcode;
pub mod udp;

pub use channel::{AgentChannel, ChannelPool, UdpAgentChannel};
pub use codec::{decode_frame, encode_frame, DecodedBatch, IncomingMetric, MetricKey, MetricName, Reply};
pub use handler::{AgentMetricHandler, HandlerStats};
pub use opcode::OpCode;
pub use udp::UdpListener;
