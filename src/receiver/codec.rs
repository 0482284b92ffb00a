//! Binary codec for agent frames.
//!
//! All integers are big-endian. An inbound metric frame is
//!
//! ```text
//! opcode:u8  count:u32  { length:u32  body[length] } * count
//! ```
//!
//! and each body is
//!
//! ```text
//! token:i64  type:u8  [host agent ns_count:u32 ns* name]  time:i64  value
//! ```
//!
//! where the bracketed name part is only present when `token` is `-1`. Strings
//! are `length:u32` followed by UTF-8. Long values are an `i64`, error and text
//! values a string, blobs `length:u32` followed by raw bytes.

use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::opcode::OpCode;
use crate::core::types::{render_fqn, NO_TOKEN};
use crate::core::{ApmError, MetricType, MetricValue, Result};

/// Identifiers of a metric sent in full form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricName {
    pub host: String,
    pub agent: String,
    pub namespace: Vec<String>,
    pub name: String,
}

impl MetricName {
    pub fn new<S: AsRef<str>>(host: &str, agent: &str, namespace: &[S], name: &str) -> Self {
        Self {
            host: host.to_string(),
            agent: agent.to_string(),
            namespace: namespace.iter().map(|s| s.as_ref().to_string()).collect(),
            name: name.to_string(),
        }
    }

    /// Namespace as borrowed segments
    pub fn namespace_refs(&self) -> Vec<&str> {
        self.namespace.iter().map(String::as_str).collect()
    }

    pub fn fqn(&self) -> String {
        render_fqn(&self.host, &self.agent, &self.name, &self.namespace)
    }
}

/// How an incoming metric refers to its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricKey {
    /// Compact form: a token assigned earlier
    Token(i64),
    /// Full form: the agent holds no token for this metric yet
    Named(MetricName),
}

/// One decoded metric, before identity resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMetric {
    pub key: MetricKey,
    pub metric_type: MetricType,
    pub time: i64,
    pub value: MetricValue,
}

impl IncomingMetric {
    /// Full-form long metric
    pub fn long(name: MetricName, metric_type: MetricType, time: i64, value: i64) -> Self {
        Self {
            key: MetricKey::Named(name),
            metric_type,
            time,
            value: MetricValue::Long(value),
        }
    }

    /// Token-form metric
    pub fn tokenized(token: i64, metric_type: MetricType, time: i64, value: MetricValue) -> Self {
        Self {
            key: MetricKey::Token(token),
            metric_type,
            time,
            value,
        }
    }

    /// Wire token, `-1` for the full form
    pub fn token(&self) -> i64 {
        match self.key {
            MetricKey::Token(token) => token,
            MetricKey::Named(_) => NO_TOKEN,
        }
    }
}

/// A decoded frame from one agent.
#[derive(Debug, Clone)]
pub struct DecodedBatch {
    pub op_code: OpCode,
    /// Sender address; `None` for in-process submissions
    pub remote: Option<SocketAddr>,
    pub metrics: Vec<IncomingMetric>,
    /// Frame size on the wire
    pub bytes: usize,
    /// Bodies that failed to decode and were skipped
    pub malformed: usize,
}

impl DecodedBatch {
    /// A batch submitted in-process, without a reply address.
    pub fn local(metrics: Vec<IncomingMetric>) -> Self {
        Self {
            op_code: OpCode::SendMetric,
            remote: None,
            metrics,
            bytes: 0,
            malformed: 0,
        }
    }
}

fn need(buf: &impl Buf, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(ApmError::decode(format!(
            "truncated {}: need {} bytes, {} left",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_len(buf: &mut impl Buf, what: &str) -> Result<usize> {
    need(buf, 4, what)?;
    let len = buf.get_u32() as usize;
    need(buf, len, what)?;
    Ok(len)
}

fn get_string(buf: &mut impl Buf, what: &str) -> Result<String> {
    let len = get_len(buf, what)?;
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|e| ApmError::decode(format!("{} is not UTF-8: {}", what, e)))
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Decodes one metric body.
pub fn decode_metric(mut body: &[u8]) -> Result<IncomingMetric> {
    need(&body, 9, "metric header")?;
    let token = body.get_i64();
    let ordinal = body.get_u8();
    let metric_type = MetricType::from_ordinal(ordinal)
        .ok_or_else(|| ApmError::decode(format!("unknown metric type {}", ordinal)))?;

    let key = if token == NO_TOKEN {
        let host = get_string(&mut body, "host")?;
        let agent = get_string(&mut body, "agent")?;
        need(&body, 4, "namespace count")?;
        let count = body.get_u32() as usize;
        let mut namespace = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            namespace.push(get_string(&mut body, "namespace")?);
        }
        let name = get_string(&mut body, "name")?;
        MetricKey::Named(MetricName {
            host,
            agent,
            namespace,
            name,
        })
    } else {
        MetricKey::Token(token)
    };

    need(&body, 8, "time")?;
    let time = body.get_i64();

    let value = match metric_type {
        MetricType::Gauge | MetricType::Delta => {
            need(&body, 8, "long value")?;
            MetricValue::Long(body.get_i64())
        },
        MetricType::Error | MetricType::Text => MetricValue::Text(get_string(&mut body, "text value")?),
        MetricType::Blob => {
            let len = get_len(&mut body, "blob value")?;
            MetricValue::Blob(body.copy_to_bytes(len))
        },
    };

    Ok(IncomingMetric {
        key,
        metric_type,
        time,
        value,
    })
}

/// Decodes a frame received from `remote`.
///
/// Bodies that fail to decode are skipped and counted in
/// [`DecodedBatch::malformed`]; a frame whose framing is broken is an error.
pub fn decode_frame(frame: &[u8], remote: Option<SocketAddr>) -> Result<DecodedBatch> {
    let mut buf = frame;
    need(&buf, 1, "opcode")?;
    let op_code = OpCode::try_from(buf.get_u8())?;

    let mut batch = DecodedBatch {
        op_code,
        remote,
        metrics: Vec::new(),
        bytes: frame.len(),
        malformed: 0,
    };

    match op_code {
        OpCode::ResetConfirm => return Ok(batch),
        OpCode::SendMetric | OpCode::SendMetricDirect => {},
        other => return Err(ApmError::protocol(format!("{} is not accepted from agents", other))),
    }

    need(&buf, 4, "metric count")?;
    let count = buf.get_u32() as usize;
    batch.metrics.reserve(count.min(1024));

    for i in 0..count {
        let len = match get_len(&mut buf, "metric body") {
            Ok(len) => len,
            Err(e) => {
                // Framing lost: the remaining bodies cannot be located.
                batch.malformed += count - i;
                tracing::debug!("Frame from {:?} cut short: {}", remote, e);
                break;
            },
        };
        let (body, rest) = buf.split_at(len);
        buf = rest;
        match decode_metric(body) {
            Ok(metric) => batch.metrics.push(metric),
            Err(e) => {
                batch.malformed += 1;
                tracing::debug!("Skipping malformed metric from {:?}: {}", remote, e);
            },
        }
    }

    Ok(batch)
}

/// Encodes one metric body.
pub fn encode_metric(metric: &IncomingMetric) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_i64(metric.token());
    buf.put_u8(metric.metric_type.ordinal());
    if let MetricKey::Named(name) = &metric.key {
        put_string(&mut buf, &name.host);
        put_string(&mut buf, &name.agent);
        buf.put_u32(name.namespace.len() as u32);
        for segment in &name.namespace {
            put_string(&mut buf, segment);
        }
        put_string(&mut buf, &name.name);
    }
    buf.put_i64(metric.time);
    match &metric.value {
        MetricValue::Long(v) => buf.put_i64(*v),
        MetricValue::Text(s) => put_string(&mut buf, s),
        MetricValue::Blob(b) => {
            buf.put_u32(b.len() as u32);
            buf.put_slice(b);
        },
    }
    buf.freeze()
}

/// Encodes a metric frame as an agent would send it.
pub fn encode_frame(op_code: OpCode, metrics: &[IncomingMetric]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + metrics.len() * 64);
    buf.put_u8(op_code.byte());
    buf.put_u32(metrics.len() as u32);
    for metric in metrics {
        let body = encode_metric(metric);
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
    }
    buf.freeze()
}

/// `TOKEN_ASSIGN`: FQN length, FQN, token
pub fn encode_token_assign(fqn: &str, token: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 4 + fqn.len() + 8);
    buf.put_u8(OpCode::TokenAssign.byte());
    put_string(&mut buf, fqn);
    buf.put_i64(token);
    buf.freeze()
}

/// `CONFIRM`: key length, key
pub fn encode_confirm(key: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 4 + key.len());
    buf.put_u8(OpCode::Confirm.byte());
    put_string(&mut buf, key);
    buf.freeze()
}

/// `RESET`: opcode only
pub fn encode_reset() -> Bytes {
    Bytes::from_static(&[OpCode::Reset as u8])
}

/// `RESET_CONFIRM`: opcode only
pub fn encode_reset_confirm() -> Bytes {
    Bytes::from_static(&[OpCode::ResetConfirm as u8])
}

/// A reply frame sent to an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    TokenAssign { fqn: String, token: i64 },
    Confirm { key: String },
    Reset,
}

impl Reply {
    pub fn encode(&self) -> Bytes {
        match self {
            Reply::TokenAssign { fqn, token } => encode_token_assign(fqn, *token),
            Reply::Confirm { key } => encode_confirm(key),
            Reply::Reset => encode_reset(),
        }
    }

    /// Parses a reply frame, as an agent would.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut buf = frame;
        need(&buf, 1, "opcode")?;
        match OpCode::try_from(buf.get_u8())? {
            OpCode::TokenAssign => {
                let fqn = get_string(&mut buf, "fqn")?;
                need(&buf, 8, "token")?;
                Ok(Reply::TokenAssign {
                    fqn,
                    token: buf.get_i64(),
                })
            },
            OpCode::Confirm => Ok(Reply::Confirm {
                key: get_string(&mut buf, "key")?,
            }),
            OpCode::Reset => Ok(Reply::Reset),
            other => Err(ApmError::protocol(format!("{} is not a reply", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cpu_load() -> IncomingMetric {
        IncomingMetric::long(
            MetricName::new::<&str>("h1", "a1", &[], "cpu.load"),
            MetricType::Gauge,
            1000,
            42,
        )
    }

    #[test]
    fn test_decode_frame() {
        let metrics = vec![
            cpu_load(),
            IncomingMetric::tokenized(7, MetricType::Delta, 1001, MetricValue::Long(-3)),
            IncomingMetric::tokenized(8, MetricType::Text, 1002, MetricValue::Text("up".into())),
            IncomingMetric::tokenized(9, MetricType::Blob, 1003, MetricValue::Blob(Bytes::from_static(b"\x00\x01"))),
            IncomingMetric {
                key: MetricKey::Named(MetricName::new("h1", "a1", &["jvm", "heap"], "oom")),
                metric_type: MetricType::Error,
                time: 1004,
                value: MetricValue::Text("OutOfMemoryError".into()),
            },
        ];
        let frame = encode_frame(OpCode::SendMetricDirect, &metrics);
        let batch = decode_frame(&frame, None).unwrap();

        assert_eq!(batch.op_code, OpCode::SendMetricDirect);
        assert_eq!(batch.bytes, frame.len());
        assert_eq!(batch.malformed, 0);
        assert_eq!(batch.metrics, metrics);
    }

    #[test]
    fn test_token_assign_layout() {
        let frame = encode_token_assign("h1/a1:cpu.load", 5);
        let mut expected = vec![2u8, 0, 0, 0, 14];
        expected.extend_from_slice(b"h1/a1:cpu.load");
        expected.extend_from_slice(&5i64.to_be_bytes());
        assert_eq!(frame.to_vec(), expected);
    }

    #[test]
    fn test_confirm_and_reset_layout() {
        let frame = encode_confirm("h1/a1:cpu.load1000");
        assert_eq!(frame[0], 3);
        assert_eq!(&frame[1..5], &18u32.to_be_bytes());
        assert_eq!(&frame[5..], b"h1/a1:cpu.load1000");
        assert_eq!(encode_reset().to_vec(), vec![4u8]);
        assert_eq!(
            Reply::decode(&frame).unwrap(),
            Reply::Confirm {
                key: "h1/a1:cpu.load1000".into()
            }
        );
    }

    #[test]
    fn test_malformed_body_is_skipped() {
        let good = encode_metric(&cpu_load());
        let mut bad = BytesMut::new();
        bad.put_i64(3);
        bad.put_u8(42); // unknown type

        let mut frame = BytesMut::new();
        frame.put_u8(OpCode::SendMetric.byte());
        frame.put_u32(3);
        for body in [&good[..], &bad[..], &good[..]] {
            frame.put_u32(body.len() as u32);
            frame.put_slice(body);
        }

        let batch = decode_frame(&frame, None).unwrap();
        assert_eq!(batch.metrics.len(), 2);
        assert_eq!(batch.malformed, 1);
    }

    #[test]
    fn test_truncated_frame_keeps_decoded_metrics() {
        let frame = encode_frame(OpCode::SendMetric, &[cpu_load(), cpu_load()]);
        let cut = &frame[..frame.len() - 3];
        let batch = decode_frame(cut, None).unwrap();
        assert_eq!(batch.metrics.len(), 1);
        assert_eq!(batch.malformed, 1);
    }

    #[test]
    fn test_reset_confirm_frame() {
        let batch = decode_frame(&encode_reset_confirm(), None).unwrap();
        assert_eq!(batch.op_code, OpCode::ResetConfirm);
        assert!(batch.metrics.is_empty());
    }

    #[test]
    fn test_rejects_server_opcodes_and_garbage() {
        assert!(decode_frame(&encode_reset(), None).is_err());
        assert!(decode_frame(&[], None).is_err());
        assert!(decode_frame(&[9], None).is_err());
        assert!(decode_frame(&[0, 0, 0], None).is_err());
    }
}
