use crate::core::error::{ApmError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Separator between host, agent and namespace segments of an FQN
pub const NS_DELIM: char = '/';
/// Separator between the namespace path and the metric name
pub const NAME_DELIM: char = ':';
/// Substituted for empty host, agent or metric names
pub const PLACEHOLDER: &str = "unknown";
/// Token value of an identity that has not been tokenized yet
pub const NO_TOKEN: i64 = -1;

/// Closed set of metric types understood by the router.
///
/// The discriminant is the wire ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum MetricType {
    /// Point-in-time long value (heap size, queue depth)
    Gauge = 0,
    /// Long increment since the previous sample (requests, errors)
    Delta = 1,
    /// Error report carrying a message
    Error = 2,
    /// Free-form text value
    Text = 3,
    /// Opaque binary payload
    Blob = 4,
}

impl MetricType {
    /// All types, indexed by ordinal
    pub const ALL: [MetricType; 5] = [
        MetricType::Gauge,
        MetricType::Delta,
        MetricType::Error,
        MetricType::Text,
        MetricType::Blob,
    ];

    /// Returns the type for a wire ordinal
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(usize::from(ordinal)).copied()
    }

    /// Returns the type for a case-insensitive name
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(name))
    }

    /// Wire ordinal of this type
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Lowercase name of this type
    pub fn as_str(self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Delta => "delta",
            MetricType::Error => "error",
            MetricType::Text => "text",
            MetricType::Blob => "blob",
        }
    }

    /// True for types whose value is a long
    pub fn is_long(self) -> bool {
        matches!(self, MetricType::Gauge | MetricType::Delta)
    }

    /// True for counter-like types that accumulate on merge
    pub fn is_counter(self) -> bool {
        matches!(self, MetricType::Delta)
    }

    /// True if samples of this type may be held back and merged
    pub fn is_conflatable(self) -> bool {
        self.is_long()
    }

    /// True if `value` is the kind of value this type carries
    pub fn accepts(self, value: &MetricValue) -> bool {
        match value {
            MetricValue::Long(_) => self.is_long(),
            MetricValue::Text(_) => matches!(self, MetricType::Error | MetricType::Text),
            MetricValue::Blob(_) => self == MetricType::Blob,
        }
    }

    /// Merges an incoming value into the current one.
    ///
    /// Gauges keep the incoming (later) value, counters add up.
    pub fn merge(self, current: &MetricValue, incoming: &MetricValue) -> Result<MetricValue> {
        match (self, current, incoming) {
            (MetricType::Gauge, MetricValue::Long(_), MetricValue::Long(v)) => {
                Ok(MetricValue::Long(*v))
            },
            (MetricType::Delta, MetricValue::Long(a), MetricValue::Long(b)) => {
                Ok(MetricValue::Long(a.saturating_add(*b)))
            },
            (t, _, _) if !t.is_conflatable() => {
                Err(ApmError::conflation(format!("{} values cannot be conflated", t)))
            },
            (t, current, incoming) => Err(ApmError::conflation(format!(
                "cannot merge {:?} into {:?} for type {}",
                incoming, current, t
            ))),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value carried by a metric sample
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// Gauge and delta values
    Long(i64),
    /// Error messages and text values
    Text(String),
    /// Blob payloads
    Blob(Bytes),
}

impl MetricValue {
    /// Returns the long value, if this is one
    pub fn as_long(&self) -> Option<i64> {
        match self {
            MetricValue::Long(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Long(v) => write!(f, "{}", v),
            MetricValue::Text(s) => f.write_str(s),
            MetricValue::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// Normalizes one identifier segment.
///
/// Empty segments become [`PLACEHOLDER`], delimiters are replaced with `_`.
pub fn sanitize_segment(segment: &str) -> String {
    let trimmed = segment.trim();
    if trimmed.is_empty() {
        return PLACEHOLDER.to_string();
    }
    trimmed
        .chars()
        .map(|c| if c == NS_DELIM || c == NAME_DELIM { '_' } else { c })
        .collect()
}

/// Normalizes namespace segments, dropping the empty ones.
pub fn sanitize_namespace<S: AsRef<str>>(namespace: &[S]) -> Vec<String> {
    namespace
        .iter()
        .map(AsRef::as_ref)
        .filter(|s| !s.trim().is_empty())
        .map(sanitize_segment)
        .collect()
}

/// Renders the fully-qualified name `host/agent[/ns...]:name`.
///
/// Inputs are sanitized, so two calls with equivalent identifiers always agree.
pub fn render_fqn<S: AsRef<str>>(host: &str, agent: &str, name: &str, namespace: &[S]) -> String {
    let mut fqn = String::with_capacity(host.len() + agent.len() + name.len() + 16);
    fqn.push_str(&sanitize_segment(host));
    fqn.push(NS_DELIM);
    fqn.push_str(&sanitize_segment(agent));
    for segment in sanitize_namespace(namespace) {
        fqn.push(NS_DELIM);
        fqn.push_str(&segment);
    }
    fqn.push(NAME_DELIM);
    fqn.push_str(&sanitize_segment(name));
    fqn
}

/// The parts of a parsed FQN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FqnParts {
    pub host: String,
    pub agent: String,
    pub namespace: Vec<String>,
    pub name: String,
}

impl FqnParts {
    /// Splits an FQN back into its parts.
    pub fn parse(fqn: &str) -> Result<Self> {
        let (path, name) = fqn
            .split_once(NAME_DELIM)
            .ok_or_else(|| ApmError::decode(format!("FQN [{}] has no metric name", fqn)))?;
        let mut segments = path.split(NS_DELIM);
        let host = segments.next().unwrap_or_default();
        let agent = segments
            .next()
            .ok_or_else(|| ApmError::decode(format!("FQN [{}] has no agent", fqn)))?;
        Ok(Self {
            host: host.to_string(),
            agent: agent.to_string(),
            namespace: segments.map(str::to_string).collect(),
            name: name.to_string(),
        })
    }
}

/// Stable identity of one metric.
///
/// The FQN is derived once at construction and never changes. The token starts
/// at [`NO_TOKEN`] and is set at most once.
#[derive(Debug)]
pub struct MetricIdentity {
    host: String,
    agent: String,
    namespace: Vec<String>,
    name: String,
    metric_type: MetricType,
    fqn: Arc<str>,
    token: AtomicI64,
}

impl MetricIdentity {
    /// Creates an untokenized identity from raw identifiers
    pub fn new<S: AsRef<str>>(
        host: &str,
        agent: &str,
        name: &str,
        metric_type: MetricType,
        namespace: &[S],
    ) -> Self {
        let namespace = sanitize_namespace(namespace);
        let fqn: Arc<str> = Arc::from(render_fqn(host, agent, name, &namespace));
        Self {
            host: sanitize_segment(host),
            agent: sanitize_segment(agent),
            namespace,
            name: sanitize_segment(name),
            metric_type,
            fqn,
            token: AtomicI64::new(NO_TOKEN),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn namespace(&self) -> &[String] {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    /// Fully-qualified name
    pub fn fqn(&self) -> &str {
        &self.fqn
    }

    /// Shared handle to the fully-qualified name
    pub fn fqn_arc(&self) -> Arc<str> {
        Arc::clone(&self.fqn)
    }

    /// Current token, or [`NO_TOKEN`]
    pub fn token(&self) -> i64 {
        self.token.load(Ordering::Acquire)
    }

    pub fn is_tokenized(&self) -> bool {
        self.token() != NO_TOKEN
    }

    /// Sets the token once. Returns the token already held on failure.
    pub(crate) fn set_token(&self, token: i64) -> std::result::Result<(), i64> {
        self.token
            .compare_exchange(NO_TOKEN, token, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }
}

impl fmt::Display for MetricIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, token={})", self.fqn, self.metric_type, self.token())
    }
}

/// A routable metric sample
#[derive(Debug, Clone)]
pub struct Metric {
    identity: Arc<MetricIdentity>,
    time: i64,
    value: MetricValue,
}

impl Metric {
    pub fn new(identity: Arc<MetricIdentity>, time: i64, value: MetricValue) -> Self {
        Self {
            identity,
            time,
            value,
        }
    }

    pub fn identity(&self) -> &Arc<MetricIdentity> {
        &self.identity
    }

    pub fn fqn(&self) -> &str {
        self.identity.fqn()
    }

    pub fn token(&self) -> i64 {
        self.identity.token()
    }

    pub fn metric_type(&self) -> MetricType {
        self.identity.metric_type()
    }

    /// Sample time in milliseconds since the epoch
    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn value(&self) -> &MetricValue {
        &self.value
    }

    pub fn long_value(&self) -> Option<i64> {
        self.value.as_long()
    }

    /// Key echoed back to agents in a confirm: FQN followed by the sample time
    pub fn confirm_key(&self) -> String {
        format!("{}{}", self.identity.fqn(), self.time)
    }

    /// Merges a later observation of the same metric into this one.
    pub fn conflate(&mut self, other: &Metric) -> Result<()> {
        let metric_type = self.metric_type();
        if metric_type != other.metric_type() {
            return Err(ApmError::conflation(format!(
                "cannot conflate {} into {} for [{}]",
                other.metric_type(),
                metric_type,
                self.fqn()
            )));
        }
        self.value = metric_type.merge(&self.value, &other.value)?;
        self.time = self.time.max(other.time);
        Ok(())
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}={}", self.time, self.identity.fqn(), self.value)
    }
}
