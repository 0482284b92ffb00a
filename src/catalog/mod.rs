//! Metric identity catalog.
//!
//! The catalog maps `(host, agent, namespace, name)` to a shared
//! [`MetricIdentity`], hands out compact tokens agents can send instead of
//! the full name, and tracks the last raw value of counters to compute deltas.
//!
//! One catalog instance is created at startup and injected wherever it is
//! needed as an `Arc<dyn MetricCatalog>`.

pub mod heap;
pub mod keys;

use std::sync::Arc;

use crate::core::config::{CatalogBackend, CatalogConfig};
use crate::core::Result;

pub use crate::core::types::{MetricIdentity, MetricType};
pub use heap::HeapCatalog;
pub use keys::{hash_fqn, CatalogKeys, FqnKeys, HashedKeys};

/// Identity, token and delta bookkeeping for every metric seen by the process.
pub trait MetricCatalog: Send + Sync {
    /// Returns the identity for the given identifiers, creating it on first sight.
    ///
    /// Concurrent first sightings of the same FQN construct one identity.
    /// Malformed identifiers are normalized, never rejected.
    fn resolve(
        &self,
        host: &str,
        agent: &str,
        name: &str,
        metric_type: MetricType,
        namespace: &[&str],
    ) -> Arc<MetricIdentity>;

    /// Assigns the next token to an identity held by this catalog.
    ///
    /// Returns the existing token if one is already set.
    fn tokenize(&self, identity: &Arc<MetricIdentity>) -> i64;

    /// Resolves the identity and returns its token, assigning one if needed.
    fn assign_token(
        &self,
        host: &str,
        agent: &str,
        name: &str,
        metric_type: MetricType,
        namespace: &[&str],
    ) -> i64 {
        let identity = self.resolve(host, agent, name, metric_type, namespace);
        self.tokenize(&identity)
    }

    /// Assigns an externally chosen token.
    ///
    /// Fails if the token is held by another identity. An identity that is
    /// already tokenized keeps its token.
    fn assign_token_with(
        &self,
        token: i64,
        host: &str,
        agent: &str,
        name: &str,
        metric_type: MetricType,
        namespace: &[&str],
    ) -> Result<i64>;

    /// Token of an existing identity, without creating anything.
    fn is_assigned(&self, host: &str, agent: &str, name: &str, namespace: &[&str]) -> Option<i64>;

    /// Reverse lookup of a token.
    fn lookup_by_token(&self, token: i64) -> Option<Arc<MetricIdentity>>;

    /// Stores `value` as the new raw reading and returns the increase since the
    /// previous one.
    ///
    /// `None` on the first reading and on rollback (`value` below the previous
    /// reading), which becomes the new baseline.
    fn delta(&self, value: i64, host: &str, agent: &str, name: &str, namespace: &[&str]) -> Option<i64>;

    /// Resolves an identity from a rendered FQN.
    fn build(&self, fqn: &str, metric_type: MetricType) -> Result<Arc<MetricIdentity>>;

    /// Number of identities held
    fn size(&self) -> usize;

    /// Number of key collisions detected
    fn collisions(&self) -> u64;

    /// Backing store label
    fn backend(&self) -> &'static str;

    /// Drops every identity, token and delta. Tokens restart from 1.
    fn reset_for_test(&self);
}

/// Creates the catalog selected by configuration.
pub fn from_config(config: &CatalogConfig) -> Arc<dyn MetricCatalog> {
    let catalog: Arc<dyn MetricCatalog> = match config.backend {
        CatalogBackend::Hashed => Arc::new(HeapCatalog::new(HashedKeys::new())),
        CatalogBackend::Fqn => Arc::new(HeapCatalog::new(FqnKeys)),
    };
    tracing::info!("Metric catalog backend: {}", catalog.backend());
    catalog
}
