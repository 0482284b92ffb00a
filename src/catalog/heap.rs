//! In-memory catalog backed by concurrent maps.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::keys::CatalogKeys;
use super::MetricCatalog;
use crate::core::error::{ApmError, Result};
use crate::core::types::{render_fqn, FqnParts, MetricIdentity, MetricType, NO_TOKEN};

/// First token handed out by a fresh catalog.
const FIRST_TOKEN: i64 = 1;

/// Process-wide identity store.
///
/// Identities live in `identities` under the key strategy's key. A key that is
/// already held by a different FQN is a collision: the newcomer is stored in
/// `overflow` under its full FQN, so lookups stay correct and the event is
/// counted.
pub struct HeapCatalog<K: CatalogKeys> {
    keys: K,
    identities: DashMap<K::Key, Arc<MetricIdentity>>,
    overflow: DashMap<Arc<str>, Arc<MetricIdentity>>,
    tokens: DashMap<i64, Arc<MetricIdentity>>,
    deltas: DashMap<String, i64>,
    next_token: AtomicI64,
    collisions: AtomicU64,
}

impl<K: CatalogKeys> HeapCatalog<K> {
    pub fn new(keys: K) -> Self {
        Self {
            keys,
            identities: DashMap::new(),
            overflow: DashMap::new(),
            tokens: DashMap::new(),
            deltas: DashMap::new(),
            next_token: AtomicI64::new(FIRST_TOKEN),
            collisions: AtomicU64::new(0),
        }
    }

    /// Looks up an identity by FQN without creating it.
    fn find(&self, fqn: &str) -> Option<Arc<MetricIdentity>> {
        let key = self.keys.key(fqn);
        let primary = self.identities.get(&key).map(|e| Arc::clone(e.value()))?;
        if primary.fqn() == fqn {
            return Some(primary);
        }
        self.overflow.get(fqn).map(|e| Arc::clone(e.value()))
    }

    /// Stores an identity whose key is taken by another FQN.
    fn resolve_collision<F>(
        &self,
        key: &K::Key,
        holder: &str,
        fqn: &str,
        create: F,
    ) -> Arc<MetricIdentity>
    where
        F: FnOnce() -> MetricIdentity,
    {
        match self.overflow.entry(Arc::from(fqn)) {
            Entry::Occupied(e) => Arc::clone(e.get()),
            Entry::Vacant(e) => {
                self.collisions.fetch_add(1, Ordering::Relaxed);
                let err = ApmError::IdentityCollision {
                    key: self.keys.fingerprint(key),
                    expected: fqn.to_string(),
                    found: holder.to_string(),
                };
                tracing::warn!(backend = K::NAME, "{}", err);
                Arc::clone(e.insert(Arc::new(create())).value())
            },
        }
    }
}

impl<K: CatalogKeys> MetricCatalog for HeapCatalog<K> {
    fn resolve(
        &self,
        host: &str,
        agent: &str,
        name: &str,
        metric_type: MetricType,
        namespace: &[&str],
    ) -> Arc<MetricIdentity> {
        let fqn = render_fqn(host, agent, name, namespace);
        let key = self.keys.key(&fqn);
        let create = || MetricIdentity::new(host, agent, name, metric_type, namespace);

        // Lock-free fast path: the identity already exists.
        let existing = self.identities.get(&key).map(|e| Arc::clone(e.value()));
        let primary = match existing {
            Some(identity) => identity,
            None => {
                let entry = self.identities.entry(key.clone()).or_insert_with(|| Arc::new(create()));
                Arc::clone(entry.value())
            },
        };

        if primary.fqn() == fqn {
            if primary.metric_type() != metric_type {
                tracing::debug!(
                    "Metric [{}] seen as {} but registered as {}",
                    fqn,
                    metric_type,
                    primary.metric_type()
                );
            }
            return primary;
        }

        if let Some(identity) = self.overflow.get(fqn.as_str()) {
            return Arc::clone(identity.value());
        }
        self.resolve_collision(&key, primary.fqn(), &fqn, create)
    }

    fn tokenize(&self, identity: &Arc<MetricIdentity>) -> i64 {
        let current = identity.token();
        if current != NO_TOKEN {
            return current;
        }
        // Index first so the token is resolvable as soon as it is visible.
        // A counter value already claimed by `assign_token_with` is skipped.
        let token = loop {
            let candidate = self.next_token.fetch_add(1, Ordering::Relaxed);
            if let Entry::Vacant(slot) = self.tokens.entry(candidate) {
                slot.insert(Arc::clone(identity));
                break candidate;
            }
        };
        match identity.set_token(token) {
            Ok(()) => {
                tracing::debug!("Assigned token {} to [{}]", token, identity.fqn());
                token
            },
            Err(existing) => {
                self.tokens.remove(&token);
                existing
            },
        }
    }

    fn assign_token_with(
        &self,
        token: i64,
        host: &str,
        agent: &str,
        name: &str,
        metric_type: MetricType,
        namespace: &[&str],
    ) -> Result<i64> {
        // i64::MAX is reserved so the counter can always move past a supplied token.
        if !(FIRST_TOKEN..i64::MAX).contains(&token) {
            return Err(ApmError::protocol(format!("invalid token {}", token)));
        }
        let identity = self.resolve(host, agent, name, metric_type, namespace);
        if identity.token() == token {
            return Ok(token);
        }

        match self.tokens.entry(token) {
            Entry::Occupied(e) => Err(ApmError::TokenConflict {
                token,
                fqn: e.get().fqn().to_string(),
            }),
            Entry::Vacant(e) => match identity.set_token(token) {
                Ok(()) => {
                    e.insert(Arc::clone(&identity));
                    self.next_token.fetch_max(token + 1, Ordering::Relaxed);
                    Ok(token)
                },
                Err(existing) => Ok(existing),
            },
        }
    }

    fn is_assigned(&self, host: &str, agent: &str, name: &str, namespace: &[&str]) -> Option<i64> {
        let fqn = render_fqn(host, agent, name, namespace);
        self.find(&fqn)
            .map(|identity| identity.token())
            .filter(|token| *token != NO_TOKEN)
    }

    fn lookup_by_token(&self, token: i64) -> Option<Arc<MetricIdentity>> {
        self.tokens.get(&token).map(|e| Arc::clone(e.value()))
    }

    fn delta(&self, value: i64, host: &str, agent: &str, name: &str, namespace: &[&str]) -> Option<i64> {
        let fqn = render_fqn(host, agent, name, namespace);
        let previous = self.deltas.insert(fqn, value)?;
        if value < previous {
            None
        } else {
            Some(value - previous)
        }
    }

    fn build(&self, fqn: &str, metric_type: MetricType) -> Result<Arc<MetricIdentity>> {
        let parts = FqnParts::parse(fqn)?;
        let namespace: Vec<&str> = parts.namespace.iter().map(String::as_str).collect();
        Ok(self.resolve(&parts.host, &parts.agent, &parts.name, metric_type, &namespace))
    }

    fn size(&self) -> usize {
        self.identities.len() + self.overflow.len()
    }

    fn collisions(&self) -> u64 {
        self.collisions.load(Ordering::Relaxed)
    }

    fn backend(&self) -> &'static str {
        K::NAME
    }

    fn reset_for_test(&self) {
        self.identities.clear();
        self.overflow.clear();
        self.tokens.clear();
        self.deltas.clear();
        self.next_token.store(FIRST_TOKEN, Ordering::Relaxed);
        self.collisions.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FqnKeys, HashedKeys};
    use std::sync::Barrier;

    fn hashed() -> HeapCatalog<HashedKeys> {
        HeapCatalog::new(HashedKeys::new())
    }

    /// Every FQN of the same length lands on the same key.
    fn colliding() -> HeapCatalog<HashedKeys> {
        HeapCatalog::new(HashedKeys::with_hasher(|s: &str| s.len() as u64))
    }

    #[test]
    fn test_identity_stability() {
        let catalog = hashed();
        let a = catalog.resolve("h1", "a1", "used", MetricType::Gauge, &["jvm", "heap"]);
        let b = catalog.resolve("h1", "a1", "used", MetricType::Gauge, &["jvm", "heap"]);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.fqn(), "h1/a1/jvm/heap:used");
        assert_eq!(catalog.size(), 1);

        let token = catalog.assign_token("h1", "a1", "used", MetricType::Gauge, &["jvm", "heap"]);
        assert_eq!(token, 1);
        assert_eq!(catalog.assign_token("h1", "a1", "used", MetricType::Gauge, &["jvm", "heap"]), token);
        assert_eq!(catalog.is_assigned("h1", "a1", "used", &["jvm", "heap"]), Some(token));
        assert!(Arc::ptr_eq(&catalog.lookup_by_token(token).unwrap(), &a));
    }

    #[test]
    fn test_tokens_are_distinct() {
        let catalog = hashed();
        let t1 = catalog.assign_token("h1", "a1", "x", MetricType::Gauge, &[]);
        let t2 = catalog.assign_token("h1", "a1", "y", MetricType::Gauge, &[]);
        assert_ne!(t1, t2);
        assert_eq!(catalog.lookup_by_token(t2).unwrap().fqn(), "h1/a1:y");
        assert!(catalog.lookup_by_token(99).is_none());
    }

    #[test]
    fn test_unassigned_identity() {
        let catalog = hashed();
        assert_eq!(catalog.is_assigned("h1", "a1", "x", &[]), None);
        catalog.resolve("h1", "a1", "x", MetricType::Gauge, &[]);
        assert_eq!(catalog.is_assigned("h1", "a1", "x", &[]), None);
    }

    #[test]
    fn test_collision_resolves_by_full_fqn() {
        let catalog = colliding();
        let x = catalog.resolve("h", "a", "x", MetricType::Gauge, &[]);
        let y = catalog.resolve("h", "a", "y", MetricType::Delta, &[]);

        assert_eq!(x.fqn(), "h/a:x");
        assert_eq!(y.fqn(), "h/a:y");
        assert!(!Arc::ptr_eq(&x, &y));
        assert_eq!(catalog.collisions(), 1);
        assert_eq!(catalog.size(), 2);

        // Repeated lookups stay correct and are not counted again.
        let y_again = catalog.resolve("h", "a", "y", MetricType::Delta, &[]);
        assert!(Arc::ptr_eq(&y, &y_again));
        assert!(Arc::ptr_eq(&x, &catalog.resolve("h", "a", "x", MetricType::Gauge, &[])));
        assert_eq!(catalog.collisions(), 1);

        let ty = catalog.assign_token("h", "a", "y", MetricType::Delta, &[]);
        assert_eq!(catalog.is_assigned("h", "a", "y", &[]), Some(ty));
        assert_eq!(catalog.is_assigned("h", "a", "x", &[]), None);
        assert_eq!(catalog.lookup_by_token(ty).unwrap().fqn(), "h/a:y");
    }

    #[test]
    fn test_delta_idempotence() {
        let catalog = hashed();
        assert_eq!(catalog.delta(100, "h1", "a1", "requests", &[]), None);
        assert_eq!(catalog.delta(150, "h1", "a1", "requests", &[]), Some(50));
        assert_eq!(catalog.delta(20, "h1", "a1", "requests", &[]), None);
        assert_eq!(catalog.delta(35, "h1", "a1", "requests", &[]), Some(15));
        assert_eq!(catalog.delta(35, "h1", "a1", "requests", &[]), Some(0));
    }

    #[test]
    fn test_assign_token_with() {
        let catalog = hashed();
        assert_eq!(catalog.assign_token_with(40, "h1", "a1", "x", MetricType::Gauge, &[]).unwrap(), 40);
        assert_eq!(catalog.assign_token_with(40, "h1", "a1", "x", MetricType::Gauge, &[]).unwrap(), 40);

        let conflict = catalog.assign_token_with(40, "h1", "a1", "y", MetricType::Gauge, &[]);
        assert!(matches!(conflict, Err(ApmError::TokenConflict { token: 40, .. })));

        // Generated tokens never reuse a supplied one.
        assert_eq!(catalog.assign_token("h1", "a1", "z", MetricType::Gauge, &[]), 41);

        // A token is never reassigned once set.
        assert_eq!(catalog.assign_token_with(77, "h1", "a1", "x", MetricType::Gauge, &[]).unwrap(), 40);
        assert!(catalog.assign_token_with(-1, "h1", "a1", "w", MetricType::Gauge, &[]).is_err());
    }

    #[test]
    fn test_largest_token_is_rejected() {
        let catalog = hashed();
        let result = catalog.assign_token_with(i64::MAX, "h1", "a1", "x", MetricType::Gauge, &[]);
        assert!(matches!(result, Err(ApmError::Protocol(_))));
        assert!(catalog.lookup_by_token(i64::MAX).is_none());

        let highest = i64::MAX - 1;
        assert_eq!(
            catalog.assign_token_with(highest, "h1", "a1", "x", MetricType::Gauge, &[]).unwrap(),
            highest
        );
        assert_eq!(catalog.lookup_by_token(highest).unwrap().fqn(), "h1/a1:x");
    }

    #[test]
    fn test_tokenize_skips_claimed_token() {
        let catalog = hashed();
        let claimed = catalog.resolve("h1", "a1", "claimed", MetricType::Gauge, &[]);
        assert_eq!(catalog.assign_token_with(5, "h1", "a1", "claimed", MetricType::Gauge, &[]).unwrap(), 5);

        // Counter still behind the supplied token, as when both calls race.
        catalog.next_token.store(5, Ordering::Relaxed);

        let fresh = catalog.resolve("h1", "a1", "fresh", MetricType::Gauge, &[]);
        assert_eq!(catalog.tokenize(&fresh), 6);
        assert!(Arc::ptr_eq(&catalog.lookup_by_token(5).unwrap(), &claimed));
        assert!(Arc::ptr_eq(&catalog.lookup_by_token(6).unwrap(), &fresh));
    }

    #[test]
    fn test_build_from_fqn() {
        let catalog = hashed();
        let built = catalog.build("myhost/myagent/foo/bar:cpu1", MetricType::Gauge).unwrap();
        let resolved = catalog.resolve("myhost", "myagent", "cpu1", MetricType::Gauge, &["foo", "bar"]);
        assert!(Arc::ptr_eq(&built, &resolved));
        assert!(catalog.build("no-name-here", MetricType::Gauge).is_err());
    }

    #[test]
    fn test_concurrent_first_sighting() {
        let catalog = Arc::new(hashed());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let catalog = Arc::clone(&catalog);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let identity = catalog.resolve("h1", "a1", "hot", MetricType::Gauge, &[]);
                    let token = catalog.tokenize(&identity);
                    (identity, token)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let (first, token) = &results[0];
        for (identity, t) in &results {
            assert!(Arc::ptr_eq(first, identity));
            assert_eq!(t, token);
        }
        assert_eq!(catalog.size(), 1);
        assert!(Arc::ptr_eq(&catalog.lookup_by_token(*token).unwrap(), first));
    }

    #[test]
    fn test_fqn_backend() {
        let catalog = HeapCatalog::new(FqnKeys);
        let a = catalog.resolve("h1", "a1", "x", MetricType::Gauge, &[]);
        let b = catalog.build("h1/a1:x", MetricType::Gauge).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(catalog.backend(), "fqn");
        assert_eq!(catalog.collisions(), 0);
    }

    #[test]
    fn test_reset_for_test() {
        let catalog = hashed();
        catalog.assign_token("h1", "a1", "x", MetricType::Gauge, &[]);
        catalog.delta(5, "h1", "a1", "x", &[]);
        catalog.reset_for_test();
        assert_eq!(catalog.size(), 0);
        assert!(catalog.lookup_by_token(1).is_none());
        assert_eq!(catalog.delta(5, "h1", "a1", "x", &[]), None);
        assert_eq!(catalog.assign_token("h1", "a1", "x", MetricType::Gauge, &[]), 1);
    }
}
