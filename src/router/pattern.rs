//! Routing patterns with memoized match results.
//!
//! A [`PatternMatch`] wraps one compiled regex and remembers, per candidate
//! hash, whether the candidate matched. Metric streams repeat a small set of
//! FQNs, so after warm-up nearly every check is a set lookup.
//!
//! Patterns are compiled through a [`PatternRegistry`] keyed by pattern text, so
//! destinations subscribing with the same text share one matcher and its
//! caches.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::{DashMap, DashSet};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::catalog::hash_fqn;
use crate::core::Result;

static GLOBAL_REGISTRY: Lazy<Arc<PatternRegistry>> = Lazy::new(|| Arc::new(PatternRegistry::new()));

/// Compiles `text` through the process-wide registry.
pub fn compile(text: &str) -> Result<Arc<PatternMatch>> {
    GLOBAL_REGISTRY.compile(text)
}

/// Compiled pattern with hit/miss memo.
pub struct PatternMatch {
    text: String,
    regex: Regex,
    hits: DashSet<u64>,
    misses: DashSet<u64>,
}

impl PatternMatch {
    /// Compiles a pattern. The whole candidate must match.
    pub fn compile(text: &str) -> Result<Self> {
        let regex = Regex::new(&format!("^(?:{})$", text))?;
        Ok(Self {
            text: text.to_string(),
            regex,
            hits: DashSet::new(),
            misses: DashSet::new(),
        })
    }

    /// Pattern text as supplied
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn matches(&self, candidate: &str) -> bool {
        let key = hash_fqn(candidate);
        if self.hits.contains(&key) {
            return true;
        }
        if self.misses.contains(&key) {
            return false;
        }

        let matched = self.regex.is_match(candidate);
        if matched {
            self.hits.insert(key);
        } else {
            self.misses.insert(key);
        }
        matched
    }

    /// `false` for an absent candidate.
    pub fn matches_opt(&self, candidate: Option<&str>) -> bool {
        candidate.map_or(false, |c| self.matches(c))
    }

    /// Number of memoized candidates
    pub fn cached(&self) -> usize {
        self.hits.len() + self.misses.len()
    }
}

impl std::fmt::Debug for PatternMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternMatch")
            .field("text", &self.text)
            .field("cached", &self.cached())
            .finish()
    }
}

/// Cache of compiled patterns keyed by literal text.
#[derive(Default)]
pub struct PatternRegistry {
    patterns: DashMap<String, Arc<PatternMatch>>,
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry
    pub fn global() -> Arc<PatternRegistry> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    /// Returns the shared matcher for `text`, compiling it on first use.
    ///
    /// Invalid syntax fails here and is never cached.
    pub fn compile(&self, text: &str) -> Result<Arc<PatternMatch>> {
        if let Some(existing) = self.patterns.get(text) {
            return Ok(Arc::clone(existing.value()));
        }
        let compiled = Arc::new(PatternMatch::compile(text)?);
        let entry = self.patterns.entry(text.to_string()).or_insert(compiled);
        Ok(Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// A set of patterns that matches when any member matches.
///
/// Membership changes swap in a new snapshot; matching never locks.
pub struct PatternMatchGroup {
    registry: Arc<PatternRegistry>,
    members: ArcSwap<Vec<Arc<PatternMatch>>>,
}

impl PatternMatchGroup {
    /// Empty group backed by the process-wide registry
    pub fn new() -> Self {
        Self::with_registry(PatternRegistry::global())
    }

    pub fn with_registry(registry: Arc<PatternRegistry>) -> Self {
        Self {
            registry,
            members: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Builds a group from pattern texts, failing on the first invalid one.
    pub fn from_patterns<S: AsRef<str>>(registry: Arc<PatternRegistry>, patterns: &[S]) -> Result<Self> {
        let group = Self::with_registry(registry);
        for pattern in patterns {
            group.add(pattern.as_ref())?;
        }
        Ok(group)
    }

    /// Adds a pattern. Returns `false` if it was already a member.
    pub fn add(&self, text: &str) -> Result<bool> {
        let compiled = self.registry.compile(text)?;
        let mut added = false;
        self.members.rcu(|current| {
            added = !current.iter().any(|m| m.text() == text);
            let mut next = Vec::clone(current);
            if added {
                next.push(Arc::clone(&compiled));
            }
            next
        });
        Ok(added)
    }

    /// Removes a pattern. Returns `false` if it was not a member.
    pub fn remove(&self, text: &str) -> bool {
        let mut removed = false;
        self.members.rcu(|current| {
            let mut next = Vec::clone(current);
            next.retain(|m| m.text() != text);
            removed = next.len() != current.len();
            next
        });
        removed
    }

    /// Replaces all members at once.
    pub fn replace<S: AsRef<str>>(&self, patterns: &[S]) -> Result<()> {
        let mut next = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let compiled = self.registry.compile(pattern.as_ref())?;
            if !next.iter().any(|m: &Arc<PatternMatch>| m.text() == compiled.text()) {
                next.push(compiled);
            }
        }
        self.members.store(Arc::new(next));
        Ok(())
    }

    /// Member pattern texts in insertion order
    pub fn patterns(&self) -> Vec<String> {
        self.members.load().iter().map(|m| m.text().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.members.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.load().is_empty()
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.members.load().iter().any(|m| m.matches(candidate))
    }

    pub fn matches_opt(&self, candidate: Option<&str>) -> bool {
        candidate.map_or(false, |c| self.matches(c))
    }
}

impl Default for PatternMatchGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ApmError;

    const CANDIDATES: [&str; 6] = [
        "h1/a1:cpu.load",
        "h1/a1/jvm/heap:used",
        "h2/a1:cpu.load",
        "h1/a2:cpu.idle",
        "xh1/a1:cpu.load",
        "",
    ];

    #[test]
    fn test_cached_match_equals_regex() {
        let direct = Regex::new("^(?:h1/a1.*)$").unwrap();

        // Two population orders, same answers.
        let forward = PatternMatch::compile("h1/a1.*").unwrap();
        let backward = PatternMatch::compile("h1/a1.*").unwrap();
        for c in CANDIDATES {
            assert_eq!(forward.matches(c), direct.is_match(c), "candidate {c:?}");
        }
        for c in CANDIDATES.iter().rev() {
            assert_eq!(backward.matches(c), direct.is_match(c), "candidate {c:?}");
        }
        // Cached answers hold on a second pass.
        for c in CANDIDATES {
            assert_eq!(forward.matches(c), direct.is_match(c));
        }
        assert_eq!(forward.cached(), CANDIDATES.len());
    }

    #[test]
    fn test_pattern_is_anchored() {
        let pattern = PatternMatch::compile("h1/a1:cpu").unwrap();
        assert!(pattern.matches("h1/a1:cpu"));
        assert!(!pattern.matches("h1/a1:cpu.load"));
        assert!(!pattern.matches("xh1/a1:cpu"));
    }

    #[test]
    fn test_absent_candidate() {
        let pattern = PatternMatch::compile(".*").unwrap();
        assert!(!pattern.matches_opt(None));
        assert!(pattern.matches_opt(Some("anything")));
        assert!(!PatternMatchGroup::new().matches_opt(None));
    }

    #[test]
    fn test_invalid_pattern_fails_at_compile() {
        let registry = PatternRegistry::new();
        assert!(matches!(registry.compile("h1/(.*"), Err(ApmError::InvalidPattern(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_shares_matchers() {
        let registry = PatternRegistry::new();
        let a = registry.compile("h1/.*").unwrap();
        let b = registry.compile("h1/.*").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        // The memo is shared too.
        a.matches("h1/a1:x");
        assert_eq!(b.cached(), 1);
    }

    #[test]
    fn test_group_is_any_member() {
        let registry = Arc::new(PatternRegistry::new());
        let group = PatternMatchGroup::from_patterns(Arc::clone(&registry), &["h1/.*", ".*:cpu.idle"]).unwrap();
        assert_eq!(group.len(), 2);

        for c in CANDIDATES {
            let expected = group.patterns().iter().any(|p| Regex::new(&format!("^(?:{p})$")).unwrap().is_match(c));
            assert_eq!(group.matches(c), expected, "candidate {c:?}");
        }
        assert!(group.matches("h2/a2:cpu.idle"));
        assert!(!group.matches("h2/a2:cpu.load"));
    }

    #[test]
    fn test_group_add_remove() {
        let group = PatternMatchGroup::with_registry(Arc::new(PatternRegistry::new()));
        assert!(group.is_empty());
        assert!(!group.matches("h1/a1:x"));

        assert!(group.add("h1/.*").unwrap());
        assert!(!group.add("h1/.*").unwrap());
        assert!(group.matches("h1/a1:x"));

        assert!(group.remove("h1/.*"));
        assert!(!group.remove("h1/.*"));
        assert!(!group.matches("h1/a1:x"));

        group.replace(&["h2/.*", "h2/.*", "h3/.*"]).unwrap();
        assert_eq!(group.patterns(), vec!["h2/.*", "h3/.*"]);
        assert!(group.add("(").is_err());
        assert_eq!(group.len(), 2);
    }
}
