//! The Registry: the proxy's only piece of shared mutable state besides the
//! CA leaf cache. Guarded by a single reader/writer lock, as required by the
//! concurrency model (`register/revoke` linearisable; a `lookup` that starts
//! after `revoke` returns `None`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::proxy::http_proxy::RequestSink;
use crate::vault::CredentialView;

/// The proxy-side state bound to one run's injection token.
#[derive(Clone)]
pub struct RunContext {
    /// The run this context belongs to.
    pub run_id: String,
    /// Hosts this run's traffic may reach (beyond the proxy itself).
    pub allow_hosts: std::collections::HashSet<String>,
    /// Host pattern -> credential view, used to rewrite matching requests.
    pub credentials: Vec<(String, CredentialView)>,
    /// Host patterns for grants that are recognized providers but whose
    /// credential could not be resolved at bind time (expired with no
    /// usable refresh, or never actually granted). Traffic to these hosts
    /// is neither forwarded nor outright refused: the proxy answers `407`
    /// per-request, since the vault has no credential view to inject (S3).
    pub unresolved_hosts: std::collections::HashSet<String>,
    /// Where this run's proxied requests are recorded, if it wants them.
    pub sink: Option<Arc<RequestSink>>,
}

impl RunContext {
    /// Find the most specific credential view matching `host`, if any.
    #[must_use]
    pub fn match_host(&self, host: &str) -> Option<&CredentialView> {
        self.credentials
            .iter()
            .find(|(pattern, _)| host_matches(pattern, host))
            .map(|(_, view)| view)
    }

    /// Whether `host` names a grant that was recognized at bind time but
    /// has no resolvable credential right now.
    #[must_use]
    pub fn is_unresolved(&self, host: &str) -> bool {
        self.unresolved_hosts.iter().any(|pattern| host_matches(pattern, host))
    }

    /// Whether `host` is reachable at all under this context's policy.
    #[must_use]
    pub fn allows(&self, host: &str) -> bool {
        self.credentials.iter().any(|(pattern, _)| host_matches(pattern, host))
            || self.unresolved_hosts.iter().any(|pattern| host_matches(pattern, host))
            || self.allow_hosts.iter().any(|pattern| host_matches(pattern, host))
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        host.ends_with(suffix)
    } else {
        host == pattern
    }
}

struct Inner {
    contexts: HashMap<String, RunContext>,
}

/// Callback invoked when the registry transitions from non-empty to empty.
pub type OnEmptyCallback = Arc<dyn Fn() + Send + Sync>;

/// Token -> [`RunContext`] table plus an idle-shutdown trigger. Holds no
/// reference back to the Manager: revocation flows one direction only
/// (Manager -> Registry), per the design note on breaking the
/// Manager/Registry reference cycle.
pub struct Registry {
    inner: RwLock<Inner>,
    on_empty: RwLock<Option<OnEmptyCallback>>,
    idle_timeout: Duration,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("idle_timeout", &self.idle_timeout).finish()
    }
}

impl Registry {
    /// Create an empty registry with the given idle-shutdown timeout
    /// (default 5 minutes, per the external-interfaces daemon contract).
    #[must_use]
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner { contexts: HashMap::new() }),
            on_empty: RwLock::new(None),
            idle_timeout,
        }
    }

    /// Register a callback fired (on its own task) whenever the registry
    /// becomes empty after having held at least one context.
    pub async fn on_empty(&self, callback: OnEmptyCallback) {
        *self.on_empty.write().await = Some(callback);
    }

    /// The configured idle timeout.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Register `context`, returning the token it is now reachable by.
    pub async fn register(&self, token: String, context: RunContext) {
        let mut inner = self.inner.write().await;
        inner.contexts.insert(token, context);
    }

    /// Look up the context bound to `token`.
    pub async fn lookup(&self, token: &str) -> Option<RunContext> {
        self.inner.read().await.contexts.get(token).cloned()
    }

    /// Revoke `token`. Subsequent `lookup`s for it return `None` immediately
    /// (the write lock makes this linearisable with concurrent lookups).
    pub async fn revoke(&self, token: &str) {
        let became_empty = {
            let mut inner = self.inner.write().await;
            inner.contexts.remove(token);
            inner.contexts.is_empty()
        };
        if became_empty {
            if let Some(cb) = self.on_empty.read().await.clone() {
                cb();
            }
        }
    }

    /// Number of currently registered contexts.
    pub async fn len(&self) -> usize {
        self.inner.read().await.contexts.len()
    }

    /// Whether the registry currently holds no contexts.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn sample_context() -> RunContext {
        RunContext {
            run_id: "run-1".to_string(),
            allow_hosts: std::collections::HashSet::new(),
            credentials: Vec::new(),
            unresolved_hosts: std::collections::HashSet::new(),
            sink: None,
        }
    }

    #[tokio::test]
    async fn register_then_lookup_succeeds() {
        let registry = Registry::new(Duration::from_secs(300));
        registry.register("tok".to_string(), sample_context()).await;
        assert!(registry.lookup("tok").await.is_some());
    }

    #[tokio::test]
    async fn revoke_makes_subsequent_lookups_return_none() {
        let registry = Registry::new(Duration::from_secs(300));
        registry.register("tok".to_string(), sample_context()).await;
        registry.revoke("tok").await;
        assert!(registry.lookup("tok").await.is_none());
    }

    #[tokio::test]
    async fn on_empty_fires_only_on_the_empty_transition() {
        let registry = Registry::new(Duration::from_secs(300));
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        registry.on_empty(Arc::new(move || fired_clone.store(true, Ordering::SeqCst))).await;

        registry.register("a".to_string(), sample_context()).await;
        registry.register("b".to_string(), sample_context()).await;
        registry.revoke("a").await;
        assert!(!fired.load(Ordering::SeqCst), "still one context left");

        registry.revoke("b").await;
        assert!(fired.load(Ordering::SeqCst), "registry is now empty");
    }

    #[test]
    fn wildcard_host_match_excludes_apex() {
        assert!(host_matches("*.github.com", "api.github.com"));
        assert!(!host_matches("*.github.com", "github.com"));
        assert!(host_matches("github.com", "github.com"));
    }

    #[test]
    fn unresolved_host_is_reachable_but_has_no_credential_view() {
        let mut context = sample_context();
        context.unresolved_hosts.insert("api.anthropic.com".to_string());

        assert!(context.allows("api.anthropic.com"));
        assert!(context.is_unresolved("api.anthropic.com"));
        assert!(context.match_host("api.anthropic.com").is_none());
    }

    #[test]
    fn host_with_neither_credential_nor_unresolved_entry_is_denied() {
        let context = sample_context();
        assert!(!context.allows("evil.example.com"));
        assert!(!context.is_unresolved("evil.example.com"));
    }
}
