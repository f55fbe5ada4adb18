//! Secret tracking and the secrets provider seam (spec §4.2, §3).
//!
//! A [`SecretTracker`] is created per task instance, tainted as raw secret
//! values are resolved through the `secret` template function, and consulted
//! by [`crate::redact::redact_summary`] at register-time. It is never
//! global — see spec §9's "secret tracker lifetime" note.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Per-task-instance set of resolved secret values.
///
/// Cheaply cloneable: the backing set is `Arc`-shared so the tracker can be
/// captured by the template function map and by the redaction step without
/// threading a reference through both.
#[derive(Clone, Default)]
pub struct SecretTracker {
    values: Arc<RwLock<HashSet<String>>>,
}

impl SecretTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Taint `value`. Empty strings are ignored — they would otherwise make
    /// `contains_tracked_secret` match every string.
    pub fn add(&self, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            return;
        }
        self.values.write().insert(value);
    }

    /// Exact-match containment check.
    pub fn is_tracked(&self, value: &str) -> bool {
        !value.is_empty() && self.values.read().contains(value)
    }

    /// True iff any tracked value appears as a substring of `s`.
    pub fn contains_tracked_secret(&self, s: &str) -> bool {
        if s.is_empty() {
            return false;
        }
        self.values.read().iter().any(|v| s.contains(v.as_str()))
    }

    /// Number of distinct tracked values. Exposed for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// True if nothing has been tainted yet.
    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

/// Error returned by a [`SecretProvider`] lookup.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// No secret is registered under the given key.
    #[error("secret not found: {0}")]
    NotFound(String),
    /// The provider timed out or failed to reach its backend.
    #[error("secret retrieval failed: {0}")]
    RetrievalFailed(String),
}

/// External secrets backend seam (spec §1: "the secrets backend (env, vault)"
/// is explicitly out of core scope; only this trait and an env-backed
/// reference implementation live here).
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Resolve `key` to its raw secret value, honoring `timeout`.
    async fn get(&self, key: &str, timeout: Duration) -> Result<String, SecretError>;
}

/// Reference provider backed by process environment variables. Suitable for
/// local runs and the end-to-end test scenarios; production deployments are
/// expected to supply a vault-backed [`SecretProvider`].
#[derive(Debug, Default, Clone)]
pub struct EnvSecretProvider;

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn get(&self, key: &str, _timeout: Duration) -> Result<String, SecretError> {
        std::env::var(key).map_err(|_| SecretError::NotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_strings_are_never_tracked() {
        let t = SecretTracker::new();
        t.add("");
        assert!(t.is_empty());
        assert!(!t.contains_tracked_secret("anything"));
    }

    #[test]
    fn exact_and_substring_checks() {
        let t = SecretTracker::new();
        t.add("abc123");
        assert!(t.is_tracked("abc123"));
        assert!(!t.is_tracked("abc"));
        assert!(t.contains_tracked_secret("prefix-abc123-suffix"));
        assert!(!t.contains_tracked_secret("prefix-abc124-suffix"));
    }

    #[tokio::test]
    async fn env_provider_reads_process_env() {
        std::env::set_var("GXO_TEST_SECRET_KEY", "shh");
        let provider = EnvSecretProvider;
        let v = provider
            .get("GXO_TEST_SECRET_KEY", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(v, "shh");
    }

    #[tokio::test]
    async fn env_provider_missing_key_errors() {
        let provider = EnvSecretProvider;
        let err = provider
            .get("GXO_DOES_NOT_EXIST_XYZ", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SecretError::NotFound(_)));
    }
}
