// ABOUTME: Concurrent session registry mapping backend-assigned session ids to base URLs
// The only state shared across control channels; all access goes through this type

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use url::Url;

/// Shared map from session id to the base URL of the backend that owns it.
///
/// Many concurrent readers (one per proxied API call), rare writers (session
/// creation and teardown). The lock is never held across an await point, so
/// readers always observe either the fully inserted entry or none at all.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, Url>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly bootstrapped session. Returns the previous address
    /// if the id was already present (session ids are backend-assigned and
    /// unique among live sessions, so this indicates a backend bug).
    pub fn insert(&self, session_id: impl Into<String>, address: Url) -> Option<Url> {
        self.lock_write().insert(session_id.into(), address)
    }

    pub fn lookup(&self, session_id: &str) -> Option<Url> {
        self.lock_read().get(session_id).cloned()
    }

    /// Remove a session on channel teardown. A no-op when the id is absent,
    /// which makes teardown safe to reach from multiple trigger paths.
    pub fn remove(&self, session_id: &str) -> Option<Url> {
        self.lock_write().remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.lock_read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_read().is_empty()
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Url>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Url>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Url {
        Url::parse(&format!("http://127.0.0.1:{port}")).unwrap()
    }

    #[test]
    fn lookup_after_insert_returns_the_address() {
        let registry = SessionRegistry::new();
        registry.insert("ses_1", addr(4001));
        assert_eq!(registry.lookup("ses_1"), Some(addr(4001)));
        assert_eq!(registry.lookup("ses_2"), None);
    }

    #[test]
    fn remove_is_a_noop_for_absent_ids() {
        let registry = SessionRegistry::new();
        registry.insert("ses_1", addr(4001));
        assert_eq!(registry.remove("ses_1"), Some(addr(4001)));
        assert_eq!(registry.remove("ses_1"), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_inserts_keep_every_entry_distinct() {
        let registry = SessionRegistry::new();
        let handles: Vec<_> = (0..16u16)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry.insert(format!("ses_{i}"), addr(4000 + i));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 16);
        for i in 0..16u16 {
            assert_eq!(registry.lookup(&format!("ses_{i}")), Some(addr(4000 + i)));
        }
    }
}
