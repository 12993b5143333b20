use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use coedit_protocol::{LockKey, SessionId};

/// Process-wide registry of per-field edit locks.
///
/// Maps `(entity, row_id, field)` to the session currently editing that
/// field. Shared by every session through an `Arc`; each operation is an
/// atomic per-key map op, so two distinct holders can never end up holding
/// the same key. Locks are scoped per field, not per row, so independent
/// fields on the same row can be edited by different sessions at once.
///
/// There is no expiry: a lock lives until its holder releases it or the
/// holder's session tears down via [`LockRegistry::release_all`].
#[derive(Debug, Default)]
pub struct LockRegistry {
    held: DashMap<LockKey, SessionId>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            held: DashMap::new(),
        }
    }

    /// Try to acquire an edit lock. Non-blocking compare-and-set: succeeds
    /// if the key is unheld or already held by `holder` (idempotent
    /// re-acquire), fails with no state change if another session holds it.
    pub fn acquire(&self, key: &LockKey, holder: &str) -> bool {
        match self.held.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get() == holder,
            Entry::Vacant(entry) => {
                entry.insert(holder.to_string());
                true
            }
        }
    }

    /// Release a lock, but only if `holder` actually holds it. Returns
    /// false (and leaves the entry untouched) otherwise.
    pub fn release(&self, key: &LockKey, holder: &str) -> bool {
        self.held
            .remove_if(key, |_, current| current == holder)
            .is_some()
    }

    /// The session currently holding `key`, if any.
    pub fn holder(&self, key: &LockKey) -> Option<SessionId> {
        self.held.get(key).map(|entry| entry.value().clone())
    }

    /// Remove every lock held by `holder`, returning exactly the removed
    /// keys so the caller can broadcast targeted invalidations. This is the
    /// only cleanup path for abandoned locks; used on session teardown.
    pub fn release_all(&self, holder: &str) -> Vec<LockKey> {
        let mut released = Vec::new();
        self.held.retain(|key, current| {
            if current.as_str() == holder {
                released.push(key.clone());
                false
            } else {
                true
            }
        });
        if !released.is_empty() {
            debug!(holder = %holder, count = released.len(), "released all locks for session");
        }
        released
    }

    /// All locks currently held on one row, regardless of holder. Used when
    /// a row is removed out from under in-progress edits.
    pub fn locks_for_row(&self, entity: &str, row_id: &str) -> Vec<LockKey> {
        self.held
            .iter()
            .filter(|entry| entry.key().entity == entity && entry.key().row_id == row_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drop a lock regardless of holder. Returns the evicted session, if
    /// the key was held. Reserved for forced invalidation (row deletion).
    pub fn force_release(&self, key: &LockKey) -> Option<SessionId> {
        self.held.remove(key).map(|(_, holder)| holder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(row: &str, field: &str) -> LockKey {
        LockKey::new("card", row, field)
    }

    #[test]
    fn acquire_then_conflict() {
        let registry = LockRegistry::new();
        assert!(registry.acquire(&key("1", "title"), "alice"));
        assert!(!registry.acquire(&key("1", "title"), "bob"));
        assert_eq!(registry.holder(&key("1", "title")), Some("alice".to_string()));
    }

    #[test]
    fn reacquire_is_idempotent() {
        let registry = LockRegistry::new();
        assert!(registry.acquire(&key("1", "title"), "alice"));
        assert!(registry.acquire(&key("1", "title"), "alice"));
        assert_eq!(registry.release_all("alice").len(), 1);
    }

    #[test]
    fn per_field_scoping() {
        let registry = LockRegistry::new();
        assert!(registry.acquire(&key("1", "title"), "alice"));
        assert!(registry.acquire(&key("1", "content"), "bob"));
    }

    #[test]
    fn release_checks_ownership() {
        let registry = LockRegistry::new();
        assert!(registry.acquire(&key("1", "title"), "bob"));
        assert!(!registry.release(&key("1", "title"), "alice"));
        assert_eq!(registry.holder(&key("1", "title")), Some("bob".to_string()));
        assert!(registry.release(&key("1", "title"), "bob"));
        assert_eq!(registry.holder(&key("1", "title")), None);
    }

    #[test]
    fn release_unheld_is_noop() {
        let registry = LockRegistry::new();
        assert!(!registry.release(&key("1", "title"), "alice"));
    }

    #[test]
    fn release_all_returns_exactly_held_keys() {
        let registry = LockRegistry::new();
        registry.acquire(&key("1", "title"), "alice");
        registry.acquire(&key("2", "content"), "alice");
        registry.acquire(&key("3", "title"), "bob");

        let mut released = registry.release_all("alice");
        released.sort_by(|a, b| a.row_id.cmp(&b.row_id));
        assert_eq!(released, vec![key("1", "title"), key("2", "content")]);

        assert_eq!(registry.holder(&key("1", "title")), None);
        assert_eq!(registry.holder(&key("2", "content")), None);
        assert_eq!(registry.holder(&key("3", "title")), Some("bob".to_string()));
        assert!(registry.release_all("alice").is_empty());
    }

    #[test]
    fn locks_for_row_spans_holders() {
        let registry = LockRegistry::new();
        registry.acquire(&key("1", "title"), "alice");
        registry.acquire(&key("1", "content"), "bob");
        registry.acquire(&key("2", "title"), "alice");

        let mut keys = registry.locks_for_row("card", "1");
        keys.sort_by(|a, b| a.field.cmp(&b.field));
        assert_eq!(keys, vec![key("1", "content"), key("1", "title")]);
    }

    #[test]
    fn concurrent_acquire_has_one_winner() {
        let registry = Arc::new(LockRegistry::new());
        let contended = key("1", "title");

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let contended = contended.clone();
                std::thread::spawn(move || registry.acquire(&contended, &format!("session-{i}")))
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert!(registry.holder(&contended).is_some());
    }
}
