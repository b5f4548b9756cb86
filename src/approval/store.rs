//! Conversation-scoped "always allow" memory.

use std::collections::HashSet;
use std::fmt;

/// Deterministic key derived from a confirmation's action and command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ApprovalKey(String);

impl ApprovalKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApprovalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApprovalStore {
    keys: HashSet<ApprovalKey>,
}

impl ApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert every key. Re-inserting a key is a no-op.
    pub fn approve_all(&mut self, keys: &[ApprovalKey]) {
        self.keys.extend(keys.iter().cloned());
    }

    /// True when `keys` is non-empty and every key has been approved.
    pub fn all_approved(&self, keys: &[ApprovalKey]) -> bool {
        !keys.is_empty() && keys.iter().all(|key| self.keys.contains(key))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(raw: &[&str]) -> Vec<ApprovalKey> {
        raw.iter().map(|k| ApprovalKey::new(*k)).collect()
    }

    #[test]
    fn approving_twice_is_idempotent() {
        let mut store = ApprovalStore::new();
        let set = keys(&["exec:git", "edit"]);
        store.approve_all(&set);
        let after_once = store.len();
        store.approve_all(&set);
        assert_eq!(store.len(), after_once);
        assert!(store.all_approved(&set));
    }

    #[test]
    fn requires_every_key() {
        let mut store = ApprovalStore::new();
        store.approve_all(&keys(&["exec:git"]));
        assert!(!store.all_approved(&keys(&["exec:git", "exec:rm"])));
        assert!(store.all_approved(&keys(&["exec:git"])));
    }

    #[test]
    fn empty_key_set_is_never_approved() {
        let mut store = ApprovalStore::new();
        store.approve_all(&keys(&["edit"]));
        assert!(!store.all_approved(&[]));
    }
}
