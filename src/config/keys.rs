//! Multi-key credential pool with rotation.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Ordered set of API keys; one is active at a time.
#[derive(Debug, Default)]
pub struct ApiKeyPool {
    keys: Vec<String>,
    active: AtomicUsize,
}

impl Clone for ApiKeyPool {
    fn clone(&self) -> Self {
        Self {
            keys: self.keys.clone(),
            active: AtomicUsize::new(self.active.load(Ordering::Relaxed)),
        }
    }
}

impl ApiKeyPool {
    /// Split a comma- or newline-delimited credential string.
    /// Entries are trimmed; blanks and duplicates are dropped.
    pub fn parse(raw: &str) -> Self {
        let mut keys: Vec<String> = Vec::new();
        for key in raw.split([',', '\n']).map(str::trim) {
            if !key.is_empty() && !keys.iter().any(|existing| existing == key) {
                keys.push(key.to_string());
            }
        }
        Self {
            keys,
            active: AtomicUsize::new(0),
        }
    }

    pub fn from_keys(keys: impl IntoIterator<Item = String>) -> Self {
        Self::parse(&keys.into_iter().collect::<Vec<_>>().join(","))
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn current(&self) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }
        let index = self.active.load(Ordering::Relaxed) % self.keys.len();
        self.keys.get(index).map(String::as_str)
    }

    /// Advance to the next key. Returns `None` when there is nothing to rotate to.
    pub fn rotate(&self) -> Option<&str> {
        if self.keys.len() < 2 {
            return None;
        }
        let next = (self.active.fetch_add(1, Ordering::Relaxed) + 1) % self.keys.len();
        tracing::debug!(key_index = next, keys = self.keys.len(), "Rotated API key");
        self.keys.get(next).map(String::as_str)
    }
}
