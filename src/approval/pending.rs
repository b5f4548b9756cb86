//! Confirmations waiting on the caller, keyed by call id.

use std::collections::HashMap;

use tokio::task::JoinHandle;

use crate::types::Confirmation;

struct PendingEntry {
    confirmation: Confirmation,
    expiry: Option<JoinHandle<()>>,
}

impl PendingEntry {
    fn cancel_expiry(&mut self) {
        if let Some(handle) = self.expiry.take() {
            handle.abort();
        }
    }
}

/// At most one confirmation per call id; each may own an expiry timer.
#[derive(Default)]
pub struct PendingConfirmations {
    entries: HashMap<String, PendingEntry>,
}

/// Result of [`PendingConfirmations::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    /// Same call id and confirmation id: updated in place, timer kept.
    Updated,
}

impl PendingConfirmations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, confirmation: Confirmation) -> Upsert {
        match self.entries.get_mut(&confirmation.call_id) {
            Some(entry) if entry.confirmation.id == confirmation.id => {
                entry.confirmation = confirmation;
                Upsert::Updated
            }
            Some(entry) => {
                entry.cancel_expiry();
                entry.confirmation = confirmation;
                Upsert::Inserted
            }
            None => {
                self.entries.insert(
                    confirmation.call_id.clone(),
                    PendingEntry {
                        confirmation,
                        expiry: None,
                    },
                );
                Upsert::Inserted
            }
        }
    }

    /// Attach an expiry timer; aborted when the entry leaves.
    pub fn set_expiry(&mut self, call_id: &str, handle: JoinHandle<()>) {
        match self.entries.get_mut(call_id) {
            Some(entry) => {
                entry.cancel_expiry();
                entry.expiry = Some(handle);
            }
            None => handle.abort(),
        }
    }

    pub fn get(&self, call_id: &str) -> Option<&Confirmation> {
        self.entries.get(call_id).map(|entry| &entry.confirmation)
    }

    pub fn remove(&mut self, call_id: &str) -> Option<Confirmation> {
        let mut entry = self.entries.remove(call_id)?;
        entry.cancel_expiry();
        Some(entry.confirmation)
    }

    /// Remove only if the pending confirmation still has `id`.
    pub fn remove_if_id(&mut self, call_id: &str, id: &str) -> Option<Confirmation> {
        if self.get(call_id)?.id != id {
            return None;
        }
        self.remove(call_id)
    }

    pub fn drain(&mut self) -> Vec<Confirmation> {
        let call_ids: Vec<String> = self.entries.keys().cloned().collect();
        call_ids
            .iter()
            .filter_map(|call_id| self.remove(call_id))
            .collect()
    }

    pub fn confirmations(&self) -> impl Iterator<Item = &Confirmation> {
        self.entries.values().map(|entry| &entry.confirmation)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for PendingConfirmations {
    fn drop(&mut self) {
        for entry in self.entries.values_mut() {
            entry.cancel_expiry();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{default_options, ConfirmationAction};

    fn conf(call_id: &str, id: &str, title: &str) -> Confirmation {
        Confirmation {
            id: id.into(),
            call_id: call_id.into(),
            title: title.into(),
            description: String::new(),
            action: ConfirmationAction::Edit,
            command_type: None,
            options: default_options(),
        }
    }

    #[test]
    fn re_emission_with_same_id_updates_in_place() {
        let mut pending = PendingConfirmations::new();
        assert_eq!(pending.upsert(conf("c1", "a", "first")), Upsert::Inserted);
        assert_eq!(pending.upsert(conf("c1", "a", "second")), Upsert::Updated);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.get("c1").unwrap().title, "second");
    }

    #[test]
    fn stale_expiry_does_not_remove_newer_confirmation() {
        let mut pending = PendingConfirmations::new();
        pending.upsert(conf("c1", "a", "first"));
        pending.upsert(conf("c1", "b", "replacement"));
        assert!(pending.remove_if_id("c1", "a").is_none());
        assert!(pending.remove_if_id("c1", "b").is_some());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn removal_aborts_expiry_timer() {
        let mut pending = PendingConfirmations::new();
        pending.upsert(conf("c1", "a", "t"));
        let (alive_tx, alive_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await;
        });
        pending.set_expiry("c1", handle);
        pending.remove("c1");
        assert!(alive_rx.await.is_err());
    }
}
