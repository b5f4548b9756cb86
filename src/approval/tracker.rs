//! Per-turn tool-call tracking with protection against spurious cancellation.
//!
//! A call becomes protected once it has been handed to the backend for
//! execution (approved, or reported in progress). Protected calls are
//! skipped by [`ToolTracker::cleanup_pass`] until they reach a terminal status.

use serde_json::Value;

use crate::types::{ToolCallStatus, ToolGroupEntry, ToolKind};

#[derive(Debug, Clone, PartialEq)]
struct TrackedCall {
    entry: ToolGroupEntry,
    protected: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ToolTracker {
    calls: Vec<TrackedCall>,
}

impl ToolTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a requested call. A repeated request for a known call refreshes its args.
    pub fn request(&mut self, call_id: &str, name: &str, args: Value) {
        if let Some(call) = self.find_mut(call_id) {
            call.entry.args = args;
            if !name.is_empty() {
                call.entry.name = name.to_string();
            }
            return;
        }
        self.calls.push(TrackedCall {
            entry: ToolGroupEntry {
                call_id: call_id.to_string(),
                name: name.to_string(),
                status: ToolCallStatus::Pending,
                kind: ToolKind::infer(name),
                args,
                output: None,
            },
            protected: false,
        });
    }

    /// Apply a status update. Unknown calls are added.
    pub fn update(
        &mut self,
        call_id: &str,
        name: Option<&str>,
        status: ToolCallStatus,
        kind: Option<ToolKind>,
        output: Option<String>,
    ) {
        if self.find_mut(call_id).is_none() {
            self.request(call_id, name.unwrap_or_default(), Value::Null);
        }
        let Some(call) = self.find_mut(call_id) else {
            return;
        };
        if call.entry.status.is_terminal() && !status.is_terminal() {
            tracing::debug!(call_id, %status, "Ignoring regression from terminal status");
            return;
        }
        if let Some(name) = name.filter(|name| !name.is_empty()) {
            call.entry.name = name.to_string();
        }
        if kind.is_some() {
            call.entry.kind = kind;
        }
        if output.is_some() {
            call.entry.output = output;
        }
        call.entry.status = status;
        if status == ToolCallStatus::InProgress {
            call.protected = true;
        }
        if status.is_terminal() {
            call.protected = false;
        }
    }

    /// Mark a call as dispatched for execution.
    pub fn protect(&mut self, call_id: &str) {
        if let Some(call) = self.find_mut(call_id) {
            if !call.entry.status.is_terminal() {
                call.protected = true;
            }
        }
    }

    pub fn is_protected(&self, call_id: &str) -> bool {
        self.calls
            .iter()
            .any(|call| call.entry.call_id == call_id && call.protected)
    }

    /// Drop every protection, used on error paths.
    pub fn unprotect_all(&mut self) {
        for call in &mut self.calls {
            call.protected = false;
        }
    }

    /// Cancel every non-terminal call that is not protected. Returns the canceled ids.
    pub fn cleanup_pass(&mut self) -> Vec<String> {
        let mut canceled = Vec::new();
        for call in &mut self.calls {
            if !call.protected && !call.entry.status.is_terminal() {
                call.entry.status = ToolCallStatus::Canceled;
                canceled.push(call.entry.call_id.clone());
            }
        }
        canceled
    }

    /// True when the batch is non-empty and every call ended canceled.
    pub fn batch_all_canceled(&self) -> bool {
        !self.calls.is_empty()
            && self
                .calls
                .iter()
                .all(|call| call.entry.status == ToolCallStatus::Canceled && !call.protected)
    }

    pub fn status(&self, call_id: &str) -> Option<ToolCallStatus> {
        self.calls
            .iter()
            .find(|call| call.entry.call_id == call_id)
            .map(|call| call.entry.status)
    }

    pub fn snapshot(&self) -> Vec<ToolGroupEntry> {
        self.calls.iter().map(|call| call.entry.clone()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.calls.iter().map(|call| call.entry.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn reset(&mut self) {
        self.calls.clear();
    }

    fn find_mut(&mut self, call_id: &str) -> Option<&mut TrackedCall> {
        self.calls
            .iter_mut()
            .find(|call| call.entry.call_id == call_id)
    }
}
