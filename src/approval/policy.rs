//! Approval keys and the auto-approval decision.

use crate::types::{Confirmation, ConfirmationAction, SessionMode};

use super::store::{ApprovalKey, ApprovalStore};

/// Root commands of a shell command line, one per pipeline segment.
///
/// Leading `NAME=value` assignments are skipped and paths reduced to their
/// basename, so `FOO=1 /usr/bin/git status && rm x` yields `git`, `rm`.
pub fn root_commands(command: &str) -> Vec<String> {
    let mut roots: Vec<String> = Vec::new();
    for segment in command.split(['&', '|', ';', '\n']) {
        if let Some(root) = root_command(segment) {
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
    }
    roots
}

fn root_command(segment: &str) -> Option<String> {
    let token = segment
        .split_whitespace()
        .find(|token| !is_env_assignment(token))?;
    let token = token.trim_matches(|c| c == '(' || c == ')' || c == '"' || c == '\'');
    let base = token.rsplit('/').next().unwrap_or(token);
    (!base.is_empty()).then(|| base.to_string())
}

fn is_env_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

/// Keys a confirmation must have approved to be auto-approved.
pub fn approval_keys(confirmation: &Confirmation) -> Vec<ApprovalKey> {
    match confirmation.action {
        ConfirmationAction::Edit => vec![ApprovalKey::new("edit")],
        ConfirmationAction::Info => vec![ApprovalKey::new("info")],
        ConfirmationAction::Exec => match confirmation.command_type.as_deref() {
            Some(roots) if !roots.trim().is_empty() => roots
                .split(',')
                .map(str::trim)
                .filter(|root| !root.is_empty())
                .map(|root| ApprovalKey::new(format!("exec:{root}")))
                .collect(),
            _ => vec![ApprovalKey::new("exec")],
        },
        ConfirmationAction::Mcp => match confirmation.command_type.as_deref() {
            Some(target) if !target.is_empty() => {
                vec![ApprovalKey::new(format!("mcp:{target}"))]
            }
            _ => vec![ApprovalKey::new("mcp")],
        },
    }
}

/// Why a confirmation was approved without asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoReason {
    Yolo,
    AutoEdit,
    Remembered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    AutoApprove { option: String, reason: AutoReason },
    Ask,
}

/// Decide whether `confirmation` can be answered without the caller.
///
/// Order: yolo approves everything; auto-edit approves edit and info
/// actions; otherwise a remembered "always allow" for every key approves.
pub fn decide(
    mode: SessionMode,
    confirmation: &Confirmation,
    store: &ApprovalStore,
) -> ApprovalDecision {
    let Some(option) = confirmation.preferred_allow_option() else {
        return ApprovalDecision::Ask;
    };
    let approve = |reason| ApprovalDecision::AutoApprove {
        option: option.value.clone(),
        reason,
    };

    if mode == SessionMode::Yolo {
        return approve(AutoReason::Yolo);
    }
    if mode == SessionMode::AutoEdit
        && matches!(
            confirmation.action,
            ConfirmationAction::Edit | ConfirmationAction::Info
        )
    {
        return approve(AutoReason::AutoEdit);
    }
    if store.all_approved(&approval_keys(confirmation)) {
        return approve(AutoReason::Remembered);
    }
    ApprovalDecision::Ask
}
