//! Scheduling commands embedded in assistant text.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleCommand {
    Create {
        name: String,
        schedule: String,
        message: String,
    },
    Delete {
        id: String,
    },
}

/// Receives scheduling commands found at the end of a turn.
#[async_trait]
pub trait SideEffectHandler: Send + Sync {
    async fn on_schedule(&self, conversation_id: &str, command: ScheduleCommand) -> Result<()>;
}

fn create_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)\[CRON_CREATE\](.*?)\[/CRON_CREATE\]").expect("valid pattern")
    })
}

fn delete_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[CRON_DELETE:\s*([^\]\s]+)\s*\]").expect("valid pattern")
    })
}

/// Parse `name:`/`schedule:`/`message:` lines; `message:` may continue over
/// the following lines.
fn parse_create(body: &str) -> Option<ScheduleCommand> {
    let mut name = None;
    let mut schedule = None;
    let mut message: Option<String> = None;

    for line in body.lines() {
        let trimmed = line.trim();
        if let Some(value) = trimmed.strip_prefix("name:") {
            name = Some(value.trim().to_string());
        } else if let Some(value) = trimmed.strip_prefix("schedule:") {
            schedule = Some(value.trim().to_string());
        } else if let Some(value) = trimmed.strip_prefix("message:") {
            message = Some(value.trim().to_string());
        } else if let Some(message) = message.as_mut() {
            if !trimmed.is_empty() {
                message.push('\n');
                message.push_str(trimmed);
            }
        }
    }

    Some(ScheduleCommand::Create {
        name: name.filter(|n| !n.is_empty())?,
        schedule: schedule.filter(|s| !s.is_empty())?,
        message: message.unwrap_or_default(),
    })
}

/// Every scheduling command in `text`, in order of appearance.
pub fn parse_schedule_commands(text: &str) -> Vec<ScheduleCommand> {
    let mut found: Vec<(usize, ScheduleCommand)> = Vec::new();

    for captures in create_block().captures_iter(text) {
        let (Some(whole), Some(body)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        match parse_create(body.as_str()) {
            Some(command) => found.push((whole.start(), command)),
            None => tracing::warn!("Ignoring CRON_CREATE block without name or schedule"),
        }
    }
    for captures in delete_marker().captures_iter(text) {
        let (Some(whole), Some(id)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        found.push((
            whole.start(),
            ScheduleCommand::Delete {
                id: id.as_str().to_string(),
            },
        ));
    }

    found.sort_by_key(|(position, _)| *position);
    found.into_iter().map(|(_, command)| command).collect()
}
