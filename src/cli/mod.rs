//! Command-line interface for agent-relay.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::types::{BackendKind, SessionMode};

/// Drive one agent conversation from the terminal.
#[derive(Parser, Debug)]
#[command(name = "agent-relay", version, about = "Streaming agent orchestration CLI")]
pub struct Cli {
    /// TOML settings file; the environment is used when absent
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send one prompt and stream the reply
    Chat(ChatArgs),
    /// List models offered by the configured endpoint
    Models,
}

#[derive(Parser, Debug)]
pub struct ChatArgs {
    /// Backend to drive (sdk, jsonrpc, gateway)
    #[arg(short, long)]
    pub backend: Option<BackendKind>,

    /// Model for the in-process backend
    #[arg(short, long)]
    pub model: Option<String>,

    /// Approval mode (default, autoEdit, yolo)
    #[arg(long)]
    pub mode: Option<SessionMode>,

    /// Files to attach
    #[arg(short, long = "file")]
    pub files: Vec<PathBuf>,

    /// User prompt
    pub prompt: String,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_chat_with_options() {
        let cli = Cli::try_parse_from([
            "agent-relay",
            "chat",
            "--backend",
            "acp",
            "--mode",
            "yolo",
            "-f",
            "notes.md",
            "Summarize this",
        ])
        .unwrap();
        match cli.command {
            Commands::Chat(args) => {
                assert_eq!(args.backend, Some(BackendKind::Jsonrpc));
                assert_eq!(args.mode, Some(SessionMode::Yolo));
                assert_eq!(args.files, vec![PathBuf::from("notes.md")]);
                assert_eq!(args.prompt, "Summarize this");
            }
            other => panic!("expected Chat, got {other:?}"),
        }
    }

    #[test]
    fn parse_global_config_flag() {
        let cli = Cli::try_parse_from(["agent-relay", "models", "--config", "relay.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("relay.toml")));
        assert!(matches!(cli.command, Commands::Models));
    }

    #[test]
    fn chat_requires_prompt() {
        assert!(Cli::try_parse_from(["agent-relay", "chat"]).is_err());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(Cli::try_parse_from(["agent-relay", "chat", "-b", "carrier-pigeon", "hi"]).is_err());
    }
}
