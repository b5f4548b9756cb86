//! agent-relay CLI binary entry point.

use std::io::Write;
use std::sync::Arc;

use agent_relay::backend::openai::OpenAiClient;
use agent_relay::backend::sdk::NoTools;
use agent_relay::backend::ConfiguredFactory;
use agent_relay::cli::{ChatArgs, Cli, Commands};
use agent_relay::config::RelayConfig;
use agent_relay::manager::{AgentManager, BroadcastBus, Collaborators, MemoryStore};
use agent_relay::types::{Confirmation, EventEnvelope, ToolGroupEntry, WireType};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse_args();
    let result = match load_config(&cli) {
        Ok(config) => match cli.command {
            Commands::Chat(args) => handle_chat(config, args).await,
            Commands::Models => handle_models(config).await,
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<RelayConfig, BoxError> {
    Ok(match &cli.config {
        Some(path) => RelayConfig::from_toml_file(path)?,
        None => RelayConfig::from_env(),
    })
}

async fn handle_models(config: RelayConfig) -> Result<(), BoxError> {
    let client = OpenAiClient::from_config(&config)?;
    for model in client.list_models().await? {
        println!("{model}");
    }
    Ok(())
}

async fn handle_chat(mut config: RelayConfig, args: ChatArgs) -> Result<(), BoxError> {
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(model) = args.model {
        config.model = model;
    }

    let bus = Arc::new(BroadcastBus::default());
    let mut events = bus.subscribe();
    let deps = Collaborators::new(
        Arc::new(MemoryStore::new()),
        bus.clone(),
        Arc::new(ConfiguredFactory::new(Arc::new(NoTools))),
    );
    let mut manager = AgentManager::new("cli", Arc::new(config), deps);
    if let Some(mode) = args.mode {
        manager = manager.force_session_mode(mode);
    }

    manager.send(args.prompt, args.files).await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let envelope = match events.recv().await {
            Ok(envelope) => envelope,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Terminal fell behind the event stream");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if render(&manager, &mut stdin, envelope).await? {
            break;
        }
    }
    println!();

    manager.shutdown().await?;
    Ok(())
}

/// Print one event. Returns true at the end of the turn.
async fn render(
    manager: &AgentManager,
    stdin: &mut Lines<BufReader<Stdin>>,
    envelope: EventEnvelope,
) -> Result<bool, BoxError> {
    match envelope.kind {
        WireType::Content => {
            print!("{}", envelope.data.as_str().unwrap_or_default());
            std::io::stdout().flush()?;
        }
        WireType::Thought => {
            if let Some(text) = envelope.data.get("text").and_then(|t| t.as_str()) {
                eprint!("\x1b[2m{text}\x1b[0m");
            }
        }
        WireType::ToolGroup => {
            let calls: Vec<ToolGroupEntry> = serde_json::from_value(envelope.data)?;
            for call in calls {
                eprintln!("\n  [{}] {} ({})", call.status, call.name, call.call_id);
            }
        }
        WireType::ConfirmationRequest => {
            let confirmation: Confirmation = serde_json::from_value(envelope.data)?;
            let choice = ask(&confirmation, stdin).await?;
            manager.confirm(&confirmation.call_id, &choice).await?;
        }
        WireType::AgentStatus => {
            if let Some(message) = envelope.data.get("message").and_then(|m| m.as_str()) {
                eprintln!("\n  ! {message}");
            }
        }
        WireType::Error => {
            eprintln!("\nError: {}", envelope.data.as_str().unwrap_or("unknown error"));
        }
        WireType::Finish => return Ok(true),
        WireType::Start
        | WireType::ToolCallRequest
        | WireType::ConfirmationRemove => {}
    }
    Ok(false)
}

async fn ask(
    confirmation: &Confirmation,
    stdin: &mut Lines<BufReader<Stdin>>,
) -> Result<String, BoxError> {
    eprintln!("\n{}", confirmation.title);
    if !confirmation.description.is_empty() {
        eprintln!("  {}", confirmation.description);
    }
    for (index, option) in confirmation.options.iter().enumerate() {
        eprintln!("  {}) {}", index + 1, option.label);
    }

    loop {
        eprint!("choice> ");
        let line = stdin.next_line().await?.unwrap_or_default();
        let picked = line
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| confirmation.options.get(i));
        match picked {
            Some(option) => return Ok(option.value.clone()),
            None if line.is_empty() => match confirmation.reject_option() {
                Some(reject) => return Ok(reject.value.clone()),
                None => return Err("stdin closed with a confirmation pending".into()),
            },
            None => eprintln!("Enter a number between 1 and {}", confirmation.options.len()),
        }
    }
}
