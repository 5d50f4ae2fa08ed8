//! Main Entrypoint for the Parley CLI
//!
//! Loads configuration, installs logging and runs one subcommand: a health
//! check, a live realtime session, or maintenance of the stored histories.

use anyhow::Context;
use clap::{Parser, Subcommand};
use parley_client::{
    audio_utils::LoggingAudio,
    config::Config,
    rest::{BackendClient, Health},
    ws::{Session, SessionEvent},
};
use parley_core::{
    dispatcher::McpToolDispatcher,
    history::prepare_for_llm,
    memory::{FileStore, MemoryStore},
    sync::{SyncReport, pull_snapshots, push_snapshots},
    tools::{CapabilityEndpoints, CapabilityService},
    turn::{SessionConfig, Turn},
};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(version, about = "Realtime voice conversation client")]
struct Cli {
    /// Overrides PARLEY_VOICE_NAME.
    #[arg(long, global = true)]
    voice: Option<String>,
    /// Overrides PARLEY_BACKEND_URL.
    #[arg(long, global = true)]
    backend: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Checks whether the backend is reachable.
    Health,
    /// Connects and runs a session until Ctrl+C.
    Chat,
    /// Inspects or clears the live history.
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
    /// Manages history snapshots, locally and on the backend.
    Memories {
        #[command(subcommand)]
        action: MemoriesAction,
    },
}

#[derive(Subcommand, Debug)]
enum HistoryAction {
    Show {
        /// Joins consecutive same-role turns with this separator.
        #[arg(long, default_value = " ")]
        separator: String,
        /// Shows the history as prepared for a chat model instead.
        #[arg(long)]
        llm: bool,
    },
    Clear,
}

#[derive(Subcommand, Debug)]
enum MemoriesAction {
    List,
    Snapshot,
    Restore { timestamp: String },
    Push,
    Pull,
}

fn print_turns(turns: &[Turn]) {
    for turn in turns {
        match (&turn.content, &turn.tool_calls, &turn.tool_call_id) {
            (_, Some(calls), _) => {
                for call in calls {
                    println!(
                        "{}: [call {} {}({})]",
                        turn.role, call.id, call.function.name, call.function.arguments_json
                    );
                }
            }
            (Some(content), None, Some(call_id)) => {
                println!("{}: [result {call_id}] {content}", turn.role)
            }
            (Some(content), None, None) => println!("{}: {content}", turn.role),
            (None, None, _) => {}
        }
    }
}

fn print_report(action: &str, report: &SyncReport) {
    println!(
        "{action}: {} succeeded, {} failed",
        report.success_count, report.error_count
    );
    if report.is_partial_failure() {
        warn!(
            errors = report.error_count,
            "Some snapshots were not transferred."
        );
    }
}

fn backend_client(config: &Config) -> anyhow::Result<BackendClient> {
    BackendClient::new(
        config.require_backend()?,
        config.health_timeout,
        config.request_timeout,
    )
}

async fn chat(config: &Config, memory: MemoryStore) -> anyhow::Result<()> {
    let capabilities = CapabilityService::new(
        reqwest::Client::new(),
        CapabilityEndpoints::open_meteo(config.backend_url.as_deref()),
    );
    let dispatcher = McpToolDispatcher::start(capabilities)
        .await
        .context("Failed to start the capability server")?;

    let session_config = SessionConfig {
        instructions: config.instructions.clone(),
        voice_id: config.voice_id.clone(),
        voice_name: config.voice_name.clone(),
        allow_recording: config.allow_recording,
        tool_declarations: vec![],
    };
    let (mut session, events) = Session::new(
        session_config,
        config.backend_url.clone(),
        memory,
        Arc::new(dispatcher),
        Arc::new(LoggingAudio::default()),
    );
    let handle = session.handle();
    let runtime = tokio::spawn(async move {
        session.run(events).await;
        session
    });

    handle.send(SessionEvent::Connect).await?;
    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;
    info!("Received shutdown signal. Closing session...");
    handle.send(SessionEvent::Shutdown).await?;

    let session = runtime.await.context("Session task panicked")?;
    print_turns(&session.history().compress(" "));
    for error in session.errors() {
        eprintln!("error #{}: {}", error.id, error.message);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(voice) = cli.voice {
        config.voice_id = voice.clone();
        config.voice_name = voice;
    }
    if let Some(backend) = cli.backend {
        config.backend_url = Some(backend.trim_end_matches('/').to_string());
    }

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    let store = FileStore::open(&config.store_path).with_context(|| {
        format!(
            "Failed to open history store at {}",
            config.store_path.display()
        )
    })?;
    let memory = MemoryStore::new(Arc::new(store));
    let voice = config.voice_name.clone();

    match cli.command {
        Command::Health => {
            let client = backend_client(&config)?;
            match client.health().await {
                Health::Reachable(status) => {
                    println!("{}", serde_json::to_string_pretty(&status)?)
                }
                Health::Unreachable => println!("unreachable"),
            }
        }
        Command::Chat => chat(&config, memory).await?,
        Command::History { action } => match action {
            HistoryAction::Show { separator, llm } => {
                let history = memory.load(&voice);
                if llm {
                    print_turns(&prepare_for_llm(history.turns()));
                } else {
                    print_turns(&history.compress(&separator));
                }
            }
            HistoryAction::Clear => {
                memory.clear(&voice)?;
                println!("Cleared history for {voice}");
            }
        },
        Command::Memories { action } => match action {
            MemoriesAction::List => {
                for timestamp in memory.list(&voice)? {
                    println!("{timestamp}");
                }
            }
            MemoriesAction::Snapshot => println!("{}", memory.snapshot(&voice)?),
            MemoriesAction::Restore { timestamp } => {
                memory.restore(&voice, &timestamp)?;
                println!("Restored {timestamp} for {voice}");
            }
            MemoriesAction::Push => {
                let client = backend_client(&config)?;
                print_report("push", &push_snapshots(&memory, &client, &voice).await?);
            }
            MemoriesAction::Pull => {
                let client = backend_client(&config)?;
                print_report("pull", &pull_snapshots(&memory, &client, &voice).await?);
            }
        },
    }
    Ok(())
}
