//! murmur CLI: terminal front end for the murmur conversational client

use clap::{Args, Parser, Subcommand};
use murmur_engine::{
    engine_version, start_http_session, LifecycleState, SessionConfig, SessionError,
    SessionEvent, SessionView,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Conversational client with incremental replies
#[derive(Parser)]
#[command(name = "murmur")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat interactively (default when no command specified)
    Chat,

    /// Send a single message and print the reply
    Ask {
        /// Message to send
        text: String,
    },

    /// Write a default config file
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
}

/// Settings that take precedence over the config file.
#[derive(Args)]
struct Overrides {
    /// Path to the config file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Completion service endpoint
    #[arg(long, global = true)]
    completion_url: Option<String>,

    /// Image service endpoint
    #[arg(long, global = true)]
    image_url: Option<String>,

    /// Model name sent with every request
    #[arg(long, global = true)]
    model: Option<String>,

    /// Do not fetch images for replies
    #[arg(long, global = true)]
    no_images: bool,
}

const DEFAULT_CONFIG_PATH: &str = ".murmur/config.json";

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Some(Commands::Init { force }) => cmd_init(&cli.overrides.config, force),
        command => {
            let config = match load_config(&cli.overrides) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Error: {e}");
                    std::process::exit(1);
                }
            };

            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("Error: failed to start runtime: {e}");
                    std::process::exit(1);
                }
            };

            let result = match command {
                Some(Commands::Ask { text }) => rt.block_on(cmd_ask(config, text)),
                _ => rt.block_on(cmd_chat(config)),
            };
            if let Err(e) = result {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
    }
}

fn load_config(overrides: &Overrides) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    let mut config = SessionConfig::load_or_default(&overrides.config)?;

    if let Some(url) = &overrides.completion_url {
        config.completion_url.clone_from(url);
    }
    if let Some(url) = &overrides.image_url {
        config.image_url.clone_from(url);
    }
    if let Some(model) = &overrides.model {
        config.model.clone_from(model);
    }
    if overrides.no_images {
        config.image_enabled = false;
    }

    config.validate()?;
    tracing::debug!(
        completion_url = %config.completion_url,
        image_url = %config.image_url,
        model = %config.model,
        images = config.image_enabled,
        "config loaded"
    );
    Ok(config)
}

fn cmd_init(path: &Path, force: bool) {
    if path.exists() && !force {
        println!("Config already exists at {}", path.display());
        println!("Use --force to overwrite it.");
        return;
    }

    match SessionConfig::default().save(path) {
        Ok(()) => {
            println!("Wrote default config to {}", path.display());
            println!();
            println!("Edit completion_url and image_url, then run `murmur chat`.");
        }
        Err(e) => {
            eprintln!("Failed to write config: {e}");
            std::process::exit(1);
        }
    }
}

async fn cmd_chat(config: SessionConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (handle, mut events, task) = start_http_session(config)?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = true;
    let mut outstanding = 0usize;
    let mut printed = 0;

    println!("murmur {} - type a message, Ctrl-D to quit", engine_version());

    loop {
        tokio::select! {
            line = lines.next_line(), if input_open => match line? {
                Some(text) => match handle.submit(text) {
                    Ok(()) => outstanding += 1,
                    Err(SessionError::EmptyInput) => eprintln!("(empty input ignored)"),
                    Err(e) => return Err(e.into()),
                },
                None => input_open = false,
            },
            Some(event) = events.recv() => {
                if matches!(event, SessionEvent::TurnFinalized { .. }) {
                    outstanding = outstanding.saturating_sub(1);
                }
                render_event(&event, &mut printed)?;
            }
        }

        // Input closed: let the last reply finish before leaving.
        if !input_open && outstanding == 0 {
            break;
        }
    }

    handle.shutdown();
    task.await?;
    Ok(())
}

/// Print the part of the reply that became visible since the last event.
fn render_event(event: &SessionEvent, printed: &mut usize) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    match event {
        SessionEvent::RevealProgress { prefix } => {
            let fresh: String = prefix.chars().skip(*printed).collect();
            write!(stdout, "{fresh}")?;
            *printed = prefix.chars().count();
        }
        SessionEvent::TurnFinalized { bot, .. } => {
            let rest: String = bot.chars().skip(*printed).collect();
            writeln!(stdout, "{rest}")?;
            *printed = 0;
        }
        SessionEvent::ArtifactUpdated { data_url } => {
            eprintln!("[image received, {} bytes]", data_url.len());
        }
        SessionEvent::TurnAppended { .. }
        | SessionEvent::RequestStarted { .. }
        | SessionEvent::RequestFailed { .. }
        | SessionEvent::ScrollToBottom => {}
    }
    stdout.flush()
}

async fn cmd_ask(config: SessionConfig, text: String) -> Result<(), Box<dyn std::error::Error>> {
    // Room for the request itself plus the reveal of a long reply.
    let wait = config.request_timeout() + Duration::from_secs(120);
    let (handle, _events, task) = start_http_session(config)?;

    handle.submit(text)?;
    let view = handle
        .wait_for(reply_settled, wait)
        .await
        .ok_or("timed out waiting for a reply")?;

    if let Some(turn) = view.turns.last() {
        println!("{}", turn.bot);
    }

    handle.shutdown();
    task.await?;

    if view.last_outcome == Some(LifecycleState::Failed) {
        return Err("completion request failed".into());
    }
    Ok(())
}

fn reply_settled(view: &SessionView) -> bool {
    view.last_outcome.is_some()
        && view.lifecycle == LifecycleState::Idle
        && view.reveal_prefix.is_none()
}
