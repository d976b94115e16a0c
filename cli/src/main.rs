// danmuhub: live comment relay
//
// Connects to a room's comment feed, records every command to rotating
// history files and rebroadcasts it to local WebSocket subscribers.

mod history;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use danmuhub_core::history::{HistoryLog, HISTORY_EXTENSION};
use danmuhub_core::{CompanionHook, Config, ConfigStore, GiftCache, Pipeline, PipelineOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser)]
#[command(name = "danmuhub")]
#[command(about = "danmuhub — live comment relay", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to <config dir>/danmuhub/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to daily files in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a room and serve subscribers until Ctrl-C
    Start {
        /// Room to join (saved to the config)
        #[arg(short, long)]
        room: Option<u64>,
        /// Subscriber server port (saved to the config)
        #[arg(short, long)]
        port: Option<u16>,
        /// Gift metadata JSON to hand to subscribers
        #[arg(long)]
        gift_config: Option<PathBuf>,
        /// Serve subscribers without opening the upstream connection
        #[arg(long)]
        no_connect: bool,
    },
    /// Show or change settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
    /// Browse recorded history files
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Room {
        roomid: u64,
    },
    Port {
        port: u16,
    },
    Reconnect {
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
        /// Attempt bound, -1 for unbounded
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        max: i64,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    List,
    Show {
        /// File name or path; newest file when omitted
        file: Option<String>,
        /// Include entries a subscriber replay would skip
        #[arg(long)]
        all: bool,
    },
    Delete {
        file: String,
        /// Also delete the newest file, which a running session may be writing
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Start { .. } => "info",
        _ => "warn",
    };
    let _guard = init_logging(default_level, cli.log_dir.as_deref())?;

    let store = open_store(cli.config)?;

    match cli.command {
        Commands::Start {
            room,
            port,
            gift_config,
            no_connect,
        } => cmd_start(store, room, port, gift_config, no_connect).await,
        Commands::Config { action } => cmd_config(store, action),
        Commands::History { action } => cmd_history(store, action),
    }
}

fn init_logging(default_level: &str, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "danmuhub.log"));
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            Ok(None)
        }
    }
}

fn open_store(path: Option<PathBuf>) -> Result<Arc<ConfigStore>> {
    let path = match path {
        Some(path) => path,
        None => Config::config_file()?,
    };
    let store = ConfigStore::open(path.clone())
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn cmd_start(
    store: Arc<ConfigStore>,
    room: Option<u64>,
    port: Option<u16>,
    gift_config: Option<PathBuf>,
    no_connect: bool,
) -> Result<()> {
    if let Some(room) = room {
        store.set_roomid(room).context("Failed to save room id")?;
    }
    if let Some(port) = port {
        store.set_server_port(port).context("Failed to save server port")?;
    }

    let gifts = GiftCache::new();
    if let Some(path) = gift_config {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read gift config {}", path.display()))?;
        let table = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse gift config {}", path.display()))?;
        gifts.replace(table);
    }

    let roomid = store.roomid();
    if roomid == 0 && !no_connect {
        anyhow::bail!("No room configured; pass --room or run `danmuhub config room <id>`");
    }

    println!("{}", "danmuhub — Starting...".bold());
    println!();

    let companion: CompanionHook = Arc::new(|roomid: u64| {
        println!("{} Connected to room {}", "✓".green(), roomid.to_string().bright_cyan());
    });

    let pipeline = Pipeline::start(
        store.clone(),
        gifts,
        PipelineOptions {
            connect_on_start: !no_connect,
            companion: Some(companion),
            ..PipelineOptions::default()
        },
    )
    .context("Failed to start")?;
    tracing::info!("Pipeline started for room {}", roomid);

    if let Some(addr) = pipeline.server_addr() {
        println!("{} Subscribers: {}", "✓".green(), format!("ws://{}/", addr).bright_cyan());
        println!("{} Status:      {}", "✓".green(), format!("http://{}/api/status", addr).bright_cyan());
    }
    match pipeline.history_path() {
        Some(path) => println!("{} History:     {}", "✓".green(), path.display()),
        None => println!("{} History:     {}", "•".dimmed(), "disabled".dimmed()),
    }
    if no_connect {
        println!("{} Upstream connection not opened (--no-connect)", "•".dimmed());
    } else {
        println!("{} Joining room {}", "✓".green(), roomid.to_string().bright_cyan());
    }
    println!();
    println!("Press {} to stop.", "Ctrl-C".bright_green());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    println!();
    println!("Shutting down...");
    pipeline.shutdown().await;
    tracing::info!("Stopped cleanly");

    Ok(())
}

fn cmd_config(store: Arc<ConfigStore>, action: Option<ConfigAction>) -> Result<()> {
    match action.unwrap_or(ConfigAction::Show) {
        ConfigAction::Show => {
            let config = store.snapshot();
            let receiver = &config.danmu_receiver;

            println!("{}", "Configuration".bold());
            println!();
            print_row("roomid", receiver.roomid);
            print_row("upstream", receiver.url());
            print_row("heartBeatInterval", format!("{}s", receiver.heartbeat_interval));
            print_row("autoReconnect", receiver.auto_reconnect);
            print_row("maxReconnectCount", receiver.max_reconnect_count);
            print_row("reconnectDelayMs", receiver.reconnect_delay_ms);
            print_row("noReconnectCodes", format!("{:?}", receiver.no_reconnect_codes));
            print_row(
                "autoOpenWhenConnect",
                config.danmu_view_config.auto_open_when_connect,
            );
            print_row(
                "server",
                format!("{}:{}", config.http_server_host, config.http_server_port),
            );
            print_row("history", config.history.enabled);
            match config.history_dir() {
                Ok(dir) => print_row("historyDirectory", dir.display()),
                Err(e) => print_row("historyDirectory", e.to_string().red()),
            }
            if let Some(mb) = config.history.max_file_size_mb {
                print_row("maxFileSizeMb", mb);
            }
        }

        ConfigAction::Room { roomid } => {
            store.set_roomid(roomid)?;
            println!("{} Set {} = {}", "✓".green(), "roomid".bright_cyan(), roomid);
        }

        ConfigAction::Port { port } => {
            store.set_server_port(port)?;
            println!("{} Set {} = {}", "✓".green(), "httpServerPort".bright_cyan(), port);
        }

        ConfigAction::Reconnect { enabled, max } => {
            store.set_reconnect_policy(enabled, max)?;
            println!(
                "{} Set {} = {}, {} = {}",
                "✓".green(),
                "autoReconnect".bright_cyan(),
                enabled,
                "maxReconnectCount".bright_cyan(),
                max
            );
        }
    }

    Ok(())
}

fn print_row(key: &str, value: impl std::fmt::Display) {
    println!("  {:<22} {}", key.bright_cyan(), value);
}

fn cmd_history(store: Arc<ConfigStore>, action: HistoryAction) -> Result<()> {
    let dir = store.snapshot().history_dir()?;

    match action {
        HistoryAction::List => {
            if !dir.exists() {
                println!("{}", "No history recorded yet.".dimmed());
                return Ok(());
            }
            let files = HistoryLog::list(&dir)
                .with_context(|| format!("Failed to list {}", dir.display()))?;
            if files.is_empty() {
                println!("{}", "No history recorded yet.".dimmed());
                return Ok(());
            }

            println!("{} ({} files, *.{})", "History".bold(), files.len(), HISTORY_EXTENSION);
            println!();
            for path in files {
                let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                println!("  {:<40} {:>10}", name.bright_cyan(), format_size(size));
            }
        }

        HistoryAction::Show { file, all } => {
            let path = history::resolve_file(&dir, file.as_deref())?;
            let envelopes = if all {
                HistoryLog::read(&path)
            } else {
                HistoryLog::read_filtered(&path)
            }
            .with_context(|| format!("Failed to read {}", path.display()))?;

            if envelopes.is_empty() {
                println!("{}", "No entries found.".dimmed());
                return Ok(());
            }

            println!("{} ({} entries)", path.display().to_string().bold(), envelopes.len());
            println!();
            for envelope in &envelopes {
                println!(
                    "{} {:<24} {}",
                    history::formatted_time(envelope).dimmed(),
                    envelope.message.kind().unwrap_or("?").bright_cyan(),
                    history::summary(&envelope.message)
                );
            }
        }

        HistoryAction::Delete { file, force } => {
            let path = history::resolve_file(&dir, Some(&file))?;
            HistoryLog::delete_stored(&dir, &path, force)
                .with_context(|| format!("Failed to delete {}", path.display()))?;
            println!("{} Deleted {}", "✓".green(), path.display());
        }
    }

    Ok(())
}

fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let bytes = bytes as f64;
    if bytes < KB {
        format!("{} B", bytes)
    } else if bytes < KB * KB {
        format!("{:.1} KB", bytes / KB)
    } else {
        format!("{:.1} MB", bytes / (KB * KB))
    }
}
