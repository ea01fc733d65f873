//! Quill CLI - Command line access to an event store
//!
//! Opens the store in a data directory, runs one command and disposes it.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use quill_common::{Document, EngineConfig, RecordState};
use quill_storage::Engine;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "quill-cli")]
#[command(about = "Quill event store CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "quill.toml")]
    config: PathBuf,

    /// Data directory (overrides the configuration file)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Append an event (or snapshot) to a stream
    Append {
        /// Stream id
        stream: String,
        /// Payload as a JSON object
        payload: String,
        /// Metadata as a JSON object
        #[arg(short, long)]
        metadata: Option<String>,
        /// Store the payload as a snapshot
        #[arg(long)]
        snapshot: bool,
    },
    /// Tombstone a stream
    Delete {
        /// Stream id
        stream: String,
    },
    /// Print a stream newest-first, one JSON record per line
    Read {
        /// Stream id
        stream: String,
        /// Stop after this many records
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Rewrite the data file without deleted records
    Compact,
    /// Show engine counters
    Stats,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    engine: EngineConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let config_str = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&config_str)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn parse_document(what: &str, json: &str) -> Result<Document> {
    match serde_json::from_str(json).with_context(|| format!("{what} is not valid JSON"))? {
        serde_json::Value::Object(doc) => Ok(doc),
        _ => bail!("{what} must be a JSON object"),
    }
}

/// Follow-up advice for engine errors the user can act on
fn recovery_hint(err: &anyhow::Error) -> Option<&'static str> {
    let err = err.downcast_ref::<quill_common::Error>()?;
    if err.is_corruption() {
        Some("the data file is damaged; a torn trailing record is truncated on open when engine.allow_recovery is true")
    } else if err.is_terminal_state() {
        Some("the store stopped accepting work; the log holds the first failure")
    } else {
        None
    }
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    run(args).inspect_err(|err| {
        if let Some(hint) = recovery_hint(err) {
            eprintln!("hint: {hint}");
        }
    })
}

fn run(args: Args) -> Result<()> {
    let config = load_config(&args.config)?;

    // Merge CLI args with config file (CLI takes precedence)
    let mut engine_config = config.engine;
    if let Some(data_dir) = args.data_dir {
        engine_config.data_dir = data_dir;
    }
    let log_level = if args.log_level == "warn" {
        config.logging.level
    } else {
        args.log_level
    };

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Data directory: {:?}", engine_config.data_dir);
    let engine = Engine::open(engine_config).context("failed to open event store")?;

    match args.command {
        Commands::Append {
            stream,
            payload,
            metadata,
            snapshot,
        } => {
            let payload = parse_document("payload", &payload)?;
            let metadata = match metadata {
                Some(json) => parse_document("metadata", &json)?,
                None => Document::new(),
            };
            let state = if snapshot {
                RecordState::Snapshot
            } else {
                RecordState::Event
            };
            engine.enqueue(&stream, state, metadata, payload)?.wait()?;
            println!("Appended {state} to {stream}");
        }
        Commands::Delete { stream } => {
            engine
                .enqueue(&stream, RecordState::Delete, Document::new(), Document::new())?
                .wait()?;
            println!("Deleted {stream}");
        }
        Commands::Read { stream, limit } => match engine.read(&stream)? {
            Some(reader) => {
                for record in reader.take(limit.unwrap_or(usize::MAX)) {
                    println!("{}", serde_json::to_string(&*record?)?);
                }
            }
            None => println!("Stream {stream} not found"),
        },
        Commands::Compact => {
            let before = engine.data_file()?;
            engine.compact()?;
            println!("Compacted {} into {}", before, engine.data_file()?);
        }
        Commands::Stats => {
            let cache = engine.cache_stats();
            println!("Engine Stats");
            println!("============");
            println!("Data file: {}", engine.data_file()?);
            println!("State: {}", engine.state());
            println!("Streams: {}", engine.stream_count());
            println!("Records: {}", engine.event_count());
            println!("Garbage: {}", engine.delete_count());
            println!(
                "Cache: {} strong, {} demoted",
                cache.strong_entries, cache.demoted_entries
            );
            println!("Cache hit ratio: {:.1}%", cache.hit_ratio() * 100.0);
        }
    }

    engine.dispose()?;
    Ok(())
}
