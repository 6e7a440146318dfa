//! agent-memory CLI entry point.

use agent_memory::config::Config;
use agent_memory::memory::{MemoryStore, Metadata, build_embedder};
use agent_memory::tools::{MemoryKind, SaveInput, format_memories, memory_recall, memory_save};
use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "agent-memory")]
#[command(about = "Persistent similarity-search memory for a stateful agent")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a new memory
    Remember {
        text: String,
        /// Extra metadata as key=value; values that parse as JSON are kept typed
        #[arg(short, long = "meta", value_parser = parse_key_value)]
        meta: Vec<(String, serde_json::Value)>,
    },
    /// Show the memories closest to a query
    Recall {
        query: String,
        /// Number of results (defaults to memory.default_k)
        #[arg(short)]
        k: Option<usize>,
    },
    /// Print a single memory
    Show { id: u64 },
    /// List memories, most recent first
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Print store statistics
    Stats,
    /// Rebuild the vector index from the record log and save it
    RebuildIndex,
}

fn parse_key_value(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    if key.is_empty() {
        return Err("metadata key must not be empty".into());
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        Config::load().with_context(|| "failed to load configuration from environment")?
    };

    std::fs::create_dir_all(config.log_dir())
        .with_context(|| format!("failed to create log directory {}", config.log_dir().display()))?;
    let _log_guard = agent_memory::logging::init_tracing(
        &config.log_dir(),
        &format!("{}.log", config.store_name),
        cli.debug,
    );

    tracing::debug!(data_dir = %config.data_dir.display(), "configuration loaded");

    let store = open_store(&config).await?;

    match cli.command {
        Command::Remember { text, meta } => {
            store.require_persistent()?;
            let mut input = SaveInput::new(text, MemoryKind::Note);
            input.metadata = meta.into_iter().collect::<Metadata>();
            let record = memory_save(&store, input).await?;
            store.save().await?;
            println!("{}", record.id);
        }
        Command::Recall { query, k } => {
            let k = k.unwrap_or(config.memory.default_k);
            let recalled = memory_recall(&store, &query, k).await?;
            print!("{}", format_memories(&recalled));
        }
        Command::Show { id } => {
            let record = store.get(id).await?;
            let view = serde_json::json!({
                "id": record.id,
                "text": record.text,
                "metadata": record.metadata,
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::List { limit } => {
            let records = store.records().await;
            for record in records.iter().rev().take(limit) {
                let first_line = record.text.lines().next().unwrap_or_default();
                println!("{:>6}  {:<14} {}", record.id, record.kind().unwrap_or("-"), first_line);
            }
        }
        Command::Stats => {
            println!("records:   {}", store.len().await);
            println!("model:     {}", store.model());
            match store.paths() {
                Some(paths) => {
                    println!("log:       {}", paths.log.display());
                    println!("snapshot:  {}", paths.snapshot.display());
                }
                None => println!("storage:   in-memory (degraded)"),
            }
        }
        Command::RebuildIndex => {
            store.require_persistent()?;
            store.rebuild_index().await?;
            store.save().await?;
            println!("rebuilt index over {} records", store.len().await);
        }
    }

    Ok(())
}

/// Open the configured store, applying the load-failure policy.
async fn open_store(config: &Config) -> anyhow::Result<Arc<MemoryStore>> {
    let embedder = build_embedder(&config.embedding)?;
    let store = MemoryStore::open_with_policy(config.store_paths(), embedder, config.memory.on_load_failure)
        .await
        .context("failed to load memory store")?;
    Ok(store)
}
