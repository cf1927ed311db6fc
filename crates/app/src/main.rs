//! memory_replay - drive the chat memory store from a JSON script
//!
//! Usage: memory_replay <script.json> [--settings <settings.json>] [--out <report.json>]
//!
//! Prints a JSON report with each step's result, the events the store
//! emitted and the final memory snapshot. `--out` also writes it to a file.

use anyhow::{Context, Result};
use chat_memory::{ChatMemoryStore, MemorySettings};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod script;

#[derive(Parser)]
#[command(name = "memory_replay")]
#[command(about = "Replay a script of chat memory operations", long_about = None)]
struct Args {
    /// JSON script of memory steps
    script: PathBuf,

    /// Settings file (defaults to the user config dir)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Also write the report to this file
    #[arg(long)]
    out: Option<PathBuf>,
}

fn config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("com.local", "Little Helper", "LittleHelper")
        .map(|proj| proj.config_dir().join("memory_settings.json"))
}

fn load_settings(explicit: Option<PathBuf>) -> Result<MemorySettings> {
    match explicit {
        Some(path) => MemorySettings::from_json_file(&path),
        None => match config_path() {
            Some(path) => MemorySettings::load_or_default(&path),
            None => Ok(MemorySettings::default()),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let settings = load_settings(args.settings)?;
    info!(
        debounce_ms = settings.debounce_ms,
        timer_scope = ?settings.timer_scope,
        "Loaded memory settings"
    );

    let steps = script::load_script(&args.script)?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let store = ChatMemoryStore::with_events(settings, tx);

    let report = script::replay(&store, &mut rx, steps).await;
    let json = serde_json::to_string_pretty(&report).context("serializing replay report")?;
    println!("{}", json);

    if let Some(path) = args.out {
        fs::write(&path, json).with_context(|| format!("writing report to {}", path.display()))?;
        info!(path = %path.display(), "Wrote replay report");
    }

    Ok(())
}
