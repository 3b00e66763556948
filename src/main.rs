use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::info;

use hive::blackboard::MemoryEntry;
use hive::config::Config;
use hive::{Blackboard, BlackboardConfig, Result, WorkflowDefinition};

/// Hive - multi-agent task orchestration core
#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    HIVE_DEBUG=1     Enable debug logging (alternative to --debug)\n    HIVE_LOG=<filter> Full tracing filter directive")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.hive/hive.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Inspect a blackboard snapshot file
    Blackboard {
        #[command(subcommand)]
        action: BlackboardAction,
    },

    /// Validate a JSON workflow and print its execution layers
    Plan {
        /// Path to the workflow definition
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Write the default configuration to ~/.hive/hive.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum BlackboardAction {
    /// List every key with its version and author
    List {
        /// Snapshot file (defaults to the configured one)
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Print one entry
    Get {
        key: String,
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Remove every entry
    Clear {
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    hive::log::init_with_debug(cli.debug);
    info!(debug = cli.debug, "hive starting");

    match cli.command {
        Command::Config { action } => run_config(action),
        Command::Blackboard { action } => run_blackboard(action),
        Command::Plan { file } => run_plan(&file),
    }
}

fn run_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = Config::load()?;
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Init { force } => {
            let path = Config::config_path()?;
            if path.exists() && !force {
                println!("Config already exists at {} (use --force to overwrite)", path.display());
                return Ok(());
            }
            Config::default().save()?;
            println!("Wrote default config to {}", path.display());
        }
    }
    Ok(())
}

/// The snapshot to operate on: `--path`, else the configured one, else the
/// default location.
fn snapshot_path(path: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = path {
        return Ok(path);
    }
    let config = Config::load()?;
    match config.blackboard_config()?.persistence_path {
        Some(path) => Ok(path),
        None => Config::default_blackboard_path(),
    }
}

/// Entries sorted by key; empty when the file does not exist.
fn load_entries(path: &Path) -> Result<Vec<(String, MemoryEntry)>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    Ok(Blackboard::load_snapshot(path)?.into_iter().collect())
}

fn run_blackboard(action: BlackboardAction) -> Result<()> {
    match action {
        BlackboardAction::List { path } => {
            let path = snapshot_path(path)?;
            let entries = load_entries(&path)?;
            if entries.is_empty() {
                println!("No entries in {}", path.display());
                return Ok(());
            }
            for (key, entry) in entries {
                println!(
                    "{:<40} v{:<4} {:<16} {}",
                    key,
                    entry.version,
                    entry.author,
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        BlackboardAction::Get { key, path } => {
            let path = snapshot_path(path)?;
            match load_entries(&path)?.into_iter().find(|(k, _)| *k == key) {
                Some((_, entry)) => println!("{}", serde_json::to_string_pretty(&entry)?),
                None => println!("No entry for '{}' in {}", key, path.display()),
            }
        }
        BlackboardAction::Clear { path } => {
            let path = snapshot_path(path)?;
            let board = Blackboard::open(BlackboardConfig::persistent(&path));
            let removed = board.len();
            board.clear();
            println!("Cleared {} entries from {}", removed, path.display());
        }
    }
    Ok(())
}

fn run_plan(file: &Path) -> Result<()> {
    let workflow = WorkflowDefinition::load(file)?;
    let layers = workflow.execution_layers()?;

    println!("Workflow: {}", workflow.name);
    if !workflow.description.is_empty() {
        println!("{}", workflow.description);
    }
    println!("{} steps in {} layers", workflow.steps.len(), layers.len());
    for (i, layer) in layers.iter().enumerate() {
        println!("  {}: {}", i + 1, layer.join(", "));
    }
    Ok(())
}
