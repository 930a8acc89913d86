//! Tabsync CLI
//!
//! Drive one or more contexts against a shared store and compare what their
//! live views show with what the store holds.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tabsync_core::{ChannelNaming, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tabsync", version, about = "Cross-context change notification harness")]
struct Cli {
    /// Shared store file
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Config file (.toml or .json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Channel naming strategy: schema_derived or session_random
    #[arg(long, global = true)]
    naming: Option<ChannelNaming>,
    /// Fixed id for this context
    #[arg(long, global = true)]
    tab_id: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Insert one item
    Add {
        /// Item name; defaults to "Item <count+1>"
        #[arg(long)]
        name: Option<String>,
    },
    /// Print items straight from the store
    Query,
    /// Keep a live view open and report updates
    Watch {
        /// Stop after this many seconds; runs until Ctrl-C when absent
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Run two contexts in this process and compare their views
    Repro {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Trim the change journal to the configured retention
    Prune,
}

impl Cli {
    fn resolve_config(&self) -> Result<SyncConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => SyncConfig::load(path)?,
            None => SyncConfig::new(),
        };
        if let Some(db) = &self.db {
            config.store.path = db.clone();
        }
        if let Some(naming) = self.naming {
            config.bus.naming = naming;
        }
        if let Some(tab_id) = &self.tab_id {
            config.tab_id = Some(tab_id.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.resolve_config()?;

    match cli.command {
        Command::Add { name } => commands::add(&config, name),
        Command::Query => commands::query(&config),
        Command::Watch { seconds } => commands::watch(&config, seconds).await,
        Command::Repro { json } => {
            let report = commands::repro(&config, cli.db.is_some())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                report.print();
            }
            if report.diverged {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Prune => commands::prune(&config),
    }
}
