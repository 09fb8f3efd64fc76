//! wikitransp CLI - find semi-transparent PNGs in the Wikipedia Image-Text dataset.
//!
//! Streams each candidate PNG just far enough to tell whether it has genuine
//! semi-transparency, and writes the accepted rows out as TSV or JSONL.
//!
//! # Usage
//!
//! ```bash
//! # Scan a WIT shard, writing accepted rows to a file
//! wikitransp scan wit_v1.train.all-00000-of-00010.tsv.gz --output transparent.tsv
//!
//! # Scan a reproducible 1% sample
//! wikitransp scan shard.tsv.gz --sample --sample-fraction 0.01
//!
//! # Review URLs suggested for the ban list
//! wikitransp bans list
//! wikitransp bans confirm --all
//!
//! # View configuration
//! wikitransp config show
//! ```

use clap::{Parser, Subcommand};

mod cli;
mod logging;

/// wikitransp - find semi-transparent PNGs in the WIT dataset.
#[derive(Parser, Debug)]
#[command(name = "wikitransp")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan WIT tables for semi-transparent PNGs
    Scan(cli::scan::ScanArgs),

    /// Review and manage the ban list
    Bans(cli::bans::BansArgs),

    /// View and manage configuration
    Config(cli::config::ConfigArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging isn't initialized yet, so use eprintln for config warnings.
    let config = match wikitransp_core::Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Warning: Failed to load config: {e}\n  \
                 Using default configuration. Check your config file with `wikitransp config path`."
            );
            wikitransp_core::Config::default()
        }
    };
    logging::init_from_config(&config, cli.verbose, cli.json_logs);

    tracing::debug!("wikitransp v{}", wikitransp_core::VERSION);

    match cli.command {
        Commands::Scan(args) => cli::scan::execute(args, config).await,
        Commands::Bans(args) => cli::bans::execute(args, config).await,
        Commands::Config(args) => cli::config::execute(args, config).await,
    }
}
