//! The `wikitransp bans` command for reviewing the ban list.

use clap::{Args, Subcommand};
use std::path::PathBuf;
use wikitransp_core::banlist::builtin_entries;
use wikitransp_core::{BanList, BanPolicy, BanStatus, Config};

/// Arguments for the `bans` command.
#[derive(Args, Debug)]
pub struct BansArgs {
    /// Ban list file (defaults to the configured path)
    #[arg(long, global = true)]
    pub ban_list: Option<PathBuf>,

    #[command(subcommand)]
    pub command: BansCommand,
}

/// Subcommands for ban list review.
#[derive(Subcommand, Debug)]
pub enum BansCommand {
    /// List entries awaiting review
    List {
        /// Include confirmed entries
        #[arg(long)]
        all: bool,
    },

    /// Confirm suggested entries so later scans skip them
    Confirm {
        /// Exact pattern to confirm
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        pattern: Option<String>,

        /// Confirm every suggested entry
        #[arg(long)]
        all: bool,
    },

    /// Add the built-in list of known-404 Wikimedia Commons files
    Seed,
}

/// Execute the bans command.
pub async fn execute(args: BansArgs, config: Config) -> anyhow::Result<()> {
    let path = match args.ban_list {
        Some(path) => path,
        None => config.ban_list_path(),
    };
    let bans = BanList::load(&path, BanPolicy::from(&config.bans))?;

    match args.command {
        BansCommand::List { all } => {
            let entries: Vec<_> = bans
                .entries()
                .into_iter()
                .filter(|e| all || e.status == BanStatus::Suggested)
                .collect();
            if entries.is_empty() {
                eprintln!("No {} entries in {}", if all { "ban" } else { "suggested" }, path.display());
            }
            for entry in entries {
                let status = match entry.status {
                    BanStatus::Confirmed => "confirmed",
                    BanStatus::Suggested => "suggested",
                };
                println!(
                    "{status}\t{}\t{}\t{}",
                    entry.reason,
                    entry.timestamp.to_rfc3339(),
                    entry.pattern
                );
            }
        }

        BansCommand::Confirm { pattern, all } => {
            let confirmed = bans.confirm(if all { None } else { pattern.as_deref() });
            if confirmed == 0 {
                anyhow::bail!("No matching suggested entries in {}", path.display());
            }
            bans.save(&path)?;
            tracing::info!(confirmed, path = %path.display(), "Confirmed ban entries");
            println!("Confirmed {confirmed} entr{}", if confirmed == 1 { "y" } else { "ies" });
        }

        BansCommand::Seed => {
            let added = builtin_entries()
                .into_iter()
                .filter(|entry| bans.insert(entry.clone()))
                .count();
            bans.save(&path)?;
            println!("Added {added} built-in entries to {}", path.display());
        }
    }

    Ok(())
}
