//! The `wikitransp config` command.

use std::fmt::Write as _;
use std::path::Path;

use clap::{Args, Subcommand};
use wikitransp_core::{BanList, BanPolicy, BanStatus, Config};

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration and the files it points at
    Show,

    /// Print the config file path
    Path {
        /// Print the resolved ban list path instead
        #[arg(long)]
        bans: bool,
    },

    /// Write a default config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

pub async fn execute(args: ConfigArgs, config: Config) -> anyhow::Result<()> {
    match args.command {
        ConfigCommand::Show => {
            print!("{}", config.to_toml()?);
            print!("{}", resolved_paths(&config, &Config::default_path()));
        }

        ConfigCommand::Path { bans } => {
            let path = if bans {
                config.ban_list_path()
            } else {
                Config::default_path()
            };
            println!("{}", path.display());
        }

        ConfigCommand::Init { force } => {
            let path = Config::default_path();
            if path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists at: {}\nUse --force to overwrite.",
                    path.display()
                );
            }
            Config::write_default(&path)?;
            tracing::info!(path = %path.display(), "Wrote default config");
            println!("Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

/// Trailing TOML comments naming the files a scan would touch.
fn resolved_paths(config: &Config, config_path: &Path) -> String {
    let bans_path = config.ban_list_path();
    let mut out = String::from("\n");
    let origin = if config_path.exists() { "" } else { " (absent, defaults in use)" };
    let _ = writeln!(out, "# config file: {}{origin}", config_path.display());

    let _ = write!(out, "# ban list:    {}", bans_path.display());
    if !bans_path.exists() {
        out.push_str(" (not created yet)\n");
        return out;
    }
    match BanList::load(&bans_path, BanPolicy::from(&config.bans)) {
        Ok(bans) => {
            let entries = bans.entries();
            let suggested = entries.iter().filter(|e| e.status == BanStatus::Suggested).count();
            let _ = writeln!(
                out,
                " ({} confirmed, {suggested} awaiting review)",
                entries.len() - suggested
            );
        }
        Err(err) => {
            let _ = writeln!(out, " (unreadable: {err})");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_resolved_paths_before_first_run() {
        let mut config = Config::default();
        config.bans.path = PathBuf::from("/nonexistent/wikitransp/bans.jsonl");
        let text = resolved_paths(&config, Path::new("/nonexistent/wikitransp/config.toml"));

        assert!(text.contains("# config file: /nonexistent/wikitransp/config.toml (absent"));
        assert!(text.contains("# ban list:    /nonexistent/wikitransp/bans.jsonl (not created yet)"));
        assert!(text.lines().skip(1).all(|l| l.starts_with('#')));
    }
}
