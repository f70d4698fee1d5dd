//! `tubelens config` subcommands.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Subcommand;

use tubelens_config::{
    apply_all_defaults, load_and_prepare, load_config, redact, resolve_env_vars, validate,
    write_config, TubeLensConfig,
};

use crate::terminal_output::{note_error, note_info, note_success, note_warn};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective config with secrets masked
    Show,
    /// Write a config file populated with defaults
    Init {
        /// Overwrite an existing file (the old one is kept as a backup)
        #[arg(long)]
        force: bool,
    },
    /// Check the config file and report every problem found
    Validate,
    /// Print the config file location
    Path,
}

pub async fn run(cmd: ConfigCommands, path: &Path) -> Result<()> {
    match cmd {
        ConfigCommands::Show => {
            let config = load_and_prepare(path).await?;
            let value = serde_json::to_value(&config).context("Failed to serialize config")?;
            print!("{}", serde_yaml::to_string(&redact(&value))?);
        }
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                bail!(
                    "{} already exists; pass --force to overwrite it",
                    path.display()
                );
            }
            write_config(&apply_all_defaults(TubeLensConfig::default()), path).await?;
            note_success(&format!("Wrote {}", path.display()));
        }
        ConfigCommands::Validate => {
            if !path.exists() {
                note_info(&format!("{} does not exist; defaults apply", path.display()));
            }
            let raw = load_config(path).await?;
            let value = serde_json::to_value(&raw)?;
            let resolved = resolve_env_vars(&value)?;
            let config: TubeLensConfig = serde_json::from_value(resolved)?;
            let report = validate(&apply_all_defaults(config));

            for warning in &report.warnings {
                note_warn(&format!("{}: {}", warning.path, warning.message));
            }
            for error in &report.errors {
                note_error(&format!("{}: {}", error.path, error.message));
            }
            if !report.is_valid() {
                bail!("{} config error(s) found", report.errors.len());
            }
            note_success("Config is valid");
        }
        ConfigCommands::Path => println!("{}", path.display()),
    }
    Ok(())
}
