//! Configuration view and validation for `worldgen config`.

use anyhow::Result;
use worldgen::config::Settings;

use crate::ConfigCommands;

pub fn cmd_config(settings: &Settings, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!("# Effective worldgen configuration (file + env + CLI)");
            println!();
            print!("{}", settings.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let warnings = settings.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
                anyhow::bail!("{} configuration warning(s)", warnings.len());
            }
        }
    }
    Ok(())
}
