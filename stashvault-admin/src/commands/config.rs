use anyhow::{anyhow, Result};
use clap::Subcommand;
use stashvault_core::{ConfigManager, VaultConfig};
use std::path::{Path, PathBuf};

use crate::config;

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Validate the configuration file
    Validate,
    /// Show the configuration file and data paths
    Path,
    /// Change one setting, e.g. `rotation.default_batch_size 50`
    Set {
        /// Setting as section.field
        key: String,
        /// New value in TOML syntax; bare words are strings
        value: String,
    },
}

pub async fn execute_config_command(
    path: &Path,
    data_dir: Option<PathBuf>,
    command: ConfigCommands,
) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = config::load(path, data_dir, false)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }

        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                return Err(anyhow!(
                    "{} already exists; pass --force to overwrite it",
                    path.display()
                ));
            }

            let mut config = VaultConfig::default();
            if let Some(data_dir) = data_dir {
                config.storage.data_dir = data_dir;
            }
            config.save(path)?;
            println!("✓ Wrote default configuration to {}", path.display());
        }

        ConfigCommands::Validate => {
            println!("Validating {}...", path.display());
            if !path.exists() {
                println!("✗ File not found; defaults would be used");
                return Ok(());
            }

            match VaultConfig::load(path) {
                Ok(_) => println!("✓ Configuration is valid"),
                Err(e) => {
                    println!("✗ Configuration has errors:");
                    for cause in e.chain() {
                        println!("  - {}", cause);
                    }
                    return Err(anyhow!("invalid configuration"));
                }
            }
        }

        ConfigCommands::Path => {
            let config = config::load(path, data_dir, false)?;
            println!("Configuration file: {}", path.display());
            println!("Catalog:            {}", config.storage.catalog_path().display());
            println!("Images:             {}", config.storage.image_root().display());
        }

        ConfigCommands::Set { key, value } => {
            let manager = ConfigManager::new(path.to_path_buf())?;
            let restart_required = manager
                .update_config(&key, |config| config.set_value(&key, &value))
                .await?;

            println!("✓ Set {} = {} in {}", key, value, manager.path().display());
            if restart_required {
                println!("  Vaults already open apply it after reopening");
            }
        }
    }

    Ok(())
}
