use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

mod commands;
mod config;

use commands::*;
use stashvault_core::{init_logging, Vault, VaultConfig};

#[derive(Parser)]
#[command(name = "stashvault-admin")]
#[command(about = "StashVault image encryption administration tool")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "STASHVAULT_CONFIG", default_value = "stashvault.toml")]
    config: PathBuf,

    /// Data directory, overriding the configuration file
    #[arg(short, long, env = "STASHVAULT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Name recorded as the initiator of keys and rotations
    #[arg(long, env = "STASHVAULT_OPERATOR", default_value = "admin")]
    operator: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encryption key management
    Key {
        #[command(subcommand)]
        action: KeyCommands,
    },
    /// Stored image commands
    Image {
        #[command(subcommand)]
        action: ImageCommands,
    },
    /// Key rotation commands
    Rotation {
        #[command(subcommand)]
        action: RotationCommands,
    },
    /// Configuration file commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config commands must work on a file that does not parse yet
    let command = match cli.command {
        Commands::Config { action } => {
            return execute_config_command(&cli.config, cli.data_dir, action).await;
        }
        command => command,
    };

    let mut config = config::load(&cli.config, cli.data_dir.clone(), cli.verbose)?;
    init_logging(&config.logging)?;

    // Only an explicit `rotation resume` picks up interrupted rotations
    config.rotation.resume_on_startup = false;

    let vault = open_vault(config).await?;

    let result = match command {
        Commands::Key { action } => execute_key_command(&vault, &cli.operator, action).await,
        Commands::Image { action } => execute_image_command(&vault, action).await,
        Commands::Rotation { action } => {
            execute_rotation_command(&vault, &cli.operator, action).await
        }
        Commands::Config { action } => {
            execute_config_command(&cli.config, cli.data_dir, action).await
        }
    };

    vault.close().await;

    match result {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {}", e);
            Err(e)
        }
    }
}

async fn open_vault(config: VaultConfig) -> Result<Vault> {
    info!(
        data_dir = %config.storage.data_dir.display(),
        "StashVault admin v{} starting",
        env!("CARGO_PKG_VERSION")
    );
    Vault::open(config).await
}
