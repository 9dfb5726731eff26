use anyhow::{anyhow, Result};
use clap::Subcommand;
use stashvault_core::{EncryptionKey, Vault};

use super::rotation::follow_rotation;

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Generate a new key in Created status
    Create {
        /// Free-form description
        #[arg(short, long, default_value = "")]
        description: String,
        /// Activate the key right away
        #[arg(long)]
        activate: bool,
    },
    /// Make a key the Active key, retiring the previous one
    Activate { kid: i64 },
    /// Retire a key; it keeps decrypting existing images
    Retire { kid: i64 },
    /// Deprecate a key; it keeps decrypting existing images
    Deprecate { kid: i64 },
    /// Delete a key no image or rotation depends on
    Delete { kid: i64 },
    /// List all keys
    List,
    /// Show the Active key
    Active,
    /// Show how many images a key protects
    Stats { kid: i64 },
}

pub async fn execute_key_command(vault: &Vault, operator: &str, command: KeyCommands) -> Result<()> {
    let keys = vault.keys();

    match command {
        KeyCommands::Create {
            description,
            activate,
        } => {
            let key = keys.create_key(&description, operator)?;
            println!("✓ Created key {} (version {})", key.kid, key.version);

            if activate {
                activate_key(vault, key.kid, operator).await?;
            }
        }

        KeyCommands::Activate { kid } => {
            activate_key(vault, kid, operator).await?;
        }

        KeyCommands::Retire { kid } => {
            if !keys.retire_key(kid)? {
                return Err(anyhow!("key {} not found", kid));
            }
            println!("✓ Key {} retired", kid);
        }

        KeyCommands::Deprecate { kid } => {
            if !keys.deprecate_key(kid)? {
                return Err(anyhow!("key {} not found", kid));
            }
            println!("✓ Key {} deprecated", kid);
        }

        KeyCommands::Delete { kid } => {
            if !keys.delete_key(kid)? {
                return Err(anyhow!("key {} not found", kid));
            }
            println!("✓ Key {} deleted", kid);
        }

        KeyCommands::List => {
            let all = keys.list_keys();
            if all.is_empty() {
                println!("No keys found");
                return Ok(());
            }

            println!(
                "{:<6} {:<8} {:<11} {:<20} {:<12} {}",
                "KID", "VERSION", "STATUS", "CREATED", "CREATED BY", "DESCRIPTION"
            );
            println!("{}", "-".repeat(80));
            for key in all {
                println!(
                    "{:<6} {:<8} {:<11} {:<20} {:<12} {}",
                    key.kid,
                    key.version,
                    key.status.to_string(),
                    key.created_at.format("%Y-%m-%d %H:%M:%S"),
                    key.created_by,
                    key.description
                );
            }
        }

        KeyCommands::Active => match keys.get_active_key() {
            Some(key) => print_key(&key),
            None => println!("No active key"),
        },

        KeyCommands::Stats { kid } => {
            let stats = keys.get_key_stats(kid)?;

            println!("\nKey {} Statistics", stats.kid);
            println!("{}", "=".repeat(40));
            println!("Version:      {}", stats.version);
            println!("Status:       {}", stats.status);
            println!("Images:       {}", stats.image_count);
            println!("Total Size:   {:.2} MB", stats.total_bytes as f64 / 1024.0 / 1024.0);
        }
    }

    Ok(())
}

async fn activate_key(vault: &Vault, kid: i64, operator: &str) -> Result<()> {
    let rotation = vault.rotations().activate_key_and_rotate(kid, operator).await?;
    println!("✓ Key {} is now active", kid);

    if let Some(rotation) = rotation {
        println!(
            "Automatic rotation {} started for {} images",
            rotation.id, rotation.total_images
        );
        follow_rotation(vault, rotation.id, false).await?;
    } else if vault.rotations().config().auto_rotate_on_activation {
        println!("No automatic rotation started");
    }

    Ok(())
}

fn print_key(key: &EncryptionKey) {
    println!("\nKey {}", key.kid);
    println!("{}", "=".repeat(40));
    println!("Version:      {}", key.version);
    println!("Algorithm:    {}", key.algorithm);
    println!("Status:       {}", key.status);
    println!("Created by:   {}", key.created_by);
    println!("Created:      {}", key.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(activated) = key.activated_at {
        println!("Activated:    {}", activated.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if !key.description.is_empty() {
        println!("Description:  {}", key.description);
    }
}
