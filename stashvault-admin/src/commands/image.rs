use anyhow::{anyhow, Context, Result};
use clap::Subcommand;
use stashvault_core::{ImageMetadata, Vault, VaultError};
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum ImageCommands {
    /// Store a local file in the vault
    Add {
        /// File to import
        file: PathBuf,
        /// Storage path inside the vault (defaults to the file name)
        #[arg(long)]
        path: Option<String>,
        /// MIME type (guessed from the extension if omitted)
        #[arg(long)]
        content_type: Option<String>,
        /// Encrypt with the Active key after storing
        #[arg(long)]
        encrypt: bool,
    },
    /// List stored images
    List {
        /// Only images that are not encrypted yet
        #[arg(long)]
        unencrypted: bool,
    },
    /// Show one image
    Show { id: i64 },
    /// Write an image's plaintext to a local file
    Export {
        id: i64,
        /// Output file
        output: PathBuf,
    },
}

pub async fn execute_image_command(vault: &Vault, command: ImageCommands) -> Result<()> {
    let images = vault.images();

    match command {
        ImageCommands::Add {
            file,
            path,
            content_type,
            encrypt,
        } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;

            let storage_path = match path {
                Some(path) => path,
                None => file
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("cannot derive a storage path from {}", file.display()))?,
            };
            let content_type = content_type.or_else(|| guess_content_type(&file).map(str::to_string));

            let mut image = images.register_image(&storage_path, &bytes, content_type).await?;
            println!("✓ Stored image {} at {}", image.image_id, image.storage_path);

            if encrypt {
                let key = vault.keys().get_active_key().ok_or(VaultError::NoActiveKey)?;
                image = images.encrypt_existing_image(&image, key.kid).await?;
                println!("✓ Encrypted image {} with key {}", image.image_id, key.kid);
            }
        }

        ImageCommands::List { unencrypted } => {
            let all: Vec<ImageMetadata> = images
                .list_images()
                .into_iter()
                .filter(|image| !unencrypted || !image.is_encrypted)
                .collect();
            if all.is_empty() {
                println!("No images found");
                return Ok(());
            }

            println!("{:<8} {:<10} {:<6} {:<12} {}", "ID", "ENCRYPTED", "KEY", "SIZE", "PATH");
            println!("{}", "-".repeat(70));
            for image in all {
                println!(
                    "{:<8} {:<10} {:<6} {:<12} {}",
                    image.image_id,
                    if image.is_encrypted { "yes" } else { "no" },
                    image
                        .encryption_key_id
                        .map_or_else(|| "-".to_string(), |kid| kid.to_string()),
                    format_size(image.size_in_bytes),
                    image.storage_path
                );
            }
        }

        ImageCommands::Show { id } => {
            let image = images
                .get_image(id)
                .ok_or(VaultError::ImageNotFound(id))?;

            println!("\nImage {}", image.image_id);
            println!("{}", "=".repeat(50));
            println!("Path:         {}", image.storage_path);
            println!("Content type: {}", image.content_type.as_deref().unwrap_or("-"));
            println!("Size:         {}", format_size(image.size_in_bytes));
            println!("Encrypted:    {}", image.is_encrypted);
            if let Some((kid, iv, tag)) = image.crypto_fields() {
                println!("Key:          {}", kid);
                println!("IV:           {}", hex_string(&iv));
                println!("Tag:          {}", hex_string(&tag));
            }
            println!("Uploaded:     {}", image.uploaded_at.format("%Y-%m-%d %H:%M:%S UTC"));
            println!("Updated:      {}", image.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
        }

        ImageCommands::Export { id, output } => {
            let image = images
                .get_image(id)
                .ok_or(VaultError::ImageNotFound(id))?;
            let plaintext = images.read_image(&image).await?;

            tokio::fs::write(&output, plaintext.as_slice())
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("✓ Exported image {} to {}", id, output.display());
        }
    }

    Ok(())
}

fn guess_content_type(file: &Path) -> Option<&'static str> {
    let extension = file.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "heic" => Some("image/heic"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / 1024.0 / 1024.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
