use anyhow::{anyhow, Result};
use async_trait::async_trait;
use clap::Subcommand;
use stashvault_core::{
    EncryptionKeyRotation, ProgressEvent, ProgressSink, RotationProgress, RotationStatus,
    StartRotation, Vault, VaultResult,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Subcommand)]
pub enum RotationCommands {
    /// Start a rotation. Without --from, encrypts every unencrypted image.
    Start {
        /// Target key id
        #[arg(long)]
        to: i64,
        /// Source key id
        #[arg(long)]
        from: Option<i64>,
        /// Images per batch
        #[arg(long)]
        batch_size: Option<usize>,
        /// Print every progress update
        #[arg(long)]
        watch: bool,
    },
    /// List rotations, newest first
    List {
        /// Only rotations in this status (in-progress, completed, failed, cancelled)
        #[arg(long)]
        status: Option<RotationStatus>,
    },
    /// Show one rotation
    Status {
        id: Uuid,
        /// Print the progress snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Cancel an in-progress rotation
    Cancel { id: Uuid },
    /// Run rotations left in progress by an earlier run
    Resume {
        /// Print every progress update
        #[arg(long)]
        watch: bool,
    },
}

pub async fn execute_rotation_command(
    vault: &Vault,
    operator: &str,
    command: RotationCommands,
) -> Result<()> {
    match command {
        RotationCommands::Start {
            to,
            from,
            batch_size,
            watch,
        } => {
            let mut request = match from {
                Some(from) => StartRotation::rotation(from, to, operator),
                None => StartRotation::migration(to, operator),
            };
            request.batch_size = batch_size;

            let rotation = vault.rotations().start_rotation(request).await?;
            println!(
                "✓ Rotation {} started: {} images to key {}",
                rotation.id, rotation.total_images, rotation.to_key_id
            );

            follow_rotation(vault, rotation.id, watch).await?;
        }

        RotationCommands::List { status } => {
            let rotations = vault.rotations().list_rotations(status);
            if rotations.is_empty() {
                println!("No rotations found");
                return Ok(());
            }

            println!(
                "{:<38} {:<12} {:<6} {:<6} {:<14} {:<20}",
                "ID", "STATUS", "FROM", "TO", "PROGRESS", "STARTED"
            );
            println!("{}", "-".repeat(100));
            for rotation in rotations {
                println!(
                    "{:<38} {:<12} {:<6} {:<6} {:<14} {:<20}",
                    rotation.id,
                    rotation.status.to_string(),
                    rotation
                        .from_key_id
                        .map_or_else(|| "-".to_string(), |kid| kid.to_string()),
                    rotation.to_key_id,
                    format!(
                        "{}/{} ({})",
                        rotation.processed_images, rotation.total_images, rotation.failed_images
                    ),
                    rotation.started_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }

        RotationCommands::Status { id, json } => {
            let rotation = vault
                .rotations()
                .get_rotation(id)
                .ok_or_else(|| anyhow!("rotation {} not found", id))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&rotation.progress())?);
            } else {
                print_rotation(&rotation);
            }
        }

        RotationCommands::Cancel { id } => {
            if vault.rotations().cancel_rotation(id)? {
                println!("✓ Rotation {} cancelled", id);
            } else {
                println!("Rotation {} is not in progress", id);
            }
        }

        RotationCommands::Resume { watch } => {
            let resumed = vault.rotations().resume_interrupted();
            if resumed.is_empty() {
                println!("No interrupted rotations");
                return Ok(());
            }

            println!("Resuming {} rotation(s)", resumed.len());
            for id in resumed {
                follow_rotation(vault, id, watch).await?;
            }
        }
    }

    Ok(())
}

/// Stream a rotation until it ends, cancelling it on Ctrl+C
pub(crate) async fn follow_rotation(vault: &Vault, id: Uuid, watch: bool) -> Result<()> {
    let rotations = vault.rotations();
    let mut sink = ConsoleSink { watch };

    {
        let stream = rotations.stream_progress(id, &mut sink, CancellationToken::new());
        tokio::pin!(stream);

        loop {
            tokio::select! {
                result = &mut stream => {
                    result?;
                    break;
                }
                _ = signal::ctrl_c() => {
                    println!("Cancelling rotation {}...", id);
                    rotations.cancel_rotation(id)?;
                }
            }
        }
    }

    rotations.wait(id).await?;

    let rotation = rotations
        .get_rotation(id)
        .ok_or_else(|| anyhow!("rotation {} not found", id))?;
    print_rotation(&rotation);

    if rotation.status == RotationStatus::Failed {
        return Err(anyhow!(
            "rotation {} failed: {}",
            id,
            rotation.error_message.as_deref().unwrap_or("unknown error")
        ));
    }
    Ok(())
}

/// Writes progress snapshots to stdout
struct ConsoleSink {
    watch: bool,
}

#[async_trait]
impl ProgressSink for ConsoleSink {
    async fn send(&mut self, event: ProgressEvent) -> VaultResult<()> {
        if let ProgressEvent::Progress(progress) = event {
            if self.watch {
                println!("{}", progress_line(&progress));
            }
        }
        Ok(())
    }
}

fn progress_line(progress: &RotationProgress) -> String {
    format!(
        "[{:>6.2}%] {}/{} processed, {} failed ({})",
        progress.percent_complete,
        progress.processed_images,
        progress.total_images,
        progress.failed_images,
        progress.status
    )
}

fn print_rotation(rotation: &EncryptionKeyRotation) {
    let progress = rotation.progress();

    println!("\nRotation {}", rotation.id);
    println!("{}", "=".repeat(50));
    println!("Status:       {}", rotation.status);
    match rotation.from_key_id {
        Some(from) => println!("Keys:         {} -> {}", from, rotation.to_key_id),
        None => println!("Keys:         unencrypted -> {}", rotation.to_key_id),
    }
    println!(
        "Progress:     {}/{} ({:.2}%)",
        rotation.processed_images, rotation.total_images, progress.percent_complete
    );
    println!("Failed:       {}", rotation.failed_images);
    println!("Batch size:   {}", rotation.batch_size);
    println!(
        "Initiated by: {}{}",
        rotation.initiated_by,
        if rotation.is_automatic { " (automatic)" } else { "" }
    );
    println!("Started:      {}", rotation.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(completed) = rotation.completed_at {
        println!("Completed:    {}", completed.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(message) = &rotation.error_message {
        println!("Error:        {}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_progress_line() {
        let progress = RotationProgress {
            rotation_id: Uuid::nil(),
            status: RotationStatus::InProgress,
            total_images: 8,
            processed_images: 2,
            failed_images: 1,
            percent_complete: 25.0,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
        };

        assert_eq!(
            progress_line(&progress),
            format!("[ 25.00%] 2/8 processed, 1 failed ({})", RotationStatus::InProgress)
        );
    }
}
