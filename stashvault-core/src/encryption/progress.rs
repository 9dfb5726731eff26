//! Per-rotation progress mailboxes
//!
//! The rotation engine publishes snapshots without knowing whether anyone
//! listens. A mailbox exists only while a stream is open for that rotation;
//! without one, snapshots are dropped.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::encryption::rotation_state::RotationProgress;
use crate::error::{VaultError, VaultResult};

/// What a progress stream delivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ProgressEvent {
    /// Sent once when the stream opens
    KeepAlive,
    Progress(RotationProgress),
}

/// Destination of a progress stream
#[async_trait]
pub trait ProgressSink: Send {
    async fn send(&mut self, event: ProgressEvent) -> VaultResult<()>;
}

/// Sink that forwards into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ProgressSink for ChannelSink {
    async fn send(&mut self, event: ProgressEvent) -> VaultResult<()> {
        self.tx.send(event).map_err(|_| VaultError::ObserverClosed)
    }
}

struct Mailbox {
    /// None once a terminal snapshot was written
    sender: Option<mpsc::UnboundedSender<RotationProgress>>,
    /// Taken by the single stream consuming this mailbox
    receiver: Option<mpsc::UnboundedReceiver<RotationProgress>>,
}

impl Mailbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: Some(tx),
            receiver: Some(rx),
        }
    }
}

type Mailboxes = Arc<DashMap<Uuid, Mailbox>>;

/// Progress notifier
#[derive(Clone, Default)]
pub struct ProgressNotifier {
    mailboxes: Mailboxes,
}

impl ProgressNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a snapshot if someone is listening; close the mailbox after a terminal one
    pub fn notify_progress(&self, rotation_id: Uuid, snapshot: RotationProgress) {
        let terminal = snapshot.status.is_terminal();

        if let Some(mut mailbox) = self.mailboxes.get_mut(&rotation_id) {
            if let Some(sender) = &mailbox.sender {
                // receiver dropped means the stream is already gone
                let _ = sender.send(snapshot);
            }
            if terminal {
                mailbox.sender = None;
            }
        }
    }

    /// Claim the mailbox for `rotation_id`, creating it if needed.
    ///
    /// Snapshots published after this call are buffered for the returned
    /// subscription. The mailbox is removed when the subscription drops.
    pub fn subscribe(&self, rotation_id: Uuid) -> VaultResult<ProgressSubscription> {
        let receiver = {
            let mut mailbox = self.mailboxes.entry(rotation_id).or_insert_with(Mailbox::new);
            mailbox.receiver.take()
        };

        let receiver = receiver.ok_or_else(|| {
            VaultError::invalid_state(format!(
                "a progress stream is already open for rotation {}",
                rotation_id
            ))
        })?;

        Ok(ProgressSubscription {
            rotation_id,
            receiver,
            mailboxes: self.mailboxes.clone(),
        })
    }

    /// Forward snapshots for `rotation_id` to `sink` until the rotation
    /// finishes or `cancel` fires
    pub async fn stream_progress(
        &self,
        rotation_id: Uuid,
        sink: &mut dyn ProgressSink,
        cancel: CancellationToken,
    ) -> VaultResult<()> {
        self.subscribe(rotation_id)?.forward(sink, cancel).await
    }

    pub fn has_mailbox(&self, rotation_id: Uuid) -> bool {
        self.mailboxes.contains_key(&rotation_id)
    }

    pub fn mailbox_count(&self) -> usize {
        self.mailboxes.len()
    }
}

/// An open claim on one rotation's mailbox
pub struct ProgressSubscription {
    rotation_id: Uuid,
    receiver: mpsc::UnboundedReceiver<RotationProgress>,
    mailboxes: Mailboxes,
}

impl ProgressSubscription {
    pub fn rotation_id(&self) -> Uuid {
        self.rotation_id
    }

    /// Write a keep-alive, then relay snapshots until the mailbox closes or `cancel` fires
    pub async fn forward(
        mut self,
        sink: &mut dyn ProgressSink,
        cancel: CancellationToken,
    ) -> VaultResult<()> {
        sink.send(ProgressEvent::KeepAlive).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(rotation_id = %self.rotation_id, "Progress stream cancelled");
                    return Ok(());
                }
                next = self.receiver.recv() => match next {
                    Some(snapshot) => sink.send(ProgressEvent::Progress(snapshot)).await?,
                    None => return Ok(()),
                },
            }
        }
    }
}

impl Drop for ProgressSubscription {
    fn drop(&mut self) {
        self.mailboxes.remove(&self.rotation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::rotation_state::RotationStatus;
    use chrono::Utc;

    fn snapshot(id: Uuid, status: RotationStatus, processed: u64) -> RotationProgress {
        RotationProgress {
            rotation_id: id,
            status,
            total_images: 4,
            processed_images: processed,
            failed_images: 0,
            percent_complete: RotationProgress::percent(processed, 4),
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
        }
    }

    #[test]
    fn test_notify_without_listener_is_dropped() {
        let notifier = ProgressNotifier::new();
        let id = Uuid::new_v4();
        notifier.notify_progress(id, snapshot(id, RotationStatus::InProgress, 1));
        assert!(!notifier.has_mailbox(id));
    }

    #[tokio::test]
    async fn test_stream_ends_after_terminal_snapshot() {
        let notifier = ProgressNotifier::new();
        let id = Uuid::new_v4();
        let subscription = notifier.subscribe(id).unwrap();

        notifier.notify_progress(id, snapshot(id, RotationStatus::InProgress, 2));
        notifier.notify_progress(id, snapshot(id, RotationStatus::Completed, 4));
        // closed: ignored
        notifier.notify_progress(id, snapshot(id, RotationStatus::InProgress, 9));

        let (mut sink, mut events) = ChannelSink::new();
        subscription
            .forward(&mut sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(events.recv().await, Some(ProgressEvent::KeepAlive));
        match events.recv().await {
            Some(ProgressEvent::Progress(p)) => assert_eq!(p.processed_images, 2),
            other => panic!("unexpected event: {:?}", other),
        }
        match events.recv().await {
            Some(ProgressEvent::Progress(p)) => assert_eq!(p.status, RotationStatus::Completed),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(events.try_recv().is_err());
        assert!(!notifier.has_mailbox(id));
    }

    #[tokio::test]
    async fn test_cancel_removes_mailbox() {
        let notifier = ProgressNotifier::new();
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let streamer = {
            let notifier = notifier.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let (mut sink, _events) = ChannelSink::new();
                notifier.stream_progress(id, &mut sink, cancel).await
            })
        };

        while !notifier.has_mailbox(id) {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        streamer.await.unwrap().unwrap();
        assert_eq!(notifier.mailbox_count(), 0);
    }

    #[tokio::test]
    async fn test_second_stream_is_rejected() {
        let notifier = ProgressNotifier::new();
        let id = Uuid::new_v4();
        let _first = notifier.subscribe(id).unwrap();

        let err = notifier.subscribe(id).err().unwrap();
        assert!(err.is_invalid_state());
    }

    #[tokio::test]
    async fn test_sink_failure_still_removes_mailbox() {
        let notifier = ProgressNotifier::new();
        let id = Uuid::new_v4();
        let (mut sink, events) = ChannelSink::new();
        drop(events);

        let err = notifier
            .stream_progress(id, &mut sink, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::ObserverClosed));
        assert!(!notifier.has_mailbox(id));
    }
}
