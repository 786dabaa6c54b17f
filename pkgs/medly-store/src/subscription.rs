//! Live subscriptions: cancellable streams of full snapshots
//!
//! Each subscription owns a background task. The task loads the current
//! matching set once, then reloads and pushes it again whenever the change
//! feed reports a relevant write. Pushes are whole snapshots, never diffs.
//! Load failures are logged and skipped; the stream stays open and the
//! consumer keeps its last good snapshot.

use crate::change_feed::{ChangeFeed, StoreChange};
use crate::error::DmResult;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Something a subscription can (re)load a snapshot from
#[async_trait]
pub(crate) trait SnapshotSource: Send + Sync + 'static {
    type Snapshot: Send + 'static;

    /// Human readable selector, used in logs
    fn describe(&self) -> String;

    async fn load(&self) -> DmResult<Self::Snapshot>;

    /// Whether `change` can affect the snapshot
    fn is_relevant(&self, change: &StoreChange) -> bool;

    /// Called with every snapshot that is about to be pushed
    fn observe(&mut self, _snapshot: &Self::Snapshot) {}
}

/// A single-consumer stream of snapshots.
///
/// Dropping the subscription stops the background task; [`Subscription::cancel`]
/// additionally waits for it to finish.
pub struct Subscription<T> {
    receiver: mpsc::Receiver<T>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Subscription<T> {
    pub(crate) fn spawn<S>(source: S, feed: &ChangeFeed, buffer: usize) -> Self
    where
        S: SnapshotSource<Snapshot = T>,
    {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();
        // Listen before the first load so no write can slip in between
        let changes = feed.subscribe();
        let task = tokio::spawn(run(source, changes, sender, cancel.clone()));

        Self {
            receiver,
            cancel,
            task: Some(task),
        }
    }
}

impl<T> Subscription<T> {
    /// Wait for the next snapshot; `None` once the subscription has ended
    pub async fn next_snapshot(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Stop the subscription and wait until its task has exited.
    ///
    /// No snapshot is produced after this returns.
    pub async fn cancel(mut self) {
        self.cancel.cancel();
        self.receiver.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Subscription task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run<S: SnapshotSource>(
    mut source: S,
    mut changes: tokio::sync::broadcast::Receiver<StoreChange>,
    sender: mpsc::Sender<S::Snapshot>,
    cancel: CancellationToken,
) {
    let selector = source.describe();
    debug!("Subscription started for {}", selector);

    if !push(&mut source, &sender, &cancel).await {
        debug!("Subscription for {} ended before first snapshot", selector);
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            change = changes.recv() => match change {
                Ok(change) => {
                    if !source.is_relevant(&change) {
                        continue;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    debug!("Subscription for {} missed {} changes, reloading", selector, missed);
                }
                Err(RecvError::Closed) => break,
            },
        }

        if !push(&mut source, &sender, &cancel).await {
            break;
        }
    }

    debug!("Subscription for {} stopped", selector);
}

/// Load and forward one snapshot. Returns false once the subscription is over.
async fn push<S: SnapshotSource>(
    source: &mut S,
    sender: &mpsc::Sender<S::Snapshot>,
    cancel: &CancellationToken,
) -> bool {
    let snapshot = tokio::select! {
        _ = cancel.cancelled() => return false,
        loaded = source.load() => loaded,
    };

    match snapshot {
        Ok(snapshot) => {
            source.observe(&snapshot);
            tokio::select! {
                _ = cancel.cancelled() => false,
                sent = sender.send(snapshot) => sent.is_ok(),
            }
        }
        Err(e) => {
            warn!("Failed to refresh {}, keeping last snapshot: {}", source.describe(), e);
            true
        }
    }
}
