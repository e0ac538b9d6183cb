use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ASSISTANT_PARTICIPANT_ID, ChannelId, MessageId, ParticipantId};
pub use memory::MemoryLog;
pub use sqlite::SqliteLog;
pub use types::{LogEvent, MessageRecord, NewMessage, current_unix_millis, sort_by_server_time};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Append-only, per-channel ordered log with live snapshot fan-out.
pub trait MessageLog: Send + Sync {
    /// Appends one record; the log assigns the id and the server timestamp.
    fn append<'a>(
        &'a self,
        channel_id: &'a ChannelId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageId>>;

    /// Opens a live query over the channel ordered by server time ascending.
    ///
    /// Every delivered [`LogEvent::Snapshot`] carries the complete record set, never a diff.
    fn subscribe_ordered(&self, channel_id: &ChannelId) -> StorageResult<LogSubscription>;
}

/// Receiving half of one live query. Dropping it cancels the query.
pub struct LogSubscription {
    channel_id: ChannelId,
    events: mpsc::UnboundedReceiver<LogEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl LogSubscription {
    pub(crate) fn new(
        channel_id: ChannelId,
        events: mpsc::UnboundedReceiver<LogEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            channel_id,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub async fn recv(&mut self) -> Option<LogEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LogEvent> {
        self.events.try_recv().ok()
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub(crate) fn make_subscription(
    channel_id: ChannelId,
) -> (
    mpsc::UnboundedSender<LogEvent>,
    LogSubscription,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        LogSubscription::new(channel_id, event_rx, cancel_tx),
        cancel_rx,
    )
}
