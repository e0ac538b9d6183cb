//! Process-local message log.
//!
//! Appends go through two visible phases, the way a latency-compensated remote log behaves:
//! the record is first published without a server timestamp, then re-published once the
//! timestamp is assigned.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};

use super::error::{LogUnavailableSnafu, StorageResult};
use super::ids::{ChannelId, MessageId};
use super::types::{
    LogEvent, MessageRecord, NewMessage, current_unix_millis, sort_by_server_time,
};
use super::{BoxFuture, LogSubscription, MessageLog, make_subscription};

struct Subscriber {
    events: mpsc::UnboundedSender<LogEvent>,
    cancel_rx: oneshot::Receiver<()>,
}

impl Subscriber {
    fn is_cancelled(&mut self) -> bool {
        // Either an explicit cancel or a dropped subscription closes the receiver side.
        !matches!(
            self.cancel_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        )
    }
}

#[derive(Default)]
struct MemoryLogState {
    channels: HashMap<ChannelId, Vec<MessageRecord>>,
    subscribers: HashMap<ChannelId, Vec<Subscriber>>,
    failure: Option<String>,
    last_server_millis: u64,
}

impl MemoryLogState {
    fn snapshot(&self, channel_id: &ChannelId) -> Vec<MessageRecord> {
        let mut records = self.channels.get(channel_id).cloned().unwrap_or_default();
        sort_by_server_time(&mut records);
        records
    }

    fn publish(&mut self, channel_id: &ChannelId) {
        let snapshot = self.snapshot(channel_id);
        let Some(subscribers) = self.subscribers.get_mut(channel_id) else {
            return;
        };

        subscribers.retain_mut(|subscriber| {
            !subscriber.is_cancelled()
                && subscriber
                    .events
                    .send(LogEvent::Snapshot(snapshot.clone()))
                    .is_ok()
        });
    }

    fn next_server_millis(&mut self) -> u64 {
        // Strictly increasing even when the wall clock stalls or steps back.
        let now = current_unix_millis().max(self.last_server_millis.saturating_add(1));
        self.last_server_millis = now;
        now
    }
}

/// In-memory [`MessageLog`]; clones share the same underlying log.
#[derive(Clone, Default)]
pub struct MemoryLog {
    state: Arc<Mutex<MemoryLogState>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the channel's records in log order.
    pub fn records(&self, channel_id: &ChannelId) -> Vec<MessageRecord> {
        self.lock().snapshot(channel_id)
    }

    /// Puts the log into a failed state: open subscriptions end with a failure and
    /// appends are rejected until [`MemoryLog::recover`] is called.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut state = self.lock();
        for (_, subscribers) in state.subscribers.drain() {
            for subscriber in subscribers {
                let _ = subscriber.events.send(LogEvent::Failed {
                    reason: reason.clone(),
                });
            }
        }
        state.failure = Some(reason);
    }

    pub fn recover(&self) {
        self.lock().failure = None;
    }

    pub fn subscriber_count(&self, channel_id: &ChannelId) -> usize {
        let mut state = self.lock();
        let Some(subscribers) = state.subscribers.get_mut(channel_id) else {
            return 0;
        };
        subscribers.retain_mut(|subscriber| !subscriber.is_cancelled());
        subscribers.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryLogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MessageLog for MemoryLog {
    fn append<'a>(
        &'a self,
        channel_id: &'a ChannelId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageId>> {
        Box::pin(async move {
            let message_id = MessageId::new_v7();
            {
                let mut state = self.lock();
                if let Some(details) = state.failure.clone() {
                    return LogUnavailableSnafu {
                        stage: "memory-append-pending",
                        channel_id: channel_id.to_string(),
                        details,
                    }
                    .fail();
                }

                state
                    .channels
                    .entry(channel_id.clone())
                    .or_default()
                    .push(input.into_record(message_id, None));
                state.publish(channel_id);
            }

            // Acknowledgement from the "server" is a suspension point like any remote write.
            tokio::task::yield_now().await;

            let mut state = self.lock();
            let server_millis = state.next_server_millis();
            if let Some(record) = state
                .channels
                .get_mut(channel_id)
                .and_then(|records| records.iter_mut().find(|record| record.id == message_id))
            {
                record.created_at_unix_millis = Some(server_millis);
            }
            state.publish(channel_id);

            tracing::trace!(
                channel_id = %channel_id,
                message_id = %message_id,
                server_millis,
                "memory log append committed"
            );
            Ok(message_id)
        })
    }

    fn subscribe_ordered(&self, channel_id: &ChannelId) -> StorageResult<LogSubscription> {
        let (events, subscription, cancel_rx) = make_subscription(channel_id.clone());
        let mut state = self.lock();

        if let Some(reason) = state.failure.clone() {
            let _ = events.send(LogEvent::Failed { reason });
            return Ok(subscription);
        }

        let _ = events.send(LogEvent::Snapshot(state.snapshot(channel_id)));
        state
            .subscribers
            .entry(channel_id.clone())
            .or_default()
            .push(Subscriber { events, cancel_rx });
        Ok(subscription)
    }
}
