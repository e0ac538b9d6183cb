//! Live, ordered view over one channel's log.
//!
//! Each subscription gets a fresh [`SubscriptionGeneration`]. Log events are forwarded onto a
//! single queue tagged with the generation that produced them, and anything tagged with a
//! superseded generation is dropped when it is dequeued.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use snafu::ResultExt;
use synapse_storage::{
    ChannelId, LogEvent, LogSubscription, MessageId, MessageLog, MessageRecord,
    current_unix_millis,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::{CoreResult, SubscribeSnafu};
use super::message::{Message, order_by_effective_timestamp};

/// Monotonic tag for one subscription. Must change on every subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionGeneration(pub u64);

impl SubscriptionGeneration {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SubscriptionGeneration {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Transport failure surfaced to observers. The stream does not retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    pub channel_id: ChannelId,
    pub reason: String,
}

impl fmt::Display for StreamError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "message stream for '{}' failed: {}",
            self.channel_id, self.reason
        )
    }
}

/// Raw log event tagged with the subscription that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamUpdate {
    pub generation: SubscriptionGeneration,
    pub channel_id: ChannelId,
    pub event: LogEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Complete, ordered sequence for the current channel.
    Sequence {
        channel_id: ChannelId,
        messages: Vec<Message>,
    },
    Failed(StreamError),
}

struct ActiveSubscription {
    generation: SubscriptionGeneration,
    channel_id: ChannelId,
    forwarder: JoinHandle<()>,
    first_seen: HashMap<MessageId, u64>,
    latest_server_millis: u64,
}

impl ActiveSubscription {
    fn order_snapshot(&mut self, records: Vec<MessageRecord>, now_millis: u64) -> Vec<Message> {
        if let Some(latest) = records
            .iter()
            .filter_map(|record| record.created_at_unix_millis)
            .max()
        {
            self.latest_server_millis = self.latest_server_millis.max(latest);
        }

        // Newly sighted records never sort before server time already observed.
        let floor = now_millis.max(self.latest_server_millis);
        let mut messages = records
            .into_iter()
            .map(|record| {
                let hint = *self.first_seen.entry(record.id).or_insert(floor);
                Message::from_record(record, hint)
            })
            .collect::<Vec<_>>();
        order_by_effective_timestamp(&mut messages);
        messages
    }
}

pub struct MessageStream {
    log: Arc<dyn MessageLog>,
    updates_tx: mpsc::UnboundedSender<StreamUpdate>,
    updates_rx: mpsc::UnboundedReceiver<StreamUpdate>,
    last_generation: u64,
    active: Option<ActiveSubscription>,
}

impl MessageStream {
    pub fn new(log: Arc<dyn MessageLog>) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            log,
            updates_tx,
            updates_rx,
            last_generation: 0,
            active: None,
        }
    }

    pub fn current_generation(&self) -> Option<SubscriptionGeneration> {
        self.active.as_ref().map(|active| active.generation)
    }

    pub fn channel_id(&self) -> Option<&ChannelId> {
        self.active.as_ref().map(|active| &active.channel_id)
    }

    /// Releases any prior subscription, then opens exactly one live query for `channel_id`.
    pub fn subscribe(&mut self, channel_id: ChannelId) -> CoreResult<SubscriptionGeneration> {
        self.unsubscribe();

        self.last_generation = self.last_generation.saturating_add(1);
        let generation = SubscriptionGeneration::new(self.last_generation);

        let subscription = self
            .log
            .subscribe_ordered(&channel_id)
            .context(SubscribeSnafu {
                stage: "message-stream-subscribe",
                channel_id: channel_id.to_string(),
            })?;
        let forwarder = tokio::spawn(forward_log_events(
            generation,
            subscription,
            self.updates_tx.clone(),
        ));

        tracing::debug!(
            channel_id = %channel_id,
            generation = %generation,
            "opened message stream subscription"
        );

        self.active = Some(ActiveSubscription {
            generation,
            channel_id,
            forwarder,
            first_seen: HashMap::new(),
            latest_server_millis: 0,
        });
        Ok(generation)
    }

    /// Idempotent; safe after the source has already failed or closed.
    pub fn unsubscribe(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };

        // Aborting drops the log subscription, which cancels the live query.
        active.forwarder.abort();
        tracing::debug!(
            channel_id = %active.channel_id,
            generation = %active.generation,
            "released message stream subscription"
        );
        true
    }

    /// Waits for the next event belonging to the current subscription.
    ///
    /// Cancel-safe: the only suspension point is the queue receive.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            let update = self.updates_rx.recv().await?;
            if let Some(event) = self.accept(update) {
                return Some(event);
            }
        }
    }

    /// Applies one tagged update; stale generations yield `None`.
    pub fn accept(&mut self, update: StreamUpdate) -> Option<StreamEvent> {
        self.accept_at(update, current_unix_millis())
    }

    pub(crate) fn accept_at(&mut self, update: StreamUpdate, now_millis: u64) -> Option<StreamEvent> {
        let Some(active) = self.active.as_mut() else {
            tracing::trace!(
                generation = %update.generation,
                "discarding stream update with no active subscription"
            );
            return None;
        };

        if active.generation != update.generation {
            tracing::debug!(
                stale_generation = %update.generation,
                current_generation = %active.generation,
                channel_id = %update.channel_id,
                "discarding stale stream update"
            );
            return None;
        }

        match update.event {
            LogEvent::Snapshot(records) => Some(StreamEvent::Sequence {
                channel_id: active.channel_id.clone(),
                messages: active.order_snapshot(records, now_millis),
            }),
            LogEvent::Failed { reason } => {
                tracing::warn!(
                    channel_id = %active.channel_id,
                    generation = %active.generation,
                    reason = %reason,
                    "message stream source failed"
                );
                Some(StreamEvent::Failed(StreamError {
                    channel_id: active.channel_id.clone(),
                    reason,
                }))
            }
        }
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

async fn forward_log_events(
    generation: SubscriptionGeneration,
    mut subscription: LogSubscription,
    updates: mpsc::UnboundedSender<StreamUpdate>,
) {
    let channel_id = subscription.channel_id().clone();
    while let Some(event) = subscription.recv().await {
        let terminal = matches!(event, LogEvent::Failed { .. });
        let update = StreamUpdate {
            generation,
            channel_id: channel_id.clone(),
            event,
        };
        if updates.send(update).is_err() || terminal {
            return;
        }
    }
}
