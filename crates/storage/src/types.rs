use std::time::{SystemTime, UNIX_EPOCH};

use super::ids::{MessageId, ParticipantId};

/// One immutable record in a channel's log.
///
/// `created_at_unix_millis` is assigned by the log when the append becomes durable,
/// so it is `None` while a local write is still pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub text: String,
    pub image: Option<String>,
    pub sender_id: ParticipantId,
    pub created_at_unix_millis: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub text: String,
    pub image: Option<String>,
    pub sender_id: ParticipantId,
}

impl NewMessage {
    pub fn text(sender_id: ParticipantId, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image: None,
            sender_id,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub(crate) fn into_record(self, id: MessageId, created_at: Option<u64>) -> MessageRecord {
        MessageRecord {
            id,
            text: self.text,
            image: self.image,
            sender_id: self.sender_id,
            created_at_unix_millis: created_at,
        }
    }
}

/// Change notification delivered by a log subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// Complete current record set for the channel, ascending by server time.
    Snapshot(Vec<MessageRecord>),
    /// The source stopped; no further events follow.
    Failed { reason: String },
}

pub fn current_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Orders records the way the log's ordered query does: by server time, pending writes last.
pub fn sort_by_server_time(records: &mut [MessageRecord]) {
    records.sort_by_key(|record| record.created_at_unix_millis.unwrap_or(u64::MAX));
}
