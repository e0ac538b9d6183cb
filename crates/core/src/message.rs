use synapse_storage::{MessageId, MessageRecord, ParticipantId};

/// A log record as seen by this client, with the local ordering fallback attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    pub image: Option<String>,
    pub sender_id: ParticipantId,
    /// Server-assigned time; `None` until the append is durable.
    pub created_at_unix_millis: Option<u64>,
    /// Local time this client first observed the record. Only used for ordering.
    pub sequence_hint_unix_millis: u64,
}

impl Message {
    pub fn from_record(record: MessageRecord, sequence_hint_unix_millis: u64) -> Self {
        Self {
            id: record.id,
            text: record.text,
            image: record.image,
            sender_id: record.sender_id,
            created_at_unix_millis: record.created_at_unix_millis,
            sequence_hint_unix_millis,
        }
    }

    pub fn effective_timestamp(&self) -> u64 {
        self.created_at_unix_millis
            .unwrap_or(self.sequence_hint_unix_millis)
    }

    pub fn is_pending(&self) -> bool {
        self.created_at_unix_millis.is_none()
    }

    pub fn is_from_assistant(&self) -> bool {
        self.sender_id.is_assistant()
    }
}

/// Stable sort by effective timestamp; ties keep their input order.
pub fn order_by_effective_timestamp(messages: &mut [Message]) {
    messages.sort_by_key(Message::effective_timestamp);
}
