//! Per-session wiring of channel selection, the live sequence and automated replies.

use std::collections::VecDeque;
use std::sync::Arc;

use snafu::{OptionExt, ResultExt, ensure};
use synapse_llm::ReplyGenerator;
use synapse_storage::{ChannelId, MessageId, MessageLog, NewMessage, ParticipantId};
use tokio::sync::watch;

use super::channel::{Channel, ChannelKind, ChannelResolver, ensure_human};
use super::error::{AppendSnafu, CoreResult, EmptyMessageSnafu, NoActiveChannelSnafu};
use super::message::Message;
use super::reply::{ReplyAttemptId, ReplyCompletion, ReplyOrchestrator, ReplyPolicy, ReplyState};
use super::stream::{MessageStream, StreamError, StreamEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveChannel {
    pub channel: Channel,
    pub channel_id: ChannelId,
}

impl ActiveChannel {
    pub fn kind(&self) -> ChannelKind {
        self.channel.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A new ordered sequence was published for the active channel.
    SequenceUpdated {
        channel_id: ChannelId,
        message_count: usize,
    },
    StreamFailed(StreamError),
    ReplyStarted {
        channel_id: ChannelId,
        attempt: ReplyAttemptId,
    },
    /// `current` is false when the attempt belonged to a channel that is no longer active.
    ReplyFinished {
        completion: ReplyCompletion,
        current: bool,
    },
}

/// Signed-in user's view: identity, selected channel and its live sequence.
///
/// Created at sign-in and torn down with [`SessionContext::sign_out`] or by dropping it.
pub struct SessionContext {
    identity: ParticipantId,
    log: Arc<dyn MessageLog>,
    active: Option<ActiveChannel>,
    stream: MessageStream,
    replies: ReplyOrchestrator,
    sequence: Arc<Vec<Message>>,
    sequence_tx: watch::Sender<Arc<Vec<Message>>>,
    stream_error: Option<StreamError>,
    queued_events: VecDeque<SessionEvent>,
}

impl SessionContext {
    pub fn new(
        identity: ParticipantId,
        log: Arc<dyn MessageLog>,
        generator: Arc<dyn ReplyGenerator>,
        policy: ReplyPolicy,
    ) -> CoreResult<Self> {
        ensure_human(&identity, "session-identity")?;

        let sequence = Arc::new(Vec::new());
        let (sequence_tx, _) = watch::channel(Arc::clone(&sequence));
        Ok(Self {
            identity,
            stream: MessageStream::new(Arc::clone(&log)),
            replies: ReplyOrchestrator::new(Arc::clone(&log), generator, policy),
            log,
            active: None,
            sequence,
            sequence_tx,
            stream_error: None,
            queued_events: VecDeque::new(),
        })
    }

    pub fn identity(&self) -> &ParticipantId {
        &self.identity
    }

    pub fn active_channel(&self) -> Option<&ActiveChannel> {
        self.active.as_ref()
    }

    /// Current ordered sequence of the active channel.
    pub fn messages(&self) -> &[Message] {
        &self.sequence
    }

    /// Follows every published sequence, including the clear on channel switch.
    pub fn observe(&self) -> watch::Receiver<Arc<Vec<Message>>> {
        self.sequence_tx.subscribe()
    }

    pub fn stream_error(&self) -> Option<&StreamError> {
        self.stream_error.as_ref()
    }

    pub fn reply_state(&self) -> ReplyState {
        self.replies.state()
    }

    pub fn is_assistant_responding(&self) -> bool {
        self.replies.state() == ReplyState::Pending
    }

    pub fn select_direct_channel(&mut self, peer: ParticipantId) -> CoreResult<ChannelId> {
        let channel = Channel::direct(self.identity.clone(), peer);
        self.select(channel)
    }

    pub fn select_assistant_channel(&mut self) -> CoreResult<ChannelId> {
        let channel = Channel::assistant(self.identity.clone());
        self.select(channel)
    }

    fn select(&mut self, channel: Channel) -> CoreResult<ChannelId> {
        // Resolve first so a bad selection leaves the current channel untouched.
        let channel_id = ChannelResolver::resolve(&channel)?;

        self.release_active();
        let generation = self.stream.subscribe(channel_id.clone())?;
        if let Some(owner) = channel.owner() {
            self.replies.activate(owner.clone(), channel_id.clone());
        }

        tracing::info!(
            channel_id = %channel_id,
            kind = ?channel.kind(),
            generation = %generation,
            "selected channel"
        );
        self.active = Some(ActiveChannel {
            channel,
            channel_id: channel_id.clone(),
        });
        Ok(channel_id)
    }

    fn release_active(&mut self) {
        self.stream.unsubscribe();
        self.replies.deactivate();
        self.stream_error = None;
        self.active = None;
        self.publish(Arc::new(Vec::new()));
    }

    /// Ends the session: releases the subscription and forgets the selection.
    pub fn sign_out(&mut self) {
        if let Some(active) = self.active.as_ref() {
            tracing::info!(
                identity = %self.identity,
                channel_id = %active.channel_id,
                "signing out"
            );
        }
        self.release_active();
        self.queued_events.clear();
    }

    /// Appends a message from this session's identity to the active channel.
    pub async fn send_message(
        &self,
        text: &str,
        image: Option<String>,
    ) -> CoreResult<MessageId> {
        let stage = "send-message";
        let active = self.active.as_ref().context(NoActiveChannelSnafu { stage })?;

        let text = text.trim();
        let image = image
            .map(|image| image.trim().to_string())
            .filter(|image| !image.is_empty());
        ensure!(
            !text.is_empty() || image.is_some(),
            EmptyMessageSnafu { stage }
        );

        let mut input = NewMessage::text(self.identity.clone(), text);
        if let Some(image) = image {
            input = input.with_image(image);
        }

        self.log
            .append(&active.channel_id, input)
            .await
            .context(AppendSnafu {
                stage,
                channel_id: active.channel_id.to_string(),
            })
    }

    /// Drives the session until something observable happens.
    ///
    /// Cancel-safe; dropping the future loses no events.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        if let Some(event) = self.queued_events.pop_front() {
            return Some(event);
        }

        tokio::select! {
            event = self.stream.next_event() => {
                event.map(|event| self.apply_stream_event(event))
            }
            completion = self.replies.next_completion() => {
                completion.map(|completion| self.apply_completion(completion))
            }
        }
    }

    fn apply_stream_event(&mut self, event: StreamEvent) -> SessionEvent {
        match event {
            StreamEvent::Sequence {
                channel_id,
                messages,
            } => {
                let message_count = messages.len();
                self.stream_error = None;
                self.publish(Arc::new(messages));

                if let Some(attempt) = self.replies.on_sequence(&self.sequence) {
                    self.queued_events.push_back(SessionEvent::ReplyStarted {
                        channel_id: channel_id.clone(),
                        attempt,
                    });
                }

                SessionEvent::SequenceUpdated {
                    channel_id,
                    message_count,
                }
            }
            StreamEvent::Failed(error) => {
                self.stream_error = Some(error.clone());
                SessionEvent::StreamFailed(error)
            }
        }
    }

    fn apply_completion(&mut self, completion: ReplyCompletion) -> SessionEvent {
        let current = self.replies.complete(&completion);
        SessionEvent::ReplyFinished {
            completion,
            current,
        }
    }

    fn publish(&mut self, sequence: Arc<Vec<Message>>) {
        self.sequence = Arc::clone(&sequence);
        self.sequence_tx.send_replace(sequence);
    }
}
