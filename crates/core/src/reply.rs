//! Automated replies for assistant channels.
//!
//! The orchestrator is a two-state machine (`Idle`/`Pending`). A reply is triggered only when
//! the newest message in a published sequence was written by the channel owner; the
//! assistant's own reply therefore can never trigger another one. Each attempt runs as a
//! detached task that always appends exactly one assistant message (the reply or a fallback)
//! and always reports back, even if the task is torn down mid-flight.

use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use synapse_llm::{FailureKind, GenerationRequest, ReplyGenerator};
use synapse_storage::{ChannelId, MessageId, MessageLog, NewMessage, ParticipantId};
use tokio::sync::mpsc;

use super::message::Message;

pub const DEFAULT_CONTEXT_WINDOW: usize = 6;
pub const ASSISTANT_SPEAKER_LABEL: &str = "AI";
pub const HUMAN_SPEAKER_LABEL: &str = "User";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReplyState {
    #[default]
    Idle,
    Pending,
}

/// Identifier for one reply attempt; completions for any other attempt are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplyAttemptId(pub u64);

impl fmt::Display for ReplyAttemptId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPolicy {
    /// Number of most recent messages rendered into the prompt context.
    pub context_window: usize,
}

impl Default for ReplyPolicy {
    fn default() -> Self {
        Self {
            context_window: DEFAULT_CONTEXT_WINDOW,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The generated text was appended.
    Generated { message_id: MessageId },
    /// Generation failed and the fallback text was appended instead.
    Fallback {
        message_id: MessageId,
        kind: FailureKind,
    },
    /// Nothing could be appended to the log.
    Undelivered { reason: String },
    /// The attempt task was aborted or the runtime shut down before it reported.
    Interrupted,
}

impl ReplyOutcome {
    pub fn appended_message(&self) -> Option<MessageId> {
        match self {
            Self::Generated { message_id } | Self::Fallback { message_id, .. } => {
                Some(*message_id)
            }
            Self::Undelivered { .. } | Self::Interrupted => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyCompletion {
    pub attempt: ReplyAttemptId,
    pub channel_id: ChannelId,
    pub trigger_message_id: MessageId,
    pub outcome: ReplyOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AssistantBinding {
    owner: ParticipantId,
    channel_id: ChannelId,
}

pub struct ReplyOrchestrator {
    log: Arc<dyn MessageLog>,
    generator: Arc<dyn ReplyGenerator>,
    policy: ReplyPolicy,
    binding: Option<AssistantBinding>,
    state: ReplyState,
    pending: Option<ReplyAttemptId>,
    // Owner messages an attempt was started for; survives channel switches so a
    // re-selected channel does not answer the same message twice.
    claimed: HashSet<MessageId>,
    last_attempt: u64,
    completions_tx: mpsc::UnboundedSender<ReplyCompletion>,
    completions_rx: mpsc::UnboundedReceiver<ReplyCompletion>,
}

impl ReplyOrchestrator {
    pub fn new(
        log: Arc<dyn MessageLog>,
        generator: Arc<dyn ReplyGenerator>,
        policy: ReplyPolicy,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            log,
            generator,
            policy,
            binding: None,
            state: ReplyState::Idle,
            pending: None,
            claimed: HashSet::new(),
            last_attempt: 0,
            completions_tx,
            completions_rx,
        }
    }

    pub fn state(&self) -> ReplyState {
        self.state
    }

    pub fn bound_channel(&self) -> Option<&ChannelId> {
        self.binding.as_ref().map(|binding| &binding.channel_id)
    }

    /// Binds to a newly active assistant channel, starting from `Idle`.
    pub fn activate(&mut self, owner: ParticipantId, channel_id: ChannelId) {
        self.reset();
        self.binding = Some(AssistantBinding { owner, channel_id });
    }

    /// Unbinds on channel switch. In-flight attempts keep running but become stale.
    pub fn deactivate(&mut self) {
        self.reset();
        self.binding = None;
    }

    fn reset(&mut self) {
        if let Some(attempt) = self.pending.take() {
            tracing::debug!(
                attempt = %attempt,
                "detaching in-flight reply attempt from active channel"
            );
        }
        self.state = ReplyState::Idle;
    }

    /// Returns the owner message that should be answered, if any.
    pub fn trigger_candidate<'a>(&self, messages: &'a [Message]) -> Option<&'a Message> {
        let binding = self.binding.as_ref()?;
        if self.state != ReplyState::Idle {
            return None;
        }

        let last = messages.last()?;
        if last.sender_id != binding.owner || self.claimed.contains(&last.id) {
            return None;
        }

        Some(last)
    }

    /// Evaluates the trigger condition for a freshly published sequence and starts an
    /// attempt when it holds. The state is `Pending` by the time this returns `Some`.
    pub fn on_sequence(&mut self, messages: &[Message]) -> Option<ReplyAttemptId> {
        self.release_settled_claims(messages);
        let trigger = self.trigger_candidate(messages)?;
        let binding = self.binding.clone()?;

        self.last_attempt = self.last_attempt.saturating_add(1);
        let attempt = ReplyAttemptId(self.last_attempt);
        self.state = ReplyState::Pending;
        self.pending = Some(attempt);
        self.claimed.insert(trigger.id);

        let request = GenerationRequest::new(
            trigger.text.clone(),
            render_context_lines(messages, self.policy.context_window),
        );

        tracing::info!(
            channel_id = %binding.channel_id,
            attempt = %attempt,
            trigger_message_id = %trigger.id,
            context_lines = request.context_lines.len(),
            "automated reply triggered"
        );

        let guard = CompletionGuard {
            attempt,
            channel_id: binding.channel_id.clone(),
            trigger_message_id: trigger.id,
            completions: Some(self.completions_tx.clone()),
        };
        tokio::spawn(run_attempt(
            Arc::clone(&self.log),
            Arc::clone(&self.generator),
            request,
            guard,
        ));

        Some(attempt)
    }

    /// Drops claims on messages followed by a committed record. Committed records never
    /// move, so such a message can never be the newest one again.
    fn release_settled_claims(&mut self, messages: &[Message]) {
        if self.claimed.is_empty() {
            return;
        }
        let Some(last_committed) = messages.iter().rposition(|message| !message.is_pending())
        else {
            return;
        };
        for message in &messages[..last_committed] {
            self.claimed.remove(&message.id);
        }
    }

    /// Waits for the next attempt to finish, current or stale.
    pub async fn next_completion(&mut self) -> Option<ReplyCompletion> {
        self.completions_rx.recv().await
    }

    /// Applies a completion; returns whether it belonged to the current attempt.
    pub fn complete(&mut self, completion: &ReplyCompletion) -> bool {
        if completion.outcome.appended_message().is_none() {
            // Nothing reached the log, so the message is still unanswered.
            self.claimed.remove(&completion.trigger_message_id);
        }

        if self.pending != Some(completion.attempt) {
            tracing::debug!(
                attempt = %completion.attempt,
                channel_id = %completion.channel_id,
                "ignoring completion of a detached reply attempt"
            );
            return false;
        }

        self.pending = None;
        self.state = ReplyState::Idle;
        true
    }
}

/// Renders the newest `window` messages oldest-first as `speaker: text` lines.
pub fn render_context_lines(messages: &[Message], window: usize) -> Vec<String> {
    let start = messages.len().saturating_sub(window);
    messages[start..]
        .iter()
        .map(|message| {
            let speaker = if message.is_from_assistant() {
                ASSISTANT_SPEAKER_LABEL
            } else {
                HUMAN_SPEAKER_LABEL
            };
            let text = if message.text.is_empty() && message.image.is_some() {
                "[image]"
            } else {
                message.text.as_str()
            };
            format!("{speaker}: {text}")
        })
        .collect()
}

/// Reports an attempt's completion exactly once, falling back to `Interrupted` on drop.
struct CompletionGuard {
    attempt: ReplyAttemptId,
    channel_id: ChannelId,
    trigger_message_id: MessageId,
    completions: Option<mpsc::UnboundedSender<ReplyCompletion>>,
}

impl CompletionGuard {
    fn finish(mut self, outcome: ReplyOutcome) {
        self.report(outcome);
    }

    fn report(&mut self, outcome: ReplyOutcome) {
        if let Some(completions) = self.completions.take() {
            let _ = completions.send(ReplyCompletion {
                attempt: self.attempt,
                channel_id: self.channel_id.clone(),
                trigger_message_id: self.trigger_message_id,
                outcome,
            });
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.completions.is_some() {
            tracing::warn!(
                attempt = %self.attempt,
                channel_id = %self.channel_id,
                "reply attempt ended without reporting"
            );
            self.report(ReplyOutcome::Interrupted);
        }
    }
}

async fn run_attempt(
    log: Arc<dyn MessageLog>,
    generator: Arc<dyn ReplyGenerator>,
    request: GenerationRequest,
    guard: CompletionGuard,
) {
    let channel_id = guard.channel_id.clone();
    let generated = AssertUnwindSafe(generator.generate(request))
        .catch_unwind()
        .await;
    let outcome = match generated {
        Ok(Ok(text)) => {
            let reply = NewMessage::text(ParticipantId::assistant(), text);
            match log.append(&channel_id, reply).await {
                Ok(message_id) => {
                    tracing::info!(
                        channel_id = %channel_id,
                        attempt = %guard.attempt,
                        message_id = %message_id,
                        "automated reply appended"
                    );
                    ReplyOutcome::Generated { message_id }
                }
                Err(error) => {
                    // The reply text is lost; still try to leave a visible turn behind.
                    tracing::warn!(
                        channel_id = %channel_id,
                        attempt = %guard.attempt,
                        error = %error,
                        "failed to append automated reply"
                    );
                    append_fallback(log.as_ref(), &channel_id, FailureKind::Unavailable).await
                }
            }
        }
        Ok(Err(error)) => {
            let kind = error.kind();
            tracing::warn!(
                channel_id = %channel_id,
                attempt = %guard.attempt,
                generator = %generator.id(),
                failure_kind = ?kind,
                error = %error,
                "generation failed; appending fallback reply"
            );
            append_fallback(log.as_ref(), &channel_id, kind).await
        }
        Err(_) => {
            tracing::error!(
                channel_id = %channel_id,
                attempt = %guard.attempt,
                generator = %generator.id(),
                "generator panicked; appending fallback reply"
            );
            append_fallback(log.as_ref(), &channel_id, FailureKind::Unavailable).await
        }
    };

    guard.finish(outcome);
}

async fn append_fallback(
    log: &dyn MessageLog,
    channel_id: &ChannelId,
    kind: FailureKind,
) -> ReplyOutcome {
    let fallback = NewMessage::text(ParticipantId::assistant(), kind.user_message());
    match log.append(channel_id, fallback).await {
        Ok(message_id) => ReplyOutcome::Fallback { message_id, kind },
        Err(error) => {
            tracing::error!(
                channel_id = %channel_id,
                error = %error,
                "failed to append fallback reply"
            );
            ReplyOutcome::Undelivered {
                reason: error.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use synapse_llm::{BoxFuture, FALLBACK_REPLY_TEXT, GenerationError, GenerationResult};
    use synapse_storage::{MemoryLog, MessageRecord};
    use tokio::sync::oneshot;

    use super::*;

    enum Script {
        Reply(&'static str),
        Fail,
        Gate(oneshot::Receiver<GenerationResult<String>>),
        Panic,
    }

    /// Generator that plays back a fixed script and records every request it sees.
    struct ScriptedGenerator {
        script: Mutex<Vec<Script>>,
        requests: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedGenerator {
        fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().rev().collect()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn request_count(&self) -> usize {
            self.requests.lock().map(|requests| requests.len()).unwrap_or(0)
        }

        fn last_request(&self) -> Option<GenerationRequest> {
            self.requests
                .lock()
                .ok()
                .and_then(|requests| requests.last().cloned())
        }
    }

    impl ReplyGenerator for ScriptedGenerator {
        fn id(&self) -> &str {
            "scripted"
        }

        fn generate<'a>(
            &'a self,
            request: GenerationRequest,
        ) -> BoxFuture<'a, GenerationResult<String>> {
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request);
            }
            let step = self.script.lock().ok().and_then(|mut script| script.pop());
            Box::pin(async move {
                match step {
                    Some(Script::Reply(text)) => Ok(text.to_string()),
                    Some(Script::Gate(gate)) => gate.await.unwrap_or_else(|_| {
                        Err(GenerationError::Unavailable {
                            stage: "scripted-gate",
                            details: "gate dropped".to_string(),
                        })
                    }),
                    Some(Script::Panic) => panic!("scripted generator panic"),
                    Some(Script::Fail) | None => Err(GenerationError::Unavailable {
                        stage: "scripted",
                        details: "network error".to_string(),
                    }),
                }
            })
        }
    }

    fn owner() -> ParticipantId {
        ParticipantId::new("u1")
    }

    fn channel() -> ChannelId {
        ChannelId::new("assistant:u1")
    }

    fn message(sender: ParticipantId, text: &str, created_at: u64) -> Message {
        Message::from_record(
            MessageRecord {
                id: MessageId::new_v7(),
                text: text.to_string(),
                image: None,
                sender_id: sender,
                created_at_unix_millis: Some(created_at),
            },
            created_at,
        )
    }

    fn orchestrator(
        log: &MemoryLog,
        generator: Arc<ScriptedGenerator>,
    ) -> ReplyOrchestrator {
        let mut orchestrator =
            ReplyOrchestrator::new(Arc::new(log.clone()), generator, ReplyPolicy::default());
        orchestrator.activate(owner(), channel());
        orchestrator
    }

    async fn completion(orchestrator: &mut ReplyOrchestrator) -> ReplyCompletion {
        tokio::time::timeout(Duration::from_secs(5), orchestrator.next_completion())
            .await
            .ok()
            .flatten()
            .expect("attempt completion")
    }

    #[tokio::test]
    async fn owner_message_triggers_and_reply_is_appended() {
        let log = MemoryLog::new();
        let generator = ScriptedGenerator::new(vec![Script::Reply("hi there")]);
        let mut orchestrator = orchestrator(&log, generator.clone());

        let sequence = vec![message(owner(), "hello", 10)];
        assert!(orchestrator.on_sequence(&sequence).is_some());
        assert_eq!(orchestrator.state(), ReplyState::Pending);

        let done = completion(&mut orchestrator).await;
        assert!(orchestrator.complete(&done));
        assert_eq!(orchestrator.state(), ReplyState::Idle);
        assert!(matches!(done.outcome, ReplyOutcome::Generated { .. }));

        let records = log.records(&channel());
        assert_eq!(records.len(), 1);
        assert!(records[0].sender_id.is_assistant());
        assert_eq!(records[0].text, "hi there");
        assert_eq!(records[0].image, None);
    }

    #[tokio::test]
    async fn claims_are_released_once_a_committed_record_follows() {
        let log = MemoryLog::new();
        let generator = ScriptedGenerator::new(vec![Script::Reply("hi there")]);
        let mut orchestrator = orchestrator(&log, generator.clone());

        let hello = message(owner(), "hello", 10);
        assert!(orchestrator.on_sequence(std::slice::from_ref(&hello)).is_some());
        let done = completion(&mut orchestrator).await;
        assert!(orchestrator.complete(&done));
        assert!(orchestrator.claimed.contains(&hello.id));

        // A stale snapshot that predates the reply must not answer the message twice.
        assert_eq!(orchestrator.on_sequence(std::slice::from_ref(&hello)), None);

        let unsent = Message::from_record(
            MessageRecord {
                id: MessageId::new_v7(),
                text: "typing".to_string(),
                image: None,
                sender_id: ParticipantId::assistant(),
                created_at_unix_millis: None,
            },
            11,
        );
        assert_eq!(orchestrator.on_sequence(&[hello.clone(), unsent]), None);
        assert!(orchestrator.claimed.contains(&hello.id));

        let reply = message(ParticipantId::assistant(), "hi there", 11);
        assert_eq!(orchestrator.on_sequence(&[hello, reply]), None);
        assert!(orchestrator.claimed.is_empty());
        assert_eq!(generator.request_count(), 1);
    }

    #[tokio::test]
    async fn assistant_tail_never_triggers() {
        let log = MemoryLog::new();
        let generator = ScriptedGenerator::new(Vec::new());
        let mut orchestrator = orchestrator(&log, generator.clone());

        let only_ai = vec![message(ParticipantId::assistant(), "welcome", 1)];
        assert_eq!(orchestrator.on_sequence(&only_ai), None);

        let answered = vec![
            message(owner(), "hello", 1),
            message(ParticipantId::assistant(), "hi", 2),
        ];
        assert_eq!(orchestrator.on_sequence(&answered), None);
        assert_eq!(orchestrator.on_sequence(&[]), None);
        assert_eq!(generator.request_count(), 0);
    }

    #[tokio::test]
    async fn foreign_sender_tail_does_not_trigger() {
        let log = MemoryLog::new();
        let generator = ScriptedGenerator::new(Vec::new());
        let mut orchestrator = orchestrator(&log, generator.clone());

        let sequence = vec![message(ParticipantId::new("u2"), "sneaky", 1)];
        assert_eq!(orchestrator.on_sequence(&sequence), None);
    }

    #[tokio::test]
    async fn unbound_orchestrator_never_triggers() {
        let log = MemoryLog::new();
        let generator = ScriptedGenerator::new(Vec::new());
        let mut orchestrator = orchestrator(&log, generator);
        orchestrator.deactivate();

        assert_eq!(orchestrator.on_sequence(&[message(owner(), "hello", 1)]), None);
    }

    #[tokio::test]
    async fn pending_state_blocks_second_trigger() {
        let log = MemoryLog::new();
        let (release, gate) = oneshot::channel();
        let generator = ScriptedGenerator::new(vec![Script::Gate(gate), Script::Reply("again")]);
        let mut orchestrator = orchestrator(&log, generator.clone());

        let first = vec![message(owner(), "hello", 1)];
        assert!(orchestrator.on_sequence(&first).is_some());

        let follow_up = vec![message(owner(), "hello", 1), message(owner(), "anyone?", 2)];
        assert_eq!(orchestrator.on_sequence(&follow_up), None);
        assert_eq!(orchestrator.on_sequence(&first), None);
        assert_eq!(orchestrator.state(), ReplyState::Pending);

        let _ = release.send(Ok("sure".to_string()));
        let done = completion(&mut orchestrator).await;
        assert!(orchestrator.complete(&done));
        assert_eq!(generator.request_count(), 1);
    }

    #[tokio::test]
    async fn generation_failure_appends_single_fallback() {
        let log = MemoryLog::new();
        let generator = ScriptedGenerator::new(vec![Script::Fail]);
        let mut orchestrator = orchestrator(&log, generator);

        assert!(orchestrator.on_sequence(&[message(owner(), "hello", 1)]).is_some());
        let done = completion(&mut orchestrator).await;
        assert!(orchestrator.complete(&done));

        assert!(matches!(
            done.outcome,
            ReplyOutcome::Fallback {
                kind: FailureKind::Unavailable,
                ..
            }
        ));
        let records = log.records(&channel());
        assert_eq!(records.len(), 1);
        assert!(records[0].sender_id.is_assistant());
        assert_eq!(records[0].text, FALLBACK_REPLY_TEXT);
        assert_eq!(orchestrator.state(), ReplyState::Idle);
    }

    #[tokio::test]
    async fn panicking_generator_appends_single_fallback() {
        let log = MemoryLog::new();
        let generator = ScriptedGenerator::new(vec![Script::Panic]);
        let mut orchestrator = orchestrator(&log, generator);

        assert!(orchestrator.on_sequence(&[message(owner(), "hello", 1)]).is_some());
        let done = completion(&mut orchestrator).await;
        assert!(matches!(
            done.outcome,
            ReplyOutcome::Fallback {
                kind: FailureKind::Unavailable,
                ..
            }
        ));
        assert!(orchestrator.complete(&done));
        assert_eq!(orchestrator.state(), ReplyState::Idle);

        let records = log.records(&channel());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sender_id, ParticipantId::assistant());
        assert_eq!(records[0].text, FALLBACK_REPLY_TEXT);
    }

    #[tokio::test]
    async fn dropped_guard_reports_interrupted_once() {
        let (completions_tx, mut completions_rx) = mpsc::unbounded_channel();
        let guard = CompletionGuard {
            attempt: ReplyAttemptId(7),
            channel_id: channel(),
            trigger_message_id: MessageId::new_v7(),
            completions: Some(completions_tx),
        };
        drop(guard);

        let done = completions_rx.recv().await.expect("interrupted completion");
        assert_eq!(done.attempt, ReplyAttemptId(7));
        assert_eq!(done.outcome, ReplyOutcome::Interrupted);
        assert!(completions_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unreachable_log_reports_undelivered_and_unclaims() {
        let log = MemoryLog::new();
        let generator = ScriptedGenerator::new(vec![Script::Reply("lost"), Script::Reply("ok")]);
        let mut orchestrator = orchestrator(&log, generator.clone());
        let sequence = vec![message(owner(), "hello", 1)];

        log.fail("offline");
        assert!(orchestrator.on_sequence(&sequence).is_some());
        let done = completion(&mut orchestrator).await;
        assert!(matches!(done.outcome, ReplyOutcome::Undelivered { .. }));
        assert!(orchestrator.complete(&done));

        // The unanswered message may be retried once the log is back.
        log.recover();
        assert!(orchestrator.on_sequence(&sequence).is_some());
        let done = completion(&mut orchestrator).await;
        assert!(matches!(done.outcome, ReplyOutcome::Generated { .. }));
        assert_eq!(generator.request_count(), 2);
    }

    #[tokio::test]
    async fn answered_message_is_not_answered_twice() {
        let log = MemoryLog::new();
        let generator = ScriptedGenerator::new(vec![Script::Reply("once"), Script::Reply("twice")]);
        let mut orchestrator = orchestrator(&log, generator.clone());
        let sequence = vec![message(owner(), "hello", 1)];

        assert!(orchestrator.on_sequence(&sequence).is_some());
        let done = completion(&mut orchestrator).await;
        orchestrator.complete(&done);

        // A re-delivered snapshot that still ends with the answered message.
        assert_eq!(orchestrator.on_sequence(&sequence), None);
        assert_eq!(generator.request_count(), 1);
    }

    #[tokio::test]
    async fn switched_away_attempt_appends_to_original_channel_only() {
        let log = MemoryLog::new();
        let (release, gate) = oneshot::channel();
        let generator = ScriptedGenerator::new(vec![Script::Gate(gate)]);
        let mut orchestrator = orchestrator(&log, generator);

        assert!(orchestrator.on_sequence(&[message(owner(), "hello", 1)]).is_some());
        orchestrator.deactivate();
        assert_eq!(orchestrator.state(), ReplyState::Idle);

        let other_owner = ParticipantId::new("u9");
        let other_channel = ChannelId::new("assistant:u9");
        orchestrator.activate(other_owner, other_channel.clone());

        let _ = release.send(Ok("late reply".to_string()));
        let done = completion(&mut orchestrator).await;
        assert_eq!(done.channel_id, channel());
        assert!(!orchestrator.complete(&done));
        assert_eq!(orchestrator.state(), ReplyState::Idle);
        assert_eq!(orchestrator.bound_channel(), Some(&other_channel));

        assert_eq!(log.records(&channel())[0].text, "late reply");
        assert!(log.records(&other_channel).is_empty());
    }

    #[tokio::test]
    async fn stale_completion_does_not_clear_new_pending_attempt() {
        let log = MemoryLog::new();
        let (release_old, old_gate) = oneshot::channel();
        let (release_new, new_gate) = oneshot::channel();
        let generator =
            ScriptedGenerator::new(vec![Script::Gate(old_gate), Script::Gate(new_gate)]);
        let mut orchestrator = orchestrator(&log, generator);

        assert!(orchestrator.on_sequence(&[message(owner(), "first", 1)]).is_some());
        orchestrator.deactivate();
        orchestrator.activate(owner(), channel());

        let current = orchestrator
            .on_sequence(&[message(owner(), "second", 2)])
            .expect("new attempt");

        let _ = release_old.send(Ok("old".to_string()));
        let stale = completion(&mut orchestrator).await;
        assert!(!orchestrator.complete(&stale));
        assert_eq!(orchestrator.state(), ReplyState::Pending);

        let _ = release_new.send(Ok("new".to_string()));
        let done = completion(&mut orchestrator).await;
        assert_eq!(done.attempt, current);
        assert!(orchestrator.complete(&done));
        assert_eq!(orchestrator.state(), ReplyState::Idle);
    }

    #[tokio::test]
    async fn context_window_is_bounded_and_labelled() {
        let log = MemoryLog::new();
        let generator = ScriptedGenerator::new(vec![Script::Reply("ok")]);
        let mut orchestrator = orchestrator(&log, generator.clone());

        let mut sequence = Vec::new();
        for index in 0..8_u64 {
            let sender = if index % 2 == 0 {
                owner()
            } else {
                ParticipantId::assistant()
            };
            sequence.push(message(sender, &format!("m{index}"), index));
        }
        sequence.push(message(owner(), "latest", 100));

        assert!(orchestrator.on_sequence(&sequence).is_some());
        let _ = completion(&mut orchestrator).await;

        let request = generator.last_request().expect("request");
        assert_eq!(request.latest_message, "latest");
        assert_eq!(
            request.context_lines,
            ["AI: m3", "User: m4", "AI: m5", "User: m6", "AI: m7", "User: latest"]
        );
    }

    #[test]
    fn image_only_messages_render_placeholder() {
        let mut image = message(owner(), "", 1);
        image.image = Some("https://img/cat.png".to_string());
        assert_eq!(render_context_lines(&[image], 6), ["User: [image]"]);
    }
}
