//! Interactive terminal loop: reads commands from stdin while rendering session events.

use std::collections::HashSet;

use snafu::ResultExt;
use synapse_core::{ChannelKind, Message, ReplyOutcome, SessionContext, SessionEvent};
use synapse_storage::{ChannelId, MessageId, ParticipantId};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::error::{AppResult, ReadInputSnafu};

pub const HELP_TEXT: &str = "commands: /ai (assistant channel), /dm <peer> (direct channel), \
/img <url> [caption], /who, /help, /quit; anything else is sent as a message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Assistant,
    Direct(String),
    Image { url: String, caption: String },
    Who,
    Help,
    Quit,
    Send(String),
    Empty,
    Invalid(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }

        let Some(rest) = line.strip_prefix('/') else {
            return Self::Send(line.to_string());
        };

        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (rest, ""),
        };

        match (name, argument) {
            ("ai", "") => Self::Assistant,
            ("dm", "") => Self::Invalid("usage: /dm <peer>".to_string()),
            ("dm", peer) => Self::Direct(peer.to_string()),
            ("img", "") => Self::Invalid("usage: /img <url> [caption]".to_string()),
            ("img", argument) => {
                let (url, caption) = argument
                    .split_once(char::is_whitespace)
                    .map(|(url, caption)| (url, caption.trim()))
                    .unwrap_or((argument, ""));
                Self::Image {
                    url: url.to_string(),
                    caption: caption.to_string(),
                }
            }
            ("who", "") => Self::Who,
            ("help", _) => Self::Help,
            ("quit" | "exit", "") => Self::Quit,
            _ => Self::Invalid(format!("unknown command '/{name}'; {HELP_TEXT}")),
        }
    }
}

/// Turns published sequences into printable lines, each committed message once.
pub struct Transcript {
    identity: ParticipantId,
    assistant_name: String,
    channel_id: Option<ChannelId>,
    printed: HashSet<MessageId>,
}

impl Transcript {
    pub fn new(identity: ParticipantId, assistant_name: impl Into<String>) -> Self {
        Self {
            identity,
            assistant_name: assistant_name.into(),
            channel_id: None,
            printed: HashSet::new(),
        }
    }

    /// Lines for messages not printed yet. Pending writes wait for their server time.
    pub fn take_new_lines(&mut self, channel_id: &ChannelId, messages: &[Message]) -> Vec<String> {
        if self.channel_id.as_ref() != Some(channel_id) {
            self.channel_id = Some(channel_id.clone());
            self.printed.clear();
        }

        let mut lines = Vec::new();
        for message in messages.iter().filter(|message| !message.is_pending()) {
            if self.printed.insert(message.id) {
                lines.push(self.format_message(message));
            }
        }
        lines
    }

    fn format_message(&self, message: &Message) -> String {
        let speaker = if message.is_from_assistant() {
            self.assistant_name.as_str()
        } else if message.sender_id == self.identity {
            "you"
        } else {
            message.sender_id.as_str()
        };

        match (&message.image, message.text.is_empty()) {
            (Some(image), true) => format!("{speaker}: [image] {image}"),
            (Some(image), false) => format!("{speaker}: {} [image] {image}", message.text),
            (None, _) => format!("{speaker}: {}", message.text),
        }
    }
}

pub async fn run(mut session: SessionContext, assistant_name: &str) -> AppResult<()> {
    let mut transcript = Transcript::new(session.identity().clone(), assistant_name);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("signed in as {}; {HELP_TEXT}", session.identity());

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context(ReadInputSnafu { stage: "read-command-line" })? else {
                    break;
                };
                if !handle_command(&mut session, Command::parse(&line), assistant_name).await {
                    break;
                }
            }
            event = session.next_event() => {
                let Some(event) = event else {
                    break;
                };
                render_event(&session, &mut transcript, &event, assistant_name);
            }
        }
    }

    session.sign_out();
    Ok(())
}

/// Returns false once the user asked to leave.
async fn handle_command(session: &mut SessionContext, command: Command, assistant_name: &str) -> bool {
    let outcome = match command {
        Command::Quit => return false,
        Command::Empty => return true,
        Command::Help => {
            println!("{HELP_TEXT}");
            return true;
        }
        Command::Invalid(reason) => {
            println!("{reason}");
            return true;
        }
        Command::Who => {
            match session.active_channel() {
                Some(active) if active.kind() == ChannelKind::Assistant => {
                    println!("chatting with {assistant_name} in {}", active.channel_id)
                }
                Some(active) => println!("direct channel {}", active.channel_id),
                None => println!("no channel selected; {HELP_TEXT}"),
            }
            return true;
        }
        Command::Assistant => session.select_assistant_channel().map(|channel_id| {
            println!("now chatting with {assistant_name} ({channel_id})");
        }),
        Command::Direct(peer) => session
            .select_direct_channel(ParticipantId::new(peer))
            .map(|channel_id| println!("now in {channel_id}")),
        Command::Send(text) => session.send_message(&text, None).await.map(|_| ()),
        Command::Image { url, caption } => {
            session.send_message(&caption, Some(url)).await.map(|_| ())
        }
    };

    if let Err(error) = outcome {
        tracing::debug!(error = %error, "command failed");
        println!("! {error}");
    }
    true
}

fn render_event(
    session: &SessionContext,
    transcript: &mut Transcript,
    event: &SessionEvent,
    assistant_name: &str,
) {
    match event {
        SessionEvent::SequenceUpdated { channel_id, .. } => {
            for line in transcript.take_new_lines(channel_id, session.messages()) {
                println!("{line}");
            }
        }
        SessionEvent::StreamFailed(error) => {
            println!("! {error}; select the channel again to retry");
        }
        SessionEvent::ReplyStarted { .. } => println!("{assistant_name} is typing..."),
        SessionEvent::ReplyFinished {
            completion,
            current,
        } => match &completion.outcome {
            ReplyOutcome::Undelivered { reason } => {
                println!("! {assistant_name} could not reply in {}: {reason}", completion.channel_id)
            }
            ReplyOutcome::Interrupted if *current => {
                println!("! {assistant_name} stopped before replying")
            }
            _ => {}
        },
    }
}
