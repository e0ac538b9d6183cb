//! Channel identity derivation.
//!
//! Direct ids join the two participants in lexicographic order so either side computes the
//! same id. The lower id's byte length is written first, so the separator may also appear
//! inside participant ids without two pairs sharing a channel. Assistant ids live under their
//! own prefix and can never equal a direct id.

use snafu::ensure;
use synapse_storage::{ChannelId, ParticipantId};

use super::error::{CoreResult, InvalidParticipantsSnafu};

pub const DIRECT_CHANNEL_PREFIX: &str = "direct:";
pub const ASSISTANT_CHANNEL_PREFIX: &str = "assistant:";
const DIRECT_SEPARATOR: char = '_';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Direct,
    Assistant,
}

/// A conversation scope: two humans, or one human and the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Direct {
        first: ParticipantId,
        second: ParticipantId,
    },
    Assistant {
        owner: ParticipantId,
    },
}

impl Channel {
    pub fn direct(first: ParticipantId, second: ParticipantId) -> Self {
        Self::Direct { first, second }
    }

    pub fn assistant(owner: ParticipantId) -> Self {
        Self::Assistant { owner }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Direct { .. } => ChannelKind::Direct,
            Self::Assistant { .. } => ChannelKind::Assistant,
        }
    }

    /// Owner of an assistant channel; direct channels have none.
    pub fn owner(&self) -> Option<&ParticipantId> {
        match self {
            Self::Assistant { owner } => Some(owner),
            Self::Direct { .. } => None,
        }
    }
}

/// Pure mapping from channel participants to a [`ChannelId`].
pub struct ChannelResolver;

impl ChannelResolver {
    pub fn resolve(channel: &Channel) -> CoreResult<ChannelId> {
        match channel {
            Channel::Direct { first, second } => Self::direct(first, second),
            Channel::Assistant { owner } => Self::assistant(owner),
        }
    }

    /// Resolves from a kind and a participant list (two for direct, one for assistant).
    pub fn resolve_participants(
        kind: ChannelKind,
        participants: &[ParticipantId],
    ) -> CoreResult<ChannelId> {
        match (kind, participants) {
            (ChannelKind::Direct, [first, second]) => Self::direct(first, second),
            (ChannelKind::Assistant, [owner]) => Self::assistant(owner),
            (kind, participants) => InvalidParticipantsSnafu {
                stage: "resolve-participants-arity",
                details: format!(
                    "{kind:?} channel cannot be formed from {} participant(s)",
                    participants.len()
                ),
            }
            .fail(),
        }
    }

    pub fn direct(first: &ParticipantId, second: &ParticipantId) -> CoreResult<ChannelId> {
        ensure_human(first, "resolve-direct-first")?;
        ensure_human(second, "resolve-direct-second")?;
        ensure!(
            first != second,
            InvalidParticipantsSnafu {
                stage: "resolve-direct-distinct",
                details: format!("participant '{first}' cannot open a direct channel with itself"),
            }
        );

        let (low, high) = if first < second {
            (first, second)
        } else {
            (second, first)
        };
        Ok(ChannelId::new(format!(
            "{DIRECT_CHANNEL_PREFIX}{}:{low}{DIRECT_SEPARATOR}{high}",
            low.as_str().len()
        )))
    }

    pub fn assistant(owner: &ParticipantId) -> CoreResult<ChannelId> {
        ensure_human(owner, "resolve-assistant-owner")?;
        Ok(ChannelId::new(format!("{ASSISTANT_CHANNEL_PREFIX}{owner}")))
    }
}

pub(crate) fn ensure_human(participant: &ParticipantId, stage: &'static str) -> CoreResult<()> {
    ensure!(
        !participant.is_empty(),
        InvalidParticipantsSnafu {
            stage,
            details: "participant identity is empty".to_string(),
        }
    );
    ensure!(
        !participant.is_assistant(),
        InvalidParticipantsSnafu {
            stage,
            details: "the assistant identity is reserved".to_string(),
        }
    );
    Ok(())
}
