use snafu::Snafu;
use synapse_storage::StorageError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CoreError {
    #[snafu(display("invalid channel participants on `{stage}`: {details}"))]
    InvalidParticipants {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("no channel is selected on `{stage}`"))]
    NoActiveChannel { stage: &'static str },
    #[snafu(display("refusing to send an empty message on `{stage}`"))]
    EmptyMessage { stage: &'static str },
    #[snafu(display("failed to append to channel '{channel_id}' on `{stage}`: {source}"))]
    Append {
        stage: &'static str,
        channel_id: String,
        source: StorageError,
    },
    #[snafu(display("failed to subscribe to channel '{channel_id}' on `{stage}`: {source}"))]
    Subscribe {
        stage: &'static str,
        channel_id: String,
        source: StorageError,
    },
}

pub type CoreResult<T> = Result<T, CoreError>;
