use snafu::Snafu;
use synapse_core::CoreError;
use synapse_llm::GenerationError;
use synapse_storage::StorageError;

use crate::settings::SettingsError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to open message log '{database_url}' on `{stage}`: {source}"))]
    OpenLog {
        stage: &'static str,
        database_url: String,
        source: StorageError,
    },
    #[snafu(display("failed to create reply generator on `{stage}`: {source}"))]
    CreateGenerator {
        stage: &'static str,
        source: GenerationError,
    },
    #[snafu(display("failed to start session on `{stage}`: {source}"))]
    StartSession {
        stage: &'static str,
        source: CoreError,
    },
    #[snafu(display("failed to save settings on `{stage}`: {source}"))]
    SaveSettings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to read terminal input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type AppResult<T> = Result<T, AppError>;
