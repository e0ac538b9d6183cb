use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use snafu::Snafu;

use super::prompt::default_preamble;

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u64 = 1_000;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Reply shown when a generation attempt fails for a reason without a dedicated message.
pub const FALLBACK_REPLY_TEXT: &str =
    "Sorry, I'm having trouble responding right now. Please try again.";

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorConfig {
    pub provider_id: String,
    pub api_key: String,
    pub base_url: String,
    pub model_id: String,
    pub preamble: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub timeout: Duration,
}

impl GeneratorConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            base_url: base_url.into().trim().to_string(),
            model_id: DEFAULT_OPENAI_MODEL.to_string(),
            preamble: default_preamble(super::prompt::DEFAULT_ASSISTANT_NAME),
            temperature: Some(DEFAULT_TEMPERATURE),
            max_tokens: Some(DEFAULT_MAX_TOKENS),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = preamble.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Input for one automated reply: the message being answered plus bounded history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub latest_message: String,
    pub context_lines: Vec<String>,
}

impl GenerationRequest {
    pub fn new(latest_message: impl Into<String>, context_lines: Vec<String>) -> Self {
        Self {
            latest_message: latest_message.into(),
            context_lines,
        }
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type GenerationResult<T> = Result<T, GenerationError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum GenerationError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("provider returned an empty reply on `{stage}`"))]
    EmptyResponse { stage: &'static str },
    #[snafu(display("generation timed out after {timeout:?} on `{stage}`"))]
    TimedOut {
        stage: &'static str,
        timeout: Duration,
    },
    #[snafu(display("generation capability unavailable on `{stage}`: {details}"))]
    Unavailable {
        stage: &'static str,
        details: String,
    },
}

/// Coarse failure class used only to pick user-facing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    MissingCredential,
    InvalidCredential,
    RateLimited,
    EmptyResponse,
    Unavailable,
}

impl FailureKind {
    pub fn user_message(self) -> &'static str {
        match self {
            Self::MissingCredential => {
                "⚠️ API key not configured. Please add an API key to your settings."
            }
            Self::InvalidCredential => "⚠️ API key is invalid. Please check your API key settings.",
            Self::RateLimited => "⚠️ Too many requests. Please wait a moment and try again.",
            Self::EmptyResponse => "I couldn't generate a response. Please try again.",
            Self::Unavailable => FALLBACK_REPLY_TEXT,
        }
    }
}

impl GenerationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::MissingApiKey { .. } => FailureKind::MissingCredential,
            Self::EmptyResponse { .. } => FailureKind::EmptyResponse,
            Self::CompletionsFailed { source, .. } => classify_failure_text(&source.to_string()),
            Self::HttpClient { source, .. } => classify_failure_text(&source.to_string()),
            Self::UnsupportedProvider { .. } | Self::TimedOut { .. } | Self::Unavailable { .. } => {
                FailureKind::Unavailable
            }
        }
    }

    pub fn user_message(&self) -> &'static str {
        self.kind().user_message()
    }
}

const STATUS_MARKERS: [&str; 6] = ["status", "code", "http", "error", "providererror", "httperror"];
const RATE_LIMIT_PHRASES: [&str; 3] = ["rate limit", "rate_limit", "too many requests"];
const CREDENTIAL_PHRASES: [&str; 4] = [
    "invalid api key",
    "incorrect api key",
    "invalid_api_key",
    "unauthorized",
];

/// Maps provider error text onto a failure class.
///
/// Providers surface HTTP status only inside their error text, so matching is textual. A
/// number only counts as a status when it directly follows a marker such as `status` or
/// `HTTP`, so ids and token counts that happen to contain `429` stay generic failures.
pub fn classify_failure_text(text: &str) -> FailureKind {
    let lowered = text.to_ascii_lowercase();
    let status = status_code(&lowered);

    if status == Some(429) || RATE_LIMIT_PHRASES.iter().any(|phrase| lowered.contains(phrase)) {
        return FailureKind::RateLimited;
    }

    if matches!(status, Some(401 | 403))
        || CREDENTIAL_PHRASES.iter().any(|phrase| lowered.contains(phrase))
    {
        return FailureKind::InvalidCredential;
    }

    FailureKind::Unavailable
}

fn status_code(lowered: &str) -> Option<u16> {
    let tokens: Vec<&str> = lowered
        .split(|character: char| !character.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .collect();

    tokens.windows(2).find_map(|pair| match pair {
        [marker, code] if STATUS_MARKERS.contains(marker) && code.len() == 3 => code.parse().ok(),
        _ => None,
    })
}

/// External text-generation capability.
pub trait ReplyGenerator: Send + Sync {
    fn id(&self) -> &str;
    fn generate<'a>(&'a self, request: GenerationRequest)
    -> BoxFuture<'a, GenerationResult<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_classification() {
        assert_eq!(
            classify_failure_text("ProviderError: 429 Too Many Requests"),
            FailureKind::RateLimited
        );
        assert_eq!(
            classify_failure_text("HTTP 401: Incorrect API key provided"),
            FailureKind::InvalidCredential
        );
        assert_eq!(
            classify_failure_text("status 403 forbidden"),
            FailureKind::InvalidCredential
        );
        assert_eq!(
            classify_failure_text("connection reset by peer"),
            FailureKind::Unavailable
        );
        assert_eq!(
            classify_failure_text("Invalid status code: 429"),
            FailureKind::RateLimited
        );
    }

    #[test]
    fn numbers_outside_status_position_are_not_status_codes() {
        assert_eq!(
            classify_failure_text("request req_4291 used 429 tokens"),
            FailureKind::Unavailable
        );
        assert_eq!(
            classify_failure_text("model returned 401 characters before disconnecting"),
            FailureKind::Unavailable
        );
        assert_eq!(
            classify_failure_text("HttpError: status 4030 from upstream"),
            FailureKind::Unavailable
        );
    }

    #[test]
    fn generic_failures_use_the_fixed_fallback() {
        let error = GenerationError::Unavailable {
            stage: "test",
            details: "offline".to_string(),
        };
        assert_eq!(error.user_message(), FALLBACK_REPLY_TEXT);

        let timed_out = GenerationError::TimedOut {
            stage: "test",
            timeout: Duration::from_secs(1),
        };
        assert_eq!(timed_out.user_message(), FALLBACK_REPLY_TEXT);
    }

    #[test]
    fn missing_key_has_dedicated_text() {
        let error = GenerationError::MissingApiKey {
            stage: "test",
            provider_id: "openai".to_string(),
        };
        assert_eq!(error.kind(), FailureKind::MissingCredential);
        assert!(error.user_message().contains("API key not configured"));
    }

    #[test]
    fn config_trims_credentials() {
        let config = GeneratorConfig::new(" openai ", "  sk-test \n", " https://api.openai.com/v1 ");
        assert_eq!(config.provider_id, "openai");
        assert_eq!(config.api_key, "sk-test");
        assert_eq!(config.base_url, "https://api.openai.com/v1");
        assert_eq!(config.temperature, Some(DEFAULT_TEMPERATURE));
        assert_eq!(config.max_tokens, Some(DEFAULT_MAX_TOKENS));
    }
}
