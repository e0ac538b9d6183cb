use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};

use super::prompt::render_prompt;
use super::provider::{
    BoxFuture, CompletionsFailedSnafu, EmptyResponseSnafu, GenerationError, GenerationRequest,
    GenerationResult, GeneratorConfig, HttpClientSnafu, MissingApiKeySnafu, ReplyGenerator,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

/// OpenAI-compatible reply generator built on rig.
pub struct RigGenerator {
    config: GeneratorConfig,
}

impl RigGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    fn build_client(config: &GeneratorConfig) -> GenerationResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.base_url.is_empty() {
            builder = builder.base_url(config.base_url.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    async fn complete(config: &GeneratorConfig, request: &GenerationRequest) -> GenerationResult<String> {
        // A missing key is reported per call so the caller can render it as a reply.
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-generate",
                provider_id: config.provider_id.clone(),
            }
        );

        let client = Self::build_client(config)?;
        let model = client.completion_model(config.model_id.clone());
        let prompt = RigMessage::user(render_prompt(request));

        let mut builder = model.completion_request(prompt);
        if !config.preamble.trim().is_empty() {
            builder = builder.preamble(config.preamble.clone());
        }
        if let Some(temperature) = config.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(max_tokens) = config.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        let mut stream = builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })?;

        let mut reply = String::new();
        while let Some(item) = stream.next().await {
            // Reasoning and tool traffic never reach the channel.
            if let StreamedAssistantContent::Text(text) = item.context(CompletionsFailedSnafu {
                stage: "stream-chunk",
            })? {
                reply.push_str(&text.text);
            }
        }

        let reply = reply.trim().to_string();
        ensure!(
            !reply.is_empty(),
            EmptyResponseSnafu {
                stage: "collect-stream"
            }
        );
        Ok(reply)
    }
}

impl ReplyGenerator for RigGenerator {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn generate<'a>(
        &'a self,
        request: GenerationRequest,
    ) -> BoxFuture<'a, GenerationResult<String>> {
        Box::pin(async move {
            let timeout = self.config.timeout;
            let outcome =
                tokio::time::timeout(timeout, Self::complete(&self.config, &request)).await;

            match outcome {
                Ok(Ok(reply)) => {
                    tracing::debug!(
                        provider_id = %self.config.provider_id,
                        model_id = %self.config.model_id,
                        reply_chars = reply.chars().count(),
                        "generation completed"
                    );
                    Ok(reply)
                }
                Ok(Err(error)) => {
                    tracing::warn!(
                        provider_id = %self.config.provider_id,
                        model_id = %self.config.model_id,
                        error = %error,
                        "generation failed"
                    );
                    Err(error)
                }
                Err(_) => {
                    tracing::warn!(
                        provider_id = %self.config.provider_id,
                        timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        "generation timed out"
                    );
                    Err(GenerationError::TimedOut {
                        stage: "rig-generate-timeout",
                        timeout,
                    })
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FailureKind;

    #[tokio::test]
    async fn missing_api_key_fails_at_call_time() {
        let generator = RigGenerator::new(GeneratorConfig::new("openai", "", ""));
        let result = generator
            .generate(GenerationRequest::new("hello", Vec::new()))
            .await;

        let Err(error) = result else {
            panic!("expected missing key error");
        };
        assert_eq!(error.kind(), FailureKind::MissingCredential);
    }
}
