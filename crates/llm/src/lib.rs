use std::sync::Arc;

mod prompt;
mod provider;
mod rig_adapter;

pub use prompt::{DEFAULT_ASSISTANT_NAME, PRODUCT_NAME, default_preamble, render_prompt};
pub use provider::{
    BoxFuture, DEFAULT_MAX_TOKENS, DEFAULT_OPENAI_MODEL, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_TEMPERATURE, FALLBACK_REPLY_TEXT, FailureKind, GenerationError, GenerationRequest,
    GenerationResult, GeneratorConfig, ReplyGenerator, classify_failure_text,
};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigGenerator};

pub fn create_generator(mut config: GeneratorConfig) -> GenerationResult<Arc<dyn ReplyGenerator>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigGenerator::new(config)))
        }
        _ => Err(GenerationError::UnsupportedProvider {
            stage: "create-generator",
            provider_id: config.provider_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_provider_defaults_to_openai() {
        let generator = create_generator(GeneratorConfig::new("", "sk-test", ""));
        assert!(matches!(generator, Ok(generator) if generator.id() == "openai"));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let generator = create_generator(GeneratorConfig::new("carrier-pigeon", "k", ""));
        assert!(matches!(
            generator,
            Err(GenerationError::UnsupportedProvider { .. })
        ));
    }
}
