use super::provider::GenerationRequest;

pub const DEFAULT_ASSISTANT_NAME: &str = "NeuronAI";
pub const PRODUCT_NAME: &str = "Synapse";

pub fn default_preamble(assistant_name: &str) -> String {
    format!(
        "You are {assistant_name}, an intelligent assistant inside a chat app called {PRODUCT_NAME}.\nBe concise, helpful, friendly, and professional."
    )
}

/// Renders the user turn sent to the model: prior context, then the message being answered.
pub fn render_prompt(request: &GenerationRequest) -> String {
    format!(
        "Conversation so far:\n{}\n\nUser: {}",
        request.context_lines.join("\n"),
        request.latest_message
    )
}
