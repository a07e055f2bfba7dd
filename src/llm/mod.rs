pub mod openai;

pub use openai::{
    ChatMessage, LlmClient, LlmConfig, LlmError, OutputFormat, RealtimeSecret,
};

/// Removes a ```json fence if the model wrapped its output in one, returning
/// the inner body untouched.
pub fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}
