//! Prompt assembly: system prompt selection and context injection.

use docent_core::config::PromptConfig;
use docent_core::types::Chunk;

/// Header placed above the retrieved excerpts in a grounded question.
pub const CONTEXT_HEADER: &str = "Context excerpts:";

/// Label placed before the literal question in a grounded question.
pub const QUESTION_LABEL: &str = "Question:";

/// System prompt for the current mode.
pub fn system_prompt(prompts: &PromptConfig, grounded: bool) -> &str {
    if grounded {
        &prompts.grounded
    } else {
        &prompts.ungrounded
    }
}

/// Join chunk texts in the given order, separated by a blank line.
pub fn context_block(chunks: &[Chunk]) -> String {
    chunks
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Prepend the context block to the literal prompt.
///
/// With no chunks the prompt is returned unchanged.
pub fn augment(prompt: &str, chunks: &[Chunk]) -> String {
    if chunks.is_empty() {
        return prompt.to_string();
    }
    format!(
        "{}\n\n{}\n\n{} {}",
        CONTEXT_HEADER,
        context_block(chunks),
        QUESTION_LABEL,
        prompt
    )
}
