//! Merges retrieved passages with the user's prompt.

use crate::types::{AugmentedPrompt, RetrievalResult};

/// Build the augmented prompt: passage texts in ranked order, then the
/// original prompt, one per line. With no passages the combined text is the
/// original prompt unchanged.
pub fn compose(original_prompt: &str, retrieval: &RetrievalResult) -> AugmentedPrompt {
    let mut combined_text = String::new();
    for passage in retrieval.iter() {
        combined_text.push_str(&passage.text);
        combined_text.push('\n');
    }
    combined_text.push_str(original_prompt);

    AugmentedPrompt {
        original_prompt: original_prompt.to_string(),
        context: retrieval.passages.clone(),
        combined_text,
    }
}
