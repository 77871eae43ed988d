//! Token-count estimation
//!
//! The `/v1/messages/count_tokens` endpoint and the streaming encoder's
//! output-token fallback both use a cl100k BPE estimate. This is a local
//! approximation, not the upstream's own tokenizer.

use nimbus_core::normalized::NormalizedRequest;
use once_cell::sync::Lazy;
use tiktoken_rs::{cl100k_base, CoreBPE};

static BPE: Lazy<Option<CoreBPE>> = Lazy::new(|| match cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        tracing::warn!(error = %e, "cl100k tokenizer unavailable, falling back to byte estimate");
        None
    }
});

/// Estimate the token count of a text fragment.
pub fn estimate_text_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    match BPE.as_ref() {
        Some(bpe) => bpe.encode_ordinary(text).len() as u32,
        // Rough byte heuristic when the tokenizer failed to load
        None => (text.len() as u32 / 4).max(1),
    }
}

/// Estimate input tokens for a whole request: system prompt, message text,
/// tool call arguments and tool definitions, plus a small per-message framing
/// overhead.
pub fn estimate_input_tokens(request: &NormalizedRequest) -> u32 {
    let mut total = 0u32;

    if let Some(system) = &request.system {
        total += estimate_text_tokens(system);
    }

    for message in &request.messages {
        // Role and framing overhead per message
        total += 4;
        total += estimate_text_tokens(&message.content.to_text());
        for call in &message.tool_calls {
            total += estimate_text_tokens(&call.name);
            total += estimate_text_tokens(&call.arguments);
        }
    }

    for tool in &request.tools {
        total += estimate_text_tokens(&tool.name);
        if let Some(description) = &tool.description {
            total += estimate_text_tokens(description);
        }
        total += estimate_text_tokens(&tool.input_schema.to_string());
    }

    total
}
