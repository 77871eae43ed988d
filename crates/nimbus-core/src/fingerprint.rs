//! Request fingerprinting for deduplication
//!
//! A fingerprint is a SHA-256 hash over the canonical JSON of the fields that
//! influence the upstream answer. Request ids and client metadata are
//! excluded; the stream flag is included so streaming and unary calls dedupe
//! separately.

use crate::normalized::NormalizedRequest;
use serde_json::json;
use sha2::{Digest, Sha256};

/// Stable identity of a request body, hex-encoded SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..16.min(self.0.len())]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.short())
    }
}

/// Compute the fingerprint of a normalized request.
pub fn fingerprint(request: &NormalizedRequest) -> Fingerprint {
    // serde_json maps use sorted keys, so the serialization is canonical.
    let canonical = json!({
        "model": request.model,
        "system": request.system,
        "messages": request.messages,
        "tools": request.tools,
        "tool_choice": request.tool_choice,
        "temperature": request.temperature,
        "top_p": request.top_p,
        "stop_sequences": request.stop_sequences,
        "max_tokens": request.max_tokens,
        "stream": request.stream,
    });

    let serialized = canonical.to_string();
    let digest = Sha256::digest(serialized.as_bytes());
    Fingerprint(format!("{:x}", digest))
}
