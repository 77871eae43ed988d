//! Upstream credential resolution
//!
//! The orchestrator resolves each candidate's credentials before the attempt:
//! a literal key, a bearer token (possibly issued by the OAuth manager), or
//! the inbound request's own headers for passthrough providers.

use reqwest::RequestBuilder;

/// Credentials resolved for one upstream attempt
#[derive(Debug, Clone)]
pub enum ResolvedAuth {
    /// `x-api-key` header (Anthropic style)
    ApiKey(String),
    /// `Authorization: Bearer` header (OpenAI style, auth-token providers,
    /// OAuth-issued tokens)
    Bearer(String),
    /// Forward the inbound request's credential headers unchanged
    Passthrough {
        api_key: Option<String>,
        authorization: Option<String>,
    },
}

impl ResolvedAuth {
    /// Apply the credential headers to an outbound request.
    pub fn apply(&self, builder: RequestBuilder) -> RequestBuilder {
        match self {
            ResolvedAuth::ApiKey(key) => builder.header("x-api-key", key),
            ResolvedAuth::Bearer(token) => {
                builder.header("Authorization", format!("Bearer {}", token))
            }
            ResolvedAuth::Passthrough {
                api_key,
                authorization,
            } => {
                let mut builder = builder;
                if let Some(key) = api_key {
                    builder = builder.header("x-api-key", key);
                }
                if let Some(value) = authorization {
                    builder = builder.header("Authorization", value);
                }
                builder
            }
        }
    }

    /// Short label for log lines; never includes the secret itself.
    pub fn describe(&self) -> &'static str {
        match self {
            ResolvedAuth::ApiKey(_) => "api_key",
            ResolvedAuth::Bearer(_) => "bearer",
            ResolvedAuth::Passthrough { .. } => "passthrough",
        }
    }
}
