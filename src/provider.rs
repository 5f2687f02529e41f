use serde_json::{Value, json};

/// Backend identity inferred from the configured base URL.
///
/// The agent may be reconfigured between runs, so call sites classify the
/// URL fresh for every request instead of caching a kind at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    OpenRouter,
    Cerebras,
    Unknown,
}

impl ProviderKind {
    /// Classifies a base endpoint. Unknown inputs never fail; they degrade
    /// to the most conservative capability set.
    pub fn from_base_url(base_url: &str) -> Self {
        let url = base_url.to_ascii_lowercase();
        if url.contains("cerebras") {
            Self::Cerebras
        } else if url.contains("openrouter") {
            Self::OpenRouter
        } else if url.contains("openai") {
            Self::OpenAi
        } else {
            Self::Unknown
        }
    }

    /// Whether to ask for usage accounting on the stream via
    /// `stream_options.include_usage`.
    ///
    /// Cerebras ignores the option but reports usage in the final chunk
    /// anyway; unknown backends get the request too, worst case they reject
    /// it and the run surfaces a transport error.
    pub fn include_stream_usage(self) -> bool {
        match self {
            Self::OpenAi | Self::OpenRouter | Self::Cerebras | Self::Unknown => true,
        }
    }

    /// Backend-specific extra request attributes.
    ///
    /// OpenRouter accepts a tracing session id and a request for monetary
    /// cost in the usage object. Cerebras rejects unknown body fields with
    /// 422, so it (and any unknown backend) gets nothing extra.
    pub fn extra_body(self, tracking_token: &str) -> Value {
        match self {
            Self::OpenRouter => json!({
                "litellm_session_id": tracking_token,
                "usage": {"include": true},
            }),
            Self::OpenAi | Self::Cerebras | Self::Unknown => json!({}),
        }
    }

    /// Whether the backend's structured-output compiler rejects JSON-Schema
    /// constraint keywords (length/numeric bounds, patterns, formats),
    /// requiring them to be stripped before sending.
    pub fn strict_schema_compiler(self) -> bool {
        matches!(self, Self::Cerebras)
    }
}
