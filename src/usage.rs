use serde::Serialize;

/// Character budget for stored prompt/response snapshots. Applied at
/// insertion time so the audit trail stays bounded during very long runs.
const SNIPPET_CHAR_LIMIT: usize = 2000;

/// Flat, backend-agnostic token accounting for one request or a whole run.
///
/// Backends report these numbers in different places and shapes; the
/// streaming aggregator normalizes them into this struct before anything
/// downstream sees them.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub thinking_tokens: u64,
    pub cached_tokens: u64,
    /// Monetary cost reported by the backend itself, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// True when the counts are a character-based approximation rather than
    /// real backend accounting. Estimated counts can diverge significantly
    /// from real tokenization.
    pub estimated: bool,
}

impl Usage {
    /// Rough character-count fallback for backends that report no usage at
    /// all: ~4 characters per token.
    pub fn estimate(prompt_chars: usize, completion_chars: usize) -> Self {
        let prompt_tokens = (prompt_chars / 4) as u64;
        let completion_tokens = (completion_chars / 4) as u64;
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            thinking_tokens: 0,
            cached_tokens: 0,
            cost: None,
            estimated: true,
        }
    }

    /// Pure accumulation: merging in any order yields the same totals.
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
        self.thinking_tokens = self.thinking_tokens.saturating_add(other.thinking_tokens);
        self.cached_tokens = self.cached_tokens.saturating_add(other.cached_tokens);
        if let Some(cost) = other.cost {
            *self.cost.get_or_insert(0.0) += cost;
        }
        self.estimated |= other.estimated;
    }
}

/// Externally supplied per-model pricing, per one million tokens.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    /// Cost of one request when the backend did not report one itself.
    /// Thinking tokens are billed as output.
    pub fn cost(&self, usage: &Usage) -> f64 {
        let input = usage.prompt_tokens as f64 / 1e6 * self.input_per_million;
        let output = (usage.completion_tokens + usage.thinking_tokens) as f64 / 1e6
            * self.output_per_million;
        input + output
    }
}

/// One bounded audit entry: what was asked, what came back, what it cost.
#[derive(Clone, Debug, Serialize)]
pub struct RequestAudit {
    pub request_number: u32,
    pub prompt_snippet: String,
    pub response_snippet: String,
    pub usage: Usage,
    pub cost_usd: f64,
}

/// Flattened end-of-run artifact consumed by reporting collaborators.
#[derive(Clone, Debug, Serialize)]
pub struct UsageSummary {
    pub totals: Usage,
    pub cost_usd: f64,
    pub request_count: u32,
    pub requests: Vec<RequestAudit>,
}

/// Accumulates token and monetary cost across every request of one agent
/// run. Never errors: missing fields count as zero.
#[derive(Debug, Default)]
pub struct UsageLedger {
    totals: Usage,
    cost_usd: f64,
    requests: Vec<RequestAudit>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one completed request into the running totals and appends its
    /// audit entry. Prefers a backend-reported cost; otherwise falls back to
    /// the supplied pricing.
    pub fn record(&mut self, prompt: &str, response: &str, usage: Usage, pricing: &ModelPricing) {
        let cost_usd = usage.cost.unwrap_or_else(|| pricing.cost(&usage));
        self.totals.add(&usage);
        self.cost_usd += cost_usd;
        self.requests.push(RequestAudit {
            request_number: self.requests.len() as u32 + 1,
            prompt_snippet: truncate_chars(prompt, SNIPPET_CHAR_LIMIT),
            response_snippet: truncate_chars(response, SNIPPET_CHAR_LIMIT),
            usage,
            cost_usd,
        });
    }

    pub fn totals(&self) -> &Usage {
        &self.totals
    }

    pub fn cost_usd(&self) -> f64 {
        self.cost_usd
    }

    pub fn request_count(&self) -> u32 {
        self.requests.len() as u32
    }

    /// True when at least one recorded request carried estimated counts.
    pub fn any_estimated(&self) -> bool {
        self.requests.iter().any(|request| request.usage.estimated)
    }

    pub fn summary(&self) -> UsageSummary {
        UsageSummary {
            totals: self.totals.clone(),
            cost_usd: self.cost_usd,
            request_count: self.request_count(),
            requests: self.requests.clone(),
        }
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    text.chars().take(limit).collect()
}
