//! LLM-backed roles: relevance search, extraction, validation, repair.
//!
//! Every role is consumed the same way: one call with a text input, one
//! structured JSON answer. The [`RoleRunner`] trait is that seam; the
//! production implementation is [`LlmRoleRunner`], tests script their own.
//!
//! ## Retry Strategy
//!
//! [`call_role`] owns retries so runners stay thin. Every call consumes one
//! attempt of the shared budget (`role_attempts`, default 3), so the budget
//! bounds total calls, not retries after the first:
//!
//! * **Malformed output** (unparsable JSON, wrong shape, failed value checks)
//!   is retried immediately with the same input. The model is sampled again;
//!   waiting would not change anything.
//! * **Transport errors** (HTTP 429 / 503, timeouts) are retried after
//!   `retry_backoff_ms * 2^(attempt-1)`: 500 ms → 1 s with the defaults.
//! * **Not configured** is never retried.
//!
//! When the budget runs out the failure becomes fatal
//! ([`ExtractError::RoleFailed`]).

use crate::config::{ExtractionConfig, DEFAULT_MODEL};
use crate::error::{ExtractError, RoleError};
use crate::output::{Extraction, SearchDecision, Verdict};
use crate::prompts::system_prompt;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// One of the four LLM-backed capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Relevance filter: does the page describe interactions at all?
    Search,
    /// First-pass extraction of interactions.
    Extract,
    /// Review of a candidate extraction.
    Validate,
    /// Correction of a candidate, guided by the validator's explanation.
    Repair,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Search => "search",
            Role::Extract => "extract",
            Role::Validate => "validate",
            Role::Repair => "repair",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executes a single role call.
#[async_trait]
pub trait RoleRunner: Send + Sync {
    /// Run `role` on `input` and return its raw JSON answer.
    async fn run(&self, role: Role, input: &str) -> Result<Value, RoleError>;
}

/// Typed answer of a role, with checks the JSON shape alone cannot express.
pub trait RoleOutput: DeserializeOwned {
    fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

impl RoleOutput for SearchDecision {
    fn check(&self) -> Result<(), String> {
        if !self.confidence.is_finite() {
            return Err(format!("confidence must be a number, got {}", self.confidence));
        }
        Ok(())
    }
}

impl RoleOutput for Extraction {
    fn check(&self) -> Result<(), String> {
        Extraction::check(self)
    }
}

impl RoleOutput for Verdict {}

/// Call `role` and decode its answer as `T`, retrying per the module policy.
pub async fn call_role<T: RoleOutput>(
    runner: &dyn RoleRunner,
    role: Role,
    input: &str,
    attempts: u32,
    backoff_ms: u64,
) -> Result<T, ExtractError> {
    let attempts = attempts.max(1);
    let mut last_err: Option<RoleError> = None;

    for attempt in 1..=attempts {
        let result = match runner.run(role, input).await {
            Ok(value) => decode::<T>(value),
            Err(e) => Err(e),
        };

        let err = match result {
            Ok(output) => {
                if attempt > 1 {
                    debug!("{} role succeeded on attempt {}", role, attempt);
                }
                return Ok(output);
            }
            Err(e) => e,
        };

        warn!("{} role: attempt {}/{} failed: {}", role, attempt, attempts, err);

        if !err.is_retryable() {
            return Err(ExtractError::RoleFailed {
                role,
                attempts: attempt,
                detail: err.to_string(),
            });
        }
        if attempt < attempts && err.wants_backoff() {
            let backoff = backoff_ms.saturating_mul(2u64.saturating_pow(attempt - 1));
            sleep(Duration::from_millis(backoff)).await;
        }
        last_err = Some(err);
    }

    Err(ExtractError::RoleFailed {
        role,
        attempts,
        detail: last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "Unknown error".to_string()),
    })
}

fn decode<T: RoleOutput>(value: Value) -> Result<T, RoleError> {
    let output: T =
        serde_json::from_value(value).map_err(|e| RoleError::MalformedOutput(e.to_string()))?;
    output.check().map_err(RoleError::MalformedOutput)?;
    Ok(output)
}

// ── LLM-backed runner ────────────────────────────────────────────────────

/// [`RoleRunner`] over an edgequake-llm provider.
///
/// Each call sends the role's system prompt and the input as the only user
/// message, then parses the reply as JSON.
pub struct LlmRoleRunner {
    provider: Arc<dyn LLMProvider>,
    temperature: f32,
    max_tokens: usize,
}

impl LlmRoleRunner {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &ExtractionConfig) -> Self {
        Self {
            provider,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    /// Resolve the provider from `config` (see [`resolve_provider`]).
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, ExtractError> {
        Ok(Self::new(resolve_provider(config)?, config))
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl RoleRunner for LlmRoleRunner {
    async fn run(&self, role: Role, input: &str) -> Result<Value, RoleError> {
        let start = Instant::now();
        let messages = vec![
            ChatMessage::system(system_prompt(role)),
            ChatMessage::user(input),
        ];
        let options = self.options();

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| RoleError::Transport(e.to_string()))?;

        debug!(
            "{} role: {} input tokens, {} output tokens, {:?}",
            role,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        parse_json_reply(&response.content)
    }
}

/// Parse a model reply as JSON, tolerating Markdown code fences and prose
/// around a single top-level object.
pub fn parse_json_reply(reply: &str) -> Result<Value, RoleError> {
    let body = strip_code_fences(reply);
    if let Ok(v) = serde_json::from_str(body) {
        return Ok(v);
    }

    if let (Some(open), Some(close)) = (body.find('{'), body.rfind('}')) {
        if open < close {
            if let Ok(v) = serde_json::from_str(&body[open..=close]) {
                return Ok(v);
            }
        }
    }

    let preview: String = body.chars().take(120).collect();
    Err(RoleError::MalformedOutput(format!(
        "reply is not JSON: {preview:?}"
    )))
}

/// Remove a surrounding ```` ```json … ``` ```` fence, if present.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the info string (e.g. "json") on the opening line
    let rest = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ExtractError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ExtractError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`): used as-is. Useful in
///    tests or when the caller wraps the provider in caching/rate-limiting.
///
/// 2. **Named provider + model** (`config.provider_name`): built through
///    [`ProviderFactory::create_llm_provider`], which reads the matching API
///    key (`OPENAI_API_KEY`, etc.) from the environment.
///
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`):
///    honoured before auto-detection so the model choice sticks even when
///    several API keys are present.
///
/// 4. **OpenAI key** (`OPENAI_API_KEY`): preferred when present.
///
/// 5. **Full auto-detection** ([`ProviderFactory::from_env`]).
pub fn resolve_provider(config: &ExtractionConfig) -> Result<Arc<dyn LLMProvider>, ExtractError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ExtractError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}
