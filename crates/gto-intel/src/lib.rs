//! LLM-backed market intelligence and GTO strategy stages.

use async_trait::async_trait;
use gto_core::{Property, Recommendation};
use gto_storage::{FetchError, HttpClient};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, Instrument};

pub const CRATE_NAME: &str = "gto-intel";

pub const DEFAULT_MODEL: &str = "gpt-4";

/// Only the head of the property list is embedded in the analysis prompt.
pub const MAX_PROPERTIES_IN_ANALYSIS: usize = 10;

pub const MARKET_SYSTEM_PROMPT: &str = "You are an expert real estate strategist. Analyze the following property data to extract competitor behavior, \
market dynamics, and strategic investment recommendations using game theory principles.";

pub const STRATEGY_SYSTEM_PROMPT: &str = "You are a game-theory-optimal (GTO) commercial real estate investment engine. \
You score each property against the investor's goal while accounting for likely competitor moves. \
You MUST respond with a JSON array only: no markdown fences, no commentary.";

#[derive(Debug, Error)]
pub enum IntelError {
    #[error("no API key configured for the completion provider")]
    MissingApiKey,
    #[error("completion request failed: {0}")]
    Transport(#[source] FetchError),
    #[error("completion provider rejected credentials (http {status}): {body}")]
    Auth { status: u16, body: String },
    #[error("completion provider returned http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed completion payload: {0}")]
    MalformedPayload(String),
    #[error("serializing prompt data: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<FetchError> for IntelError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, body, .. } if status == 401 || status == 403 => {
                IntelError::Auth { status, body }
            }
            FetchError::HttpStatus { status, body, .. } => IntelError::Status { status, body },
            err @ FetchError::Request(_) => IntelError::Transport(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Model knobs for a single stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl StageSettings {
    pub fn analysis_default() -> Self {
        Self {
            model: DEFAULT_MODEL.into(),
            temperature: 0.3,
            max_tokens: 3000,
        }
    }

    pub fn strategy_default() -> Self {
        Self {
            model: DEFAULT_MODEL.into(),
            temperature: 0.2,
            max_tokens: 2000,
        }
    }

    fn request(&self, system: &str, user: String) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &ChatRequest) -> Result<String, IntelError>;
}

/// OpenAI-compatible `POST {base_url}/chat/completions` client.
#[derive(Debug, Clone)]
pub struct OpenAiChatProvider {
    http: HttpClient,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiChatProvider {
    pub fn new(http: HttpClient, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl CompletionProvider for OpenAiChatProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String, IntelError> {
        let api_key = self.api_key.as_deref().ok_or(IntelError::MissingApiKey)?;
        let payload = serde_json::to_value(request)?;
        let resp = self
            .http
            .post_json(&self.completions_url(), Some(api_key), &payload)
            .await?;

        let parsed: ChatCompletionResponse = serde_json::from_slice(&resp.body)
            .map_err(|e| IntelError::MalformedPayload(format!("invalid completion JSON: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| IntelError::MalformedPayload("response has no choices[0].message.content".into()))
    }
}

pub fn market_analysis_prompt(
    properties: &[Property],
    depth: &str,
    timeframe: &str,
) -> Result<String, IntelError> {
    let head = &properties[..properties.len().min(MAX_PROPERTIES_IN_ANALYSIS)];
    let data = serde_json::to_string_pretty(head)?;
    Ok(format!(
        "Analyze the following data from NYC commercial property transactions. Extract:
1. Most active investors and acquisition patterns
2. Bidding and pricing behavior
3. Market concentration and timing strategies
4. Strategic insights for investment timing, competitive entry, and defensive positioning
5. Risks and potential threats

Analysis depth: {depth}
Timeframe: {timeframe}

Property Data:
{data}

Format the output in clean sections with bullet points and key insights.
"
    ))
}

pub fn strategy_prompt(properties: &[Property], goal: &str) -> Result<String, IntelError> {
    let data = serde_json::to_string(properties)?;
    Ok(format!(
        "Strategy goal: {goal}

For every property below, return one JSON object with exactly these keys:
- \"property_id\": the property's property_id, copied verbatim
- \"gto_score\": integer from 0 to 100, higher means a stronger fit for the goal
- \"recommendation\": one of \"BUY\", \"HOLD\", \"PASS\", \"DIVEST\"
- \"rationale\": one or two sentences citing pricing, cap rate, occupancy, and likely competitor behavior

Return a JSON array of these objects in the same order as the input.

Properties:
{data}
"
    ))
}

pub async fn analyze_market_intelligence(
    provider: &dyn CompletionProvider,
    settings: &StageSettings,
    properties: &[Property],
    depth: &str,
    timeframe: &str,
) -> Result<String, IntelError> {
    let request = settings.request(
        MARKET_SYSTEM_PROMPT,
        market_analysis_prompt(properties, depth, timeframe)?,
    );
    let span = info_span!("market_analysis", provider = provider.name(), model = %settings.model);
    let text = provider.complete(&request).instrument(span).await?;
    info!(chars = text.len(), "market analysis received");
    Ok(text)
}

/// Returns the raw model text; callers decide how to handle unparsable output.
pub async fn generate_gto_recommendations(
    provider: &dyn CompletionProvider,
    settings: &StageSettings,
    properties: &[Property],
    goal: &str,
) -> Result<String, IntelError> {
    let request = settings.request(STRATEGY_SYSTEM_PROMPT, strategy_prompt(properties, goal)?);
    let span = info_span!("gto_strategy", provider = provider.name(), model = %settings.model);
    let text = provider.complete(&request).instrument(span).await?;
    info!(chars = text.len(), "strategy response received");
    Ok(text)
}

/// Only the outer shape is checked: a JSON array of objects. Field values of
/// any type are kept and shown as text.
pub fn parse_recommendations(text: &str) -> Result<Vec<Recommendation>, IntelError> {
    let body = strip_code_fence(text);
    let objects: Vec<serde_json::Map<String, serde_json::Value>> = serde_json::from_str(body)
        .map_err(|e| IntelError::MalformedPayload(format!("recommendations are not a JSON array of objects: {e}")))?;
    objects
        .into_iter()
        .map(|object| {
            serde_json::from_value(serde_json::Value::Object(object))
                .map_err(|e| IntelError::MalformedPayload(format!("unreadable recommendation: {e}")))
        })
        .collect()
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_suffix("```").unwrap_or(rest).trim_start();
    rest.strip_prefix("json")
        .or_else(|| rest.strip_prefix("JSON"))
        .unwrap_or(rest)
        .trim()
}
