use crate::http::build_client;
use crate::retry::{self, ApiError, MAX_ATTEMPTS};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Chat completion endpoint settings. Models are fixed per role so stages
/// do not carry model names around.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub vision_model: String,
    pub text_model: String,
    pub listing_model: String,
    pub referer: Option<String>,
    pub title: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env_or("OPENROUTER_API_BASE", "https://openrouter.ai/api/v1"),
            vision_model: env_or("VISION_MODEL", "anthropic/claude-sonnet-4.5"),
            text_model: env_or("TEXT_MODEL", "anthropic/claude-sonnet-4.5"),
            listing_model: env_or("LISTING_MODEL", "openai/gpt-4o-mini"),
            referer: std::env::var("APP_REFERER").ok(),
            title: std::env::var("APP_TITLE").ok(),
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("no api key provided for the model call")]
    MissingKey,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("model reply had no content")]
    EmptyReply,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn user(content: MessageContent) -> Self {
        Self {
            role: "user".to_string(),
            content,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<MessagePart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    ImageUrl { image_url: ImageRef },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self::ImageUrl {
            image_url: ImageRef { url: url.into() },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageRef {
    pub url: String,
}

/// One chat call. `json_output` asks the upstream to constrain the reply to
/// a JSON object. Only some models honor it, so JSON-expecting callers run
/// the reply through [`crate::llm::parse_model_json`] regardless.
#[derive(Debug, Clone)]
pub struct ChatParams {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub json_output: bool,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct LlmClient {
    http: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// Sends one chat completion with the shared retry policy and returns
    /// the assistant text. The key is used for this call only.
    pub async fn chat(&self, api_key: &str, params: &ChatParams) -> Result<String, LlmError> {
        if api_key.trim().is_empty() {
            return Err(LlmError::MissingKey);
        }
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = ChatRequest {
            model: &params.model,
            messages: &params.messages,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            response_format: params
                .json_output
                .then_some(ResponseFormat { kind: "json_object" }),
        };

        let raw = retry::call_with_retry("chat completion", MAX_ATTEMPTS, || {
            let mut request = self.http.post(&url).bearer_auth(api_key).json(&body);
            if let Some(referer) = &self.config.referer {
                request = request.header("HTTP-Referer", referer);
            }
            if let Some(title) = &self.config.title {
                request = request.header("X-Title", title);
            }
            async move {
                let response = request
                    .send()
                    .await
                    .map_err(|err| ApiError::transport(err.to_string()))?;
                retry::require_success(response).await
            }
        })
        .await?;

        let parsed: ChatResponse = serde_json::from_str(&raw)
            .map_err(|err| ApiError::transport(format!("unreadable chat response: {err}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(LlmError::EmptyReply);
        }
        debug!(
            target = "restage.llm",
            model = %params.model,
            chars = content.len(),
            "chat_completed"
        );
        Ok(content)
    }
}
