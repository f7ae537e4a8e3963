//! Chat-completions transport for the judge model.
//!
//! Speaks the OpenAI `/v1/chat/completions` wire format. Judge requests are
//! single-turn and, unless disabled, ask for a JSON object reply so the
//! verdict parser sees bare JSON rather than prose.

use crate::config::LlmConfig;
use crate::error::{EvalError, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// A message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

/// Request body for chat completion.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    // Null when the model refuses or only emits tool calls.
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// One judge reply with its metadata.
#[derive(Debug)]
pub struct LlmResponse {
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl LlmResponse {
    /// The reply hit the token limit, so any JSON in it is likely cut off.
    pub fn is_truncated(&self) -> bool {
        self.finish_reason.as_deref() == Some("length")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Client for an OpenAI-compatible judge endpoint.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        format!("{}/v1/chat/completions", base)
    }

    fn request<'a>(&'a self, messages: &'a [Message]) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            seed: self.config.seed,
            response_format: self
                .config
                .json_mode
                .then_some(ResponseFormat { kind: "json_object" }),
        }
    }

    /// Send a chat completion request.
    pub async fn chat(&self, messages: Vec<Message>) -> Result<LlmResponse> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&self.request(&messages))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        parse_completion(status, &body)
    }

    /// Model this client sends requests to.
    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn max_tokens(&self) -> u32 {
        self.config.max_tokens
    }

    /// Send a one-line probe and check the endpoint answers sensibly.
    pub async fn test_connection(&self) -> Result<()> {
        let probe = if self.config.json_mode {
            r#"Reply with the JSON object {"status": "ok"} and nothing else."#
        } else {
            "Reply with the word ok and nothing else."
        };

        let response = self.chat(vec![Message::user(probe)]).await?;

        if response.content.to_lowercase().contains("ok") {
            Ok(())
        } else {
            Err(EvalError::LlmApi(format!(
                "Unexpected probe reply: {}",
                response.content
            )))
        }
    }
}

/// Turn a raw HTTP status and body into a judge reply.
fn parse_completion(status: StatusCode, body: &str) -> Result<LlmResponse> {
    if !status.is_success() {
        let message = serde_json::from_str::<ApiError>(body)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| body.to_string());
        return Err(EvalError::LlmApi(format!("API error ({}): {}", status, message)));
    }

    let completion: ChatCompletionResponse = serde_json::from_str(body)?;
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| EvalError::LlmApi("No choices in response".to_string()))?;

    let content = choice
        .message
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| {
            EvalError::LlmApi(format!(
                "Empty reply (finish_reason: {})",
                choice.finish_reason.as_deref().unwrap_or("unknown")
            ))
        })?;

    Ok(LlmResponse {
        content,
        finish_reason: choice.finish_reason,
        usage: completion.usage,
    })
}
