// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! OpenAI provider implementation: chat completions and embeddings.

use async_trait::async_trait;
use flowgraph_core::ports::{
    EmbeddingProvider, LlmProvider, LlmRequest, LlmResponse, LlmUsage,
};
use flowgraph_sandbox::CapabilityError;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// OpenAI API provider.
pub struct OpenAIProvider {
    /// HTTP client.
    client: Client,
    /// API key.
    api_key: String,
    /// API base URL.
    base_url: String,
}

/// Chat completions request.
#[derive(Debug, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

/// Chat completions response.
#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    model: String,
    choices: Vec<Choice>,
    usage: OpenAIUsage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ApiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// OpenAI error envelope.
#[derive(Debug, Deserialize)]
struct OpenAIErrorResponse {
    error: OpenAIError,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    #[serde(rename = "type")]
    error_type: Option<String>,
    message: String,
}

impl OpenAIProvider {
    /// Creates a new OpenAI provider.
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, "https://api.openai.com/v1".to_string())
    }

    /// Creates a provider with a custom base URL.
    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key,
            base_url,
        }
    }

    /// Creates a provider from the `OPENAI_API_KEY` environment
    /// variable.
    pub fn from_env() -> Result<Self, CapabilityError> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| CapabilityError::Invalid {
            message: "OPENAI_API_KEY environment variable not set".to_string(),
        })?;
        Ok(Self::new(api_key))
    }

    fn convert_reqwest_error(err: reqwest::Error) -> CapabilityError {
        if err.is_timeout() {
            CapabilityError::Timeout
        } else {
            CapabilityError::Provider {
                code: "NETWORK_ERROR".to_string(),
                message: err.to_string(),
            }
        }
    }

    fn parse_error(status: StatusCode, body: &str) -> CapabilityError {
        if let Ok(parsed) = serde_json::from_str::<OpenAIErrorResponse>(body) {
            if status == StatusCode::TOO_MANY_REQUESTS {
                return CapabilityError::HttpStatus {
                    status: 429,
                    message: parsed.error.message,
                };
            }
            return CapabilityError::Provider {
                code: parsed
                    .error
                    .error_type
                    .unwrap_or_else(|| "API_ERROR".to_string())
                    .to_ascii_uppercase(),
                message: parsed.error.message,
            };
        }
        CapabilityError::HttpStatus {
            status: status.as_u16(),
            message: body.to_string(),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAIProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse, CapabilityError> {
        let mut messages: Vec<ApiMessage> = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(ApiMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.extend(request.messages.iter().map(|m| ApiMessage {
            role: m.role.clone(),
            content: m.content.clone(),
        }));

        let api_request = ChatCompletionsRequest {
            model: request.model.clone(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&api_request)
            .send()
            .await
            .map_err(Self::convert_reqwest_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("Failed to read response body"));

        if !status.is_success() {
            return Err(Self::parse_error(status, &body));
        }

        let parsed: ChatCompletionsResponse =
            serde_json::from_str(&body).map_err(|e| CapabilityError::Provider {
                code: "MALFORMED_RESPONSE".to_string(),
                message: e.to_string(),
            })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CapabilityError::Provider {
                code: "MALFORMED_RESPONSE".to_string(),
                message: "response contained no choices".to_string(),
            })?;

        let mut metadata = std::collections::HashMap::new();
        if let Some(reason) = &choice.finish_reason {
            metadata.insert("finish_reason".to_string(), serde_json::json!(reason));
        }

        Ok(LlmResponse {
            content: choice.message.content,
            model: parsed.model,
            usage: LlmUsage {
                input_tokens: parsed.usage.prompt_tokens,
                output_tokens: parsed.usage.completion_tokens,
            },
            metadata,
        })
    }

    fn name(&self) -> &str {
        "openai"
    }
}

/// OpenAI embeddings provider.
pub struct OpenAIEmbeddings {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

impl OpenAIEmbeddings {
    /// Creates an embeddings provider.
    pub fn new(api_key: String, model: impl Into<String>) -> Self {
        Self::with_base_url(api_key, "https://api.openai.com/v1".to_string(), model)
    }

    /// Creates an embeddings provider with a custom base URL.
    pub fn with_base_url(api_key: String, base_url: String, model: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key,
            base_url,
            model: model.into(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbeddings {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, CapabilityError> {
        let request = EmbeddingsRequest {
            model: self.model.clone(),
            input: texts,
        };
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(OpenAIProvider::convert_reqwest_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("Failed to read response body"));
        if !status.is_success() {
            return Err(OpenAIProvider::parse_error(status, &body));
        }

        let parsed: EmbeddingsResponse =
            serde_json::from_str(&body).map_err(|e| CapabilityError::Provider {
                code: "MALFORMED_RESPONSE".to_string(),
                message: e.to_string(),
            })?;
        Ok(parsed.data.into_iter().map(|row| row.embedding).collect())
    }

    fn name(&self) -> &str {
        "openai"
    }
}
