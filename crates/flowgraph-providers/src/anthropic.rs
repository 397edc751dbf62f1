// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Anthropic (Claude) provider implementation.

use async_trait::async_trait;
use flowgraph_core::ports::{ChatMessage, LlmProvider, LlmRequest, LlmResponse, LlmUsage};
use flowgraph_sandbox::CapabilityError;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Anthropic API provider.
pub struct AnthropicProvider {
    /// HTTP client.
    client: Client,
    /// API key.
    api_key: String,
    /// API base URL.
    base_url: String,
    /// Default API version.
    api_version: String,
}

/// Anthropic messages request.
#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

/// Message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

/// Anthropic messages response.
#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: String,
    content: Vec<ContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: Usage,
}

/// Content block in response.
#[derive(Debug, Deserialize)]
struct ContentBlock {
    text: String,
}

/// Token usage information.
#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

/// Anthropic error response.
#[derive(Debug, Deserialize)]
struct AnthropicErrorResponse {
    error: AnthropicError,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

impl AnthropicProvider {
    /// Converts a reqwest error to a capability error.
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

    /// Creates a new Anthropic provider.
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(
            api_key,
            "https://api.anthropic.com/v1".to_string(),
            "2023-06-01".to_string(),
        )
    }

    /// Creates a provider with a custom base URL and API version.
    pub fn with_base_url(api_key: String, base_url: String, api_version: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key,
            base_url,
            api_version,
        }
    }

    /// Creates a provider from the `ANTHROPIC_API_KEY` environment
    /// variable.
    pub fn from_env() -> Result<Self, CapabilityError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
            CapabilityError::Invalid {
                message: "ANTHROPIC_API_KEY environment variable not set".to_string(),
            }
        })?;
        Ok(Self::new(api_key))
    }

    /// Converts an engine request to Anthropic format.
    fn to_anthropic_request(&self, request: &LlmRequest) -> MessagesRequest {
        let messages = request
            .messages
            .iter()
            .map(|m| Message {
                role: m.role.clone(),
                content: m.content.clone(),
            })
            .collect();

        let top_p = request
            .extra
            .get("top_p")
            .and_then(|v| v.as_f64())
            .map(|f| f as f32);

        let stop_sequences = request
            .extra
            .get("stop_sequences")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            });

        MessagesRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(1024),
            system: request.system.clone(),
            temperature: request.temperature,
            top_p,
            stop_sequences,
        }
    }

    /// Parses an error response from Anthropic.
    fn parse_error(&self, status: StatusCode, body: &str) -> CapabilityError {
        if let Ok(error_response) = serde_json::from_str::<AnthropicErrorResponse>(body) {
            let error = error_response.error;

            if status == StatusCode::TOO_MANY_REQUESTS || error.error_type == "rate_limit_error" {
                return CapabilityError::HttpStatus {
                    status: 429,
                    message: error.message,
                };
            }

            return CapabilityError::Provider {
                code: error.error_type.to_ascii_uppercase(),
                message: error.message,
            };
        }

        CapabilityError::HttpStatus {
            status: status.as_u16(),
            message: body.to_string(),
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse, CapabilityError> {
        let anthropic_request = self.to_anthropic_request(&request);

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .header("Content-Type", "application/json")
            .json(&anthropic_request)
            .send()
            .await
            .map_err(Self::convert_reqwest_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("Failed to read response body"));

        if !status.is_success() {
            return Err(self.parse_error(status, &body));
        }

        let messages_response: MessagesResponse =
            serde_json::from_str(&body).map_err(|e| CapabilityError::Provider {
                code: "MALFORMED_RESPONSE".to_string(),
                message: e.to_string(),
            })?;

        let content = messages_response
            .content
            .iter()
            .map(|block| block.text.clone())
            .collect::<Vec<_>>()
            .join("");

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("id".to_string(), serde_json::json!(messages_response.id));
        if let Some(stop_reason) = &messages_response.stop_reason {
            metadata.insert("stop_reason".to_string(), serde_json::json!(stop_reason));
        }

        Ok(LlmResponse {
            content,
            model: messages_response.model,
            usage: LlmUsage {
                input_tokens: messages_response.usage.input_tokens,
                output_tokens: messages_response.usage.output_tokens,
            },
            metadata,
        })
    }

    fn name(&self) -> &str {
        "anthropic"
    }

    async fn health_check(&self) -> Result<(), CapabilityError> {
        // No dedicated health endpoint; a minimal completion stands in.
        let request = LlmRequest {
            model: "claude-3-haiku-20240307".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "Hi".to_string(),
            }],
            system: None,
            temperature: None,
            max_tokens: Some(5),
            extra: std::collections::HashMap::new(),
        };
        self.chat(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn request(prompt: &str) -> LlmRequest {
        LlmRequest {
            model: "claude-3-opus-20240229".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            system: Some("You are a helpful assistant".to_string()),
            temperature: Some(0.7),
            max_tokens: Some(100),
            extra: HashMap::new(),
        }
    }

    #[test]
    fn test_provider_creation() {
        let provider = AnthropicProvider::new("test-key".to_string());
        assert_eq!(provider.name(), "anthropic");
        assert_eq!(provider.base_url, "https://api.anthropic.com/v1");
    }

    #[test]
    fn test_to_anthropic_request() {
        let provider = AnthropicProvider::new("test-key".to_string());
        let anthropic_req = provider.to_anthropic_request(&request("Hello, world!"));

        assert_eq!(anthropic_req.model, "claude-3-opus-20240229");
        assert_eq!(anthropic_req.messages.len(), 1);
        assert_eq!(anthropic_req.messages[0].role, "user");
        assert_eq!(anthropic_req.messages[0].content, "Hello, world!");
        assert_eq!(
            anthropic_req.system,
            Some("You are a helpful assistant".to_string())
        );
        assert_eq!(anthropic_req.temperature, Some(0.7));
        assert_eq!(anthropic_req.max_tokens, 100);
    }

    #[test]
    fn test_parse_rate_limit_error() {
        let provider = AnthropicProvider::new("test-key".to_string());
        let error_json = r#"{
            "error": { "type": "rate_limit_error", "message": "Rate limit exceeded" }
        }"#;
        let error = provider.parse_error(StatusCode::TOO_MANY_REQUESTS, error_json);
        match error {
            CapabilityError::HttpStatus { status, .. } => assert_eq!(status, 429),
            other => panic!("expected 429 classification, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_provider_error() {
        let provider = AnthropicProvider::new("test-key".to_string());
        let error_json = r#"{
            "error": { "type": "invalid_request_error", "message": "Missing required field" }
        }"#;
        let error = provider.parse_error(StatusCode::BAD_REQUEST, error_json);
        match error {
            CapabilityError::Provider { code, message } => {
                assert_eq!(code, "INVALID_REQUEST_ERROR");
                assert_eq!(message, "Missing required field");
            }
            other => panic!("expected provider error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chat_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/messages")
            .match_header("x-api-key", "test-key")
            .with_status(200)
            .with_body(
                r#"{
                    "id": "msg_1",
                    "content": [{"type": "text", "text": "Hello back"}],
                    "model": "claude-3-opus-20240229",
                    "stop_reason": "end_turn",
                    "usage": {"input_tokens": 12, "output_tokens": 4}
                }"#,
            )
            .create_async()
            .await;

        let provider = AnthropicProvider::with_base_url(
            "test-key".to_string(),
            server.url(),
            "2023-06-01".to_string(),
        );
        let response = provider.chat(request("Hello")).await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.content, "Hello back");
        assert_eq!(response.usage.input_tokens, 12);
        assert_eq!(response.usage.output_tokens, 4);
    }
}
