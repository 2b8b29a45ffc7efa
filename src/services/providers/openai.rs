/// OpenAI-compatible model providers
///
/// Embeddings: POST {api_url}/embeddings
/// Chat:       POST {api_url}/chat/completions
///
/// Every failure is tagged transient or fatal from the HTTP status (or the
/// kind of transport error) so callers can decide between retrying,
/// degrading and surfacing the error.
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    error::{AppError, AppResult, FailureKind},
    services::providers::{EmbeddingModel, GenerationModel, Prompt},
};

/// Rate limits, timeouts, conflicts and upstream errors are worth repeating
pub fn classify_status(status: StatusCode) -> FailureKind {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_MANY_REQUESTS => {
            FailureKind::Transient
        }
        s if s.is_server_error() => FailureKind::Transient,
        _ => FailureKind::Fatal,
    }
}

fn classify_transport_error(error: &reqwest::Error) -> FailureKind {
    if error.is_builder() {
        FailureKind::Fatal
    } else {
        FailureKind::Transient
    }
}

fn build_http_client(timeout: Duration) -> AppResult<HttpClient> {
    HttpClient::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))
}

// ============================================================================
// Embeddings
// ============================================================================

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// Puts response rows back in request order and checks the count
fn vectors_from_response(response: EmbeddingResponse, expected: usize) -> AppResult<Vec<Vec<f32>>> {
    let mut data = response.data;
    if data.len() != expected {
        return Err(AppError::embedding(
            FailureKind::Fatal,
            format!(
                "Response data count mismatch: expected {}, got {}",
                expected,
                data.len()
            ),
        ));
    }

    data.sort_by_key(|datum| datum.index);
    if data.iter().enumerate().any(|(i, datum)| datum.index != i) {
        return Err(AppError::embedding(
            FailureKind::Fatal,
            "Response indices do not cover the request".to_string(),
        ));
    }

    Ok(data.into_iter().map(|datum| datum.embedding).collect())
}

#[derive(Clone)]
pub struct OpenAiEmbeddings {
    http_client: HttpClient,
    api_key: String,
    api_url: String,
    model: String,
}

impl OpenAiEmbeddings {
    pub fn new(api_key: String, api_url: String, model: String, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            http_client: build_http_client(timeout)?,
            api_key: api_key.trim().to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
            model,
        })
    }
}

#[async_trait::async_trait]
impl EmbeddingModel for OpenAiEmbeddings {
    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.api_url);
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            encoding_format: "float",
        };

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                AppError::embedding(
                    classify_transport_error(&e),
                    format!("Embedding request failed: {}", e),
                )
            })?;

        let status = response.status();
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            return Err(AppError::PayloadTooLarge(format!(
                "{} texts rejected by the embedding service",
                texts.len()
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::embedding(
                classify_status(status),
                format!("Embedding API returned status {}: {}", status, body),
            ));
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|e| {
            AppError::embedding(
                FailureKind::Fatal,
                format!("Failed to parse embedding response: {}", e),
            )
        })?;

        let vectors = vectors_from_response(parsed, texts.len())?;

        tracing::debug!(
            texts = texts.len(),
            model = %self.model,
            provider = "openai",
            "Embedding batch completed"
        );

        Ok(vectors)
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

// ============================================================================
// Chat completions
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
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

/// Text of the first choice; an empty answer is left for the parser to reject
fn content_from_response(response: ChatResponse) -> String {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct OpenAiChat {
    http_client: HttpClient,
    api_key: String,
    api_url: String,
    model: String,
    temperature: f32,
}

impl OpenAiChat {
    pub fn new(
        api_key: String,
        api_url: String,
        model: String,
        temperature: f32,
        timeout: Duration,
    ) -> AppResult<Self> {
        Ok(Self {
            http_client: build_http_client(timeout)?,
            api_key: api_key.trim().to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
            model,
            temperature,
        })
    }
}

#[async_trait::async_trait]
impl GenerationModel for OpenAiChat {
    async fn generate(&self, prompt: &Prompt) -> AppResult<String> {
        let url = format!("{}/chat/completions", self.api_url);
        let request = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
        };

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                AppError::generation(
                    classify_transport_error(&e),
                    format!("Generation request failed: {}", e),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::generation(
                classify_status(status),
                format!("Chat API returned status {}: {}", status, body),
            ));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            AppError::generation(
                FailureKind::Transient,
                format!("Failed to read chat response: {}", e),
            )
        })?;

        let content = content_from_response(parsed);
        tracing::debug!(
            model = %self.model,
            provider = "openai",
            chars = content.len(),
            "Chat completion received"
        );

        Ok(content)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
