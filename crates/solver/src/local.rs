//! OpenAI-compatible `chat/completions` backend for locally hosted vision
//! models (Ollama, LM Studio).

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::api::{http_client, EventStream, ModelRequest, ModelTransport, TransportEvent};
use crate::config::ApiConfig;
use crate::error::TransportError;

// --- OpenAI-compatible request/response structs ---

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct OaiMessage {
    role: &'static str,
    content: Vec<OaiContentPart>,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum OaiContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatCompletionRequest {
    fn new(model: &str, request: &ModelRequest, max_tokens: u32) -> Self {
        let mut content = Vec::with_capacity(request.images.len() + 1);
        content.push(OaiContentPart::Text {
            text: request.prompt.clone(),
        });
        content.extend(request.images.iter().map(|image| OaiContentPart::ImageUrl {
            image_url: ImageUrl {
                url: format!("data:{};base64,{}", image.mime, image.data),
            },
        }));

        Self {
            model: model.to_string(),
            messages: vec![OaiMessage {
                role: "user",
                content,
            }],
            max_tokens,
            stream: false,
        }
    }
}

#[derive(Debug)]
pub struct LocalTransport {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    max_tokens: u32,
    request_timeout: Duration,
}

impl LocalTransport {
    pub fn new(api: &ApiConfig) -> Self {
        Self {
            client: http_client(),
            endpoint: api.local.endpoint.clone(),
            model: api.local.model.clone(),
            max_tokens: api.max_tokens,
            request_timeout: Duration::from_secs(api.request_timeout_secs),
        }
    }
}

#[async_trait]
impl ModelTransport for LocalTransport {
    async fn generate(&self, request: &ModelRequest) -> Result<String, TransportError> {
        let body = ChatCompletionRequest::new(&self.model, request, self.max_tokens);

        let response = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    TransportError::Unreachable(format!(
                        "Cannot connect to local model at {}. Is Ollama/LM Studio running?",
                        self.endpoint
                    ))
                } else {
                    TransportError::from_reqwest(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status.as_u16(), &body));
        }

        let resp: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;

        resp.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.is_empty())
            .ok_or(TransportError::EmptyResponse)
    }

    /// The whole reply arrives as a single chunk.
    async fn stream(&self, request: &ModelRequest) -> Result<EventStream, TransportError> {
        let text = self.generate(request).await?;
        Ok(stream::iter([TransportEvent::Data(text), TransportEvent::End]).boxed())
    }
}
