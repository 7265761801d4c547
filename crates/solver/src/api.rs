use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::compress::{payload_size, EncodedImage};
use crate::config::{ApiConfig, Provider};
use crate::error::TransportError;
use crate::local::LocalTransport;
use crate::sse::SseParser;

const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Prompt plus images, in that order, as a single user turn.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub prompt: String,
    pub images: Vec<EncodedImage>,
}

/// Raw events from a streaming transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Data(String),
    /// The reply finished normally.
    End,
    Error(String),
    /// The connection went away without an end marker.
    Close,
}

pub type EventStream = BoxStream<'static, TransportEvent>;

/// A model backend. Dropping a returned [`EventStream`] releases the
/// underlying connection.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn generate(&self, request: &ModelRequest) -> Result<String, TransportError>;

    async fn stream(&self, request: &ModelRequest) -> Result<EventStream, TransportError>;
}

/// Build the configured transport. Gemini needs a credential; `None` means the
/// driver is not configured.
pub fn build_transport(
    api: &ApiConfig,
    credential: Option<String>,
) -> Option<Arc<dyn ModelTransport>> {
    match api.provider {
        Provider::Gemini => {
            let key = credential?;
            Some(Arc::new(GeminiTransport::new(key, api)))
        }
        Provider::Local => Some(Arc::new(LocalTransport::new(api))),
    }
}

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

// --- Gemini API request structs ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
}

impl GeminiRequest {
    fn new(request: &ModelRequest, max_tokens: u32) -> Self {
        let mut parts = Vec::with_capacity(request.images.len() + 1);
        parts.push(Part::Text {
            text: request.prompt.clone(),
        });
        parts.extend(request.images.iter().map(|image| Part::InlineData {
            inline_data: InlineData {
                mime_type: image.mime.to_string(),
                data: image.data.clone(),
            },
        }));

        Self {
            contents: vec![Content { role: "user", parts }],
            generation_config: GenerationConfig {
                max_output_tokens: max_tokens,
            },
        }
    }
}

// --- Gemini API response structs ---

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

impl GeminiResponse {
    fn text(self) -> String {
        self.candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("")
    }
}

pub struct GeminiTransport {
    client: reqwest::Client,
    key: String,
    model: String,
    max_tokens: u32,
    request_timeout: Duration,
}

impl std::fmt::Debug for GeminiTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiTransport")
            .field("key", &"[REDACTED]")
            .field("model", &self.model)
            .finish()
    }
}

impl GeminiTransport {
    pub fn new(key: String, api: &ApiConfig) -> Self {
        Self {
            client: http_client(),
            key,
            model: api.model.clone(),
            max_tokens: api.max_tokens,
            request_timeout: Duration::from_secs(api.request_timeout_secs),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{GEMINI_ENDPOINT}/{}:{method}", self.model)
    }

    async fn post(
        &self,
        url: &str,
        request: &ModelRequest,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, TransportError> {
        let body = GeminiRequest::new(request, self.max_tokens);
        debug!(
            images = request.images.len(),
            payload_bytes = payload_size(&request.images),
            "Sending Gemini request"
        );

        let mut builder = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.key)
            .header("content-type", "application/json")
            .json(&body);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(TransportError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status.as_u16(), &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelTransport for GeminiTransport {
    async fn generate(&self, request: &ModelRequest) -> Result<String, TransportError> {
        let response = self
            .post(&self.url("generateContent"), request, Some(self.request_timeout))
            .await?;

        let body: GeminiResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;

        let text = body.text();
        if text.is_empty() {
            Err(TransportError::EmptyResponse)
        } else {
            Ok(text)
        }
    }

    async fn stream(&self, request: &ModelRequest) -> Result<EventStream, TransportError> {
        // No overall timeout here: the exchange driver owns the stream deadline.
        let response = self
            .post(&self.url("streamGenerateContent?alt=sse"), request, None)
            .await?;

        let state = StreamState {
            bytes: response.bytes_stream().boxed(),
            decoder: SseTextDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        };

        Ok(stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }
                if state.done {
                    return None;
                }
                match state.bytes.next().await {
                    Some(Ok(chunk)) => state
                        .pending
                        .extend(state.decoder.push(&chunk).into_iter().map(TransportEvent::Data)),
                    Some(Err(e)) => {
                        state.pending.push_back(TransportEvent::Error(e.to_string()));
                        state.done = true;
                    }
                    None => {
                        state
                            .pending
                            .extend(state.decoder.finish().into_iter().map(TransportEvent::Data));
                        state.pending.push_back(TransportEvent::End);
                        state.done = true;
                    }
                }
            }
        })
        .boxed())
    }
}

struct StreamState {
    bytes: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    decoder: SseTextDecoder,
    pending: VecDeque<TransportEvent>,
    done: bool,
}

/// Turns raw SSE bytes from `streamGenerateContent` into text deltas.
#[derive(Debug, Default)]
pub(crate) struct SseTextDecoder {
    parser: SseParser,
    /// Trailing bytes of a UTF-8 sequence split across network chunks.
    partial: Vec<u8>,
}

impl SseTextDecoder {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.partial) {
            Ok(s) => s.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            // Invalid bytes, not just a split sequence: decode lossily.
            Err(_) => self.partial.len(),
        };
        let bytes: Vec<u8> = self.partial.drain(..valid).collect();
        let text = String::from_utf8_lossy(&bytes);

        self.parser
            .feed(&text)
            .into_iter()
            .filter_map(|event| decode_delta(&event.data))
            .collect()
    }

    pub(crate) fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            out.extend(
                self.parser
                    .feed(&String::from_utf8_lossy(&rest))
                    .into_iter()
                    .filter_map(|event| decode_delta(&event.data)),
            );
        }
        out.extend(self.parser.finish().and_then(|event| decode_delta(&event.data)));
        out
    }
}

fn decode_delta(data: &str) -> Option<String> {
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<GeminiResponse>(data) {
        Ok(response) => Some(response.text()).filter(|t| !t.is_empty()),
        Err(e) => {
            warn!("Failed to parse Gemini SSE event: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ImageId;

    #[test]
    fn request_puts_prompt_before_images() {
        let request = ModelRequest {
            prompt: "solve".into(),
            images: vec![EncodedImage {
                id: ImageId(1),
                mime: "image/jpeg",
                data: "QUJD".into(),
            }],
        };
        let json = serde_json::to_value(GeminiRequest::new(&request, 256)).unwrap();

        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][0]["parts"][0]["text"], "solve");
        assert_eq!(
            json["contents"][0]["parts"][1]["inline_data"]["mimeType"],
            "image/jpeg"
        );
        assert_eq!(json["contents"][0]["parts"][1]["inline_data"]["data"], "QUJD");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 256);
    }

    #[test]
    fn response_text_joins_parts() {
        let body: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"{\"code\":"},{"text":"\"x\"}"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(body.text(), r#"{"code":"x"}"#);
    }

    #[test]
    fn response_without_content_is_empty() {
        let body: GeminiResponse =
            serde_json::from_str(r#"{"candidates":[{"finishReason":"SAFETY"}]}"#).unwrap();
        assert_eq!(body.text(), "");
    }

    #[test]
    fn decoder_yields_deltas_in_order() {
        let mut decoder = SseTextDecoder::default();
        let first = r#"data: {"candidates":[{"content":{"parts":[{"text":"Hel"}]}}]}"#;
        let second = r#"data: {"candidates":[{"content":{"parts":[{"text":"lo"}]}}]}"#;

        let mut out = decoder.push(format!("{first}\n\n{}", &second[..10]).as_bytes());
        out.extend(decoder.push(format!("{}\n\n", &second[10..]).as_bytes()));
        assert_eq!(out, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[test]
    fn decoder_keeps_deltas_when_crlf_delimiter_is_split() {
        let mut decoder = SseTextDecoder::default();
        let first = r#"data: {"candidates":[{"content":{"parts":[{"text":"Hel"}]}}]}"#;
        let second = r#"data: {"candidates":[{"content":{"parts":[{"text":"lo"}]}}]}"#;

        let mut out = decoder.push(format!("{first}\r\n\r").as_bytes());
        out.extend(decoder.push(b"\n"));
        out.extend(decoder.push(format!("{second}\r\n\r\n").as_bytes()));
        assert_eq!(out, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[test]
    fn decoder_handles_split_utf8() {
        let mut decoder = SseTextDecoder::default();
        let event = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"é\"}]}}]}\n\n";
        let bytes = event.as_bytes();
        let split = event.find('é').unwrap() + 1;

        let mut out = decoder.push(&bytes[..split]);
        out.extend(decoder.push(&bytes[split..]));
        assert_eq!(out, vec!["é".to_string()]);
    }

    #[test]
    fn decoder_flushes_unterminated_tail() {
        let mut decoder = SseTextDecoder::default();
        let out = decoder.push(br#"data: {"candidates":[{"content":{"parts":[{"text":"end"}]}}]}"#);
        assert!(out.is_empty());
        assert_eq!(decoder.finish(), vec!["end".to_string()]);
    }

    #[test]
    fn gemini_requires_a_credential() {
        let api = ApiConfig::default();
        assert!(build_transport(&api, None).is_none());
        assert!(build_transport(&api, Some("key".into())).is_some());

        let local = ApiConfig {
            provider: Provider::Local,
            ..ApiConfig::default()
        };
        assert!(build_transport(&local, None).is_some());
    }
}
