//! OpenAI-compatible chat completions client for the in-process backend.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};

use super::sdk::{ModelClient, ModelDelta, ModelRequest};
use crate::config::{ApiKeyPool, RelayConfig};
use crate::error::{RelayError, Result};
use crate::types::ToolCall;

static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// Get (or create) the shared reqwest client.
pub fn shared_client() -> reqwest::Client {
    SHARED_CLIENT
        .get_or_init(|| {
            reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(30))
                .pool_max_idle_per_host(10)
                .build()
                .unwrap_or_default()
        })
        .clone()
}

/// Build default headers for a Bearer-token API.
pub fn bearer_headers(api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(val) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
        headers.insert(AUTHORIZATION, val);
    }
    headers
}

/// Parse an SSE "data:" line, returning None for "[DONE]".
pub fn parse_sse_data(line: &str) -> Option<&str> {
    let data = line
        .strip_prefix("data:")
        .map(str::trim_start)?;
    if data == "[DONE]" {
        return None;
    }
    Some(data)
}

/// Map an HTTP failure onto the crate error.
pub fn status_to_error(status: u16, body: &str) -> RelayError {
    match status {
        401 | 403 => RelayError::Authentication(body.to_string()),
        429 => RelayError::RateLimited {
            retry_after_ms: extract_retry_after(body),
        },
        _ => RelayError::api(status, body),
    }
}

fn extract_retry_after(body: &str) -> Option<u64> {
    serde_json::from_str::<Value>(body).ok().and_then(|v| {
        v.get("error")
            .and_then(|e| e.get("retry_after"))
            .and_then(Value::as_f64)
            .map(|s| (s * 1000.0) as u64)
    })
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<ChoiceDelta>,
    /// Present on non-streaming completions.
    #[serde(default)]
    message: Option<ChoiceDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChoiceDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
    #[serde(default)]
    images: Vec<ImageDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageDelta {
    #[serde(default)]
    image_url: Option<ImageUrl>,
}

#[derive(Debug, Deserialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental state of one streamed completion.
#[derive(Debug, Default)]
pub struct CompletionAccumulator {
    tool_calls: BTreeMap<usize, PartialToolCall>,
    produced: bool,
    finished: bool,
}

impl CompletionAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one JSON chunk (SSE data or a full completion body).
    pub fn push_json(&mut self, data: &str) -> Vec<ModelDelta> {
        let chunk = match serde_json::from_str::<StreamChunk>(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unparseable stream chunk");
                return Vec::new();
            }
        };
        let mut deltas = Vec::new();
        for choice in chunk.choices {
            if let Some(delta) = choice.delta.or(choice.message) {
                self.apply_delta(delta, &mut deltas);
            }
            if let Some(reason) = choice.finish_reason {
                deltas.extend(self.drain_tool_calls());
                self.finished = true;
                deltas.push(ModelDelta::Done {
                    finish_reason: Some(reason),
                });
            }
        }
        deltas
    }

    /// End of body. A stream with no output and no finish reason is invalid.
    pub fn finish(&mut self) -> Result<Vec<ModelDelta>> {
        let deltas = self.drain_tool_calls();
        if !self.produced && !self.finished {
            return Err(RelayError::InvalidStream(
                "response ended without content or finish reason".to_string(),
            ));
        }
        Ok(deltas)
    }

    fn apply_delta(&mut self, delta: ChoiceDelta, out: &mut Vec<ModelDelta>) {
        if let Some(text) = delta.reasoning_content.filter(|t| !t.is_empty()) {
            self.produced = true;
            out.push(ModelDelta::Reasoning(text));
        }
        if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
            self.produced = true;
            out.push(ModelDelta::Text(text));
        }
        for (position, call) in delta.tool_calls.into_iter().enumerate() {
            self.produced = true;
            let entry = self
                .tool_calls
                .entry(call.index.unwrap_or(position))
                .or_default();
            if let Some(id) = call.id.filter(|id| !id.is_empty()) {
                entry.id = id;
            }
            if let Some(function) = call.function {
                if let Some(name) = function.name {
                    entry.name.push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    entry.arguments.push_str(&arguments);
                }
            }
        }
        for image in delta.images {
            let Some(url) = image.image_url.map(|u| u.url) else {
                continue;
            };
            match decode_data_url(&url) {
                Some((mime_type, data)) => {
                    self.produced = true;
                    out.push(ModelDelta::InlineData { mime_type, data });
                }
                None => tracing::debug!("Ignoring non-data image url"),
            }
        }
    }

    fn drain_tool_calls(&mut self) -> Vec<ModelDelta> {
        std::mem::take(&mut self.tool_calls)
            .into_values()
            .filter(|call| !call.name.is_empty())
            .map(|call| {
                let arguments = if call.arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&call.arguments)
                        .unwrap_or_else(|_| json!({ "input": call.arguments }))
                };
                let id = if call.id.is_empty() {
                    format!("call_{}", uuid::Uuid::new_v4().simple())
                } else {
                    call.id
                };
                ModelDelta::ToolCall(ToolCall::new(id, call.name, arguments))
            })
            .collect()
    }
}

fn decode_data_url(url: &str) -> Option<(String, Vec<u8>)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    let mime_type = meta.strip_suffix(";base64")?;
    let data = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .ok()?;
    Some((mime_type.to_string(), data))
}

/// Streaming client for `{base_url}/chat/completions`.
pub struct OpenAiClient {
    base_url: String,
    model: String,
    keys: ApiKeyPool,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, keys: ApiKeyPool) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            keys,
            http: shared_client(),
        }
    }

    /// Build from settings. Missing credentials fail here.
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let keys = config.api_key_pool();
        if keys.is_empty() {
            return Err(RelayError::Bootstrap(
                "no API key configured (AGENT_RELAY_API_KEYS)".to_string(),
            ));
        }
        Ok(Self::new(&config.base_url, &config.model, keys))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Model ids served by the endpoint.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let key = self.keys.current().unwrap_or_default();
        let resp = self
            .http
            .get(format!("{}/models", self.base_url))
            .headers(bearer_headers(key))
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_to_error(status, &body));
        }
        let body: Value = resp.json().await?;
        Ok(body
            .get("data")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn request_body(&self, request: &ModelRequest, api_key: &str) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": request.messages,
            "stream": true,
            "conversation_id": request.conversation_id,
            "api_key": api_key,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        body
    }

    /// POST with key rotation on credential failures.
    async fn post(&self, request: &ModelRequest) -> Result<reqwest::Response> {
        let mut remaining = self.keys.len().max(1);
        loop {
            let key = self.keys.current().unwrap_or_default().to_string();
            let resp = self
                .http
                .post(format!("{}/chat/completions", self.base_url))
                .headers(bearer_headers(&key))
                .json(&self.request_body(request, &key))
                .send()
                .await?;
            let status = resp.status().as_u16();
            if resp.status().is_success() {
                return Ok(resp);
            }
            let body = resp.text().await.unwrap_or_default();
            let error = status_to_error(status, &body);
            remaining -= 1;
            if error.is_credential_failure() && remaining > 0 && self.keys.rotate().is_some() {
                tracing::warn!(status, remaining, "Credential rejected, rotating API key");
                continue;
            }
            return Err(error);
        }
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn stream(
        &self,
        request: ModelRequest,
    ) -> Result<BoxStream<'static, Result<ModelDelta>>> {
        let resp = self.post(&request).await?;
        let is_sse = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("text/event-stream"))
            .unwrap_or(false);

        if !is_sse {
            let body = resp.text().await?;
            let mut acc = CompletionAccumulator::new();
            let mut deltas = acc.push_json(&body);
            let tail = acc.finish();
            let items: Vec<Result<ModelDelta>> = match tail {
                Ok(rest) => {
                    deltas.extend(rest);
                    deltas.into_iter().map(Ok).collect()
                }
                Err(e) => vec![Err(e)],
            };
            return Ok(futures::stream::iter(items).boxed());
        }

        let byte_stream = resp.bytes_stream();
        let stream = async_stream::stream! {
            let mut buffer = String::new();
            let mut acc = CompletionAccumulator::new();
            futures::pin_mut!(byte_stream);

            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(RelayError::Network(e));
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer.drain(..=line_end);

                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }
                    if let Some(data) = parse_sse_data(&line) {
                        for delta in acc.push_json(data) {
                            yield Ok(delta);
                        }
                    }
                }
            }

            match acc.finish() {
                Ok(rest) => {
                    for delta in rest {
                        yield Ok(delta);
                    }
                }
                Err(e) => yield Err(e),
            }
        };

        Ok(Box::pin(stream))
    }
}
