//! OpenRouter chat-completions adapter with Server-Sent Events streaming.
//!
//! The response body is read chunk by chunk on a spawned task. Complete
//! `data:` lines are parsed into [`LlmEvent`]s and pushed through a bounded
//! channel; the task drops its sender when the body ends or `[DONE]` arrives,
//! which ends the stream on the consumer side.

use super::retry::{RetryConfig, retry_with_backoff};
use super::{LlmClient, LlmEvent, LlmFuture, LlmStream, ProviderSettings};
use crate::{Message, MessageRole, TokenUsage, ToolCall, ToolDef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Capacity of the event channel between the reader task and the consumer.
const STREAM_CHANNEL_CAPACITY: usize = 64;

// ── Wire types ─────────────────────────────────────────────────────

/// Borrowed view of a [`Message`] without runtime bookkeeping fields.
#[derive(Serialize)]
struct WireMessage<'a> {
    role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<&'a [ToolCall]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

impl<'a> From<&'a Message> for WireMessage<'a> {
    fn from(m: &'a Message) -> Self {
        Self {
            role: m.role,
            content: m.content.as_deref(),
            tool_calls: m.tool_calls.as_deref(),
            tool_call_id: m.tool_call_id.as_deref(),
        }
    }
}

#[derive(Serialize)]
struct StreamRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDef]>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
    usage: Option<WireUsage>,
    error: Option<WireError>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Deserialize, Debug)]
struct StreamToolCallDelta {
    index: Option<usize>,
    id: Option<String>,
    function: Option<StreamFunctionDelta>,
}

#[derive(Deserialize, Debug)]
struct StreamFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize, Debug)]
struct WireUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Deserialize, Debug)]
struct PromptTokensDetails {
    cached_tokens: Option<u64>,
}

#[derive(Deserialize, Debug)]
struct WireError {
    message: String,
}

impl From<WireUsage> for TokenUsage {
    fn from(u: WireUsage) -> Self {
        TokenUsage {
            prompt_tokens: u.prompt_tokens.unwrap_or(0),
            completion_tokens: u.completion_tokens.unwrap_or(0),
            cached_tokens: u
                .prompt_tokens_details
                .and_then(|d| d.cached_tokens)
                .unwrap_or(0),
        }
    }
}

// ── SSE parser ─────────────────────────────────────────────────────

#[derive(Default, Debug)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Incremental SSE parser.
///
/// Text deltas are emitted as soon as their line is complete. Tool calls
/// arrive as fragments keyed by index and are emitted whole by
/// [`SseParser::finish`], followed by the usage record.
#[derive(Default, Debug)]
pub(crate) struct SseParser {
    buffer: Vec<u8>,
    tool_calls: BTreeMap<usize, PartialToolCall>,
    usage: Option<TokenUsage>,
    done: bool,
}

impl SseParser {
    /// Feed raw body bytes; returns events from every completed line.
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Vec<LlmEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while !self.done
            && let Some(pos) = self.buffer.iter().position(|b| *b == b'\n')
        {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.parse_line(&String::from_utf8_lossy(&line), &mut events);
        }
        events
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    /// Flush any trailing line and emit assembled tool calls plus usage.
    pub(crate) fn finish(mut self) -> Vec<LlmEvent> {
        let mut events = Vec::new();
        if !self.done && !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.parse_line(&String::from_utf8_lossy(&rest), &mut events);
        }
        for (index, partial) in std::mem::take(&mut self.tool_calls) {
            let id = partial.id.unwrap_or_else(|| format!("call_{index}"));
            events.push(LlmEvent::ToolCallComplete(ToolCall::new(
                id,
                partial.name,
                partial.arguments,
            )));
        }
        events.push(LlmEvent::MessageComplete(self.usage.unwrap_or_default()));
        events
    }

    fn parse_line(&mut self, line: &str, events: &mut Vec<LlmEvent>) {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
            return;
        };
        if data == "[DONE]" {
            self.done = true;
            return;
        }
        let chunk = match serde_json::from_str::<StreamChunk>(data) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to parse SSE chunk: {e}; data: {data}");
                return;
            }
        };
        if let Some(err) = chunk.error {
            events.push(LlmEvent::Error(format!("OpenRouter stream error: {}", err.message)));
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.into());
        }
        for choice in chunk.choices.into_iter().flatten() {
            if let Some(delta) = choice.delta {
                if let Some(content) = delta.content
                    && !content.is_empty()
                {
                    events.push(LlmEvent::TextDelta(content));
                }
                for tc in delta.tool_calls.into_iter().flatten() {
                    let entry = self.tool_calls.entry(tc.index.unwrap_or(0)).or_default();
                    if let Some(id) = tc.id {
                        entry.id = Some(id);
                    }
                    if let Some(func) = tc.function {
                        if let Some(name) = func.name {
                            entry.name.push_str(&name);
                        }
                        if let Some(args) = func.arguments {
                            entry.arguments.push_str(&args);
                        }
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                trace!("Stream finish_reason: {reason}");
            }
        }
    }
}

// ── Client ─────────────────────────────────────────────────────────

/// Streaming client for the OpenRouter chat-completions API.
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    url: String,
    max_tokens: u32,
    temperature: f32,
    retry: RetryConfig,
}

impl OpenRouterClient {
    pub fn new(settings: &ProviderSettings) -> Result<Self, String> {
        // No whole-body timeout: long tool-call streams are read chunk by chunk.
        let client = reqwest::Client::builder()
            .user_agent(concat!("autopilot/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| OPENROUTER_URL.to_string()),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            retry: settings.retry.clone(),
        })
    }

    async fn open(&self, body: &serde_json::Value) -> Result<reqwest::Response, String> {
        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("X-Title", "autopilot")
            .json(body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(format!("OpenRouter API HTTP {status}: {text}"));
        }
        Ok(resp)
    }
}

/// Read the response body, forwarding parsed events until done.
async fn pump(mut resp: reqwest::Response, tx: mpsc::Sender<LlmEvent>) {
    let mut parser = SseParser::default();
    loop {
        match resp.chunk().await {
            Ok(Some(bytes)) => {
                for event in parser.feed(&bytes) {
                    if tx.send(event).await.is_err() {
                        debug!("Stream consumer dropped; stopping reader");
                        return;
                    }
                }
                if parser.is_done() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx
                    .send(LlmEvent::Error(format!("Failed to read stream chunk: {e}")))
                    .await;
                break;
            }
        }
    }
    for event in parser.finish() {
        if tx.send(event).await.is_err() {
            return;
        }
    }
}

impl LlmClient for OpenRouterClient {
    fn chat_completion<'a>(
        &'a self,
        messages: &'a [Message],
        tools: Option<&'a [ToolDef]>,
    ) -> LlmFuture<'a> {
        Box::pin(async move {
            let request = StreamRequest {
                model: &self.model,
                messages: messages.iter().map(WireMessage::from).collect(),
                tools: tools.filter(|t| !t.is_empty()),
                max_tokens: self.max_tokens,
                temperature: self.temperature,
                stream: true,
                stream_options: StreamOptions {
                    include_usage: true,
                },
            };
            let body = serde_json::to_value(&request)
                .map_err(|e| format!("Failed to serialize request: {e}"))?;
            debug!(
                "LLM request: model={}, messages={}, tools={}",
                self.model,
                messages.len(),
                tools.map_or(0, |t| t.len())
            );

            let resp = retry_with_backoff(&self.retry, || self.open(&body)).await?;

            let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
            tokio::spawn(pump(resp, tx));
            let stream = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
            Ok(Box::pin(stream) as LlmStream)
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(lines: &[&str]) -> String {
        lines.iter().map(|l| format!("data: {l}\n\n")).collect()
    }

    #[test]
    fn text_deltas_across_split_chunks() {
        let body = sse(&[
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
            "[DONE]",
        ]);
        let (a, b) = body.as_bytes().split_at(20);
        let mut parser = SseParser::default();
        let mut events = parser.feed(a);
        events.extend(parser.feed(b));
        assert!(parser.is_done());
        events.extend(parser.finish());

        assert_eq!(
            events,
            vec![
                LlmEvent::TextDelta("Hel".into()),
                LlmEvent::TextDelta("lo".into()),
                LlmEvent::MessageComplete(TokenUsage::default()),
            ]
        );
    }

    #[test]
    fn tool_call_fragments_assembled_by_index() {
        let body = sse(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"b","function":{"name":"write_file","arguments":"{\"pa"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"a","function":{"name":"read_file","arguments":"{}"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"function":{"arguments":"th\":1}"}}]}}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":30,"completion_tokens":7,"prompt_tokens_details":{"cached_tokens":12}}}"#,
        ]);
        let mut parser = SseParser::default();
        let mut events = parser.feed(body.as_bytes());
        events.extend(parser.finish());

        assert_eq!(
            events,
            vec![
                LlmEvent::ToolCallComplete(ToolCall::new("a", "read_file", "{}")),
                LlmEvent::ToolCallComplete(ToolCall::new("b", "write_file", r#"{"path":1}"#)),
                LlmEvent::MessageComplete(TokenUsage {
                    prompt_tokens: 30,
                    completion_tokens: 7,
                    cached_tokens: 12,
                }),
            ]
        );
    }

    #[test]
    fn error_chunk_and_garbage_do_not_stop_parsing() {
        let body = format!(
            ": keep-alive\n{}data: not json\n{}",
            sse(&[r#"{"error":{"message":"overloaded"}}"#]),
            sse(&[r#"{"choices":[{"delta":{"content":"still here"}}]}"#]),
        );
        let mut parser = SseParser::default();
        let events = parser.feed(body.as_bytes());
        assert_eq!(
            events,
            vec![
                LlmEvent::Error("OpenRouter stream error: overloaded".into()),
                LlmEvent::TextDelta("still here".into()),
            ]
        );
    }

    #[test]
    fn wire_message_drops_bookkeeping_fields() {
        let mut msg = Message::tool_result("c1", "boom");
        msg.is_error = true;
        let json = serde_json::to_value(WireMessage::from(&msg)).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "c1");
        assert!(json.get("is_error").is_none());
        assert!(json.get("timestamp").is_none());
    }
}
