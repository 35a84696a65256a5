use crate::error::AppError;
use crate::prompt::{ContentBlock, PromptMessage};
use crate::sse::UpstreamEvent;
use crate::tokens::estimate_tokens;
use axum::response::sse::Event;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};

pub const FINISH_REASON_STOP: &str = "stop";

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// Either a plain string or an array of typed content parts.
    #[serde(default)]
    pub content: Value,
}

/// Splits inbound messages into conversational turns and one merged system
/// text. Part order inside a message is preserved.
pub fn convert_messages(messages: &[ChatMessage]) -> (Vec<PromptMessage>, String) {
    let mut turns = Vec::with_capacity(messages.len());
    let mut system_parts: Vec<String> = Vec::new();

    for message in messages {
        let blocks = content_blocks(&message.content);
        if message.role == "system" || message.role == "developer" {
            let text: String = blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text(text) => Some(text.as_str()),
                    ContentBlock::Image { .. } => None,
                })
                .collect();
            if !text.is_empty() {
                system_parts.push(text);
            }
            continue;
        }
        turns.push(PromptMessage {
            role: message.role.clone(),
            content: blocks,
        });
    }

    (turns, system_parts.join("\n\n"))
}

fn content_blocks(content: &Value) -> Vec<ContentBlock> {
    match content {
        Value::String(text) => vec![ContentBlock::Text(text.clone())],
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.as_object())
            .filter_map(part_to_block)
            .collect(),
        _ => Vec::new(),
    }
}

fn part_to_block(obj: &Map<String, Value>) -> Option<ContentBlock> {
    match obj.get("type")?.as_str()? {
        "text" | "input_text" => Some(ContentBlock::Text(
            obj.get("text")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        )),
        "image_url" => {
            let url = match obj.get("image_url")? {
                Value::String(url) => url.as_str(),
                Value::Object(inner) => inner.get("url")?.as_str()?,
                _ => return None,
            };
            let block = parse_data_url(url);
            if block.is_none() {
                tracing::warn!("skipping image part: only base64 data urls are supported");
            }
            block
        }
        _ => None,
    }
}

/// `data:<media-type>;base64,<payload>` to an image block.
pub fn parse_data_url(url: &str) -> Option<ContentBlock> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64")?;
    if media_type.is_empty() || data.is_empty() {
        return None;
    }
    Some(ContentBlock::Image {
        media_type: media_type.to_string(),
        data: data.to_string(),
    })
}

/// Per-request rendering state.
pub struct StreamSession {
    pub id: String,
    pub model: String,
    pub created: i64,
    pub started_at: Instant,
    pub prompt_tokens: u64,
    completion_tokens: AtomicU64,
}

impl StreamSession {
    pub fn new(model: impl Into<String>, prompt_tokens: u64) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: format!("chatcmpl-{}", now.timestamp_millis()),
            model: model.into(),
            created: now.timestamp(),
            started_at: Instant::now(),
            prompt_tokens,
            completion_tokens: AtomicU64::new(0),
        }
    }

    /// Adds the estimate for one delta and returns it.
    pub fn record_output(&self, text: &str) -> u64 {
        let tokens = estimate_tokens(text);
        self.completion_tokens.fetch_add(tokens, Ordering::SeqCst);
        tokens
    }

    pub fn completion_tokens(&self) -> u64 {
        self.completion_tokens.load(Ordering::SeqCst)
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }]
        })
    }

    pub fn role_chunk(&self) -> Value {
        self.chunk(json!({ "role": "assistant" }), None)
    }

    pub fn delta_chunk(&self, text: &str) -> Value {
        self.chunk(json!({ "content": text }), None)
    }

    pub fn finish_chunk(&self) -> Value {
        self.chunk(json!({}), Some(FINISH_REASON_STOP))
    }

    /// Non-streaming response body. `completion_tokens` is the estimate for
    /// the full text.
    pub fn completion(&self, content: &str) -> Value {
        let completion_tokens = estimate_tokens(content);
        json!({
            "id": self.id,
            "object": "chat.completion",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": FINISH_REASON_STOP
            }],
            "usage": {
                "prompt_tokens": self.prompt_tokens,
                "completion_tokens": completion_tokens,
                "total_tokens": self.prompt_tokens + completion_tokens
            }
        })
    }
}

struct WriterState {
    tx: mpsc::Sender<Event>,
    finished: bool,
}

/// Serializes SSE writes for one response and guards the terminal frame.
///
/// After the first `finish`/`fail` every later write is a no-op, so the
/// finish chunk and `[DONE]` are always the last two frames.
#[derive(Clone)]
pub struct ChunkWriter {
    inner: Arc<Mutex<WriterState>>,
}

impl ChunkWriter {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WriterState {
                tx,
                finished: false,
            })),
        }
    }

    /// False once the stream is terminated or the client has gone.
    pub async fn write(&self, data: &Value) -> bool {
        let state = self.inner.lock().await;
        if state.finished {
            return false;
        }
        state
            .tx
            .send(Event::default().data(data.to_string()))
            .await
            .is_ok()
    }

    /// Writes the finish chunk and `[DONE]`. Returns true only for the call
    /// that actually terminated the stream.
    pub async fn finish(&self, session: &StreamSession) -> bool {
        self.terminate(session, None).await
    }

    /// Like `finish`, preceded by an error frame.
    pub async fn fail(&self, session: &StreamSession, err: &AppError) -> bool {
        self.terminate(session, Some(err)).await
    }

    async fn terminate(&self, session: &StreamSession, err: Option<&AppError>) -> bool {
        let mut state = self.inner.lock().await;
        if state.finished {
            return false;
        }
        state.finished = true;
        if let Some(err) = err {
            let _ = state
                .tx
                .send(Event::default().data(err.to_json().to_string()))
                .await;
        }
        let _ = state
            .tx
            .send(Event::default().data(session.finish_chunk().to_string()))
            .await;
        let _ = state.tx.send(Event::default().data("[DONE]")).await;
        true
    }

    #[cfg(test)]
    pub async fn is_finished(&self) -> bool {
        self.inner.lock().await.finished
    }
}

/// Renders upstream events as chunks until the finish event or the end of
/// the channel.
pub async fn pump_events(
    session: &StreamSession,
    writer: &ChunkWriter,
    rx: &mut mpsc::Receiver<UpstreamEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            UpstreamEvent::TextDelta(text) => {
                if text.is_empty() {
                    continue;
                }
                session.record_output(&text);
                if !writer.write(&session.delta_chunk(&text)).await {
                    return;
                }
            }
            UpstreamEvent::Finish { .. } => {
                writer.finish(session).await;
                return;
            }
            UpstreamEvent::Other { kind } => {
                tracing::trace!(kind = %kind, "ignoring model event");
            }
        }
    }
}

/// Concatenates every text delta until the finish event.
pub async fn collect_text(rx: &mut mpsc::Receiver<UpstreamEvent>) -> String {
    let mut out = String::new();
    while let Some(event) = rx.recv().await {
        match event {
            UpstreamEvent::TextDelta(text) => out.push_str(&text),
            UpstreamEvent::Finish { .. } => break,
            UpstreamEvent::Other { .. } => {}
        }
    }
    out
}
