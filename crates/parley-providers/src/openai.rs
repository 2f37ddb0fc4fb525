//! OpenAI-compatible Chat Completions provider.
//!
//! Streams replies via `/v1/chat/completions`. The default endpoint is a local
//! Ollama server, which speaks the same protocol without authentication.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use parley_core::backend::{Generator, TextStream};
use parley_core::config::GenerationConfig;
use parley_core::error::ParleyError;
use parley_core::types::SessionContext;

use crate::memory::{ChatMessage, ConversationMemory};
use crate::sse::{SseEvent, parse_sse_response};

const OLLAMA_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3.2:1b";
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful voice assistant. Keep replies short and \
    conversational; they will be spoken aloud.";

pub struct OpenAiGenerator {
    pub base_url: String,
    model: String,
    system_prompt: String,
    max_tokens: Option<u32>,
    temperature: f64,
    api_key: Option<String>,
    memory: Arc<ConversationMemory>,
    client: reqwest::Client,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Self {
        Self {
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(OLLAMA_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_tokens: config.max_tokens,
            temperature: config.temperature.unwrap_or(0.7),
            api_key: config.resolve_api_key(),
            memory: Arc::new(ConversationMemory::new(config.history_messages.unwrap_or(20))),
            client: reqwest::Client::new(),
        }
    }

    pub fn memory(&self) -> &Arc<ConversationMemory> {
        &self.memory
    }

    async fn build_messages(&self, prompt: &str, session_id: &str) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(&self.system_prompt)];
        messages.extend(self.memory.history(session_id).await);
        messages.push(ChatMessage::user(prompt));
        messages
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Interpretation of one SSE `data:` payload.
#[derive(Debug, PartialEq, Eq)]
enum Delta {
    Text(String),
    Done,
    Skip,
}

fn parse_delta(data: &str) -> Delta {
    let data = data.trim();
    // OpenAI terminates with "data: [DONE]"
    if data == "[DONE]" {
        return Delta::Done;
    }
    let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            trace!(%e, data, "Failed to parse chat chunk");
            return Delta::Skip;
        }
    };
    match chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
        Some(text) if !text.is_empty() => Delta::Text(text),
        _ => Delta::Skip,
    }
}

struct ReplyState {
    sse: Pin<Box<dyn Stream<Item = anyhow::Result<SseEvent>> + Send>>,
    memory: Arc<ConversationMemory>,
    session_id: String,
    prompt: String,
    reply: String,
    finished: bool,
}

impl ReplyState {
    async fn commit(&mut self) {
        self.finished = true;
        if !self.reply.is_empty() {
            self.memory
                .record(&self.session_id, &self.prompt, &self.reply)
                .await;
        }
    }
}

/// Turn an SSE event stream into text fragments, recording the full reply in
/// memory once the stream completes.
fn reply_stream<S>(
    sse: S,
    memory: Arc<ConversationMemory>,
    session_id: String,
    prompt: String,
) -> TextStream
where
    S: Stream<Item = anyhow::Result<SseEvent>> + Send + 'static,
{
    let stream = futures::stream::unfold(
        ReplyState {
            sse: Box::pin(sse),
            memory,
            session_id,
            prompt,
            reply: String::new(),
            finished: false,
        },
        |mut state| async move {
            if state.finished {
                return None;
            }
            loop {
                match state.sse.next().await {
                    Some(Ok(event)) => match parse_delta(&event.data) {
                        Delta::Text(text) => {
                            state.reply.push_str(&text);
                            return Some((Ok(text), state));
                        }
                        Delta::Done => {
                            state.commit().await;
                            return None;
                        }
                        Delta::Skip => continue,
                    },
                    Some(Err(e)) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                    None => {
                        state.commit().await;
                        return None;
                    }
                }
            }
        },
    );
    Box::pin(stream)
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn id(&self) -> &str {
        "openai-compatible"
    }

    async fn generate(&self, prompt: &str, context: &SessionContext) -> anyhow::Result<TextStream> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: self.build_messages(prompt, &context.session_id).await,
            stream: true,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        debug!(
            model = %body.model,
            base_url = %self.base_url,
            session_id = %context.session_id,
            turn_id = %context.turn_id,
            history = body.messages.len() - 2,
            "Streaming chat completion"
        );

        let mut request = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("authorization", format!("Bearer {key}"));
        }

        let response = request.json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ParleyError::Generation(format!("Chat API error {status}: {body}")).into());
        }

        Ok(reply_stream(
            parse_sse_response(response),
            self.memory.clone(),
            context.session_id.clone(),
            prompt.to_string(),
        ))
    }

    async fn end_session(&self, session_id: &str) {
        self.memory.forget(session_id).await;
    }
}
