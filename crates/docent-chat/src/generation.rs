//! Generation engine trait and backends.
//!
//! - `OllamaGeneration` streams from a local Ollama server's `/api/chat`.
//! - `ScriptedGeneration` replays fixed tokens for tests and `--mock` runs.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use docent_core::config::GenerationConfig;
use docent_core::error::DocentError;
use docent_core::types::Message;

use crate::error::ChatError;

/// Lazily produced content deltas. Dropping the stream cancels generation.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

/// Buffered deltas between an engine's reader task and its consumer.
const TOKEN_CHANNEL_CAPACITY: usize = 32;

/// Sampling options passed with every request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 512,
        }
    }
}

impl From<&GenerationConfig> for GenerationOptions {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// A language model that answers a conversation as a stream of deltas.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Start generating a reply to `history`.
    ///
    /// Errors before the first delta (unreachable engine, bad status) are
    /// returned directly; later failures arrive as an `Err` item.
    async fn generate(
        &self,
        history: &[Message],
        options: GenerationOptions,
    ) -> Result<TokenStream, ChatError>;

    /// Model identifier, for logging.
    fn model(&self) -> &str;
}

// ---------------------------------------------------------------------------
// OllamaGeneration
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    options: RequestOptions,
}

#[derive(Debug, Serialize)]
struct RequestOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

/// Streaming client for Ollama's `/api/chat` endpoint (NDJSON responses).
#[derive(Debug, Clone)]
pub struct OllamaGeneration {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OllamaGeneration {
    pub fn new(config: &GenerationConfig) -> Result<Self, DocentError> {
        // No overall timeout: answers stream for as long as the model runs.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| DocentError::Generation(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/chat", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
        })
    }
}

/// Parse one NDJSON line into `(delta, done)`. Blank lines yield `None`.
fn parse_chat_line(line: &[u8]) -> Result<Option<(String, bool)>, ChatError> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let chunk: ChatChunk = serde_json::from_str(line)
        .map_err(|e| ChatError::Generation(format!("Malformed stream line: {}", e)))?;
    if let Some(error) = chunk.error {
        return Err(ChatError::Generation(error));
    }
    let delta = chunk.message.map(|m| m.content).unwrap_or_default();
    Ok(Some((delta, chunk.done)))
}

#[async_trait]
impl GenerationEngine for OllamaGeneration {
    async fn generate(
        &self,
        history: &[Message],
        options: GenerationOptions,
    ) -> Result<TokenStream, ChatError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&ChatRequest {
                model: &self.model,
                messages: history,
                stream: true,
                options: RequestOptions {
                    temperature: options.temperature,
                    num_predict: options.max_tokens,
                },
            })
            .send()
            .await
            .map_err(|e| ChatError::Generation(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Generation(format!("HTTP {}: {}", status, body)));
        }

        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        let model = self.model.clone();

        tokio::spawn(async move {
            let mut bytes = Box::pin(response.bytes_stream());
            let mut buffer: Vec<u8> = Vec::new();

            loop {
                let chunk = tokio::select! {
                    _ = tx.closed() => {
                        debug!(model = %model, "Generation consumer dropped; closing stream");
                        return;
                    }
                    chunk = bytes.next() => chunk,
                };

                let chunk = match chunk {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(ChatError::Generation(format!("Stream interrupted: {}", e))))
                            .await;
                        return;
                    }
                    None => break,
                };
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match parse_chat_line(&line) {
                        Ok(Some((delta, done))) => {
                            if !delta.is_empty() && tx.send(Ok(delta)).await.is_err() {
                                return;
                            }
                            if done {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }

            // A final line without a trailing newline.
            match parse_chat_line(&buffer) {
                Ok(Some((delta, _))) if !delta.is_empty() => {
                    let _ = tx.send(Ok(delta)).await;
                }
                Ok(_) => {}
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// ScriptedGeneration
// ---------------------------------------------------------------------------

/// Deterministic engine that emits a fixed token sequence.
///
/// Records every history it receives and notices when its consumer goes
/// away, so tests can assert on both.
#[derive(Debug, Default)]
pub struct ScriptedGeneration {
    tokens: Vec<String>,
    fail_after: Option<usize>,
    delay: Option<Duration>,
    requests: Mutex<Vec<Vec<Message>>>,
    emitted: Arc<AtomicUsize>,
    cancelled: Arc<AtomicBool>,
}

impl ScriptedGeneration {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Fail with a generation error after emitting `n` tokens.
    pub fn with_failure_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Sleep before each token.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Histories received so far, oldest first.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Tokens delivered to consumers across all calls.
    pub fn emitted(&self) -> usize {
        self.emitted.load(Ordering::SeqCst)
    }

    /// Whether any consumer dropped its stream before the end.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationEngine for ScriptedGeneration {
    async fn generate(
        &self,
        history: &[Message],
        _options: GenerationOptions,
    ) -> Result<TokenStream, ChatError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(history.to_vec());
        }

        if self.fail_after == Some(0) {
            return Err(ChatError::Generation("scripted engine unavailable".to_string()));
        }

        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        let tokens = self.tokens.clone();
        let fail_after = self.fail_after;
        let delay = self.delay;
        let emitted = self.emitted.clone();
        let cancelled = self.cancelled.clone();

        tokio::spawn(async move {
            for (i, token) in tokens.into_iter().enumerate() {
                if fail_after == Some(i) {
                    let _ = tx
                        .send(Err(ChatError::Generation(format!(
                            "scripted failure after {} tokens",
                            i
                        ))))
                        .await;
                    return;
                }
                if let Some(delay) = delay {
                    tokio::select! {
                        _ = tx.closed() => {
                            cancelled.store(true, Ordering::SeqCst);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if tx.send(Ok(token)).await.is_err() {
                    warn!("Scripted generation consumer dropped");
                    cancelled.store(true, Ordering::SeqCst);
                    return;
                }
                emitted.fetch_add(1, Ordering::SeqCst);
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn model(&self) -> &str {
        "scripted"
    }
}
