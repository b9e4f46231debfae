//! Streaming response coordinator.
//!
//! Drives one exchange: optional document attach, retrieval, the user turn,
//! then generation on a spawned task that forwards deltas to the caller and
//! commits the answer once the stream has finished.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use docent_core::config::{DocentConfig, PromptConfig};
use docent_core::types::Chunk;
use docent_vector::cache::EmbeddingCache;
use docent_vector::chunker::Chunker;
use docent_vector::embedding::DynEmbeddingService;
use docent_vector::retriever::rank;

use crate::error::ChatError;
use crate::extraction::DocumentExtractor;
use crate::generation::{GenerationEngine, GenerationOptions, TokenStream};
use crate::registry::SessionRegistry;
use crate::session::Session;

/// Deltas buffered between the generation task and the caller.
const ANSWER_CHANNEL_CAPACITY: usize = 32;

/// How an exchange ended.
#[derive(Debug)]
enum ExchangeOutcome {
    Completed,
    Aborted(AbortReason),
}

#[derive(Debug)]
enum AbortReason {
    Disconnected,
    Failed(String),
}

/// Answers questions against sessions.
pub struct ChatCoordinator {
    registry: Arc<SessionRegistry>,
    embedder: Arc<dyn DynEmbeddingService>,
    engine: Arc<dyn GenerationEngine>,
    extractor: Arc<dyn DocumentExtractor>,
    chunker: Chunker,
    top_k: usize,
    options: GenerationOptions,
    prompts: PromptConfig,
    max_prompt_chars: usize,
}

impl ChatCoordinator {
    pub fn new(
        config: &DocentConfig,
        registry: Arc<SessionRegistry>,
        embedder: Arc<dyn DynEmbeddingService>,
        engine: Arc<dyn GenerationEngine>,
        extractor: Arc<dyn DocumentExtractor>,
    ) -> Self {
        Self {
            registry,
            embedder,
            engine,
            extractor,
            chunker: Chunker::from_config(&config.chunking),
            top_k: config.retrieval.top_k,
            options: GenerationOptions::from(&config.generation),
            prompts: config.prompt.clone(),
            max_prompt_chars: config.chat.max_prompt_chars,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Ask a question, optionally attaching a new document first.
    ///
    /// Returns once the user turn is recorded in the session. Persisting it
    /// and starting generation happen on the exchange task, before the first
    /// delta. The session stays locked until the returned stream is finished or
    /// dropped, so concurrent asks on one session run one after another.
    pub async fn ask(
        &self,
        session_id: &str,
        prompt: &str,
        document: Option<&[u8]>,
    ) -> Result<AnswerStream, ChatError> {
        self.validate(prompt)?;

        let text = match document {
            Some(bytes) => self.extractor.extract_text(bytes).await,
            None => None,
        };
        if document.is_some() && text.is_none() {
            warn!(session_id = %session_id, "Document extraction failed; not attached");
        }

        let mut session = self.registry.acquire(session_id).await?;

        if let Some(text) = text {
            self.attach_locked(&mut session, &text).await?;
        }

        let retrieved = self.retrieve_for(&session, prompt).await;
        session.ask(prompt, &retrieved, &self.prompts)?;

        // Only the exchange task leaves `Answering`; no await until it is spawned.
        let (tx, rx) = mpsc::channel(ANSWER_CHANNEL_CAPACITY);
        info!(
            session_id = %session_id,
            model = %self.engine.model(),
            grounded = session.document_attached(),
            excerpts = retrieved.len(),
            "Exchange started"
        );
        tokio::spawn(run_exchange(
            session,
            self.engine.clone(),
            self.options,
            tx,
            self.registry.clone(),
        ));

        Ok(AnswerStream {
            session_id: session_id.to_string(),
            inner: ReceiverStream::new(rx),
        })
    }

    /// Chunk, embed and attach `text` to a session, replacing any document.
    ///
    /// Returns whether the session ended up grounded.
    pub async fn attach(&self, session_id: &str, text: &str) -> Result<bool, ChatError> {
        let mut session = self.registry.acquire(session_id).await?;
        self.attach_locked(&mut session, text).await?;
        if let Err(e) = self.registry.persist(&session).await {
            error!(session_id = %session_id, error = %e, "Failed to persist session");
        }
        Ok(session.document_attached())
    }

    fn validate(&self, prompt: &str) -> Result<(), ChatError> {
        if prompt.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if prompt.chars().count() > self.max_prompt_chars {
            return Err(ChatError::MessageTooLong(self.max_prompt_chars));
        }
        Ok(())
    }

    async fn attach_locked(&self, session: &mut Session, text: &str) -> Result<(), ChatError> {
        let cache = match EmbeddingCache::build(text, &self.chunker, self.embedder.as_ref()).await
        {
            Ok(cache) => cache,
            Err(e) => {
                warn!(session_id = %session.id(), error = %e, "Embedding failed; document not attached");
                EmbeddingCache::default()
            }
        };
        let chunks = cache.len();
        session.attach_document(cache)?;
        info!(
            session_id = %session.id(),
            chunks,
            grounded = session.document_attached(),
            "Document attached"
        );
        Ok(())
    }

    /// Top-k excerpts for a grounded session; empty otherwise.
    async fn retrieve_for(&self, session: &Session, prompt: &str) -> Vec<Chunk> {
        if !session.document_attached() {
            return Vec::new();
        }
        let query = match self.embedder.embed_boxed(prompt).await {
            Ok(query) => query,
            Err(e) => {
                warn!(session_id = %session.id(), error = %e, "Query embedding failed; answering without excerpts");
                return Vec::new();
            }
        };

        let ranked = rank(&query, session.cache(), self.top_k);
        debug!(
            session_id = %session.id(),
            hits = ?ranked.iter().map(|s| (s.chunk.index, s.score)).collect::<Vec<_>>(),
            "Excerpts retrieved"
        );
        ranked.into_iter().map(|s| s.chunk).collect()
    }
}

impl std::fmt::Debug for ChatCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCoordinator")
            .field("model", &self.engine.model())
            .field("top_k", &self.top_k)
            .field("options", &self.options)
            .finish()
    }
}

/// Persist the user turn, generate, forward deltas to the caller, then
/// commit or abandon the answer.
async fn run_exchange(
    mut session: OwnedMutexGuard<Session>,
    engine: Arc<dyn GenerationEngine>,
    options: GenerationOptions,
    tx: mpsc::Sender<Result<String, ChatError>>,
    registry: Arc<SessionRegistry>,
) {
    if let Err(e) = registry.persist(&session).await {
        error!(session_id = %session.id(), error = %e, "Failed to persist user turn");
    }

    let history = session.messages().to_vec();
    let started = tokio::select! {
        _ = tx.closed() => None,
        result = engine.generate(&history, options) => Some(result),
    };

    let mut answer = String::new();
    let outcome = match started {
        None => ExchangeOutcome::Aborted(AbortReason::Disconnected),
        Some(Ok(mut tokens)) => {
            let outcome = forward_deltas(&mut tokens, &tx, &mut answer).await;
            // Cancel the engine before touching the session.
            drop(tokens);
            outcome
        }
        Some(Err(e)) => {
            let reason = e.to_string();
            let _ = tx.send(Err(e)).await;
            ExchangeOutcome::Aborted(AbortReason::Failed(reason))
        }
    };

    // Finish delivery before committing.
    drop(tx);

    match outcome {
        ExchangeOutcome::Completed => {
            let chars = answer.chars().count();
            if let Err(e) = session.complete(answer) {
                error!(session_id = %session.id(), error = %e, "Failed to commit answer");
                session.abort();
                return;
            }
            if let Err(e) = registry.persist(&session).await {
                error!(session_id = %session.id(), error = %e, "Failed to persist answer");
            }
            info!(session_id = %session.id(), chars, "Exchange completed");
        }
        ExchangeOutcome::Aborted(AbortReason::Disconnected) => {
            session.abort();
            info!(session_id = %session.id(), "Client disconnected; answer discarded");
        }
        ExchangeOutcome::Aborted(AbortReason::Failed(reason)) => {
            session.abort();
            warn!(session_id = %session.id(), error = %reason, "Generation failed; answer discarded");
        }
    }
}

/// Relay engine deltas until the engine finishes, fails, or the caller leaves.
async fn forward_deltas(
    tokens: &mut TokenStream,
    tx: &mpsc::Sender<Result<String, ChatError>>,
    answer: &mut String,
) -> ExchangeOutcome {
    loop {
        let next = tokio::select! {
            _ = tx.closed() => return ExchangeOutcome::Aborted(AbortReason::Disconnected),
            next = tokens.next() => next,
        };

        match next {
            Some(Ok(delta)) => {
                answer.push_str(&delta);
                if tx.send(Ok(delta)).await.is_err() {
                    return ExchangeOutcome::Aborted(AbortReason::Disconnected);
                }
            }
            Some(Err(e)) => {
                let reason = e.to_string();
                let _ = tx.send(Err(e)).await;
                return ExchangeOutcome::Aborted(AbortReason::Failed(reason));
            }
            None => return ExchangeOutcome::Completed,
        }
    }
}

/// Content deltas of one answer, in order.
///
/// Ends after the last delta, or after a single `Err` if generation failed.
/// Dropping it cancels generation and nothing is committed.
#[derive(Debug)]
pub struct AnswerStream {
    session_id: String,
    inner: ReceiverStream<Result<String, ChatError>>,
}

impl AnswerStream {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Drain the stream into one string, stopping at the first error.
    pub async fn collect_text(mut self) -> Result<String, ChatError> {
        let mut text = String::new();
        while let Some(delta) = self.next().await {
            text.push_str(&delta?);
        }
        Ok(text)
    }
}

impl Stream for AnswerStream {
    type Item = Result<String, ChatError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
