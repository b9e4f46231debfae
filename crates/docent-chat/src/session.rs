//! Per-session conversation state machine.
//!
//! A session moves between `Fresh` (plain conversation), `Grounded` (a
//! document is attached) and `Answering` (an exchange is in flight). The
//! history holds at most one system message, always at position 0.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docent_core::config::PromptConfig;
use docent_core::types::{Chunk, Embedding, Message, Role, SessionRecord};
use docent_vector::cache::EmbeddingCache;

use crate::error::ChatError;
use crate::prompt;

/// Maximum length of a session title, in characters.
pub const TITLE_MAX_CHARS: usize = 48;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Fresh,
    Grounded,
    /// An exchange is in flight; `grounded` is the phase to return to.
    Answering { grounded: bool },
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Fresh => "fresh",
            SessionPhase::Grounded => "grounded",
            SessionPhase::Answering { .. } => "answering",
        }
    }

    fn settled(grounded: bool) -> Self {
        if grounded {
            SessionPhase::Grounded
        } else {
            SessionPhase::Fresh
        }
    }
}

/// In-memory state of one conversation.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    title: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    messages: Vec<Message>,
    phase: SessionPhase,
    cache: EmbeddingCache,
    /// Set once the session is removed; its state must not be written back.
    deleted: bool,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: String::new(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            phase: SessionPhase::Fresh,
            cache: EmbeddingCache::default(),
            deleted: false,
        }
    }

    /// Rebuild a session from its durable record.
    ///
    /// Documents are not persisted, so the session always comes back `Fresh`.
    pub fn from_record(record: SessionRecord) -> Self {
        Self {
            id: record.id,
            title: record.title,
            created_at: record.created_at,
            updated_at: record.updated_at,
            messages: record.messages,
            phase: SessionPhase::Fresh,
            cache: EmbeddingCache::default(),
            deleted: false,
        }
    }

    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            id: self.id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            messages: self.messages.clone(),
            pdf_attached: self.document_attached(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Retire the session. Holders of a stale handle see this after locking.
    pub fn mark_deleted(&mut self) {
        self.abort();
        self.deleted = true;
    }

    /// Whether questions are currently answered from an attached document.
    pub fn document_attached(&self) -> bool {
        let grounded = matches!(
            self.phase,
            SessionPhase::Grounded | SessionPhase::Answering { grounded: true }
        );
        grounded && !self.cache.is_empty()
    }

    /// Replace the attached document.
    ///
    /// An empty cache (failed embedding) leaves the session `Fresh`.
    pub fn attach_document(&mut self, cache: EmbeddingCache) -> Result<(), ChatError> {
        self.ensure_settled("attach a document")?;
        self.phase = SessionPhase::settled(!cache.is_empty());
        self.cache = cache;
        self.touch();
        Ok(())
    }

    /// Record a question and enter `Answering`.
    ///
    /// Installs or refreshes the system prompt for the current mode. When
    /// grounded, `retrieved` is injected ahead of the literal prompt.
    pub fn ask(
        &mut self,
        prompt_text: &str,
        retrieved: &[Chunk],
        prompts: &PromptConfig,
    ) -> Result<(), ChatError> {
        self.ensure_settled("ask")?;
        let grounded = self.document_attached();

        let system = prompt::system_prompt(prompts, grounded);
        match self.messages.first_mut() {
            Some(first) if first.role == Role::System => {
                if first.content != system {
                    first.content = system.to_string();
                }
            }
            _ => self.messages.insert(0, Message::system(system)),
        }

        let content = if grounded {
            prompt::augment(prompt_text, retrieved)
        } else {
            prompt_text.to_string()
        };
        self.messages.push(Message::user(content));

        if self.title.is_empty() {
            self.title = make_title(prompt_text);
        }
        self.phase = SessionPhase::Answering { grounded };
        self.touch();
        Ok(())
    }

    /// Commit the assistant's answer and leave `Answering`.
    pub fn complete(&mut self, answer: impl Into<String>) -> Result<(), ChatError> {
        let SessionPhase::Answering { grounded } = self.phase else {
            return Err(ChatError::InvalidTransition {
                action: "complete an answer",
                phase: self.phase.as_str(),
            });
        };
        self.messages.push(Message::assistant(answer));
        self.phase = SessionPhase::settled(grounded);
        self.touch();
        Ok(())
    }

    /// Leave `Answering` without recording an answer. No-op otherwise.
    pub fn abort(&mut self) {
        if let SessionPhase::Answering { grounded } = self.phase {
            self.phase = SessionPhase::settled(grounded);
        }
    }

    /// Clear history, title and document, returning to `Fresh`.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.title.clear();
        self.cache.clear();
        self.phase = SessionPhase::Fresh;
        self.touch();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            messages: self.messages.clone(),
            phase: self.phase.as_str().to_string(),
            document_attached: self.document_attached(),
            chunks: self.cache.entries().to_vec(),
        }
    }

    fn ensure_settled(&self, action: &'static str) -> Result<(), ChatError> {
        match self.phase {
            SessionPhase::Answering { .. } => Err(ChatError::InvalidTransition {
                action,
                phase: self.phase.as_str(),
            }),
            _ => Ok(()),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// First line of the prompt, trimmed and cut to [`TITLE_MAX_CHARS`].
fn make_title(prompt_text: &str) -> String {
    prompt_text
        .trim()
        .lines()
        .next()
        .unwrap_or_default()
        .chars()
        .take(TITLE_MAX_CHARS)
        .collect::<String>()
        .trim_end()
        .to_string()
}

/// Point-in-time copy of a session, including its document.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub phase: String,
    pub document_attached: bool,
    pub chunks: Vec<(Chunk, Embedding)>,
}

/// Listing entry for a stored session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub pdf_attached: bool,
}

impl From<&SessionRecord> for SessionSummary {
    fn from(record: &SessionRecord) -> Self {
        Self {
            id: record.id.clone(),
            title: record.title.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            message_count: record.messages.len(),
            pdf_attached: record.pdf_attached,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompts() -> PromptConfig {
        PromptConfig {
            grounded: "grounded rules".to_string(),
            ungrounded: "ungrounded rules".to_string(),
        }
    }

    fn cache_with(texts: &[&str]) -> EmbeddingCache {
        let entries = texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                (
                    Chunk {
                        index: i,
                        text: t.to_string(),
                    },
                    Embedding {
                        chunk_index: i,
                        vector: vec![1.0, i as f32],
                    },
                )
            })
            .collect();
        EmbeddingCache::from_entries(entries).unwrap()
    }

    fn roles(session: &Session) -> Vec<Role> {
        session.messages().iter().map(|m| m.role).collect()
    }

    #[test]
    fn test_new_session_is_fresh_and_empty() {
        let session = Session::new("s1");
        assert_eq!(session.phase(), SessionPhase::Fresh);
        assert!(session.messages().is_empty());
        assert!(!session.document_attached());
        assert!(session.title().is_empty());
    }

    #[test]
    fn test_ungrounded_ask_appends_literal_prompt() {
        let mut session = Session::new("s1");
        session.ask("What is 2+2?", &[], &prompts()).unwrap();

        assert_eq!(roles(&session), vec![Role::System, Role::User]);
        assert_eq!(session.messages()[0].content, "ungrounded rules");
        assert_eq!(session.messages()[1].content, "What is 2+2?");
        assert_eq!(session.phase(), SessionPhase::Answering { grounded: false });
    }

    #[test]
    fn test_complete_returns_to_fresh() {
        let mut session = Session::new("s1");
        session.ask("hi", &[], &prompts()).unwrap();
        session.complete("hello").unwrap();

        assert_eq!(session.phase(), SessionPhase::Fresh);
        assert_eq!(roles(&session), vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(session.messages()[2].content, "hello");
    }

    #[test]
    fn test_system_prompt_inserted_once() {
        let mut session = Session::new("s1");
        for q in ["a", "b", "c"] {
            session.ask(q, &[], &prompts()).unwrap();
            session.complete("ok").unwrap();
        }
        let systems = session
            .messages()
            .iter()
            .filter(|m| m.role == Role::System)
            .count();
        assert_eq!(systems, 1);
        assert_eq!(session.messages().len(), 7);
    }

    #[test]
    fn test_ask_while_answering_is_rejected() {
        let mut session = Session::new("s1");
        session.ask("first", &[], &prompts()).unwrap();
        let err = session.ask("second", &[], &prompts()).unwrap_err();
        assert!(matches!(err, ChatError::InvalidTransition { action: "ask", .. }));
        assert_eq!(session.messages().len(), 2);
    }

    #[test]
    fn test_complete_without_ask_is_rejected() {
        let mut session = Session::new("s1");
        assert!(session.complete("orphan").is_err());
        assert!(session.messages().is_empty());
    }

    #[test]
    fn test_attach_while_answering_is_rejected() {
        let mut session = Session::new("s1");
        session.ask("q", &[], &prompts()).unwrap();
        assert!(session.attach_document(cache_with(&["doc"])).is_err());
    }

    #[test]
    fn test_grounded_ask_injects_context() {
        let mut session = Session::new("s1");
        session.attach_document(cache_with(&["alpha", "beta"])).unwrap();
        assert_eq!(session.phase(), SessionPhase::Grounded);
        assert!(session.document_attached());

        let retrieved = vec![session.cache().chunks()[1].clone()];
        session.ask("Which letter?", &retrieved, &prompts()).unwrap();

        assert_eq!(session.messages()[0].content, "grounded rules");
        let user = &session.messages()[1].content;
        assert!(user.contains("beta"));
        assert!(!user.contains("alpha"));
        assert!(user.ends_with("Which letter?"));

        session.complete("beta").unwrap();
        assert_eq!(session.phase(), SessionPhase::Grounded);
    }

    #[test]
    fn test_attach_after_conversation_refreshes_system_prompt() {
        let mut session = Session::new("s1");
        session.ask("hi", &[], &prompts()).unwrap();
        session.complete("hello").unwrap();
        assert_eq!(session.messages()[0].content, "ungrounded rules");

        session.attach_document(cache_with(&["doc"])).unwrap();
        session.ask("about the doc?", &[], &prompts()).unwrap();

        assert_eq!(session.messages()[0].content, "grounded rules");
        assert_eq!(
            roles(&session),
            vec![Role::System, Role::User, Role::Assistant, Role::User]
        );
    }

    #[test]
    fn test_empty_cache_leaves_session_fresh() {
        let mut session = Session::new("s1");
        session.attach_document(cache_with(&["doc"])).unwrap();
        session.attach_document(EmbeddingCache::default()).unwrap();
        assert_eq!(session.phase(), SessionPhase::Fresh);
        assert!(!session.document_attached());
        assert!(session.cache().is_empty());
    }

    #[test]
    fn test_abort_appends_nothing() {
        let mut session = Session::new("s1");
        session.attach_document(cache_with(&["doc"])).unwrap();
        session.ask("q", &[], &prompts()).unwrap();
        session.abort();

        assert_eq!(session.phase(), SessionPhase::Grounded);
        assert_eq!(roles(&session), vec![Role::System, Role::User]);

        session.ask("again", &[], &prompts()).unwrap();
        assert_eq!(session.messages().len(), 3);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut session = Session::new("s1");
        session.attach_document(cache_with(&["doc"])).unwrap();
        session.ask("one", &[], &prompts()).unwrap();
        session.complete("1").unwrap();
        session.ask("two", &[], &prompts()).unwrap();
        session.complete("2").unwrap();
        assert_eq!(session.messages().len(), 5);

        session.reset();
        assert!(session.messages().is_empty());
        assert!(!session.document_attached());
        assert!(session.title().is_empty());
        assert_eq!(session.phase(), SessionPhase::Fresh);

        session.ask("three", &[], &prompts()).unwrap();
        assert_eq!(session.messages()[0].role, Role::System);
        assert_eq!(session.messages()[0].content, "ungrounded rules");
    }

    #[test]
    fn test_title_from_first_prompt() {
        let mut session = Session::new("s1");
        let long = format!("  {}\nsecond line", "x".repeat(100));
        session.ask(&long, &[], &prompts()).unwrap();
        assert_eq!(session.title(), "x".repeat(TITLE_MAX_CHARS));

        session.complete("ok").unwrap();
        session.ask("another question", &[], &prompts()).unwrap();
        assert_eq!(session.title(), "x".repeat(TITLE_MAX_CHARS));
    }

    #[test]
    fn test_record_round_trip_comes_back_fresh() {
        let mut session = Session::new("s1");
        session.attach_document(cache_with(&["doc"])).unwrap();
        session.ask("q", &[], &prompts()).unwrap();
        session.complete("a").unwrap();

        let record = session.to_record();
        assert!(record.pdf_attached);
        assert_eq!(record.messages.len(), 3);

        let restored = Session::from_record(record);
        assert_eq!(restored.phase(), SessionPhase::Fresh);
        assert_eq!(restored.messages(), session.messages());
        assert_eq!(restored.title(), "q");
        assert!(!restored.document_attached());
    }

    #[test]
    fn test_snapshot_includes_chunks() {
        let mut session = Session::new("s1");
        session.attach_document(cache_with(&["a", "b", "c"])).unwrap();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.chunks.len(), 3);
        assert!(snapshot.document_attached);
        assert_eq!(snapshot.phase, "grounded");
        for (chunk, embedding) in &snapshot.chunks {
            assert_eq!(chunk.index, embedding.chunk_index);
        }
    }

    #[test]
    fn test_summary_from_record() {
        let mut record = SessionRecord::new("s9");
        record.messages = vec![Message::system("s"), Message::user("u")];
        let summary = SessionSummary::from(&record);
        assert_eq!(summary.id, "s9");
        assert_eq!(summary.message_count, 2);
        assert!(!summary.pdf_attached);
    }
}
