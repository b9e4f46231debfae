//! Conversational engine for Docent.
//!
//! Provides the per-session state machine, the session registry, prompt
//! assembly, generation and extraction backends, and the coordinator that
//! streams answers while keeping the session store consistent.

pub mod coordinator;
pub mod error;
pub mod extraction;
pub mod generation;
pub mod prompt;
pub mod registry;
pub mod session;

pub use coordinator::{AnswerStream, ChatCoordinator};
pub use error::ChatError;
pub use extraction::{DocumentExtractor, PdfExtractor};
pub use generation::{
    GenerationEngine, GenerationOptions, OllamaGeneration, ScriptedGeneration, TokenStream,
};
pub use registry::{SessionRegistry, SharedSession};
pub use session::{Session, SessionPhase, SessionSnapshot, SessionSummary};
