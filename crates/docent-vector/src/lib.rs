//! Docent Vector crate - document chunking, embeddings, and retrieval.
//!
//! Splits an attached document into overlapping windows, embeds every window
//! through an [`EmbeddingService`], and ranks windows against a question by
//! cosine similarity.

pub mod cache;
pub mod chunker;
pub mod embedding;
pub mod retriever;

pub use cache::EmbeddingCache;
pub use chunker::Chunker;
pub use embedding::{DynEmbeddingService, EmbeddingService, MockEmbedding, OllamaEmbedding};
pub use retriever::{cosine_similarity, rank, retrieve, ScoredChunk};
