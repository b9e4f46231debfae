//! Per-session store of document chunks and their embeddings.
//!
//! A cache is built completely before it is handed out: either every chunk
//! has an embedding or the build fails and no cache exists.

use docent_core::error::DocentError;
use docent_core::types::{Chunk, Embedding};
use tracing::{debug, info};

use crate::chunker::Chunker;
use crate::embedding::DynEmbeddingService;

/// Chunks of one attached document paired with their vectors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingCache {
    entries: Vec<(Chunk, Embedding)>,
}

impl EmbeddingCache {
    /// Chunk `text` and embed every chunk.
    ///
    /// Fails on the first embedding error, or when a vector's length differs
    /// from the first one. Text producing no chunks yields an empty cache.
    pub async fn build(
        text: &str,
        chunker: &Chunker,
        embedder: &dyn DynEmbeddingService,
    ) -> Result<Self, DocentError> {
        let chunks = chunker.split(text);
        let total = chunks.len();
        let mut entries = Vec::with_capacity(total);

        for chunk in chunks {
            let vector = embedder.embed_boxed(&chunk.text).await.map_err(|e| {
                DocentError::Embedding(format!("chunk {} of {}: {}", chunk.index, total, e))
            })?;
            debug!(chunk = chunk.index, total, "Chunk embedded");
            let embedding = Embedding {
                chunk_index: chunk.index,
                vector,
            };
            entries.push((chunk, embedding));
        }

        let cache = Self::from_entries(entries)?;
        info!(
            chunks = cache.len(),
            dimensions = cache.dimensions(),
            "Embedding cache built"
        );
        Ok(cache)
    }

    /// Assemble a cache from precomputed pairs, checking their consistency.
    pub fn from_entries(entries: Vec<(Chunk, Embedding)>) -> Result<Self, DocentError> {
        let dims = entries.first().map(|(_, e)| e.vector.len()).unwrap_or(0);
        for (chunk, embedding) in &entries {
            if chunk.index != embedding.chunk_index {
                return Err(DocentError::Embedding(format!(
                    "embedding for chunk {} paired with chunk {}",
                    embedding.chunk_index, chunk.index
                )));
            }
            if embedding.vector.len() != dims {
                return Err(DocentError::Embedding(format!(
                    "chunk {} has {} dimensions, expected {}",
                    chunk.index,
                    embedding.vector.len(),
                    dims
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[(Chunk, Embedding)] {
        &self.entries
    }

    pub fn chunks(&self) -> Vec<Chunk> {
        self.entries.iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn embeddings(&self) -> Vec<Embedding> {
        self.entries.iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Vector length shared by every entry, or 0 when empty.
    pub fn dimensions(&self) -> usize {
        self.entries.first().map(|(_, e)| e.vector.len()).unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
