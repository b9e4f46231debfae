//! Overlapping-window document splitter.
//!
//! Windows are measured in characters (Unicode scalar values), so a window
//! boundary never falls inside a multi-byte sequence.

use docent_core::config::ChunkingConfig;
use docent_core::types::Chunk;
use tracing::warn;

/// Default window length in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 1200;

/// Default number of characters shared by consecutive windows.
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Stateless splitter producing overlapping windows of text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    size: usize,
    overlap: usize,
}

impl Chunker {
    /// Create a chunker, clamping degenerate parameters.
    ///
    /// `size` is raised to at least 1 and `overlap` is lowered to `size - 1`
    /// so that every window advances by at least one character.
    pub fn new(size: usize, overlap: usize) -> Self {
        let size = size.max(1);
        let clamped = overlap.min(size - 1);
        if clamped != overlap {
            warn!(size, overlap, clamped, "Chunk overlap must be smaller than size; clamping");
        }
        Self {
            size,
            overlap: clamped,
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.size, config.overlap)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Number of characters between the starts of consecutive windows.
    pub fn stride(&self) -> usize {
        self.size - self.overlap
    }

    /// Split `text` into ordered windows.
    ///
    /// The last window is truncated to the remaining text. Windows that are
    /// empty or whitespace-only are dropped.
    pub fn split(&self, text: &str) -> Vec<Chunk> {
        // Byte offset of every char boundary, plus the end of the string.
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let char_count = boundaries.len() - 1;

        let mut chunks = Vec::new();
        let mut start = 0;

        while start < char_count {
            let end = (start + self.size).min(char_count);
            let window = &text[boundaries[start]..boundaries[end]];

            if !window.trim().is_empty() {
                chunks.push(Chunk {
                    index: chunks.len(),
                    text: window.to_string(),
                });
            }

            if end == char_count {
                break;
            }
            start += self.stride();
        }

        chunks
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP)
    }
}

/// Split `text` into overlapping windows of `size` characters.
pub fn chunk(text: &str, size: usize, overlap: usize) -> Vec<Chunk> {
    Chunker::new(size, overlap).split(text)
}
