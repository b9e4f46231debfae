//! Document text extraction.

use async_trait::async_trait;
use tracing::{debug, warn};

/// Leading bytes of every PDF file.
const PDF_MAGIC: &[u8] = b"%PDF-";

/// Turns uploaded bytes into plain text.
///
/// Failure is not an error: the caller falls back to ungrounded chat.
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    /// Extracted text, or `None` if nothing usable could be read.
    async fn extract_text(&self, bytes: &[u8]) -> Option<String>;
}

/// Extracts PDFs with `pdf-extract` and accepts UTF-8 text as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfExtractor;

impl PdfExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DocumentExtractor for PdfExtractor {
    async fn extract_text(&self, bytes: &[u8]) -> Option<String> {
        let text = if bytes.starts_with(PDF_MAGIC) {
            let owned = bytes.to_vec();
            // pdf-extract panics on some malformed inputs.
            let parsed = tokio::task::spawn_blocking(move || {
                std::panic::catch_unwind(move || pdf_extract::extract_text_from_mem(&owned))
            })
            .await;

            match parsed {
                Ok(Ok(Ok(text))) => text,
                Ok(Ok(Err(e))) => {
                    warn!(error = %e, bytes = bytes.len(), "PDF extraction failed");
                    return None;
                }
                Ok(Err(_)) | Err(_) => {
                    warn!(bytes = bytes.len(), "PDF parser panicked");
                    return None;
                }
            }
        } else {
            match std::str::from_utf8(bytes) {
                Ok(text) => text.to_string(),
                Err(e) => {
                    warn!(error = %e, bytes = bytes.len(), "Document is neither PDF nor UTF-8 text");
                    return None;
                }
            }
        };

        if text.trim().is_empty() {
            warn!(bytes = bytes.len(), "Document contains no extractable text");
            return None;
        }
        debug!(chars = text.chars().count(), "Document text extracted");
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plain_text_accepted() {
        let text = PdfExtractor::new()
            .extract_text("Las plantas producen oxígeno.".as_bytes())
            .await;
        assert_eq!(text.as_deref(), Some("Las plantas producen oxígeno."));
    }

    #[tokio::test]
    async fn test_whitespace_only_rejected() {
        assert!(PdfExtractor::new().extract_text(b"  \n\t ").await.is_none());
        assert!(PdfExtractor::new().extract_text(b"").await.is_none());
    }

    #[tokio::test]
    async fn test_binary_rejected() {
        let bytes = [0xff, 0xfe, 0x00, 0x81, 0x9f];
        assert!(PdfExtractor::new().extract_text(&bytes).await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_pdf_yields_none() {
        let bytes = b"%PDF-1.7\nthis is not really a pdf\n%%EOF";
        assert!(PdfExtractor::new().extract_text(bytes).await.is_none());
    }

    #[tokio::test]
    async fn test_usable_through_trait_object() {
        let extractor: Box<dyn DocumentExtractor> = Box::new(PdfExtractor::new());
        assert_eq!(
            extractor.extract_text(b"hello").await.as_deref(),
            Some("hello")
        );
    }
}
