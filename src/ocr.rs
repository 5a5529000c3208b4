//! OCR fallback for scanned PDFs.
//!
//! Recognition itself lives outside this crate. The ingestion pipeline only
//! consults an [`OcrEngine`] when a document is classified as scanned.

use anyhow::Result;
use async_trait::async_trait;

use crate::config::OcrConfig;
use crate::models::Page;

#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Recognize text in the rendered pages of a PDF.
    async fn recognize(&self, pdf_bytes: &[u8]) -> Result<Vec<Page>>;
}

/// Returns no pages, so scanned documents fail terminally.
pub struct DisabledOcr;

#[async_trait]
impl OcrEngine for DisabledOcr {
    async fn recognize(&self, _pdf_bytes: &[u8]) -> Result<Vec<Page>> {
        Ok(Vec::new())
    }
}

pub fn create_ocr(config: &OcrConfig) -> Box<dyn OcrEngine> {
    if config.enabled {
        tracing::warn!(
            languages = %config.languages,
            "OCR enabled but no engine is linked; scanned documents will fail"
        );
    }
    Box::new(DisabledOcr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_ocr_yields_no_pages() {
        let pages = DisabledOcr.recognize(b"%PDF-1.4").await.unwrap();
        assert!(pages.is_empty());
    }
}
