//! OCR of scanned pages: a rasterised page goes to a vision model as a
//! base64 PNG and comes back as plain text.
//!
//! Patent PDFs from the registries are often page scans with no text layer.
//! [`crate::pipeline::text`] renders such pages and hands them to a
//! [`PageOcr`]; everything else keeps using the text layer.
//!
//! ## Why PNG?
//!
//! Lossless compression keeps small digits and subscripts crisp. JPEG
//! artefacts around glyphs are exactly where a Kd of `1.5` turns into `15`.

use crate::config::ExtractionConfig;
use crate::error::RoleError;
use crate::prompts::OCR_PROMPT;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider};
use image::DynamicImage;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Encode a rasterised page as a base64 PNG for the vision model.
///
/// `detail: "high"` lets tiling models look at the page at full resolution;
/// the low-detail overview loses table cells and footnotes.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded page image → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Turns one page image into text.
#[async_trait]
pub trait PageOcr: Send + Sync {
    async fn recognize(&self, page_num: u32, image: &ImageData) -> Result<String, RoleError>;
}

/// [`PageOcr`] over an edgequake-llm vision provider.
pub struct VisionOcr {
    provider: Arc<dyn LLMProvider>,
    max_tokens: usize,
}

impl VisionOcr {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &ExtractionConfig) -> Self {
        Self {
            provider,
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl PageOcr for VisionOcr {
    async fn recognize(&self, page_num: u32, image: &ImageData) -> Result<String, RoleError> {
        let start = Instant::now();
        let messages = vec![
            ChatMessage::system(OCR_PROMPT),
            ChatMessage::user_with_images("", vec![image.clone()]),
        ];
        let options = CompletionOptions {
            temperature: Some(0.0),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        };

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| RoleError::Transport(e.to_string()))?;

        debug!(
            "OCR page {}: {} input tokens, {} output tokens, {:?}",
            page_num,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );
        Ok(response.content)
    }
}

/// OCR `image`, retrying transport errors with exponential backoff.
///
/// Returns `None` once `attempts` calls have failed; a page that cannot be
/// read is dropped rather than failing its document.
pub async fn recognize_page(
    ocr: &dyn PageOcr,
    page_num: u32,
    image: &ImageData,
    attempts: u32,
    backoff_ms: u64,
) -> Option<String> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match ocr.recognize(page_num, image).await {
            Ok(text) => return Some(text),
            Err(e) => {
                warn!("OCR page {}: attempt {}/{} failed: {}", page_num, attempt, attempts, e);
                if !e.is_retryable() {
                    break;
                }
                if attempt < attempts && e.wants_backoff() {
                    let backoff = backoff_ms.saturating_mul(2u64.saturating_pow(attempt - 1));
                    sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use std::sync::Mutex;

    fn blank_page() -> ImageData {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([255, 255, 255, 255])));
        encode_page(&img).unwrap()
    }

    /// Fails with the scripted errors first, then reads "page {n}".
    struct Flaky {
        errors: Mutex<Vec<RoleError>>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl PageOcr for Flaky {
        async fn recognize(&self, page_num: u32, _image: &ImageData) -> Result<String, RoleError> {
            *self.calls.lock().unwrap() += 1;
            match self.errors.lock().unwrap().pop() {
                Some(e) => Err(e),
                None => Ok(format!("page {page_num}")),
            }
        }
    }

    #[test]
    fn encodes_png_base64() {
        let data = blank_page();
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).unwrap();
        assert_eq!(&decoded[1..4], b"PNG");
    }

    #[tokio::test]
    async fn transport_errors_are_retried() {
        let ocr = Flaky {
            errors: Mutex::new(vec![RoleError::Transport("503".into())]),
            calls: Mutex::new(0),
        };
        let text = recognize_page(&ocr, 7, &blank_page(), 3, 1).await;
        assert_eq!(text.as_deref(), Some("page 7"));
        assert_eq!(*ocr.calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn unconfigured_provider_gives_up_at_once() {
        let ocr = Flaky {
            errors: Mutex::new(vec![RoleError::NotConfigured("no vision".into())]),
            calls: Mutex::new(0),
        };
        assert!(recognize_page(&ocr, 1, &blank_page(), 3, 1).await.is_none());
        assert_eq!(*ocr.calls.lock().unwrap(), 1);
    }
}
