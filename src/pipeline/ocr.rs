//! OCR of rasterised pages.
//!
//! [`VisionOcr`] sends each page image to a vision-capable model with the
//! transcription prompt. Tests substitute their own [`OcrEngine`].

use crate::config::PipelineConfig;
use crate::error::CallError;
use crate::pipeline::encode::encode_page;
use crate::pipeline::llm::build_options;
use crate::prompts::OCR_SYSTEM_PROMPT;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use image::DynamicImage;
use std::sync::Arc;
use tracing::debug;

/// Turns one page image into text. An empty string is a valid result.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// `page_index` is 0-based and only used for diagnostics.
    async fn recognize(&self, page_index: usize, image: &DynamicImage) -> Result<String, CallError>;
}

/// OCR through a vision LLM.
pub struct VisionOcr {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl VisionOcr {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        Self {
            provider,
            options: build_options(config),
        }
    }
}

#[async_trait]
impl OcrEngine for VisionOcr {
    async fn recognize(&self, page_index: usize, image: &DynamicImage) -> Result<String, CallError> {
        let image_data = encode_page(image)
            .map_err(|e| CallError::Provider(format!("image encoding failed: {e}")))?;

        let messages = vec![
            ChatMessage::system(OCR_SYSTEM_PROMPT),
            ChatMessage::user_with_images("", vec![image_data]),
        ];

        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| CallError::Provider(e.to_string()))?;

        debug!(
            "OCR page {}: {} chars, {} output tokens",
            page_index + 1,
            response.content.len(),
            response.completion_tokens
        );
        Ok(response.content.trim().to_string())
    }
}
