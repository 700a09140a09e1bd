//! Configuration for the invoice pipeline.
//!
//! Every knob the queue, the worker pool and the extraction stages read lives
//! in [`PipelineConfig`], built once at startup via [`PipelineConfigBuilder`]
//! and shared by reference. The encryption key is the only secret it holds.

use crate::crypto::EncryptionKey;
use crate::error::InvoiceError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Process-wide pipeline configuration.
///
/// # Example
/// ```rust
/// use edgequake_invoice::{EncryptionKey, PipelineConfig};
///
/// let config = PipelineConfig::builder()
///     .encryption_key(EncryptionKey::generate())
///     .workers(4)
///     .extraction_concurrency(2)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// assert_eq!(config.workers, 4);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Key for payloads and results at rest. Required by every queue-backed
    /// operation; the synchronous path does not need it.
    pub encryption_key: Option<EncryptionKey>,

    /// Number of independent claim/dispatch loops. Default: 1.
    pub workers: usize,

    /// Simultaneous extraction calls across all in-flight tasks. Default: 2.
    ///
    /// One semaphore is shared by every worker of the process, so raising
    /// `workers` does not raise the pressure on the provider.
    pub extraction_concurrency: usize,

    /// Simultaneous OCR calls within one document. Default: 4.
    pub ocr_concurrency: usize,

    /// Idle wait between empty claims, in milliseconds. Default: 1000.
    pub poll_interval_ms: u64,

    /// Wait after a store outage before the next claim, in milliseconds. Default: 2000.
    pub queue_backoff_ms: u64,

    /// Interval of the expired-task sweeper, in seconds. Default: 60.
    pub purge_interval_secs: u64,

    /// Task lifetime when the submission does not set one, in seconds. Default: 3600.
    pub default_ttl_secs: u64,

    /// LLM model identifier, e.g. "gpt-4.1-mini". If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens generated per call. Default: 4096.
    pub max_tokens: usize,

    /// Retries of one extraction or OCR call. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Extra boundary-proposal attempts before the fallback split. Default: 2.
    pub analysis_retries: u32,

    /// Characters of each page shown to the boundary analyzer. Default: 4000.
    pub analysis_chars_per_page: usize,

    /// Per-call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Download timeout for URL documents in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Longest edge of a rasterised page in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// Optional observer for per-range events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            encryption_key: None,
            workers: 1,
            extraction_concurrency: 2,
            ocr_concurrency: 4,
            poll_interval_ms: 1000,
            queue_backoff_ms: 2000,
            purge_interval_secs: 60,
            default_ttl_secs: 3600,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 4096,
            max_retries: 3,
            retry_backoff_ms: 500,
            analysis_retries: 2,
            analysis_chars_per_page: 4000,
            api_timeout_secs: 60,
            download_timeout_secs: 120,
            max_rendered_pixels: 2000,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "<redacted>"))
            .field("workers", &self.workers)
            .field("extraction_concurrency", &self.extraction_concurrency)
            .field("ocr_concurrency", &self.ocr_concurrency)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("default_ttl_secs", &self.default_ttl_secs)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("analysis_retries", &self.analysis_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn queue_backoff(&self) -> Duration {
        Duration::from_millis(self.queue_backoff_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Backoff before retry `attempt` (1-based): `retry_backoff_ms * 2^(attempt-1)`.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    /// The key, or `InvalidConfig` when a queue operation is attempted without one.
    pub fn require_key(&self) -> Result<&EncryptionKey, InvoiceError> {
        self.encryption_key.as_ref().ok_or_else(|| {
            InvoiceError::InvalidConfig(
                "an encryption key is required for queued tasks (set PDF2INVOICE_KEY)".into(),
            )
        })
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn encryption_key(mut self, key: EncryptionKey) -> Self {
        self.config.encryption_key = Some(key);
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n;
        self
    }

    pub fn extraction_concurrency(mut self, n: usize) -> Self {
        self.config.extraction_concurrency = n;
        self
    }

    pub fn ocr_concurrency(mut self, n: usize) -> Self {
        self.config.ocr_concurrency = n.max(1);
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn queue_backoff_ms(mut self, ms: u64) -> Self {
        self.config.queue_backoff_ms = ms;
        self
    }

    pub fn purge_interval_secs(mut self, secs: u64) -> Self {
        self.config.purge_interval_secs = secs.max(1);
        self
    }

    pub fn default_ttl_secs(mut self, secs: u64) -> Self {
        self.config.default_ttl_secs = secs;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn analysis_retries(mut self, n: u32) -> Self {
        self.config.analysis_retries = n;
        self
    }

    pub fn analysis_chars_per_page(mut self, n: usize) -> Self {
        self.config.analysis_chars_per_page = n.max(1);
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, InvoiceError> {
        let c = &self.config;
        if c.workers == 0 {
            return Err(InvoiceError::InvalidConfig("workers must be ≥ 1".into()));
        }
        if c.extraction_concurrency == 0 {
            return Err(InvoiceError::InvalidConfig(
                "extraction_concurrency must be ≥ 1".into(),
            ));
        }
        if c.default_ttl_secs == 0 || c.default_ttl_secs > crate::store::MAX_TTL.as_secs() {
            return Err(InvoiceError::InvalidConfig(format!(
                "default_ttl_secs must be between 1 and {}",
                crate::store::MAX_TTL.as_secs()
            )));
        }
        if c.api_timeout_secs == 0 {
            return Err(InvoiceError::InvalidConfig(
                "api_timeout_secs must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}
