//! Extraction strategies: document → ordered per-page text.
//!
//! The caller declares how the PDF was produced ([`PdfKind`]); the mapping
//! to a strategy is fixed and nothing is auto-detected.
//!
//! | Kind | Strategy |
//! |------|----------|
//! | `text` | text layer; fails when every page is blank |
//! | `scanned` | rasterise + OCR every page |
//! | `password_protected` | open with the password, then text layer |
//! | `copy_protected` | text layer when permitted and non-blank, else OCR |

use crate::config::PipelineConfig;
use crate::error::{CallError, InvoiceError};
use crate::pipeline::llm::call_with_retries;
use crate::pipeline::ocr::OcrEngine;
use crate::pipeline::render::PdfBackend;
use crate::task::PdfKind;
use futures::stream::{self, StreamExt};
use std::path::Path;
use tracing::{info, warn};

/// Collaborators an extraction strategy may use.
#[derive(Clone, Copy)]
pub struct ExtractionContext<'a> {
    pub backend: &'a dyn PdfBackend,
    pub ocr: &'a dyn OcrEngine,
    pub config: &'a PipelineConfig,
}

/// Closed set of extraction strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    Text,
    Scanned,
    PasswordProtected,
    CopyProtected,
}

impl ExtractionStrategy {
    pub fn for_kind(kind: PdfKind) -> Self {
        match kind {
            PdfKind::Text => ExtractionStrategy::Text,
            PdfKind::Scanned => ExtractionStrategy::Scanned,
            PdfKind::PasswordProtected => ExtractionStrategy::PasswordProtected,
            PdfKind::CopyProtected => ExtractionStrategy::CopyProtected,
        }
    }

    /// Per-page text, index = 0-based page number.
    pub async fn extract(
        self,
        ctx: ExtractionContext<'_>,
        path: &Path,
        password: Option<&str>,
    ) -> Result<Vec<String>, InvoiceError> {
        info!("Extracting {} with {:?} strategy", path.display(), self);
        match self {
            ExtractionStrategy::Text => text_layer(ctx, path, password).await,
            ExtractionStrategy::Scanned => ocr_pages(ctx, path, password).await,
            ExtractionStrategy::PasswordProtected => {
                let password = password
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| InvoiceError::PasswordRequired {
                        path: path.to_path_buf(),
                    })?;
                text_layer(ctx, path, Some(password)).await
            }
            ExtractionStrategy::CopyProtected => {
                let info = ctx.backend.inspect(path, password).await?;
                if info.text_extractable {
                    let pages = ctx.backend.page_texts(path, password).await?;
                    if !all_blank(&pages) {
                        return Ok(pages);
                    }
                    info!("Text layer is blank, falling back to OCR");
                } else {
                    info!("Text extraction is restricted, falling back to OCR");
                }
                ocr_pages(ctx, path, password).await
            }
        }
    }
}

fn all_blank(pages: &[String]) -> bool {
    pages.iter().all(|p| p.trim().is_empty())
}

async fn text_layer(
    ctx: ExtractionContext<'_>,
    path: &Path,
    password: Option<&str>,
) -> Result<Vec<String>, InvoiceError> {
    let pages = ctx.backend.page_texts(path, password).await?;
    if all_blank(&pages) {
        return Err(InvoiceError::UnreadableDocument {
            path: path.to_path_buf(),
            detail: format!("no text layer on any of its {} pages", pages.len()),
        });
    }
    Ok(pages)
}

/// Rasterise and OCR every page with bounded concurrency.
///
/// A page whose OCR call fails after retries becomes `""`; the stage fails
/// only when every page failed.
async fn ocr_pages(
    ctx: ExtractionContext<'_>,
    path: &Path,
    password: Option<&str>,
) -> Result<Vec<String>, InvoiceError> {
    let images = ctx
        .backend
        .render_pages(path, password, ctx.config.max_rendered_pixels)
        .await?;
    let total = images.len();
    if total == 0 {
        return Err(InvoiceError::UnreadableDocument {
            path: path.to_path_buf(),
            detail: "document has no pages".into(),
        });
    }

    let mut results: Vec<(usize, Result<String, CallError>)> =
        stream::iter((0..total).map(|idx| {
            let image = &images[idx];
            async move {
                let label = format!("OCR page {}", idx + 1);
                let result = call_with_retries(&label, ctx.config, ctx.config.max_retries, || {
                    ctx.ocr.recognize(idx, image)
                })
                .await;
                (idx, result)
            }
        }))
        .buffer_unordered(ctx.config.ocr_concurrency.max(1))
        .collect()
        .await;
    results.sort_by_key(|(idx, _)| *idx);

    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    if failed == total {
        let first_error = results
            .iter()
            .find_map(|(_, r)| r.as_ref().err())
            .map(ToString::to_string)
            .unwrap_or_else(|| "Unknown error".to_string());
        return Err(InvoiceError::OcrFailed {
            pages: total,
            first_error,
        });
    }

    let pages: Vec<String> = results
        .into_iter()
        .map(|(idx, r)| {
            r.unwrap_or_else(|e| {
                warn!("Page {}: OCR failed, using empty text: {}", idx + 1, e);
                String::new()
            })
        })
        .collect();
    info!("OCR complete: {}/{} pages recognised", total - failed, total);
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::render::{DocumentInfo, DocumentMetadata};
    use async_trait::async_trait;
    use image::DynamicImage;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakePdf {
        texts: Vec<String>,
        extractable: bool,
        password: Option<&'static str>,
    }

    impl FakePdf {
        fn check(&self, path: &Path, given: Option<&str>) -> Result<(), InvoiceError> {
            match (self.password, given) {
                (None, _) => Ok(()),
                (Some(_), None) => Err(InvoiceError::PasswordRequired {
                    path: path.to_path_buf(),
                }),
                (Some(want), Some(got)) if want == got => Ok(()),
                (Some(_), Some(_)) => Err(InvoiceError::InvalidPassword {
                    path: path.to_path_buf(),
                }),
            }
        }
    }

    #[async_trait]
    impl PdfBackend for FakePdf {
        async fn inspect(&self, path: &Path, pw: Option<&str>) -> Result<DocumentInfo, InvoiceError> {
            self.check(path, pw)?;
            Ok(DocumentInfo {
                page_count: self.texts.len(),
                text_extractable: self.extractable,
                metadata: DocumentMetadata::default(),
            })
        }

        async fn page_texts(&self, path: &Path, pw: Option<&str>) -> Result<Vec<String>, InvoiceError> {
            self.check(path, pw)?;
            Ok(self.texts.clone())
        }

        async fn render_pages(
            &self,
            path: &Path,
            pw: Option<&str>,
            _max: u32,
        ) -> Result<Vec<DynamicImage>, InvoiceError> {
            self.check(path, pw)?;
            Ok(self.texts.iter().map(|_| DynamicImage::new_luma8(4, 4)).collect())
        }
    }

    /// Fails on the pages listed in `failing`.
    struct FakeOcr {
        failing: Vec<usize>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OcrEngine for FakeOcr {
        async fn recognize(&self, page: usize, _img: &DynamicImage) -> Result<String, CallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(&page) {
                Err(CallError::Provider("503".into()))
            } else {
                Ok(format!("ocr page {}", page + 1))
            }
        }
    }

    fn pdf(texts: &[&str]) -> FakePdf {
        FakePdf {
            texts: texts.iter().map(|s| s.to_string()).collect(),
            extractable: true,
            password: None,
        }
    }

    fn ocr(failing: Vec<usize>) -> FakeOcr {
        FakeOcr {
            failing,
            calls: AtomicUsize::new(0),
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig::builder()
            .max_retries(1)
            .retry_backoff_ms(1)
            .build()
            .unwrap()
    }

    fn path() -> PathBuf {
        PathBuf::from("/tmp/doc.pdf")
    }

    #[test]
    fn kind_maps_to_exactly_one_strategy() {
        assert_eq!(ExtractionStrategy::for_kind(PdfKind::Scanned), ExtractionStrategy::Scanned);
        assert_eq!(
            ExtractionStrategy::for_kind(PdfKind::CopyProtected),
            ExtractionStrategy::CopyProtected
        );
    }

    #[tokio::test]
    async fn text_strategy_returns_pages_in_order() {
        let (b, o, c) = (pdf(&["one", "two"]), ocr(vec![]), config());
        let ctx = ExtractionContext { backend: &b, ocr: &o, config: &c };
        let pages = ExtractionStrategy::Text.extract(ctx, &path(), None).await.unwrap();
        assert_eq!(pages, vec!["one", "two"]);
        assert_eq!(o.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn blank_text_layer_is_unreadable() {
        let (b, o, c) = (pdf(&["  ", "\n"]), ocr(vec![]), config());
        let ctx = ExtractionContext { backend: &b, ocr: &o, config: &c };
        let err = ExtractionStrategy::Text.extract(ctx, &path(), None).await.unwrap_err();
        assert!(matches!(err, InvoiceError::UnreadableDocument { .. }));
    }

    #[tokio::test]
    async fn password_strategy_needs_the_right_password() {
        let mut b = pdf(&["secret invoice"]);
        b.password = Some("open-sesame");
        let (o, c) = (ocr(vec![]), config());
        let ctx = ExtractionContext { backend: &b, ocr: &o, config: &c };

        let err = ExtractionStrategy::PasswordProtected
            .extract(ctx, &path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, InvoiceError::PasswordRequired { .. }));

        let err = ExtractionStrategy::PasswordProtected
            .extract(ctx, &path(), Some("wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, InvoiceError::InvalidPassword { .. }));

        let pages = ExtractionStrategy::PasswordProtected
            .extract(ctx, &path(), Some("open-sesame"))
            .await
            .unwrap();
        assert_eq!(pages, vec!["secret invoice"]);
    }

    #[tokio::test]
    async fn scanned_failures_become_empty_pages() {
        let (b, o, c) = (pdf(&["", "", ""]), ocr(vec![1]), config());
        let ctx = ExtractionContext { backend: &b, ocr: &o, config: &c };
        let pages = ExtractionStrategy::Scanned.extract(ctx, &path(), None).await.unwrap();
        assert_eq!(pages, vec!["ocr page 1", "", "ocr page 3"]);
        // page 2 was retried once
        assert_eq!(o.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn scanned_fails_when_every_page_fails() {
        let (b, o, c) = (pdf(&["", ""]), ocr(vec![0, 1]), config());
        let ctx = ExtractionContext { backend: &b, ocr: &o, config: &c };
        let err = ExtractionStrategy::Scanned.extract(ctx, &path(), None).await.unwrap_err();
        assert!(matches!(err, InvoiceError::OcrFailed { pages: 2, .. }));
    }

    #[tokio::test]
    async fn copy_protected_uses_ocr_when_restricted() {
        let mut b = pdf(&["hidden text"]);
        b.extractable = false;
        let (o, c) = (ocr(vec![]), config());
        let ctx = ExtractionContext { backend: &b, ocr: &o, config: &c };
        let pages = ExtractionStrategy::CopyProtected.extract(ctx, &path(), None).await.unwrap();
        assert_eq!(pages, vec!["ocr page 1"]);
    }

    #[tokio::test]
    async fn copy_protected_prefers_permitted_text_layer() {
        let (b, o, c) = (pdf(&["visible text"]), ocr(vec![]), config());
        let ctx = ExtractionContext { backend: &b, ocr: &o, config: &c };
        let pages = ExtractionStrategy::CopyProtected.extract(ctx, &path(), None).await.unwrap();
        assert_eq!(pages, vec!["visible text"]);
        assert_eq!(o.calls.load(Ordering::SeqCst), 0);
    }
}
