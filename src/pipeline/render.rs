//! PDF access: page count, permissions, document info, text layer and
//! rasterisation.
//!
//! [`PdfBackend`] is the seam the extraction strategies use; [`PdfiumBackend`]
//! implements it with `pdfium-render`. pdfium is CPU-bound and not async-safe,
//! so every call runs inside `tokio::task::spawn_blocking`.

use crate::error::InvoiceError;
use async_trait::async_trait;
use image::DynamicImage;
use pdfium_render::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming the pdfium shared library (file or directory).
pub const PDFIUM_LIB_PATH_ENV: &str = "PDFIUM_LIB_PATH";

/// What the extraction strategies need to know before reading a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentInfo {
    pub page_count: usize,
    /// False when the document's permission flags forbid copying text.
    pub text_extractable: bool,
    pub metadata: DocumentMetadata,
}

/// Document-information dictionary of a PDF. Absent or empty entries are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer: Option<String>,
    /// Raw PDF date string, e.g. `D:20240301120000Z`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modification_date: Option<String>,
    pub page_count: usize,
}

/// PDF library capability.
///
/// Implementations map a missing password to [`InvoiceError::PasswordRequired`],
/// a wrong one to [`InvoiceError::InvalidPassword`], and any other load
/// failure to [`InvoiceError::UnreadableDocument`].
#[async_trait]
pub trait PdfBackend: Send + Sync {
    /// Page count, copy permission and the document-information dictionary.
    async fn inspect(&self, path: &Path, password: Option<&str>)
        -> Result<DocumentInfo, InvoiceError>;

    /// Text layer of every page, in page order. Pages without text are `""`.
    async fn page_texts(&self, path: &Path, password: Option<&str>)
        -> Result<Vec<String>, InvoiceError>;

    /// Rasterise every page, longest edge capped at `max_pixels`.
    async fn render_pages(
        &self,
        path: &Path,
        password: Option<&str>,
        max_pixels: u32,
    ) -> Result<Vec<DynamicImage>, InvoiceError>;
}

/// [`PdfBackend`] over the pdfium C library.
#[derive(Debug, Clone, Default)]
pub struct PdfiumBackend {
    library_path: Option<PathBuf>,
}

impl PdfiumBackend {
    /// Bind to the library named by `PDFIUM_LIB_PATH`, else the system one.
    pub fn new() -> Self {
        Self {
            library_path: std::env::var_os(PDFIUM_LIB_PATH_ENV).map(PathBuf::from),
        }
    }

    pub fn with_library_path(path: impl Into<PathBuf>) -> Self {
        Self {
            library_path: Some(path.into()),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, InvoiceError>
    where
        T: Send + 'static,
        F: FnOnce(&Pdfium) -> Result<T, InvoiceError> + Send + 'static,
    {
        let library_path = self.library_path.clone();
        tokio::task::spawn_blocking(move || {
            let pdfium = bind(library_path.as_deref())?;
            f(&pdfium)
        })
        .await
        .map_err(|e| InvoiceError::Internal(format!("pdfium task panicked: {e}")))?
    }
}

fn bind(library_path: Option<&Path>) -> Result<Pdfium, InvoiceError> {
    let bindings = match library_path {
        Some(p) if p.is_dir() => {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(p))
        }
        Some(p) => Pdfium::bind_to_library(p),
        None => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| InvoiceError::PdfiumBindingFailed(format!("{e:?}")))?;
    Ok(Pdfium::new(bindings))
}

fn load<'a>(
    pdfium: &'a Pdfium,
    path: &Path,
    password: Option<&'a str>,
) -> Result<PdfDocument<'a>, InvoiceError> {
    pdfium.load_pdf_from_file(path, password).map_err(|e| {
        let err_str = format!("{e:?}");
        if err_str.contains("Password") || err_str.contains("password") {
            if password.is_some() {
                InvoiceError::InvalidPassword {
                    path: path.to_path_buf(),
                }
            } else {
                InvoiceError::PasswordRequired {
                    path: path.to_path_buf(),
                }
            }
        } else {
            InvoiceError::UnreadableDocument {
                path: path.to_path_buf(),
                detail: err_str,
            }
        }
    })
}

fn read_metadata(document: &PdfDocument<'_>, page_count: usize) -> DocumentMetadata {
    let metadata = document.metadata();
    let get = |tag: PdfDocumentMetadataTagType| -> Option<String> {
        metadata
            .get(tag)
            .map(|t| t.value().trim().to_string())
            .filter(|v| !v.is_empty())
    };

    DocumentMetadata {
        title: get(PdfDocumentMetadataTagType::Title),
        author: get(PdfDocumentMetadataTagType::Author),
        subject: get(PdfDocumentMetadataTagType::Subject),
        keywords: get(PdfDocumentMetadataTagType::Keywords),
        creator: get(PdfDocumentMetadataTagType::Creator),
        producer: get(PdfDocumentMetadataTagType::Producer),
        creation_date: get(PdfDocumentMetadataTagType::CreationDate),
        modification_date: get(PdfDocumentMetadataTagType::ModificationDate),
        page_count,
    }
}

#[async_trait]
impl PdfBackend for PdfiumBackend {
    async fn inspect(
        &self,
        path: &Path,
        password: Option<&str>,
    ) -> Result<DocumentInfo, InvoiceError> {
        let path = path.to_path_buf();
        let password = password.map(str::to_string);
        self.blocking(move |pdfium| {
            let document = load(pdfium, &path, password.as_deref())?;
            let text_extractable = document
                .permissions()
                .can_extract_text_and_graphics()
                .unwrap_or(false);
            let page_count = document.pages().len() as usize;
            let info = DocumentInfo {
                page_count,
                text_extractable,
                metadata: read_metadata(&document, page_count),
            };
            debug!("Inspected {}: {:?}", path.display(), info);
            Ok(info)
        })
        .await
    }

    async fn page_texts(
        &self,
        path: &Path,
        password: Option<&str>,
    ) -> Result<Vec<String>, InvoiceError> {
        let path = path.to_path_buf();
        let password = password.map(str::to_string);
        self.blocking(move |pdfium| {
            let document = load(pdfium, &path, password.as_deref())?;
            let mut texts = Vec::new();
            for (idx, page) in document.pages().iter().enumerate() {
                let text = page
                    .text()
                    .map(|t| t.all())
                    .map_err(|e| InvoiceError::UnreadableDocument {
                        path: path.clone(),
                        detail: format!("page {}: {e:?}", idx + 1),
                    })?;
                texts.push(text);
            }
            info!("Extracted text layer of {} pages", texts.len());
            Ok(texts)
        })
        .await
    }

    async fn render_pages(
        &self,
        path: &Path,
        password: Option<&str>,
        max_pixels: u32,
    ) -> Result<Vec<DynamicImage>, InvoiceError> {
        let path = path.to_path_buf();
        let password = password.map(str::to_string);
        self.blocking(move |pdfium| {
            let document = load(pdfium, &path, password.as_deref())?;
            let render_config = PdfRenderConfig::new()
                .set_target_width(max_pixels as i32)
                .set_maximum_height(max_pixels as i32);

            let mut images = Vec::new();
            for (idx, page) in document.pages().iter().enumerate() {
                let bitmap = page.render_with_config(&render_config).map_err(|e| {
                    InvoiceError::RasterisationFailed {
                        page: idx + 1,
                        detail: format!("{e:?}"),
                    }
                })?;
                let image = bitmap.as_image();
                debug!(
                    "Rendered page {} → {}x{} px",
                    idx + 1,
                    image.width(),
                    image.height()
                );
                images.push(image);
            }
            info!("Rendered {} pages", images.len());
            Ok(images)
        })
        .await
    }
}
