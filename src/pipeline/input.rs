//! Document resolution: a task's `document` reference becomes a local PDF.
//!
//! pdfium opens files by path, so remote documents are fetched into a
//! [`TempDir`] owned by the returned [`LocalDocument`]; the copy disappears
//! when the task drops it. Both branches check the `%PDF` signature up front.

use crate::error::InvoiceError;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info};

const PDF_MAGIC: &[u8; 4] = b"%PDF";
const FALLBACK_FILENAME: &str = "document.pdf";

/// A PDF on the local file system, possibly a temporary download.
#[derive(Debug)]
pub enum LocalDocument {
    Path(PathBuf),
    Fetched { path: PathBuf, _dir: TempDir },
}

impl LocalDocument {
    pub fn path(&self) -> &Path {
        match self {
            LocalDocument::Path(p) => p,
            LocalDocument::Fetched { path, .. } => path,
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, LocalDocument::Fetched { .. })
    }
}

pub fn is_url(document: &str) -> bool {
    document.starts_with("http://") || document.starts_with("https://")
}

/// Resolve a document reference (file path or HTTP(S) URL).
pub async fn resolve_document(
    document: &str,
    download_timeout: Duration,
) -> Result<LocalDocument, InvoiceError> {
    let document = document.trim();
    if document.is_empty() {
        return Err(InvoiceError::InvalidInput {
            input: document.to_string(),
        });
    }
    if is_url(document) {
        fetch(document, download_timeout).await
    } else if document.contains("://") {
        Err(InvoiceError::InvalidInput {
            input: document.to_string(),
        })
    } else {
        let path = PathBuf::from(document);
        tokio::task::spawn_blocking(move || open_local(path))
            .await
            .map_err(|e| InvoiceError::Internal(format!("file check panicked: {e}")))?
    }
}

fn open_local(path: PathBuf) -> Result<LocalDocument, InvoiceError> {
    let mut file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(InvoiceError::PermissionDenied { path });
        }
        Err(_) => return Err(InvoiceError::FileNotFound { path }),
    };
    if file.metadata().map(|m| m.is_dir()).unwrap_or(false) {
        return Err(InvoiceError::FileNotFound { path });
    }

    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => check_magic(&path, &magic)?,
        Err(e) => {
            return Err(InvoiceError::UnreadableDocument {
                path,
                detail: format!("too short to be a PDF: {e}"),
            })
        }
    }

    debug!("Using local document {}", path.display());
    Ok(LocalDocument::Path(path))
}

fn check_magic(path: &Path, head: &[u8]) -> Result<(), InvoiceError> {
    if head.len() < PDF_MAGIC.len() {
        return Err(InvoiceError::UnreadableDocument {
            path: path.to_path_buf(),
            detail: format!("only {} bytes", head.len()),
        });
    }
    if &head[..4] != PDF_MAGIC {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&head[..4]);
        return Err(InvoiceError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }
    Ok(())
}

async fn fetch(url: &str, timeout: Duration) -> Result<LocalDocument, InvoiceError> {
    info!("Fetching document {}", url);
    let failed = |reason: String| InvoiceError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            InvoiceError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout.as_secs(),
            }
        } else {
            failed(e.to_string())
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(failed(format!("HTTP {status}")));
    }

    let bytes = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            InvoiceError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout.as_secs(),
            }
        } else {
            failed(e.to_string())
        }
    })?;

    let dir = TempDir::new().map_err(|e| InvoiceError::Internal(e.to_string()))?;
    let path = dir.path().join(filename_from_url(url));
    check_magic(&path, &bytes)?;

    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| InvoiceError::Internal(format!("cannot write downloaded document: {e}")))?;

    info!("Fetched {} bytes to {}", bytes.len(), path.display());
    Ok(LocalDocument::Fetched { path, _dir: dir })
}

/// Last path segment of the URL when it looks like a file name.
fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|last| !last.is_empty() && last.contains('.'))
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string())
}
