//! Input resolution: a path, a URL or raw bytes → a local PDF file.
//!
//! pdfium opens documents from the file system, so downloads and in-memory
//! buffers are spilled into a `TempDir` that lives as long as the
//! [`ResolvedInput`]. The `%PDF` magic is checked up front so a wrong file
//! type fails with a readable error instead of a pdfium parse failure.

use crate::error::StatementError;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info};

const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// A PDF on local disk, possibly backed by a temp directory.
#[derive(Debug)]
pub enum ResolvedInput {
    Local(PathBuf),
    /// Downloaded or spilled bytes; the directory is removed on drop.
    Temporary { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Temporary { path, .. } => path,
        }
    }

    /// File stem, used to name uploaded page images.
    pub fn document_name(&self) -> String {
        self.path()
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("statement")
            .to_string()
    }
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve a path or HTTP(S) URL to a local PDF.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, StatementError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else if input.trim().is_empty() {
        Err(StatementError::InvalidInput {
            input: input.to_string(),
        })
    } else {
        resolve_local(input)
    }
}

/// Write an in-memory PDF to a temp file so pdfium can open it.
pub async fn spill_bytes(bytes: &[u8], name: &str) -> Result<ResolvedInput, StatementError> {
    let temp_dir = TempDir::new().map_err(|e| StatementError::Internal(e.to_string()))?;
    let path = temp_dir.path().join(format!("{name}.pdf"));
    check_magic(bytes, &path)?;

    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| StatementError::Internal(format!("Failed to write temp file: {}", e)))?;

    Ok(ResolvedInput::Temporary {
        path,
        _temp_dir: temp_dir,
    })
}

fn resolve_local(path_str: &str) -> Result<ResolvedInput, StatementError> {
    let path = PathBuf::from(path_str);

    if !path.exists() {
        return Err(StatementError::FileNotFound { path });
    }

    let mut file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(StatementError::PermissionDenied { path });
        }
        Err(_) => return Err(StatementError::FileNotFound { path }),
    };

    let mut head = [0u8; 4];
    let read = file.read(&mut head).unwrap_or(0);
    check_magic(&head[..read], &path)?;

    debug!("Resolved local PDF: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

fn check_magic(bytes: &[u8], path: &Path) -> Result<(), StatementError> {
    if bytes.len() >= 4 && &bytes[..4] == PDF_MAGIC {
        return Ok(());
    }
    let mut magic = [0u8; 4];
    let n = bytes.len().min(4);
    magic[..n].copy_from_slice(&bytes[..n]);
    Err(StatementError::NotAPdf {
        path: path.to_path_buf(),
        magic,
    })
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, StatementError> {
    info!("Downloading statement from: {}", url);

    let failed = |reason: String| StatementError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            StatementError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
    let resolved = spill_bytes(&bytes, &filename_stem(url)).await?;

    info!("Downloaded {} bytes to: {}", bytes.len(), resolved.path().display());
    Ok(resolved)
}

/// Last path segment of the URL without its extension.
fn filename_stem(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .and_then(|last| {
            Path::new(&last)
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "downloaded".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/statement.pdf"));
        assert!(is_url("http://example.com/statement.pdf"));
        assert!(!is_url("/tmp/statement.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn filename_stem_from_url() {
        assert_eq!(filename_stem("https://bank.test/docs/march.pdf"), "march");
        assert_eq!(filename_stem("https://bank.test/"), "downloaded");
    }

    #[test]
    fn local_file_must_be_pdf() {
        let mut f = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        f.write_all(b"PK\x03\x04 zip").unwrap();
        let err = resolve_local(f.path().to_str().unwrap()).unwrap_err();
        match err {
            StatementError::NotAPdf { magic, .. } => assert_eq!(&magic, b"PK\x03\x04"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn local_pdf_resolves_with_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("june_statement.pdf");
        std::fs::write(&path, b"%PDF-1.7\n").unwrap();
        let resolved = resolve_local(path.to_str().unwrap()).unwrap();
        assert_eq!(resolved.path(), path.as_path());
        assert_eq!(resolved.document_name(), "june_statement");
    }

    #[test]
    fn missing_file_is_reported() {
        let err = resolve_local("/definitely/not/here.pdf").unwrap_err();
        assert!(matches!(err, StatementError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn spilled_bytes_live_until_drop() {
        let resolved = spill_bytes(b"%PDF-1.4 tiny", "upload").await.unwrap();
        let path = resolved.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(resolved.document_name(), "upload");
        drop(resolved);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn short_buffer_is_not_a_pdf() {
        let err = spill_bytes(b"%P", "x").await.err().unwrap();
        assert!(matches!(err, StatementError::NotAPdf { .. }));
    }

    #[tokio::test]
    async fn empty_input_is_invalid() {
        let err = resolve_input("  ", 5).await.err().unwrap();
        assert!(matches!(err, StatementError::InvalidInput { .. }));
    }
}
