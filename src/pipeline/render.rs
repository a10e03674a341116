//! PDF rasterisation: selected pages → PNG [`PageImage`]s via pdfium.
//!
//! pdfium keeps thread-local state and is not async-safe, so all work runs
//! inside `tokio::task::spawn_blocking`.
//!
//! Page size is driven by `dpi` (points × dpi / 72) and capped by
//! `max_rendered_pixels` on the longer edge, keeping memory bounded for
//! oversized pages.

use crate::error::StatementError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming an explicit pdfium library file.
pub const PDFIUM_LIB_ENV: &str = "PDFIUM_LIB_PATH";

/// One rendered statement page, PNG-encoded. `page_num` is 1-based.
#[derive(Clone, PartialEq, Eq)]
pub struct PageImage {
    pub page_num: usize,
    pub png: Vec<u8>,
}

impl PageImage {
    pub fn new(page_num: usize, png: Vec<u8>) -> Self {
        Self { page_num, png }
    }

    /// PNG-encode a rasterised page. PNG is lossless, which keeps small
    /// print legible for OCR.
    pub fn from_image(page_num: usize, image: &DynamicImage) -> Result<Self, image::ImageError> {
        let mut png = Vec::new();
        image.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;
        Ok(Self { page_num, png })
    }
}

impl fmt::Debug for PageImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageImage")
            .field("page_num", &self.page_num)
            .field("png_bytes", &self.png.len())
            .finish()
    }
}

/// Rendering knobs taken from the run configuration.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub dpi: u32,
    pub max_rendered_pixels: u32,
    pub password: Option<String>,
}

/// Rasterise the given 0-based page indices of a PDF.
///
/// Every index must be in range; the caller resolves the selection first
/// with [`page_count`].
pub async fn render_pages(
    pdf_path: &Path,
    options: &RenderOptions,
    page_indices: &[usize],
) -> Result<Vec<PageImage>, StatementError> {
    let path = pdf_path.to_path_buf();
    let options = options.clone();
    let indices = page_indices.to_vec();

    tokio::task::spawn_blocking(move || render_pages_blocking(&path, &options, &indices))
        .await
        .map_err(|e| StatementError::Internal(format!("Render task panicked: {}", e)))?
}

/// Number of pages in the document.
pub async fn page_count(pdf_path: &Path, password: Option<&str>) -> Result<usize, StatementError> {
    let path = pdf_path.to_path_buf();
    let password = password.map(str::to_string);

    tokio::task::spawn_blocking(move || {
        let pdfium = bind_pdfium()?;
        let document = open_document(&pdfium, &path, password.as_deref())?;
        Ok(document.pages().len() as usize)
    })
    .await
    .map_err(|e| StatementError::Internal(format!("Page-count task panicked: {}", e)))?
}

fn render_pages_blocking(
    pdf_path: &Path,
    options: &RenderOptions,
    page_indices: &[usize],
) -> Result<Vec<PageImage>, StatementError> {
    let pdfium = bind_pdfium()?;
    let document = open_document(&pdfium, pdf_path, options.password.as_deref())?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    info!("PDF loaded: {} pages, rendering {}", total_pages, page_indices.len());

    let max_px = options.max_rendered_pixels as i32;
    let mut images = Vec::with_capacity(page_indices.len());

    for &idx in page_indices {
        let page_num = idx + 1;
        if idx >= total_pages {
            return Err(StatementError::PageOutOfRange {
                page: page_num,
                total: total_pages,
            });
        }
        let rasterisation = |detail: String| StatementError::RasterisationFailed {
            page: page_num,
            detail,
        };

        let page = pages
            .get(idx as u16)
            .map_err(|e| rasterisation(format!("{:?}", e)))?;

        let width = (page.width().value * options.dpi as f32 / 72.0).round() as i32;
        let render_config = PdfRenderConfig::new()
            .set_target_width(width.clamp(1, max_px))
            .set_maximum_height(max_px);

        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| rasterisation(format!("{:?}", e)))?;
        let image = bitmap.as_image();

        let encoded =
            PageImage::from_image(page_num, &image).map_err(|e| rasterisation(e.to_string()))?;
        debug!(
            "Rendered page {} → {}x{} px, {} bytes PNG",
            page_num,
            image.width(),
            image.height(),
            encoded.png.len()
        );
        images.push(encoded);
    }

    Ok(images)
}

fn open_document<'a>(
    pdfium: &'a Pdfium,
    path: &Path,
    password: Option<&'a str>,
) -> Result<PdfDocument<'a>, StatementError> {
    pdfium
        .load_pdf_from_file(path, password)
        .map_err(|e| match e {
            PdfiumError::PdfiumLibraryInternalError(PdfiumInternalError::PasswordError) => {
                if password.is_some() {
                    StatementError::WrongPassword {
                        path: path.to_path_buf(),
                    }
                } else {
                    StatementError::PasswordRequired {
                        path: path.to_path_buf(),
                    }
                }
            }
            other => StatementError::CorruptPdf {
                path: path.to_path_buf(),
                detail: format!("{:?}", other),
            },
        })
}

/// Bind the pdfium shared library: `PDFIUM_LIB_PATH` first, then the
/// working directory, then the system search path.
fn bind_pdfium() -> Result<Pdfium, StatementError> {
    let bindings = match std::env::var_os(PDFIUM_LIB_ENV) {
        Some(path) => Pdfium::bind_to_library(PathBuf::from(path)),
        None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| StatementError::PdfiumUnavailable {
        detail: format!("{:?}", e),
    })?;

    Ok(Pdfium::new(bindings))
}
