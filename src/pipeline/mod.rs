//! Pipeline stages for statement extraction.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ orchestrator ──▶ normalize ──▶ merge
//! (path/URL) (pdfium)  (submit/poll)   (per page)    (dedupe)
//! ```
//!
//! 1. [`input`]: path, URL or bytes → local PDF file
//! 2. [`render`]: rasterise selected pages to PNG; pdfium runs in
//!    `spawn_blocking`
//! 3. [`orchestrator`]: one remote job per page under admission control;
//!    the only stage with network I/O besides the sample request
//! 4. [`normalize`]: raw page response → rows of the schema, using
//!    [`table`] for embedded HTML
//! 5. [`merge`]: page-ordered concatenation, tagging and deduplication

pub mod input;
pub mod merge;
pub mod normalize;
pub mod orchestrator;
pub mod render;
pub mod table;
