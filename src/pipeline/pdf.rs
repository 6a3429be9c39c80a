//! PDFium access shared by extraction and stamping.
//!
//! ## Binding order
//!
//! 1. the explicit library path from [`crate::PipelineConfig::pdfium_library`]
//! 2. `PDFIUM_LIB_PATH`
//! 3. the platform library file in the working directory
//! 4. the system library
//!
//! Everything here is blocking. Callers run it inside
//! `tokio::task::spawn_blocking`.
//!
//! ## Stamp marker
//!
//! Every stamped page carries an invisible text object
//! `DSTAMP1:<verification code>` next to the QR image. It survives in the
//! text layer, so an existing stamp is detected by reading page text and
//! never by decoding images.

use crate::error::ExtractionError;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Prefix of the invisible text marker written next to every QR stamp.
pub const STAMP_MARKER_PREFIX: &str = "DSTAMP1:";

/// Marker text for a verification code.
pub fn marker_text(verification_code: &str) -> String {
    format!("{STAMP_MARKER_PREFIX}{verification_code}")
}

/// Whether page text contains a stamp marker.
pub fn has_marker(page_text: &str) -> bool {
    page_text.contains(STAMP_MARKER_PREFIX)
}

/// Bind to a PDFium library, trying the locations in the module order.
pub fn bind_engine(explicit: Option<&Path>) -> Result<Pdfium, String> {
    let mut tried = Vec::new();
    for path in library_candidates(explicit) {
        match Pdfium::bind_to_library(&path) {
            Ok(bindings) => {
                debug!("Bound pdfium at {}", path.display());
                return Ok(Pdfium::new(bindings));
            }
            Err(e) => tried.push(format!("{}: {}", path.display(), e)),
        }
    }
    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(e) => {
            tried.push(format!("system library: {e}"));
            Err(tried.join("; "))
        }
    }
}

fn library_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = explicit {
        out.push(p.to_path_buf());
    }
    if let Ok(env_path) = std::env::var("PDFIUM_LIB_PATH") {
        if !env_path.trim().is_empty() {
            out.push(PathBuf::from(env_path));
        }
    }
    out.push(PathBuf::from(Pdfium::pdfium_platform_library_name_at_path("./")));
    out
}

/// Map a PDFium load failure onto the extraction taxonomy.
pub(crate) fn load_error(path: &Path, e: PdfiumError) -> ExtractionError {
    let err_str = format!("{:?}", e);
    if err_str.contains("Password") || err_str.contains("password") {
        ExtractionError::Encrypted {
            path: path.to_path_buf(),
        }
    } else {
        ExtractionError::CorruptPdf {
            path: path.to_path_buf(),
            detail: err_str,
        }
    }
}

/// Open a document from disk.
pub(crate) fn open_file<'a>(pdfium: &'a Pdfium, path: &Path) -> Result<PdfDocument<'a>, ExtractionError> {
    pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| load_error(path, e))
}

/// Text of every page, in page order.
pub(crate) fn document_texts(document: &PdfDocument, path: &Path) -> Result<Vec<String>, ExtractionError> {
    let mut texts = Vec::new();
    for (idx, page) in document.pages().iter().enumerate() {
        let text = page.text().map_err(|e| ExtractionError::TextLayer {
            path: path.to_path_buf(),
            page: idx,
            detail: format!("{:?}", e),
        })?;
        texts.push(text.all());
    }
    debug!(
        "Read text layer of '{}': {} page(s), {} chars",
        path.display(),
        texts.len(),
        texts.iter().map(String::len).sum::<usize>()
    );
    Ok(texts)
}

/// Blocking: per-page text of a PDF file.
pub fn page_texts(path: &Path, library: Option<&Path>) -> Result<Vec<String>, ExtractionError> {
    let pdfium = bind_engine(library).map_err(ExtractionError::Engine)?;
    let document = open_file(&pdfium, path)?;
    document_texts(&document, path)
}

/// Blocking: per-page text of an in-memory PDF. `name` only labels errors.
pub fn page_texts_from_bytes(
    bytes: &[u8],
    name: &Path,
    library: Option<&Path>,
) -> Result<Vec<String>, ExtractionError> {
    if !bytes.starts_with(b"%PDF") {
        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        return Err(ExtractionError::NotAPdf {
            path: name.to_path_buf(),
            magic,
        });
    }
    let pdfium = bind_engine(library).map_err(ExtractionError::Engine)?;
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| load_error(name, e))?;
    document_texts(&document, name)
}

/// Blocking: number of pages of a PDF file.
pub fn page_count(path: &Path, library: Option<&Path>) -> Result<usize, ExtractionError> {
    let pdfium = bind_engine(library).map_err(ExtractionError::Engine)?;
    let document = open_file(&pdfium, path)?;
    Ok(document.pages().len() as usize)
}

/// Blocking: whether any page of a PDF file carries a stamp marker.
pub fn is_stamped(path: &Path, library: Option<&Path>) -> Result<bool, ExtractionError> {
    Ok(page_texts(path, library)?.iter().any(|t| has_marker(t)))
}
