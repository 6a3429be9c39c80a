//! Input resolution: validate local PDFs, expand directories, name outputs.
//!
//! We validate the PDF magic bytes (`%PDF`) before anything reaches pdfium so
//! callers get a meaningful error rather than a pdfium crash.

use crate::error::ExtractionError;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Validate a local file path: it must exist, be readable and start with `%PDF`.
pub fn resolve_local(path: &Path) -> Result<PathBuf, ExtractionError> {
    let path = path.to_path_buf();

    if !path.is_file() {
        return Err(ExtractionError::FileNotFound { path });
    }

    match std::fs::File::open(&path) {
        Ok(mut f) => {
            let mut magic = [0u8; 4];
            let n = f.read(&mut magic).unwrap_or(0);
            if n < 4 || &magic != b"%PDF" {
                return Err(ExtractionError::NotAPdf { path, magic });
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ExtractionError::PermissionDenied { path });
        }
        Err(_) => {
            return Err(ExtractionError::FileNotFound { path });
        }
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(path)
}

/// `*.pdf` files directly inside `dir` (extension case-insensitive), sorted.
pub fn discover_pdfs(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_pdf = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
        if is_pdf && path.is_file() {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Expand a mix of files and directories into a sorted, de-duplicated list
/// of PDF paths. Files are kept as given; directories contribute their PDFs.
pub fn expand_inputs(inputs: &[PathBuf]) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for input in inputs {
        if input.is_dir() {
            out.extend(discover_pdfs(input)?);
        } else {
            out.push(input.clone());
        }
    }
    out.sort();
    out.dedup();
    Ok(out)
}

/// `<out_dir>/<stem><suffix>.pdf`.
pub fn output_path_for(input: &Path, out_dir: &Path, suffix: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    out_dir.join(format!("{stem}{suffix}.pdf"))
}
