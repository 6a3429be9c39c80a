//! QR stamping: composite a verification QR onto one page of a diploma.
//!
//! ## Coordinates
//!
//! Placement is in PDF points with the origin at the bottom-left of the
//! page. `(x, y)` is the QR's lower-left corner, `size` its edge, and
//! `page` is 0-based.
//!
//! ## What gets written
//!
//! Two page objects are appended to the target page, in this order:
//!
//! 1. an image object holding the QR bitmap, scaled to `size × size`;
//! 2. a fully transparent 1 pt Helvetica text object
//!    `DSTAMP1:<verification code>` at the same origin.
//!
//! The marker is what later runs read to detect an existing stamp; with
//! `overwrite` the marker and the image object right before it are removed
//! before the new pair is added. No other page is modified.
//!
//! ## Atomic output
//!
//! The stamped document is saved into a [`tempfile::NamedTempFile`] created
//! next to the output and then persisted (renamed) over the target, so a
//! reader never sees a half-written PDF. On any failure the temp file is
//! removed by its destructor.

use crate::config::{Placement, QrConfig};
use crate::error::{RenderError, StampError};
use crate::output::StampArtifact;
use crate::pipeline::pdf;
use crate::pipeline::qr::render_qr;
use crate::pipeline::token::VerificationToken;
use pdfium_render::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Largest page edge accepted, in points (the PDF 1.7 user-space limit).
pub const MAX_PAGE_EDGE_PT: f32 = 14_400.0;

/// One stamping request. Consumed once.
#[derive(Debug, Clone, PartialEq)]
pub struct StampJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub token: VerificationToken,
    pub placement: Placement,
    /// Replace an existing output and an existing stamp on the page.
    pub overwrite: bool,
}

/// Renders tokens to QR images and writes stamped copies of diplomas.
#[derive(Debug, Clone, Default)]
pub struct DiplomaStamper {
    qr: QrConfig,
    pdfium_library: Option<PathBuf>,
}

impl DiplomaStamper {
    pub fn new(qr: QrConfig) -> Self {
        Self {
            qr,
            pdfium_library: None,
        }
    }

    pub fn with_pdfium_library(mut self, path: Option<PathBuf>) -> Self {
        self.pdfium_library = path;
        self
    }

    /// Blocking: stamp `job.input` and write the result to `job.output`.
    pub fn stamp(&self, job: &StampJob) -> Result<StampArtifact, StampError> {
        let pdfium =
            pdf::bind_engine(self.pdfium_library.as_deref()).map_err(RenderError::Pdfium)?;

        // ── Existing output ──────────────────────────────────────────────
        if job.output.exists() && !job.overwrite {
            return Err(if output_is_stamped(&pdfium, &job.output) {
                StampError::AlreadyStamped {
                    path: job.output.clone(),
                }
            } else {
                StampError::OutputExists {
                    path: job.output.clone(),
                }
            });
        }

        // ── QR bitmap ────────────────────────────────────────────────────
        let payload = job
            .token
            .to_qr_payload()
            .map_err(|e| RenderError::Qr(e.to_string()))?;
        let image = render_qr(&payload, &self.qr)?;

        // ── Load and validate ────────────────────────────────────────────
        let mut document = pdf::open_file(&pdfium, &job.input)?;
        let total = document.pages().len() as usize;
        let placement = job.placement;
        if placement.page >= total {
            return Err(RenderError::PageOutOfRange {
                page: placement.page,
                total,
            }
            .into());
        }

        let font = document.fonts_mut().helvetica();
        let marker = PdfPageTextObject::new(
            &document,
            pdf::marker_text(&job.token.verification_code),
            font,
            PdfPoints::new(1.0),
        )
        .and_then(|mut obj| {
            obj.set_fill_color(PdfColor::new(255, 255, 255, 0))?;
            obj.translate(PdfPoints::new(placement.x), PdfPoints::new(placement.y))?;
            Ok(obj)
        })
        .map_err(pdfium_error)?;

        {
            let mut page = document
                .pages()
                .get(placement.page as u16)
                .map_err(pdfium_error)?;
            let (width, height) = (page.width().value, page.height().value);
            check_page_size(placement.page, width, height)?;
            check_placement(&placement, width, height)?;

            let page_text = page.text().map(|t| t.all()).map_err(pdfium_error)?;
            if pdf::has_marker(&page_text) {
                if !job.overwrite {
                    return Err(StampError::AlreadyStamped {
                        path: job.input.clone(),
                    });
                }
                let removed = remove_previous_stamp(&mut page)?;
                warn!(
                    "Replacing existing stamp on page {} of '{}' ({} object(s) removed)",
                    placement.page,
                    job.input.display(),
                    removed
                );
            }

            // ── Composite ────────────────────────────────────────────────
            let size = PdfPoints::new(placement.size);
            page.objects_mut()
                .create_image_object(
                    PdfPoints::new(placement.x),
                    PdfPoints::new(placement.y),
                    &image,
                    Some(size),
                    Some(size),
                )
                .map_err(pdfium_error)?;
            page.objects_mut()
                .add_text_object(marker)
                .map_err(pdfium_error)?;
            debug!(
                "Placed {}px QR at ({}, {}) size {}pt on page {} ({}x{}pt)",
                image.width(),
                placement.x,
                placement.y,
                placement.size,
                placement.page,
                width,
                height
            );
        }

        // ── Write ────────────────────────────────────────────────────────
        let bytes = document.save_to_bytes().map_err(pdfium_error)?;
        let bytes_written = write_atomic(&job.output, &bytes)?;
        info!(
            "Stamped '{}' → '{}' ({} bytes)",
            job.input.display(),
            job.output.display(),
            bytes_written
        );

        Ok(StampArtifact {
            path: job.output.clone(),
            page_count: total,
            page: placement.page,
            bytes_written,
        })
    }

    /// [`stamp`](Self::stamp) on the blocking pool.
    pub async fn stamp_async(&self, job: StampJob) -> Result<StampArtifact, StampError> {
        let stamper = self.clone();
        tokio::task::spawn_blocking(move || stamper.stamp(&job))
            .await
            .map_err(|e| RenderError::Pdfium(format!("Stamp task panicked: {}", e)))?
    }
}

/// Page edges must be positive and within [`MAX_PAGE_EDGE_PT`].
pub fn check_page_size(page: usize, width: f32, height: f32) -> Result<(), RenderError> {
    let ok = |edge: f32| edge.is_finite() && (1.0..=MAX_PAGE_EDGE_PT).contains(&edge);
    if ok(width) && ok(height) {
        Ok(())
    } else {
        Err(RenderError::UnsupportedPageSize {
            page,
            width,
            height,
        })
    }
}

/// The QR square must lie entirely on the page.
pub fn check_placement(p: &Placement, width: f32, height: f32) -> Result<(), RenderError> {
    let fits = p.size > 0.0
        && p.x >= 0.0
        && p.y >= 0.0
        && p.x + p.size <= width
        && p.y + p.size <= height;
    if fits {
        Ok(())
    } else {
        Err(RenderError::PlacementOutOfBounds {
            page: p.page,
            x: p.x,
            y: p.y,
            size: p.size,
            width,
            height,
        })
    }
}

fn pdfium_error(e: PdfiumError) -> RenderError {
    RenderError::Pdfium(format!("{:?}", e))
}

/// An unreadable existing output is treated as "not ours".
fn output_is_stamped(pdfium: &Pdfium, path: &Path) -> bool {
    pdf::open_file(pdfium, path)
        .and_then(|doc| pdf::document_texts(&doc, path))
        .is_ok_and(|texts| texts.iter().any(|t| pdf::has_marker(t)))
}

/// Remove every marker text object on `page` and the image object placed
/// immediately before each one. Returns the number of objects removed.
fn remove_previous_stamp(page: &mut PdfPage) -> Result<usize, RenderError> {
    let mut doomed = Vec::new();
    let mut previous_is_image = false;
    for (idx, object) in page.objects().iter().enumerate() {
        let is_marker = object
            .as_text_object()
            .is_some_and(|t| pdf::has_marker(&t.text()));
        if is_marker {
            if previous_is_image {
                doomed.push(idx - 1);
            }
            doomed.push(idx);
        }
        previous_is_image = object.object_type() == PdfPageObjectType::Image;
    }

    doomed.sort_unstable_by(|a, b| b.cmp(a));
    doomed.dedup();
    for idx in &doomed {
        page.objects_mut()
            .remove_object_at_index(*idx)
            .map_err(pdfium_error)?;
    }
    Ok(doomed.len())
}

/// Write `bytes` to `path` through a temp file in the same directory.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<u64, StampError> {
    let write_err = |source: std::io::Error| StampError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(write_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(bytes).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(bytes.len() as u64)
}
