//! Error types for the diploma-stamp library.
//!
//! Each pipeline stage owns its error enum so callers can match on exactly
//! the failures a stage can produce:
//!
//! * [`ExtractionError`] — the PDF could not be opened or read.
//! * [`DirectoryError`] — the directory service refused, rejected or never
//!   answered a request.
//! * [`TokenError`] — a verification token could not be built or checked.
//! * [`StampError`] / [`RenderError`] — the QR could not be composited.
//!
//! [`DiplomaError`] wraps all of them for the fatal, top-level paths
//! (configuration, engine binding). Inside a batch nothing is fatal: every
//! error is converted to a [`ReasonCode`] plus message and stored in
//! [`crate::output::DocumentOutcome::Rejected`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the diploma-stamp library.
#[derive(Debug, Error)]
pub enum DiplomaError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Stamp(#[from] StampError),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or place the library next to the binary."
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DiplomaError {
    /// Machine-readable reason for operator reports.
    pub fn reason(&self) -> ReasonCode {
        match self {
            DiplomaError::Extraction(_) => ReasonCode::ExtractionFailed,
            DiplomaError::Directory(e) => e.reason(),
            DiplomaError::Token(e) => e.reason(),
            DiplomaError::Stamp(e) => e.reason(),
            DiplomaError::PdfiumBindingFailed(_) => ReasonCode::ExtractionFailed,
            DiplomaError::InvalidConfig(_) | DiplomaError::Internal(_) => ReasonCode::Internal,
        }
    }
}

// ── Extraction ───────────────────────────────────────────────────────────

/// The input document could not be read. Fatal for that document.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("PDF file not found: '{path}'")]
    FileNotFound { path: PathBuf },

    #[error("Permission denied reading '{path}'")]
    PermissionDenied { path: PathBuf },

    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    #[error("PDF '{path}' is encrypted and requires a password")]
    Encrypted { path: PathBuf },

    /// PDFium itself could not be loaded.
    #[error("PDF engine unavailable: {0}")]
    Engine(String),

    #[error("Text extraction failed on page {page} of '{path}': {detail}")]
    TextLayer {
        path: PathBuf,
        page: usize,
        detail: String,
    },

    #[error("Extraction task failed: {0}")]
    Internal(String),
}

// ── Directory ────────────────────────────────────────────────────────────

/// Failures talking to the directory service.
#[derive(Debug, Clone, Error)]
pub enum DirectoryError {
    /// The service token was rejected. Not retried.
    #[error("Directory authentication failed: {message}")]
    Auth { message: String },

    /// The request or the response was malformed. Not retried.
    #[error("Directory request failed: {message}")]
    Request { message: String },

    /// Transient failures persisted through every attempt.
    #[error("Directory unavailable after {attempts} attempt(s): {last_error}")]
    Unavailable { attempts: u32, last_error: String },
}

impl DirectoryError {
    pub fn request(message: impl Into<String>) -> Self {
        DirectoryError::Request {
            message: message.into(),
        }
    }

    pub fn reason(&self) -> ReasonCode {
        match self {
            DirectoryError::Auth { .. } => ReasonCode::DirectoryAuth,
            DirectoryError::Request { .. } => ReasonCode::DirectoryRequest,
            DirectoryError::Unavailable { .. } => ReasonCode::DirectoryUnavailable,
        }
    }
}

// ── Token ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    /// The completion fact does not support issuing a diploma.
    #[error("Incomplete data for student {identity_id}, course {course_id}: {detail}")]
    IncompleteData {
        identity_id: i64,
        course_id: i64,
        detail: String,
    },

    /// The verification code does not match the token contents.
    #[error("Verification code does not match token contents")]
    InvalidCode,

    /// The token or its verification code could not be parsed.
    #[error("Malformed verification token: {0}")]
    Malformed(String),
}

impl TokenError {
    pub fn reason(&self) -> ReasonCode {
        match self {
            TokenError::IncompleteData { .. } => ReasonCode::IncompleteData,
            TokenError::InvalidCode | TokenError::Malformed(_) => ReasonCode::Internal,
        }
    }
}

// ── Stamping ─────────────────────────────────────────────────────────────

/// The QR could not be placed or rendered.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RenderError {
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    #[error("Placement {size}pt at ({x}, {y}) does not fit page {page} ({width}x{height}pt)")]
    PlacementOutOfBounds {
        page: usize,
        x: f32,
        y: f32,
        size: f32,
        width: f32,
        height: f32,
    },

    #[error("Unsupported page size on page {page}: {width}x{height}pt")]
    UnsupportedPageSize { page: usize, width: f32, height: f32 },

    #[error("QR payload is {len} bytes; the limit is {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("QR encoding failed: {0}")]
    Qr(String),

    #[error("PDF engine error: {0}")]
    Pdfium(String),
}

#[derive(Debug, Error)]
pub enum StampError {
    /// The target already carries a verification QR.
    #[error("'{path}' already carries a verification QR; pass --overwrite to replace it")]
    AlreadyStamped { path: PathBuf },

    /// The output path exists and is not a previously stamped diploma.
    #[error("Output '{path}' already exists; pass --overwrite to replace it")]
    OutputExists { path: PathBuf },

    #[error(transparent)]
    Render(#[from] RenderError),

    /// The input document could not be opened for stamping.
    #[error(transparent)]
    Load(#[from] ExtractionError),

    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StampError {
    pub fn reason(&self) -> ReasonCode {
        match self {
            StampError::AlreadyStamped { .. } => ReasonCode::AlreadyStamped,
            StampError::OutputExists { .. } => ReasonCode::OutputExists,
            StampError::Render(_) => ReasonCode::RenderFailed,
            StampError::Load(_) => ReasonCode::ExtractionFailed,
            StampError::OutputWriteFailed { .. } => ReasonCode::RenderFailed,
        }
    }
}

// ── Reason codes ─────────────────────────────────────────────────────────

/// Machine-readable reason attached to every rejected document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    ExtractionFailed,
    NameNotFound,
    IdentityNotFound,
    IdentityAmbiguous,
    CourseUndetermined,
    IncompleteData,
    DirectoryAuth,
    DirectoryRequest,
    DirectoryUnavailable,
    AlreadyStamped,
    OutputExists,
    RenderFailed,
    Internal,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::ExtractionFailed => "extraction_failed",
            ReasonCode::NameNotFound => "name_not_found",
            ReasonCode::IdentityNotFound => "identity_not_found",
            ReasonCode::IdentityAmbiguous => "identity_ambiguous",
            ReasonCode::CourseUndetermined => "course_undetermined",
            ReasonCode::IncompleteData => "incomplete_data",
            ReasonCode::DirectoryAuth => "directory_auth",
            ReasonCode::DirectoryRequest => "directory_request",
            ReasonCode::DirectoryUnavailable => "directory_unavailable",
            ReasonCode::AlreadyStamped => "already_stamped",
            ReasonCode::OutputExists => "output_exists",
            ReasonCode::RenderFailed => "render_failed",
            ReasonCode::Internal => "internal",
        }
    }

    /// Whether re-running the same document later may succeed without
    /// operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReasonCode::DirectoryUnavailable)
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
