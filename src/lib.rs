//! # diploma-stamp
//!
//! Match diploma PDFs to student records in an LMS directory and stamp each
//! one with a QR code that a later, independent check can verify.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Extract  candidate names from the text layer or filename (pdfium, spawn_blocking)
//!  ├─ 2. Resolve  directory search + fuzzy scoring → matched / ambiguous / not found
//!  ├─ 3. Course   job course, default course, or the single completed enrolment
//!  ├─ 4. Token    {student, course, date, code, timestamp, institution}, HMAC-keyed
//!  ├─ 5. QR       token JSON → QR bitmap
//!  └─ 6. Stamp    QR + invisible marker onto one page, atomic write
//! ```
//!
//! Every document ends as [`DocumentOutcome::Stamped`] or
//! [`DocumentOutcome::Rejected`] with a machine-readable [`ReasonCode`]; one
//! document's failure never stops a batch.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use diploma_stamp::{Pipeline, PipelineConfig};
//! use std::path::Path;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .directory_url("https://moodle.example.edu")
//!         .directory_token(std::env::var("DIPLOMA_DIRECTORY_TOKEN")?)
//!         .issuer("Example University", std::env::var("DIPLOMA_ISSUER_SECRET")?)
//!         .build()?;
//!     let pipeline = Pipeline::new(config)?;
//!     let job = pipeline.job_for(Path::new("diplomas/joao_silva.pdf"), Path::new("out"));
//!     let report = pipeline.process_batch(vec![job], CancellationToken::new()).await;
//!     eprintln!("{} stamped, {} rejected", report.stats.stamped, report.stats.rejected);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `diploma-stamp` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! diploma-stamp = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod directory;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod stream;
pub mod verify;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    DirectoryConfig, EcLevel, MatchConfig, PipelineConfig, PipelineConfigBuilder, Placement,
    QrConfig,
};
pub use directory::{CompletionFact, DirectoryClient, DirectoryRecord, HealthReport};
pub use error::{
    DiplomaError, DirectoryError, ExtractionError, ReasonCode, RenderError, StampError,
    TokenError,
};
pub use output::{BatchReport, BatchStats, DocumentOutcome, Stage, StampArtifact};
pub use pipeline::extract::{Candidate, CandidateSource, NameExtractor};
pub use pipeline::resolve::{IdentityResolver, ResolutionResult, ScoredRecord};
pub use pipeline::stamp::{DiplomaStamper, StampJob};
pub use pipeline::token::{Issuer, VerificationToken};
pub use process::{DocumentJob, Pipeline};
pub use progress::{BatchProgressCallback, NoopProgressCallback, ProgressCallback};
pub use stream::batch_stream;
pub use verify::{verify_payload, verify_token, VerificationResponse};
