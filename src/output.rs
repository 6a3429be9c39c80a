//! Output types: per-document outcomes and the batch report.

use crate::error::ReasonCode;
use crate::pipeline::resolve::ScoredRecord;
use crate::pipeline::token::VerificationToken;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The stamped PDF written by [`crate::pipeline::stamp::DiplomaStamper`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StampArtifact {
    /// Where the stamped document was written.
    pub path: PathBuf,

    /// Page count of the output, always equal to the input's.
    pub page_count: usize,

    /// 0-based page that received the QR.
    pub page: usize,

    pub bytes_written: u64,
}

/// Pipeline stage at which a document stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extraction,
    Resolution,
    Course,
    Token,
    Stamping,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Extraction => "extraction",
            Stage::Resolution => "resolution",
            Stage::Course => "course",
            Stage::Token => "token",
            Stage::Stamping => "stamping",
        };
        f.write_str(s)
    }
}

/// Terminal state of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DocumentOutcome {
    Stamped {
        input: PathBuf,
        artifact: StampArtifact,
        identity_id: i64,
        course_id: i64,
        student_name: String,
        token: VerificationToken,
    },
    Rejected {
        input: PathBuf,
        stage: Stage,
        reason: ReasonCode,
        message: String,
        /// Scored records for manual matching when resolution was ambiguous.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        candidates: Vec<ScoredRecord>,
    },
}

impl DocumentOutcome {
    pub fn rejected(input: &Path, stage: Stage, reason: ReasonCode, message: impl Into<String>) -> Self {
        DocumentOutcome::Rejected {
            input: input.to_path_buf(),
            stage,
            reason,
            message: message.into(),
            candidates: Vec::new(),
        }
    }

    /// Attach scored records to a rejection; no effect on `Stamped`.
    pub fn with_candidates(mut self, scored: Vec<ScoredRecord>) -> Self {
        if let DocumentOutcome::Rejected { candidates, .. } = &mut self {
            *candidates = scored;
        }
        self
    }

    pub fn input(&self) -> &Path {
        match self {
            DocumentOutcome::Stamped { input, .. } | DocumentOutcome::Rejected { input, .. } => input,
        }
    }

    pub fn is_stamped(&self) -> bool {
        matches!(self, DocumentOutcome::Stamped { .. })
    }

    pub fn reason(&self) -> Option<ReasonCode> {
        match self {
            DocumentOutcome::Stamped { .. } => None,
            DocumentOutcome::Rejected { reason, .. } => Some(*reason),
        }
    }
}

/// Aggregate counts for a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    /// Jobs submitted.
    pub total: usize,
    pub stamped: usize,
    pub rejected: usize,
    /// Jobs never dispatched because the batch was cancelled.
    pub skipped: usize,
    pub duration_ms: u64,
}

impl BatchStats {
    /// Counts for `outcomes` out of `total` submitted jobs.
    pub fn tally(outcomes: &[DocumentOutcome], total: usize, duration_ms: u64) -> Self {
        let stamped = outcomes.iter().filter(|o| o.is_stamped()).count();
        let rejected = outcomes.len() - stamped;
        Self {
            total,
            stamped,
            rejected,
            skipped: total.saturating_sub(outcomes.len()),
            duration_ms,
        }
    }
}

/// Everything a batch produced, in completion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub outcomes: Vec<DocumentOutcome>,
    pub stats: BatchStats,
}

impl BatchReport {
    pub fn all_stamped(&self) -> bool {
        self.stats.rejected == 0 && self.stats.skipped == 0
    }

    pub fn rejected(&self) -> impl Iterator<Item = &DocumentOutcome> {
        self.outcomes.iter().filter(|o| !o.is_stamped())
    }
}
