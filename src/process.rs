//! Per-document orchestration and batch entry points.
//!
//! ## State machine
//!
//! ```text
//! Extracted ──▶ Resolved ──┬─ Matched ──▶ course ──▶ TokenBuilt ──▶ Stamped
//!                          ├─ Ambiguous ─────────────────────────▶ Rejected
//!                          └─ NotFound ──────────────────────────▶ Rejected
//! ```
//!
//! A manual override identity skips extraction and enters at `Matched`.
//! Every failure becomes a [`DocumentOutcome::Rejected`] carrying the stage,
//! a [`ReasonCode`] and a message; nothing inside a batch is fatal.
//!
//! ## Course selection
//!
//! The job's course, else the configured default course, else the single
//! completed enrolment of the matched person. No completed enrolment is
//! `incomplete_data`; more than one is `course_undetermined`.

use crate::config::{validate_matching, PipelineConfig};
use crate::directory::{CompletionFact, DirectoryClient, DirectoryRecord};
use crate::error::{DiplomaError, DirectoryError, ReasonCode};
use crate::output::{BatchReport, BatchStats, DocumentOutcome, Stage};
use crate::pipeline::extract::NameExtractor;
use crate::pipeline::input::output_path_for;
use crate::pipeline::resolve::{IdentityResolver, ResolutionResult, ScoredRecord};
use crate::pipeline::similarity::NameSimilarity;
use crate::pipeline::stamp::{DiplomaStamper, StampJob};
use crate::pipeline::{pdf, token};
use crate::stream::batch_stream;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One document to process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentJob {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Course to certify; see the module docs for the fallback order.
    pub course_id: Option<i64>,
    /// Operator-supplied identity. Skips extraction and matching.
    pub override_identity: Option<i64>,
}

impl DocumentJob {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            course_id: None,
            override_identity: None,
        }
    }

    pub fn with_course(mut self, course_id: Option<i64>) -> Self {
        self.course_id = course_id;
        self
    }

    pub fn with_identity(mut self, identity_id: Option<i64>) -> Self {
        self.override_identity = identity_id;
        self
    }
}

/// Why a document stopped, before it is turned into an outcome.
struct Rejection {
    stage: Stage,
    reason: ReasonCode,
    message: String,
    candidates: Vec<ScoredRecord>,
}

impl Rejection {
    fn new(stage: Stage, reason: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            stage,
            reason,
            message: message.into(),
            candidates: Vec::new(),
        }
    }

    fn directory(stage: Stage) -> impl Fn(DirectoryError) -> Self {
        move |e| Self::new(stage, e.reason(), e.to_string())
    }
}

/// Extractor, resolver and stamper wired to one configuration and one
/// shared directory client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    directory: Arc<DirectoryClient>,
    extractor: NameExtractor,
    resolver: IdentityResolver,
    stamper: DiplomaStamper,
}

impl Pipeline {
    /// Pipeline talking to the directory over HTTP.
    pub fn new(config: PipelineConfig) -> Result<Self, DiplomaError> {
        let directory = Arc::new(DirectoryClient::http(&config.directory)?);
        Self::with_directory(config, directory)
    }

    /// Pipeline over an existing directory client (scripted transports,
    /// shared clients).
    pub fn with_directory(
        config: PipelineConfig,
        directory: Arc<DirectoryClient>,
    ) -> Result<Self, DiplomaError> {
        validate_matching(&config.matching)?;
        let extractor = NameExtractor::new(&config.matching)?
            .with_pdfium_library(config.pdfium_library.clone());
        let resolver = IdentityResolver::new(Arc::clone(&directory), config.matching.clone());
        let stamper = DiplomaStamper::new(config.qr.clone())
            .with_pdfium_library(config.pdfium_library.clone());
        Ok(Self {
            config,
            directory,
            extractor,
            resolver,
            stamper,
        })
    }

    /// Replace the name metric used for matching.
    pub fn with_similarity(mut self, similarity: Arc<dyn NameSimilarity>) -> Self {
        self.resolver = self.resolver.with_similarity(similarity);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<DirectoryClient> {
        &self.directory
    }

    pub fn extractor(&self) -> &NameExtractor {
        &self.extractor
    }

    /// Fail fast when no PDFium library can be bound.
    pub async fn check_engine(&self) -> Result<(), DiplomaError> {
        let library = self.config.pdfium_library.clone();
        tokio::task::spawn_blocking(move || pdf::bind_engine(library.as_deref()).map(|_| ()))
            .await
            .map_err(|e| DiplomaError::Internal(format!("Engine check panicked: {}", e)))?
            .map_err(DiplomaError::PdfiumBindingFailed)
    }

    /// Job writing `<out_dir>/<stem><suffix>.pdf` for `input`.
    pub fn job_for(&self, input: &Path, out_dir: &Path) -> DocumentJob {
        DocumentJob::new(input, output_path_for(input, out_dir, &self.config.output_suffix))
    }

    /// Run one document through every stage. Never fails: problems are
    /// reported as [`DocumentOutcome::Rejected`].
    pub async fn process_document(&self, job: &DocumentJob) -> DocumentOutcome {
        let start = Instant::now();
        match self.run(job).await {
            Ok(outcome) => {
                info!(
                    "'{}' stamped in {}ms",
                    job.input.display(),
                    start.elapsed().as_millis()
                );
                outcome
            }
            Err(r) => {
                warn!(
                    "'{}' rejected at {} stage [{}]: {}",
                    job.input.display(),
                    r.stage,
                    r.reason,
                    r.message
                );
                DocumentOutcome::rejected(&job.input, r.stage, r.reason, r.message)
                    .with_candidates(r.candidates)
            }
        }
    }

    /// Process `jobs` with `concurrency` documents in flight. Once `cancel`
    /// fires no further document is started; running ones finish.
    pub async fn process_batch(&self, jobs: Vec<DocumentJob>, cancel: CancellationToken) -> BatchReport {
        let start = Instant::now();
        let total = jobs.len();
        info!(
            "Starting batch: {} document(s), concurrency {}",
            total, self.config.concurrency
        );
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_batch_start(total);
        }

        let outcomes: Vec<DocumentOutcome> = batch_stream(self, jobs, cancel)
            .map(|(_, outcome)| outcome)
            .collect()
            .await;

        let stats = BatchStats::tally(&outcomes, total, start.elapsed().as_millis() as u64);
        if stats.skipped > 0 {
            warn!("Batch cancelled: {} document(s) not started", stats.skipped);
        }
        info!(
            "Batch complete: {} stamped, {} rejected, {} skipped in {}ms",
            stats.stamped, stats.rejected, stats.skipped, stats.duration_ms
        );
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_batch_complete(&stats);
        }
        BatchReport { outcomes, stats }
    }

    // ── Stages ───────────────────────────────────────────────────────────

    async fn run(&self, job: &DocumentJob) -> Result<DocumentOutcome, Rejection> {
        let record = self.identify(job).await?;
        let fact = self.select_course(job, &record).await?;

        let token = token::build(&record, &fact, &self.config.issuer)
            .map_err(|e| Rejection::new(Stage::Token, e.reason(), e.to_string()))?;

        let stamp_job = StampJob {
            input: job.input.clone(),
            output: job.output.clone(),
            token: token.clone(),
            placement: self.config.placement,
            overwrite: self.config.overwrite,
        };
        let artifact = self
            .stamper
            .stamp_async(stamp_job)
            .await
            .map_err(|e| Rejection::new(Stage::Stamping, e.reason(), e.to_string()))?;

        Ok(DocumentOutcome::Stamped {
            input: job.input.clone(),
            artifact,
            identity_id: record.id,
            course_id: fact.course_id,
            student_name: record.display_name(),
            token,
        })
    }

    async fn identify(&self, job: &DocumentJob) -> Result<DirectoryRecord, Rejection> {
        let result = match job.override_identity {
            Some(id) => self
                .resolver
                .resolve_override(id)
                .await
                .map_err(Rejection::directory(Stage::Resolution))?,
            None => {
                let candidates = self
                    .extractor
                    .extract_from_path(&job.input)
                    .await
                    .map_err(|e| {
                        Rejection::new(Stage::Extraction, ReasonCode::ExtractionFailed, e.to_string())
                    })?;
                if candidates.is_empty() {
                    return Err(Rejection::new(
                        Stage::Extraction,
                        ReasonCode::NameNotFound,
                        "no student name found in the text layer or the filename",
                    ));
                }
                let tried = candidates
                    .iter()
                    .map(|c| format!("'{}'", c.display))
                    .collect::<Vec<_>>()
                    .join(", ");

                match self
                    .resolver
                    .resolve_first(&candidates)
                    .await
                    .map_err(Rejection::directory(Stage::Resolution))?
                {
                    ResolutionResult::NotFound => {
                        return Err(Rejection::new(
                            Stage::Resolution,
                            ReasonCode::IdentityNotFound,
                            format!("no directory record matches {tried}"),
                        ));
                    }
                    other => other,
                }
            }
        };

        match result {
            ResolutionResult::Matched { record, score } => {
                info!(
                    "'{}' → {} (id {}, score {:.3})",
                    job.input.display(),
                    record.display_name(),
                    record.id,
                    score
                );
                Ok(record)
            }
            ResolutionResult::Ambiguous { candidates } => {
                let summary = candidates
                    .iter()
                    .map(|c| format!("{} (id {}, {:.2})", c.record.display_name(), c.record.id, c.score))
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(Rejection {
                    stage: Stage::Resolution,
                    reason: ReasonCode::IdentityAmbiguous,
                    message: format!("several records are plausible: {summary}"),
                    candidates,
                })
            }
            ResolutionResult::NotFound => Err(Rejection::new(
                Stage::Resolution,
                ReasonCode::IdentityNotFound,
                "no directory record matches",
            )),
        }
    }

    async fn select_course(
        &self,
        job: &DocumentJob,
        record: &DirectoryRecord,
    ) -> Result<CompletionFact, Rejection> {
        let course_id = match job.course_id.or(self.config.default_course_id) {
            Some(id) => id,
            None => {
                let enrolments = self
                    .directory
                    .enrolments(record.id)
                    .await
                    .map_err(Rejection::directory(Stage::Course))?;
                let completed: Vec<&CompletionFact> =
                    enrolments.iter().filter(|c| c.completed).collect();
                match completed.as_slice() {
                    [only] => only.course_id,
                    [] => {
                        return Err(Rejection::new(
                            Stage::Course,
                            ReasonCode::IncompleteData,
                            format!(
                                "{} (id {}) has not completed any of {} enrolled course(s)",
                                record.display_name(),
                                record.id,
                                enrolments.len()
                            ),
                        ));
                    }
                    many => {
                        let ids = many
                            .iter()
                            .map(|c| format!("{} ({})", c.course_id, c.course_shortname))
                            .collect::<Vec<_>>()
                            .join(", ");
                        return Err(Rejection::new(
                            Stage::Course,
                            ReasonCode::CourseUndetermined,
                            format!("completed courses {ids}; choose one with --course"),
                        ));
                    }
                }
            }
        };

        self.directory
            .get_completion(record.id, course_id)
            .await
            .map_err(Rejection::directory(Stage::Course))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{ScriptedReply, ScriptedTransport, FN_USERS_BY_FIELD, FN_USER_COURSES};
    use crate::progress::BatchProgressCallback;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DIPLOMA_FN: &str = "local_diploma_data_get_user_diploma_details";

    fn config() -> PipelineConfig {
        PipelineConfig::builder()
            .directory_url("https://moodle.example.edu")
            .directory_token("tok")
            .issuer("Example University", "0123456789abcdef0123")
            .build()
            .unwrap()
    }

    fn pipeline(config: PipelineConfig, transport: ScriptedTransport) -> (Pipeline, Arc<ScriptedTransport>) {
        let transport = Arc::new(transport);
        let client = DirectoryClient::with_transport(transport.clone(), &config.directory);
        (Pipeline::with_directory(config, Arc::new(client)).unwrap(), transport)
    }

    fn ana() -> ScriptedTransport {
        ScriptedTransport::new().reply(
            FN_USERS_BY_FIELD,
            ScriptedReply::json(json!([{"id": 7, "username": "acosta", "firstname": "Ana",
                "lastname": "Costa", "fullname": "Ana Costa", "email": "ana@x.edu"}])),
        )
    }

    fn override_job() -> DocumentJob {
        DocumentJob::new("in/ana.pdf", "out/ana_qr.pdf").with_identity(Some(7))
    }

    fn rejected(outcome: &DocumentOutcome) -> (Stage, ReasonCode, &str) {
        match outcome {
            DocumentOutcome::Rejected { stage, reason, message, .. } => (*stage, *reason, message),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_input_is_extraction_failure() {
        let (p, transport) = pipeline(config(), ScriptedTransport::new());
        let job = DocumentJob::new("/no/such/diploma.pdf", "/tmp/out.pdf");
        let outcome = p.process_document(&job).await;
        let (stage, reason, _) = rejected(&outcome);
        assert_eq!(stage, Stage::Extraction);
        assert_eq!(reason, ReasonCode::ExtractionFailed);
        assert_eq!(transport.total_calls(), 0);
    }

    #[tokio::test]
    async fn unknown_override_identity_is_rejected_at_resolution() {
        let transport = ScriptedTransport::new().reply(FN_USERS_BY_FIELD, ScriptedReply::json(json!([])));
        let (p, _) = pipeline(config(), transport);
        let outcome = p.process_document(&override_job()).await;
        let (stage, reason, message) = rejected(&outcome);
        assert_eq!(stage, Stage::Resolution);
        assert_eq!(reason, ReasonCode::DirectoryRequest);
        assert!(message.contains("does not exist"), "got: {message}");
    }

    #[tokio::test]
    async fn several_completed_courses_need_a_choice() {
        let transport = ana().reply(
            FN_USER_COURSES,
            ScriptedReply::json(json!([
                {"id": 45, "fullname": "Engenharia", "shortname": "ENG", "completed": true},
                {"id": 46, "fullname": "Direito", "shortname": "DIR", "completed": 1},
                {"id": 47, "fullname": "Artes", "shortname": "ART", "completed": false}
            ])),
        );
        let (p, transport) = pipeline(config(), transport);
        let outcome = p.process_document(&override_job()).await;
        let (stage, reason, message) = rejected(&outcome);
        assert_eq!(stage, Stage::Course);
        assert_eq!(reason, ReasonCode::CourseUndetermined);
        assert!(message.contains("45 (ENG)") && message.contains("46 (DIR)"), "got: {message}");
        assert_eq!(transport.call_count(DIPLOMA_FN), 0);
    }

    #[tokio::test]
    async fn no_completed_course_is_incomplete_data() {
        let transport = ana().reply(
            FN_USER_COURSES,
            ScriptedReply::json(json!([{"id": 45, "fullname": "Engenharia", "shortname": "ENG", "completed": 0}])),
        );
        let (p, _) = pipeline(config(), transport);
        let outcome = p.process_document(&override_job()).await;
        assert_eq!(rejected(&outcome).1, ReasonCode::IncompleteData);
    }

    #[tokio::test]
    async fn job_course_skips_enrolment_listing() {
        let transport = ana().reply(
            DIPLOMA_FN,
            ScriptedReply::json(json!({
                "status": "success",
                "courses": [{"id": 45, "fullname": "Engenharia", "shortname": "ENG",
                             "completion": {"completed": false, "timecompleted": 0}}],
                "timestamp": 1736942400
            })),
        );
        let (p, transport) = pipeline(config(), transport);
        let outcome = p.process_document(&override_job().with_course(Some(45))).await;
        let (stage, reason, _) = rejected(&outcome);
        assert_eq!(stage, Stage::Token);
        assert_eq!(reason, ReasonCode::IncompleteData);
        assert_eq!(transport.call_count(FN_USER_COURSES), 0);
        assert_eq!(transport.calls().last().unwrap().param("courseid"), Some("45"));
    }

    #[tokio::test]
    async fn default_course_applies_when_job_has_none() {
        let mut c = config();
        c.default_course_id = Some(99);
        let transport = ana().reply(
            DIPLOMA_FN,
            ScriptedReply::json(json!({"status": "error", "message": "Course not found", "timestamp": 1})),
        );
        let (p, transport) = pipeline(c, transport);
        let outcome = p.process_document(&override_job()).await;
        let (stage, reason, message) = rejected(&outcome);
        assert_eq!(stage, Stage::Course);
        assert_eq!(reason, ReasonCode::DirectoryRequest);
        assert!(message.contains("Course not found"));
        assert_eq!(transport.calls().last().unwrap().param("courseid"), Some("99"));
    }

    #[derive(Default)]
    struct Counter {
        started: AtomicUsize,
        rejected: AtomicUsize,
        completed: AtomicUsize,
    }

    impl BatchProgressCallback for Counter {
        fn on_document_start(&self, _index: usize, _path: &Path) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        fn on_document_rejected(&self, _index: usize, _path: &Path, _reason: ReasonCode, _message: &str) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
        }
        fn on_batch_complete(&self, _stats: &BatchStats) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_batch() {
        let counter = Arc::new(Counter::default());
        let mut c = config();
        c.progress_callback = Some(counter.clone());
        let (p, _) = pipeline(c, ScriptedTransport::new().reply(FN_USERS_BY_FIELD, ScriptedReply::json(json!([]))));

        let jobs = vec![
            DocumentJob::new("/missing/a.pdf", "/tmp/a_qr.pdf"),
            override_job(),
            DocumentJob::new("/missing/c.pdf", "/tmp/c_qr.pdf"),
        ];
        let report = p.process_batch(jobs, CancellationToken::new()).await;
        assert_eq!(report.stats.total, 3);
        assert_eq!(report.stats.rejected, 3);
        assert_eq!(report.stats.skipped, 0);
        assert_eq!(counter.started.load(Ordering::SeqCst), 3);
        assert_eq!(counter.rejected.load(Ordering::SeqCst), 3);
        assert_eq!(counter.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_batch_starts_nothing() {
        let (p, transport) = pipeline(config(), ana());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = p
            .process_batch(vec![override_job(), override_job()], cancel)
            .await;
        assert!(report.outcomes.is_empty());
        assert_eq!(report.stats.skipped, 2);
        assert!(!report.all_stamped());
        assert_eq!(transport.total_calls(), 0);
    }

    #[test]
    fn job_for_uses_configured_suffix() {
        let mut c = config();
        c.output_suffix = "_com_qr".into();
        let (p, _) = pipeline(c, ScriptedTransport::new());
        let job = p.job_for(Path::new("in/João Silva.pdf"), Path::new("out"));
        assert_eq!(job.output, PathBuf::from("out/João Silva_com_qr.pdf"));
        assert_eq!(job.course_id, None);
    }
}
