//! Configuration types for diploma matching and stamping.
//!
//! Every knob lives in one immutable [`PipelineConfig`], built via
//! [`PipelineConfigBuilder`] and passed explicitly into each component's
//! constructor. Components never read environment variables themselves;
//! the CLI maps flags and `DIPLOMA_*` variables onto the builder.
//!
//! The sections ([`DirectoryConfig`], [`MatchConfig`], [`QrConfig`],
//! [`Placement`]) are plain structs with documented defaults so a
//! component that only needs one of them can take it on its own.

use crate::error::DiplomaError;
use crate::pipeline::token::Issuer;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ── Directory ────────────────────────────────────────────────────────────

/// Connection and retry settings for the directory service.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Base URL of the LMS, e.g. `https://moodle.example.edu`.
    pub base_url: String,

    /// Web-service token sent as `wstoken` on every call.
    pub token: String,

    /// Service function that returns per-course diploma details.
    /// Default: `local_diploma_data_get_user_diploma_details`.
    pub diploma_function: String,

    /// Per-request timeout in seconds. Default: 30.
    pub timeout_secs: u64,

    /// Total attempts per call, including the first one. Default: 3.
    ///
    /// Only timeouts, connection failures, HTTP 429 and 5xx are retried.
    /// Authentication and request errors surface on the first attempt.
    pub max_attempts: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s → 2 s, capped at
    /// `max_backoff_ms`.
    pub retry_backoff_ms: u64,

    /// Upper bound for a single backoff sleep. Default: 8000.
    pub max_backoff_ms: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: String::new(),
            diploma_function: "local_diploma_data_get_user_diploma_details".to_string(),
            timeout_secs: 30,
            max_attempts: 3,
            retry_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl fmt::Debug for DirectoryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryConfig")
            .field("base_url", &self.base_url)
            .field("token", &redact(&self.token))
            .field("diploma_function", &self.diploma_function)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_attempts", &self.max_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("max_backoff_ms", &self.max_backoff_ms)
            .finish()
    }
}

// ── Matching ─────────────────────────────────────────────────────────────

/// Thresholds for the identity decision and extra extraction templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
    /// Minimum score for an automatic match. Default: 0.85.
    pub accept_threshold: f64,

    /// Required lead of the best record over the runner-up. Default: 0.10.
    pub margin: f64,

    /// Below this score a record is not a plausible match at all. Default: 0.40.
    pub floor: f64,

    /// How many scored records an ambiguous result keeps. Default: 5.
    pub top_k: usize,

    /// Extra regexes tried before the built-in templates. Each must capture
    /// the name in a group named `name` or in its first group.
    pub name_patterns: Vec<String>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.85,
            margin: 0.10,
            floor: 0.40,
            top_k: 5,
            name_patterns: Vec::new(),
        }
    }
}

// ── QR / placement ───────────────────────────────────────────────────────

/// QR error-correction level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EcLevel {
    /// ~7 % recovery.
    L,
    /// ~15 % recovery (default).
    #[default]
    M,
    /// ~25 % recovery.
    Q,
    /// ~30 % recovery.
    H,
}

impl std::str::FromStr for EcLevel {
    type Err = DiplomaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "L" => Ok(EcLevel::L),
            "M" => Ok(EcLevel::M),
            "Q" => Ok(EcLevel::Q),
            "H" => Ok(EcLevel::H),
            other => Err(DiplomaError::InvalidConfig(format!(
                "error-correction level must be L, M, Q or H, got '{other}'"
            ))),
        }
    }
}

/// How the QR image is rasterised before it is placed on the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QrConfig {
    /// Minimum edge of the rendered QR bitmap in pixels. Range 64–2000. Default: 200.
    pub size_px: u32,

    /// Quiet-zone width in modules. Range 0–16. Default: 4.
    pub border: u32,

    /// Error-correction level. Default: M.
    pub ec_level: EcLevel,
}

impl Default for QrConfig {
    fn default() -> Self {
        Self {
            size_px: 200,
            border: 4,
            ec_level: EcLevel::M,
        }
    }
}

/// Where the QR goes: a square of `size` points whose lower-left corner
/// sits at `(x, y)` on 0-based page `page`. PDF user space, origin at the
/// bottom-left of the page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub page: usize,
    pub x: f32,
    pub y: f32,
    pub size: f32,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            page: 0,
            x: 36.0,
            y: 36.0,
            size: 96.0,
        }
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────

/// Configuration for a diploma batch.
///
/// Built via [`PipelineConfig::builder()`].
///
/// # Example
/// ```rust
/// use diploma_stamp::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .directory_url("https://moodle.example.edu")
///     .directory_token("0123456789abcdef")
///     .issuer("Example University", "a-long-random-issuer-secret")
///     .concurrency(8)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    pub directory: DirectoryConfig,
    pub matching: MatchConfig,
    pub qr: QrConfig,
    pub placement: Placement,

    /// Institution name and signing secret for verification codes.
    pub issuer: Issuer,

    /// Documents processed in parallel. Default: 4.
    pub concurrency: usize,

    /// Appended to the input stem to name outputs. Default: `_qr`.
    pub output_suffix: String,

    /// Replace existing outputs and existing QR stamps. Default: false.
    pub overwrite: bool,

    /// Course used when a job does not name one.
    pub default_course_id: Option<i64>,

    /// Explicit PDFium library file; otherwise `PDFIUM_LIB_PATH`, the
    /// working directory, then the system library are tried.
    pub pdfium_library: Option<PathBuf>,

    /// Optional per-document progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            directory: DirectoryConfig::default(),
            matching: MatchConfig::default(),
            qr: QrConfig::default(),
            placement: Placement::default(),
            issuer: Issuer::new("", Vec::new()),
            concurrency: 4,
            output_suffix: "_qr".to_string(),
            overwrite: false,
            default_course_id: None,
            pdfium_library: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("directory", &self.directory)
            .field("matching", &self.matching)
            .field("qr", &self.qr)
            .field("placement", &self.placement)
            .field("issuer", &self.issuer)
            .field("concurrency", &self.concurrency)
            .field("output_suffix", &self.output_suffix)
            .field("overwrite", &self.overwrite)
            .field("default_course_id", &self.default_course_id)
            .field("pdfium_library", &self.pdfium_library)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn BatchProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn directory_url(mut self, url: impl Into<String>) -> Self {
        self.config.directory.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn directory_token(mut self, token: impl Into<String>) -> Self {
        self.config.directory.token = token.into();
        self
    }

    pub fn diploma_function(mut self, name: impl Into<String>) -> Self {
        self.config.directory.diploma_function = name.into();
        self
    }

    pub fn directory_timeout_secs(mut self, secs: u64) -> Self {
        self.config.directory.timeout_secs = secs.max(1);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.directory.max_attempts = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.directory.retry_backoff_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.directory.max_backoff_ms = ms;
        self
    }

    pub fn accept_threshold(mut self, t: f64) -> Self {
        self.config.matching.accept_threshold = t;
        self
    }

    pub fn margin(mut self, m: f64) -> Self {
        self.config.matching.margin = m;
        self
    }

    pub fn floor(mut self, f: f64) -> Self {
        self.config.matching.floor = f;
        self
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.config.matching.top_k = k.max(1);
        self
    }

    pub fn name_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.matching.name_patterns.push(pattern.into());
        self
    }

    pub fn qr_size_px(mut self, px: u32) -> Self {
        self.config.qr.size_px = px.clamp(64, 2000);
        self
    }

    pub fn qr_border(mut self, modules: u32) -> Self {
        self.config.qr.border = modules.min(16);
        self
    }

    pub fn ec_level(mut self, level: EcLevel) -> Self {
        self.config.qr.ec_level = level;
        self
    }

    pub fn placement(mut self, placement: Placement) -> Self {
        self.config.placement = placement;
        self
    }

    pub fn issuer(mut self, institution: impl Into<String>, secret: impl AsRef<[u8]>) -> Self {
        self.config.issuer = Issuer::new(institution, secret.as_ref().to_vec());
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn output_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.config.output_suffix = suffix.into();
        self
    }

    pub fn overwrite(mut self, v: bool) -> Self {
        self.config.overwrite = v;
        self
    }

    pub fn default_course_id(mut self, id: i64) -> Self {
        self.config.default_course_id = Some(id);
        self
    }

    pub fn pdfium_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_library = Some(path.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, DiplomaError> {
        let c = &self.config;
        let d = &c.directory;
        if !(d.base_url.starts_with("http://") || d.base_url.starts_with("https://")) {
            return Err(DiplomaError::InvalidConfig(format!(
                "directory URL must be http(s), got '{}'",
                d.base_url
            )));
        }
        if d.token.trim().is_empty() {
            return Err(DiplomaError::InvalidConfig(
                "directory token must not be empty".into(),
            ));
        }
        if d.diploma_function.trim().is_empty() {
            return Err(DiplomaError::InvalidConfig(
                "diploma function name must not be empty".into(),
            ));
        }
        if d.max_attempts == 0 {
            return Err(DiplomaError::InvalidConfig(
                "max attempts must be ≥ 1".into(),
            ));
        }
        validate_matching(&c.matching)?;
        let p = &c.placement;
        if !(p.size > 0.0) || p.x < 0.0 || p.y < 0.0 {
            return Err(DiplomaError::InvalidConfig(format!(
                "placement needs size > 0 and non-negative coordinates, got {p:?}"
            )));
        }
        if c.issuer.institution().trim().is_empty() {
            return Err(DiplomaError::InvalidConfig(
                "issuer institution must not be empty".into(),
            ));
        }
        if c.issuer.secret_len() < 16 {
            return Err(DiplomaError::InvalidConfig(
                "issuer secret must be at least 16 bytes".into(),
            ));
        }
        if c.output_suffix.contains(['/', '\\']) {
            return Err(DiplomaError::InvalidConfig(format!(
                "output suffix must not contain path separators: '{}'",
                c.output_suffix
            )));
        }
        Ok(self.config)
    }
}

/// Threshold sanity shared by the builder and by callers that construct a
/// [`MatchConfig`] by hand.
pub fn validate_matching(m: &MatchConfig) -> Result<(), DiplomaError> {
    for (name, v) in [
        ("accept threshold", m.accept_threshold),
        ("margin", m.margin),
        ("floor", m.floor),
    ] {
        if !(0.0..=1.0).contains(&v) {
            return Err(DiplomaError::InvalidConfig(format!(
                "{name} must be within 0–1, got {v}"
            )));
        }
    }
    if m.floor > m.accept_threshold {
        return Err(DiplomaError::InvalidConfig(format!(
            "floor ({}) must not exceed the accept threshold ({})",
            m.floor, m.accept_threshold
        )));
    }
    for pattern in &m.name_patterns {
        regex::Regex::new(pattern).map_err(|e| {
            DiplomaError::InvalidConfig(format!("invalid name pattern '{pattern}': {e}"))
        })?;
    }
    Ok(())
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}
