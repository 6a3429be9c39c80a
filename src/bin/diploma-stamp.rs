//! CLI binary for diploma-stamp.
//!
//! A thin shim over the library crate that maps flags and `DIPLOMA_*`
//! environment variables onto `PipelineConfig` and prints results.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use diploma_stamp::pipeline::input::expand_inputs;
use diploma_stamp::pipeline::qr::{encode_png, render_qr};
use diploma_stamp::{
    verify_payload, BatchProgressCallback, BatchStats, DirectoryClient, DirectoryConfig,
    DocumentOutcome, EcLevel, Issuer, MatchConfig, NameExtractor, Pipeline, PipelineConfig,
    Placement, ProgressCallback, QrConfig, ReasonCode,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar for the batch plus a log line per
/// finished document. Documents finish out of order, so every line names
/// its file.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} diplomas  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Stamping");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self { bar })
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Stamping {total} diploma(s)…"))
        ));
    }

    fn on_document_start(&self, _index: usize, path: &Path) {
        self.bar.set_message(file_name(path));
    }

    fn on_document_stamped(&self, _index: usize, path: &Path, output: &Path) {
        self.bar.println(format!(
            "  {} {}  {}",
            green("✓"),
            file_name(path),
            dim(&format!("→ {}", output.display())),
        ));
        self.bar.inc(1);
    }

    fn on_document_rejected(&self, _index: usize, path: &Path, reason: ReasonCode, message: &str) {
        let msg = if message.chars().count() > 100 {
            format!("{}\u{2026}", message.chars().take(99).collect::<String>())
        } else {
            message.to_string()
        };
        self.bar.println(format!(
            "  {} {}  {}  {}",
            red("✗"),
            file_name(path),
            red(reason.as_str()),
            dim(&msg),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, stats: &BatchStats) {
        self.bar.finish_and_clear();
        if stats.rejected == 0 && stats.skipped == 0 {
            eprintln!(
                "{} {} diploma(s) stamped",
                green("✔"),
                bold(&stats.stamped.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} stamped  ({} rejected, {} not started)",
                if stats.stamped == 0 { red("✘") } else { cyan("⚠") },
                bold(&stats.stamped.to_string()),
                stats.total,
                red(&stats.rejected.to_string()),
                stats.skipped,
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Stamp every diploma in a folder
  diploma-stamp stamp diplomas/ --out-dir stamped/

  # One diploma, operator-chosen student and course
  diploma-stamp stamp joao.pdf --out-dir stamped/ --identity 123 --course 45

  # Put the QR 40pt from the right edge of an A4 landscape page
  diploma-stamp stamp diplomas/ --out-dir stamped/ --x 702 --y 40 --size 100

  # Which names would be matched?
  diploma-stamp extract joao.pdf

  # Check a scanned QR
  diploma-stamp verify @scanned.json

  # Directory connectivity
  diploma-stamp health

EXIT CODES:
  stamp   0 all stamped, 2 some rejected or not started
  verify  0 valid, 1 invalid
  health  0 connected, 1 unreachable

ENVIRONMENT VARIABLES (also read from ./.env):
  DIPLOMA_DIRECTORY_URL       LMS base URL, e.g. https://moodle.example.edu
  DIPLOMA_DIRECTORY_TOKEN     Web-service token
  DIPLOMA_DIRECTORY_FUNCTION  Diploma details function
  DIPLOMA_DIRECTORY_TIMEOUT   Request timeout, seconds
  DIPLOMA_MAX_ATTEMPTS        Attempts per directory call
  DIPLOMA_BACKOFF_MS          First retry delay, milliseconds
  DIPLOMA_INSTITUTION         Issuing institution
  DIPLOMA_ISSUER_SECRET       Secret keying verification codes (≥ 16 bytes)
  DIPLOMA_ACCEPT / DIPLOMA_MARGIN / DIPLOMA_FLOOR   Matching thresholds
  DIPLOMA_QR_SIZE / DIPLOMA_QR_BORDER / DIPLOMA_QR_EC   QR rendering
  DIPLOMA_CONCURRENCY         Diplomas processed in parallel
  PDFIUM_LIB_PATH             Path to libpdfium
"#;

/// Match diploma PDFs to student records and stamp them with a verifiable QR.
#[derive(Parser)]
#[command(
    name = "diploma-stamp",
    version,
    about = "Match diploma PDFs to student records and stamp them with a verifiable QR code",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DIPLOMA_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DIPLOMA_QUIET")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Match and stamp diplomas (files or directories of PDFs).
    Stamp(StampArgs),

    /// Print the candidate names found in a PDF.
    Extract {
        pdf: PathBuf,

        /// Extra name regex (named group `name` or first group). Repeatable.
        #[arg(long = "name-pattern")]
        name_patterns: Vec<String>,

        #[arg(long, env = "PDFIUM_LIB_PATH")]
        pdfium_lib: Option<PathBuf>,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Verify a scanned QR payload (`@file` reads it from a file).
    Verify {
        payload: String,

        #[command(flatten)]
        directory: DirectoryArgs,

        #[command(flatten)]
        issuer: IssuerArgs,
    },

    /// Run the directory connectivity self-test.
    Health {
        #[command(flatten)]
        directory: DirectoryArgs,

        #[arg(long)]
        json: bool,
    },

    /// Render a QR preview PNG for a payload (`@file` reads it from a file).
    Qr {
        payload: String,

        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        qr: QrArgs,
    },
}

#[derive(Args)]
struct DirectoryArgs {
    /// LMS base URL.
    #[arg(long = "directory-url", env = "DIPLOMA_DIRECTORY_URL")]
    url: String,

    /// Web-service token.
    #[arg(long = "directory-token", env = "DIPLOMA_DIRECTORY_TOKEN", hide_env_values = true)]
    token: String,

    /// Function returning per-course diploma details.
    #[arg(
        long = "directory-function",
        env = "DIPLOMA_DIRECTORY_FUNCTION",
        default_value = "local_diploma_data_get_user_diploma_details"
    )]
    function: String,

    /// Per-request timeout in seconds.
    #[arg(long = "directory-timeout", env = "DIPLOMA_DIRECTORY_TIMEOUT", default_value_t = 30)]
    timeout: u64,

    /// Attempts per call, including the first.
    #[arg(long, env = "DIPLOMA_MAX_ATTEMPTS", default_value_t = 3,
          value_parser = clap::value_parser!(u32).range(1..=10))]
    max_attempts: u32,

    /// First retry delay in milliseconds (doubles per attempt).
    #[arg(long, env = "DIPLOMA_BACKOFF_MS", default_value_t = 500)]
    backoff_ms: u64,
}

impl DirectoryArgs {
    fn config(&self) -> DirectoryConfig {
        DirectoryConfig {
            base_url: self.url.trim_end_matches('/').to_string(),
            token: self.token.clone(),
            diploma_function: self.function.clone(),
            timeout_secs: self.timeout.max(1),
            max_attempts: self.max_attempts,
            retry_backoff_ms: self.backoff_ms,
            ..DirectoryConfig::default()
        }
    }
}

#[derive(Args)]
struct IssuerArgs {
    /// Institution named in every token.
    #[arg(long, env = "DIPLOMA_INSTITUTION")]
    institution: String,

    /// Secret keying verification codes.
    #[arg(long = "issuer-secret", env = "DIPLOMA_ISSUER_SECRET", hide_env_values = true)]
    secret: String,
}

#[derive(Args)]
struct QrArgs {
    /// Minimum QR bitmap edge in pixels (64–2000).
    #[arg(long = "qr-size", env = "DIPLOMA_QR_SIZE", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(64..=2000))]
    size_px: u32,

    /// Quiet-zone width in modules (0–16).
    #[arg(long = "qr-border", env = "DIPLOMA_QR_BORDER", default_value_t = 4,
          value_parser = clap::value_parser!(u32).range(0..=16))]
    border: u32,

    /// Error-correction level: L, M, Q or H.
    #[arg(long = "qr-ec", env = "DIPLOMA_QR_EC", default_value = "M")]
    ec_level: EcLevel,
}

impl QrArgs {
    fn config(&self) -> QrConfig {
        QrConfig {
            size_px: self.size_px,
            border: self.border,
            ec_level: self.ec_level,
        }
    }
}

#[derive(Args)]
struct StampArgs {
    /// PDF files and/or directories containing PDFs.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Directory for stamped copies.
    #[arg(short, long)]
    out_dir: PathBuf,

    /// Appended to the input file stem.
    #[arg(long, default_value = "_qr")]
    suffix: String,

    /// Course to certify (otherwise the single completed enrolment).
    #[arg(long)]
    course: Option<i64>,

    /// Skip name matching and stamp for this directory id (single input only).
    #[arg(long)]
    identity: Option<i64>,

    /// 0-based page receiving the QR.
    #[arg(long, default_value_t = 0)]
    page: usize,

    /// Lower-left corner x, in points from the left edge.
    #[arg(long, default_value_t = 36.0)]
    x: f32,

    /// Lower-left corner y, in points from the bottom edge.
    #[arg(long, default_value_t = 36.0)]
    y: f32,

    /// QR edge in points.
    #[arg(long, default_value_t = 96.0)]
    size: f32,

    /// Replace existing outputs and existing QR stamps.
    #[arg(long)]
    overwrite: bool,

    /// Diplomas processed in parallel.
    #[arg(short, long, env = "DIPLOMA_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Minimum score for an automatic match.
    #[arg(long, env = "DIPLOMA_ACCEPT", default_value_t = 0.85)]
    accept: f64,

    /// Required lead over the runner-up.
    #[arg(long, env = "DIPLOMA_MARGIN", default_value_t = 0.10)]
    margin: f64,

    /// Scores below this are not plausible at all.
    #[arg(long, env = "DIPLOMA_FLOOR", default_value_t = 0.40)]
    floor: f64,

    /// Extra name regex (named group `name` or first group). Repeatable.
    #[arg(long = "name-pattern")]
    name_patterns: Vec<String>,

    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib: Option<PathBuf>,

    /// Print the batch report as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "DIPLOMA_NO_PROGRESS")]
    no_progress: bool,

    #[command(flatten)]
    directory: DirectoryArgs,

    #[command(flatten)]
    issuer: IssuerArgs,

    #[command(flatten)]
    qr: QrArgs,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Values from ./.env become defaults for the `env = ...` flags.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level logs unless --verbose is set.
    let show_progress = match &cli.command {
        Command::Stamp(a) => !cli.quiet && !a.no_progress && !a.json,
        _ => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Stamp(args) => run_stamp(args, show_progress, cli.quiet).await,
        Command::Extract {
            pdf,
            name_patterns,
            pdfium_lib,
            json,
        } => run_extract(&pdf, name_patterns, pdfium_lib, json).await,
        Command::Verify {
            payload,
            directory,
            issuer,
        } => run_verify(&payload, &directory, &issuer).await,
        Command::Health { directory, json } => run_health(&directory, json).await,
        Command::Qr {
            payload,
            output,
            qr,
        } => run_qr(&payload, &output, &qr),
    }
}

async fn run_stamp(args: StampArgs, show_progress: bool, quiet: bool) -> Result<ExitCode> {
    let inputs = expand_inputs(&args.inputs).context("Failed to list input PDFs")?;
    if inputs.is_empty() {
        bail!("No PDF files found in the given inputs");
    }
    if args.identity.is_some() && inputs.len() > 1 {
        bail!(
            "--identity applies to a single diploma, but {} inputs were given",
            inputs.len()
        );
    }

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn BatchProgressCallback>)
    } else {
        None
    };
    let config = build_config(&args, progress)?;
    let pipeline = Pipeline::new(config).context("Failed to create the directory client")?;
    pipeline
        .check_engine()
        .await
        .context("PDF engine unavailable")?;

    let jobs = inputs
        .iter()
        .map(|input| {
            pipeline
                .job_for(input, &args.out_dir)
                .with_course(args.course)
                .with_identity(args.identity)
        })
        .collect();

    // Ctrl-C stops dispatching; diplomas already being stamped finish.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{} interrupted: finishing diplomas in progress…", cyan("⚠"));
            on_signal.cancel();
        }
    });

    let report = pipeline.process_batch(jobs, cancel).await;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
    } else if !quiet && !show_progress {
        for outcome in &report.outcomes {
            match outcome {
                DocumentOutcome::Stamped {
                    input,
                    artifact,
                    student_name,
                    ..
                } => eprintln!(
                    "{} {} → {} ({})",
                    green("✓"),
                    input.display(),
                    artifact.path.display(),
                    student_name
                ),
                DocumentOutcome::Rejected {
                    input,
                    reason,
                    message,
                    ..
                } => eprintln!("{} {} [{}] {}", red("✗"), input.display(), reason, message),
            }
        }
        eprintln!(
            "Stamped {}/{} in {}ms",
            report.stats.stamped, report.stats.total, report.stats.duration_ms
        );
    }

    Ok(if report.all_stamped() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

/// Map CLI args to `PipelineConfig`.
fn build_config(args: &StampArgs, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let d = args.directory.config();
    let mut builder = PipelineConfig::builder()
        .directory_url(d.base_url)
        .directory_token(d.token)
        .diploma_function(d.diploma_function)
        .directory_timeout_secs(d.timeout_secs)
        .max_attempts(d.max_attempts)
        .retry_backoff_ms(d.retry_backoff_ms)
        .accept_threshold(args.accept)
        .margin(args.margin)
        .floor(args.floor)
        .qr_size_px(args.qr.size_px)
        .qr_border(args.qr.border)
        .ec_level(args.qr.ec_level)
        .placement(Placement {
            page: args.page,
            x: args.x,
            y: args.y,
            size: args.size,
        })
        .issuer(&args.issuer.institution, &args.issuer.secret)
        .concurrency(args.concurrency)
        .output_suffix(&args.suffix)
        .overwrite(args.overwrite);

    for pattern in &args.name_patterns {
        builder = builder.name_pattern(pattern);
    }
    if let Some(ref lib) = args.pdfium_lib {
        builder = builder.pdfium_library(lib);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

async fn run_extract(
    pdf: &Path,
    name_patterns: Vec<String>,
    pdfium_lib: Option<PathBuf>,
    json: bool,
) -> Result<ExitCode> {
    let matching = MatchConfig {
        name_patterns,
        ..MatchConfig::default()
    };
    let extractor = NameExtractor::new(&matching)
        .context("Invalid name pattern")?
        .with_pdfium_library(pdfium_lib);
    let candidates = extractor
        .extract_from_path(pdf)
        .await
        .with_context(|| format!("Failed to read {}", pdf.display()))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&candidates).context("Failed to serialise candidates")?
        );
    } else if candidates.is_empty() {
        eprintln!("{} no candidate names found", red("✗"));
    } else {
        for c in &candidates {
            println!(
                "{:.2}  {:<40}  {}",
                c.confidence,
                c.display,
                dim(&serde_json::to_string(&c.source).unwrap_or_default())
            );
        }
    }
    Ok(if candidates.is_empty() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

async fn run_verify(payload: &str, directory: &DirectoryArgs, issuer: &IssuerArgs) -> Result<ExitCode> {
    let payload = read_payload(payload)?;
    let client = DirectoryClient::http(&directory.config()).context("Failed to create the directory client")?;
    let issuer = Issuer::new(&issuer.institution, issuer.secret.as_bytes().to_vec());

    let response = verify_payload(&payload, &issuer, &client).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&response).context("Failed to serialise response")?
    );
    Ok(if response.valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

async fn run_health(directory: &DirectoryArgs, json: bool) -> Result<ExitCode> {
    let client = DirectoryClient::http(&directory.config()).context("Failed to create the directory client")?;
    let report = client.self_test().await;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise health report")?
        );
    } else if let Some(ref site) = report.site {
        eprintln!(
            "{} connected to {} ({}), release {}, as {}",
            green("✔"),
            bold(&site.site_name),
            site.site_url,
            site.release,
            site.username
        );
        if !report.missing_functions.is_empty() {
            eprintln!(
                "{} token cannot call: {}",
                red("✘"),
                report.missing_functions.join(", ")
            );
        }
    } else {
        eprintln!(
            "{} directory unreachable: {}",
            red("✘"),
            report.error.as_deref().unwrap_or("unknown error")
        );
    }

    Ok(if report.connected {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn run_qr(payload: &str, output: &Path, qr: &QrArgs) -> Result<ExitCode> {
    let payload = read_payload(payload)?;
    let image = render_qr(&payload, &qr.config()).context("Failed to render QR")?;
    let png = encode_png(&image).context("Failed to encode PNG")?;
    std::fs::write(output, &png)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    eprintln!(
        "{} {}x{} px → {}",
        green("✔"),
        image.width(),
        image.height(),
        bold(&output.display().to_string())
    );
    Ok(ExitCode::SUCCESS)
}

/// `@path` reads the payload from a file; anything else is the payload.
fn read_payload(arg: &str) -> Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .with_context(|| format!("Failed to read payload from {path}")),
        None => Ok(arg.to_string()),
    }
}
