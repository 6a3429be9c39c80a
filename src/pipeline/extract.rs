//! Candidate student names from a diploma's text layer or filename.
//!
//! ## Rules
//!
//! Each page's text is scanned with a fixed set of rules, strongest first:
//!
//! | rule            | example                                   | confidence |
//! |-----------------|-------------------------------------------|-----------:|
//! | caller patterns | `MatchConfig::name_patterns`              | 0.95 |
//! | labelled        | `Nome: João da Silva`, `Student: Ana Costa` | 0.95 |
//! | grant phrase    | `… confere a Maria Souza o título de …`   | 0.85 |
//! | uppercase line  | `ANA BEATRIZ COSTA`                        | 0.60 |
//! | title-case run  | `… that Ana Beatriz Costa has …`          | 0.45 |
//!
//! The filename is only consulted when no rule yields a valid name
//! (confidence 0.30). Candidates are de-duplicated on their comparison key
//! and ordered strongest first, so the resolver can try them in order.

use crate::config::MatchConfig;
use crate::error::{DiplomaError, ExtractionError};
use crate::pipeline::pdf::{self, STAMP_MARKER_PREFIX};
use crate::pipeline::similarity::{is_particle, name_tokens, normalize_name};
use crate::pipeline::input;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// At most this many candidates are returned per document.
pub const MAX_CANDIDATES: usize = 8;

const CONF_LABELLED: f32 = 0.95;
const CONF_GRANT: f32 = 0.85;
const CONF_UPPERCASE: f32 = 0.6;
const CONF_TITLE_RUN: f32 = 0.45;
const CONF_FILENAME: f32 = 0.3;

// ── Types ────────────────────────────────────────────────────────────────

/// Which text-layer rule produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionRule {
    Custom,
    Labelled,
    GrantPhrase,
    UppercaseLine,
    TitleCaseRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateSource {
    /// Found in the text layer of 0-based `page`.
    TextLayer { page: usize, rule: ExtractionRule },
    /// Derived from the file name.
    Filename,
}

/// A name string pulled from a document, not yet confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Whitespace-collapsed, original casing.
    pub display: String,
    /// Comparison form, see [`normalize_name`].
    pub key: String,
    pub source: CandidateSource,
    pub confidence: f32,
}

impl Candidate {
    pub fn new(raw: &str, source: CandidateSource, confidence: f32) -> Self {
        let display = collapse(raw);
        let key = normalize_name(&display);
        Self {
            display,
            key,
            source,
            confidence,
        }
    }

    pub fn word_count(&self) -> usize {
        self.display.split_whitespace().count()
    }
}

// ── Patterns ─────────────────────────────────────────────────────────────

static LABELLED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?im)^[ \t]*(?:nome(?:[ \t]+d[oa](?:\(a\))?[ \t]+(?:alun[oa]|estudante|formand[oa]|graduand[oa])(?:\(a\))?)?|student(?:[ \t]+name)?|name|alun[oa](?:\(a\))?|estudante|formand[oa](?:\(a\))?|graduate|graduand[oa](?:\(a\))?)[ \t]*:[ \t]*(?P<name>[^\n]+)",
    )
    .unwrap()
});

static GRANT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:confere[ \t]+a|outorga[ \t]+a|concede[ \t]+a|conferido[ \t]+a|awarded[ \t]+to|conferred[ \t]+upon|certifies[ \t]+that)[\s:]+(?P<name>[^\n,;]+)",
    )
    .unwrap()
});

static TITLE_RUN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\p{Lu}[\p{Ll}'’-]+(?:[ \t]+(?:(?:da|de|do|das|dos|e|di|del|della|van|von|der|den|la|le|y)[ \t]+)?\p{Lu}[\p{Ll}'’-]+){1,7}",
    )
    .unwrap()
});

static MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"{}\S*", regex::escape(STAMP_MARKER_PREFIX))).unwrap());

/// Words that never occur in a person's name on a diploma. Stored in
/// comparison form.
static STOP_WORDS: &[&str] = &[
    "diploma", "certificado", "certificate", "curso", "course", "graduacao", "universidade",
    "university", "faculdade", "faculty", "college", "bachelor", "bacharel", "bacharelado",
    "master", "mestre", "mestrado", "doctor", "doutor", "doutorado", "especializacao",
    "instituto", "degree", "licenciatura", "ano", "year", "data", "date", "pagina", "page",
    "nome", "name", "aluno", "student", "conclusao", "completion", "republica", "federativa",
    "brasil", "ministerio", "reitor", "diretor", "secretario",
];

/// Extra words dropped from file names only.
static FILENAME_NOISE: &[&str] = &[
    "final", "assinado", "signed", "scan", "copia", "copy", "qr", "com", "pdf", "v",
];

// ── Extractor ────────────────────────────────────────────────────────────

/// Produces [`Candidate`]s from PDFs. Cheap to clone.
#[derive(Debug, Clone)]
pub struct NameExtractor {
    custom: Vec<Regex>,
    pdfium_library: Option<PathBuf>,
}

impl NameExtractor {
    /// Compile the caller patterns of `config`.
    pub fn new(config: &MatchConfig) -> Result<Self, DiplomaError> {
        let custom = config
            .name_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    DiplomaError::InvalidConfig(format!("invalid name pattern '{p}': {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            custom,
            pdfium_library: None,
        })
    }

    pub fn with_pdfium_library(mut self, library: Option<PathBuf>) -> Self {
        self.pdfium_library = library;
        self
    }

    /// Candidates from a PDF on disk.
    pub async fn extract_from_path(&self, path: &Path) -> Result<Vec<Candidate>, ExtractionError> {
        let path = input::resolve_local(path)?;
        let library = self.pdfium_library.clone();
        let blocking_path = path.clone();

        let pages = tokio::task::spawn_blocking(move || {
            pdf::page_texts(&blocking_path, library.as_deref())
        })
        .await
        .map_err(|e| ExtractionError::Internal(format!("Extraction task panicked: {}", e)))??;

        let filename = path.file_name().map(|n| n.to_string_lossy().into_owned());
        let candidates = self.candidates_from_pages(&pages, filename.as_deref());
        info!(
            "Extracted {} candidate(s) from '{}'",
            candidates.len(),
            path.display()
        );
        Ok(candidates)
    }

    /// Candidates from an in-memory PDF (e.g. an upload). `filename` feeds
    /// the fallback and labels errors.
    pub async fn extract_from_bytes(
        &self,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<Vec<Candidate>, ExtractionError> {
        let library = self.pdfium_library.clone();
        let name = PathBuf::from(filename);

        let pages = tokio::task::spawn_blocking(move || {
            pdf::page_texts_from_bytes(&bytes, &name, library.as_deref())
        })
        .await
        .map_err(|e| ExtractionError::Internal(format!("Extraction task panicked: {}", e)))??;

        Ok(self.candidates_from_pages(&pages, Some(filename)))
    }

    /// Apply the rules to already-extracted page texts.
    pub fn candidates_from_pages(&self, pages: &[String], filename: Option<&str>) -> Vec<Candidate> {
        let mut found = Vec::new();
        for (page, raw) in pages.iter().enumerate() {
            let text = clean_page_text(raw);
            self.scan_page(page, &text, &mut found);
        }

        let mut candidates = dedupe(found);
        if candidates.is_empty() {
            if let Some(c) = filename.and_then(filename_candidate) {
                debug!("No text-layer name; using filename candidate '{}'", c.display);
                candidates.push(c);
            } else {
                warn!("No candidate name in text layer or filename");
            }
        }

        candidates.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| b.word_count().cmp(&a.word_count()))
        });
        candidates.truncate(MAX_CANDIDATES);
        candidates
    }

    fn scan_page(&self, page: usize, text: &str, out: &mut Vec<Candidate>) {
        let mut push = |raw: &str, rule: ExtractionRule, confidence: f32| {
            let name = collapse(raw);
            if is_valid_name(&name) {
                debug!("page {}: {:?} → '{}'", page, rule, name);
                out.push(Candidate::new(
                    &name,
                    CandidateSource::TextLayer { page, rule },
                    confidence,
                ));
            }
        };

        for re in &self.custom {
            for caps in re.captures_iter(text) {
                if let Some(m) = caps.name("name").or_else(|| caps.get(1)).or_else(|| caps.get(0)) {
                    push(&cut_name(m.as_str()), ExtractionRule::Custom, CONF_LABELLED);
                }
            }
        }
        for caps in LABELLED.captures_iter(text) {
            push(&cut_name(&caps["name"]), ExtractionRule::Labelled, CONF_LABELLED);
        }
        for caps in GRANT.captures_iter(text) {
            push(&leading_name(&caps["name"]), ExtractionRule::GrantPhrase, CONF_GRANT);
        }
        for line in text.lines() {
            if is_uppercase_line(line) {
                push(line, ExtractionRule::UppercaseLine, CONF_UPPERCASE);
            }
        }
        for line in text.lines() {
            for m in TITLE_RUN.find_iter(line) {
                push(m.as_str(), ExtractionRule::TitleCaseRun, CONF_TITLE_RUN);
            }
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// Whether `name` looks like a person's name: 3–100 chars, at least two
/// words that are not particles, letters plus `' ’ - .` only, and no word
/// from the stop-list.
pub fn is_valid_name(name: &str) -> bool {
    let len = name.chars().count();
    if !(3..=100).contains(&len) {
        return false;
    }
    if !name
        .chars()
        .all(|c| c.is_alphabetic() || matches!(c, ' ' | '\'' | '’' | '-' | '.'))
    {
        return false;
    }
    if name_tokens(name).len() < 2 {
        return false;
    }
    !normalize_name(name)
        .split(' ')
        .any(|w| STOP_WORDS.contains(&w))
}

fn clean_page_text(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    MARKER.replace_all(&unified, "").into_owned()
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Text after a label, up to the first field separator, digit, or run of
/// two spaces (tabular layouts).
fn cut_name(raw: &str) -> String {
    let first_cell = raw.split("  ").next().unwrap_or("");
    let end = first_cell
        .find(|c: char| c.is_ascii_digit() || matches!(c, ',' | ';' | '(' | ')' | '|' | '/' | '\t'))
        .unwrap_or(first_cell.len());
    first_cell[..end]
        .trim()
        .trim_end_matches(['.', '-', ':'])
        .to_string()
}

/// Capitalised words (and particles between them) at the start of `raw`.
fn leading_name(raw: &str) -> String {
    let mut words: Vec<&str> = Vec::new();
    for word in raw.split_whitespace() {
        let starts_upper = word.chars().next().is_some_and(char::is_uppercase);
        if starts_upper || (!words.is_empty() && is_particle(word)) {
            words.push(word);
        } else {
            break;
        }
    }
    while words.last().is_some_and(|w| is_particle(w)) {
        words.pop();
    }
    words.join(" ")
}

fn is_uppercase_line(line: &str) -> bool {
    let words = line.split_whitespace().count();
    (2..=8).contains(&words)
        && line.chars().any(char::is_alphabetic)
        && line
            .chars()
            .filter(|c| c.is_alphabetic())
            .all(char::is_uppercase)
}

fn dedupe(found: Vec<Candidate>) -> Vec<Candidate> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Candidate> = Vec::new();
    for c in found {
        match index.get(&c.key) {
            Some(&i) if out[i].confidence >= c.confidence => {}
            Some(&i) => out[i] = c,
            None => {
                index.insert(c.key.clone(), out.len());
                out.push(c);
            }
        }
    }
    out
}

/// `diploma_joao-da-silva_2024.pdf` → `Joao da Silva`.
fn filename_candidate(filename: &str) -> Option<Candidate> {
    let stem = Path::new(filename).file_stem()?.to_string_lossy().into_owned();
    let spaced: String = stem
        .chars()
        .map(|c| if matches!(c, '_' | '-' | '.') { ' ' } else { c })
        .collect();

    let words: Vec<&str> = spaced
        .split_whitespace()
        .filter(|w| !w.chars().any(|c| c.is_ascii_digit()))
        .filter(|w| {
            let n = normalize_name(w);
            !n.is_empty() && !STOP_WORDS.contains(&n.as_str()) && !FILENAME_NOISE.contains(&n.as_str())
        })
        .collect();
    if words.is_empty() {
        return None;
    }

    let display = words
        .iter()
        .enumerate()
        .map(|(i, w)| {
            if i > 0 && is_particle(w) {
                w.to_lowercase()
            } else {
                capitalize(w)
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    Some(Candidate::new(&display, CandidateSource::Filename, CONF_FILENAME))
}

fn capitalize(word: &str) -> String {
    let lower = word.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> NameExtractor {
        NameExtractor::new(&MatchConfig::default()).unwrap()
    }

    fn pages(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn labelled_name_wins() {
        let c = extractor().candidates_from_pages(
            &pages(&["UNIVERSIDADE FEDERAL DE MINAS\r\nDIPLOMA\r\nNome: João da Silva\r\nCurso: Engenharia Civil"]),
            Some("scan_001.pdf"),
        );
        assert_eq!(c[0].display, "João da Silva");
        assert_eq!(c[0].key, "joao da silva");
        assert_eq!(c[0].confidence, 0.95);
        assert_eq!(
            c[0].source,
            CandidateSource::TextLayer { page: 0, rule: ExtractionRule::Labelled }
        );
    }

    #[test]
    fn label_value_stops_at_next_field() {
        let c = extractor().candidates_from_pages(
            &pages(&["Aluno(a): Ana Beatriz Costa    Matrícula: 2019001"]),
            None,
        );
        assert_eq!(c[0].display, "Ana Beatriz Costa");
    }

    #[test]
    fn grant_phrase_takes_capitalised_words() {
        let c = extractor().candidates_from_pages(
            &pages(&["A Reitora confere a Maria Souza Santos o título de Bacharel em Direito"]),
            None,
        );
        let grant = c
            .iter()
            .find(|c| matches!(c.source, CandidateSource::TextLayer { rule: ExtractionRule::GrantPhrase, .. }))
            .unwrap();
        assert_eq!(grant.display, "Maria Souza Santos");
        assert_eq!(c[0].display, "Maria Souza Santos");
    }

    #[test]
    fn uppercase_line_is_found() {
        let c = extractor().candidates_from_pages(&pages(&["CERTIFICADO\nANA BEATRIZ COSTA\n"]), None);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].display, "ANA BEATRIZ COSTA");
        assert_eq!(c[0].confidence, 0.6);
    }

    #[test]
    fn institution_lines_are_rejected() {
        let c = extractor().candidates_from_pages(
            &pages(&["REPÚBLICA FEDERATIVA DO BRASIL\nUNIVERSIDADE FEDERAL DO PARANÁ\nDiploma de Graduação"]),
            None,
        );
        assert!(c.is_empty(), "got {c:?}");
    }

    #[test]
    fn filename_is_fallback_only() {
        let c = extractor()
            .candidates_from_pages(&pages(&["", "  "]), Some("diploma_joao-da-silva_2024_final.pdf"));
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].display, "Joao da Silva");
        assert_eq!(c[0].source, CandidateSource::Filename);
        assert_eq!(c[0].confidence, 0.3);

        let c = extractor().candidates_from_pages(&pages(&["Nome: Ana Costa"]), Some("joao_silva.pdf"));
        assert!(c.iter().all(|c| c.source != CandidateSource::Filename));
    }

    #[test]
    fn stamp_marker_is_ignored() {
        let c = extractor()
            .candidates_from_pages(&pages(&["Nome: Ana Costa DSTAMP1:v1.0011.aabb"]), None);
        assert_eq!(c[0].display, "Ana Costa");
    }

    #[test]
    fn duplicates_keep_highest_confidence() {
        let c = extractor().candidates_from_pages(
            &pages(&["Student: Ana Costa\nThis certifies that Ana Costa has completed"]),
            None,
        );
        let ana: Vec<_> = c.iter().filter(|c| c.key == "ana costa").collect();
        assert_eq!(ana.len(), 1);
        assert_eq!(ana[0].confidence, 0.95);
    }

    #[test]
    fn ordering_prefers_confidence_then_length() {
        let c = extractor().candidates_from_pages(
            &pages(&["ANA COSTA\nMARIA SOUZA SANTOS\nconfere a Pedro Lima,"]),
            None,
        );
        let names: Vec<&str> = c.iter().map(|c| c.display.as_str()).collect();
        assert_eq!(names, vec!["Pedro Lima", "MARIA SOUZA SANTOS", "ANA COSTA"]);
    }

    #[test]
    fn caller_patterns_run_first() {
        let config = MatchConfig {
            name_patterns: vec![r"Holder - (?P<name>[A-Za-z ]+)".into()],
            ..MatchConfig::default()
        };
        let c = NameExtractor::new(&config)
            .unwrap()
            .candidates_from_pages(&pages(&["Holder - Ana Costa"]), None);
        assert_eq!(c[0].display, "Ana Costa");
        assert_eq!(
            c[0].source,
            CandidateSource::TextLayer { page: 0, rule: ExtractionRule::Custom }
        );
    }

    #[test]
    fn bad_caller_pattern_is_config_error() {
        let config = MatchConfig {
            name_patterns: vec!["(unclosed".into()],
            ..MatchConfig::default()
        };
        assert!(matches!(NameExtractor::new(&config), Err(DiplomaError::InvalidConfig(_))));
    }

    #[test]
    fn validity_rules() {
        assert!(is_valid_name("Anne-Marie O'Neil"));
        assert!(is_valid_name("JOÃO DA SILVA"));
        assert!(!is_valid_name("Jo"));
        assert!(!is_valid_name("Maria"));
        assert!(!is_valid_name("Maria de"));
        assert!(!is_valid_name("Ana 2 Costa"));
        assert!(!is_valid_name("Universidade Federal"));
        assert!(!is_valid_name("Data de Conclusão"));
    }

    #[tokio::test]
    async fn missing_file_is_surfaced() {
        let err = extractor()
            .extract_from_path(Path::new("/no/such/diploma.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn upload_without_pdf_magic_is_rejected() {
        let err = extractor()
            .extract_from_bytes(b"GIF89a...".to_vec(), "upload.pdf")
            .await
            .unwrap_err();
        match err {
            ExtractionError::NotAPdf { path, magic } => {
                assert_eq!(path, PathBuf::from("upload.pdf"));
                assert_eq!(&magic, b"GIF8");
            }
            other => panic!("expected NotAPdf, got {other:?}"),
        }
    }
}
