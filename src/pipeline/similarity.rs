//! Person-name similarity.
//!
//! Names on diplomas and names in the directory differ in predictable ways:
//! accents dropped or added, letter case, connective particles ("da", "de",
//! "van"), word order, and missing middle names. [`normalize_name`] removes
//! the first three; [`TokenSetSimilarity`] absorbs the last two by scoring on
//! token sets before falling back to edit distance.

use once_cell::sync::Lazy;
use std::collections::BTreeSet;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Connective particles ignored when comparing names.
static PARTICLES: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    [
        "da", "de", "do", "das", "dos", "e", "di", "del", "della", "van", "von", "der", "den",
        "la", "le", "y",
    ]
    .into_iter()
    .collect()
});

/// Whether `word` (any case or accents) is a connective particle.
pub fn is_particle(word: &str) -> bool {
    PARTICLES.contains(normalize_name(word).as_str())
}

/// Comparison form of a name: NFKD, combining marks dropped, lowercase,
/// anything but letters and digits turned into single spaces.
///
/// `"  JOÃO  d'Ávila-Souza "` → `"joao d avila souza"`.
pub fn normalize_name(raw: &str) -> String {
    let folded: String = raw
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized words of a name without connective particles.
pub fn name_tokens(raw: &str) -> Vec<String> {
    normalize_name(raw)
        .split(' ')
        .filter(|w| !w.is_empty() && !PARTICLES.contains(w))
        .map(str::to_string)
        .collect()
}

/// A similarity metric on the 0–1 scale. Must be deterministic.
pub trait NameSimilarity: Send + Sync {
    fn score(&self, candidate: &str, record: &str) -> f64;
}

impl<F> NameSimilarity for F
where
    F: Fn(&str, &str) -> f64 + Send + Sync,
{
    fn score(&self, candidate: &str, record: &str) -> f64 {
        self(candidate, record)
    }
}

/// Default metric: `0.6 · token_set_ratio + 0.4 · ratio(sorted tokens)`,
/// or exactly 1.0 when both names reduce to the same token list.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenSetSimilarity;

impl NameSimilarity for TokenSetSimilarity {
    fn score(&self, candidate: &str, record: &str) -> f64 {
        let mut a = name_tokens(candidate);
        let mut b = name_tokens(record);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        a.sort();
        b.sort();
        if a == b {
            return 1.0;
        }
        let sorted = rapidfuzz::fuzz::ratio(a.join(" ").chars(), b.join(" ").chars());
        0.6 * token_set_ratio(&a, &b) + 0.4 * sorted
    }
}

/// Intersection/remainder construction: compare the shared words alone and
/// with each side's leftovers appended, keep the best. A name whose words are
/// all contained in the other scores 1.0.
fn token_set_ratio(a: &[String], b: &[String]) -> f64 {
    let sa: BTreeSet<&str> = a.iter().map(String::as_str).collect();
    let sb: BTreeSet<&str> = b.iter().map(String::as_str).collect();

    let common: Vec<&str> = sa.intersection(&sb).copied().collect();
    let only_a: Vec<&str> = sa.difference(&sb).copied().collect();
    let only_b: Vec<&str> = sb.difference(&sa).copied().collect();

    if !common.is_empty() && (only_a.is_empty() || only_b.is_empty()) {
        return 1.0;
    }

    let t0 = common.join(" ");
    let t1 = join_nonempty(&t0, &only_a.join(" "));
    let t2 = join_nonempty(&t0, &only_b.join(" "));

    let r = |x: &str, y: &str| rapidfuzz::fuzz::ratio(x.chars(), y.chars());
    let mut best = r(&t1, &t2);
    if !t0.is_empty() {
        best = best.max(r(&t0, &t1)).max(r(&t0, &t2));
    }
    best
}

fn join_nonempty(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_string(),
        (_, true) => a.to_string(),
        _ => format!("{a} {b}"),
    }
}
