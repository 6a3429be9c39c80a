//! Identity resolution: candidate name → directory record.
//!
//! [`decide`] is the whole decision rule and is pure, so threshold
//! behaviour is tested without a directory. [`IdentityResolver`] only adds
//! the search call and the scoring around it.

use crate::config::MatchConfig;
use crate::directory::{DirectoryClient, DirectoryRecord};
use crate::error::{DirectoryError, ReasonCode};
use crate::pipeline::extract::Candidate;
use crate::pipeline::similarity::{normalize_name, NameSimilarity, TokenSetSimilarity};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Scores closer than this count as equal when checking the margin.
const MARGIN_EPSILON: f64 = 1e-9;

/// A directory record with its similarity to the candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub record: DirectoryRecord,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResolutionResult {
    /// Exactly one record cleared the threshold with enough margin.
    Matched { record: DirectoryRecord, score: f64 },
    /// Plausible records exist but none is a clear winner. Best first.
    Ambiguous { candidates: Vec<ScoredRecord> },
    NotFound,
}

impl ResolutionResult {
    pub fn is_matched(&self) -> bool {
        matches!(self, ResolutionResult::Matched { .. })
    }

    /// Reason code when this result stops the document.
    pub fn reason(&self) -> Option<ReasonCode> {
        match self {
            ResolutionResult::Matched { .. } => None,
            ResolutionResult::Ambiguous { .. } => Some(ReasonCode::IdentityAmbiguous),
            ResolutionResult::NotFound => Some(ReasonCode::IdentityNotFound),
        }
    }

    fn top_score(&self) -> f64 {
        match self {
            ResolutionResult::Matched { score, .. } => *score,
            ResolutionResult::Ambiguous { candidates } => {
                candidates.first().map(|c| c.score).unwrap_or(0.0)
            }
            ResolutionResult::NotFound => 0.0,
        }
    }
}

/// Thresholded, margin-based decision over scored records.
///
/// Records are ordered by score (descending), ties by identity id
/// (ascending). Then:
/// * nothing scored, or the best is below `floor` → `NotFound`
/// * the best reaches `accept_threshold` and is alone or leads the runner-up
///   by at least `margin` → `Matched`
/// * otherwise → `Ambiguous` with the best `top_k`
pub fn decide(mut scored: Vec<ScoredRecord>, config: &MatchConfig) -> ResolutionResult {
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.record.id.cmp(&b.record.id))
    });

    let Some(top) = scored.first() else {
        return ResolutionResult::NotFound;
    };
    if top.score < config.floor {
        return ResolutionResult::NotFound;
    }

    let clear_lead = match scored.get(1) {
        None => true,
        Some(second) => top.score - second.score + MARGIN_EPSILON >= config.margin,
    };
    if top.score >= config.accept_threshold && clear_lead {
        let top = scored.swap_remove(0);
        return ResolutionResult::Matched {
            record: top.record,
            score: top.score,
        };
    }

    scored.truncate(config.top_k.max(1));
    ResolutionResult::Ambiguous { candidates: scored }
}

/// Several candidates of equal standing matched different identities.
fn decide_conflict(mut matched: Vec<ScoredRecord>) -> ResolutionResult {
    matched.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
    ResolutionResult::Ambiguous { candidates: matched }
}

/// Matches candidates against the directory.
#[derive(Clone)]
pub struct IdentityResolver {
    directory: Arc<DirectoryClient>,
    similarity: Arc<dyn NameSimilarity>,
    config: MatchConfig,
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("directory", &self.directory)
            .field("similarity", &"<dyn NameSimilarity>")
            .field("config", &self.config)
            .finish()
    }
}

impl IdentityResolver {
    /// Resolver with the default [`TokenSetSimilarity`] metric.
    pub fn new(directory: Arc<DirectoryClient>, config: MatchConfig) -> Self {
        Self {
            directory,
            similarity: Arc::new(TokenSetSimilarity),
            config,
        }
    }

    pub fn with_similarity(mut self, similarity: Arc<dyn NameSimilarity>) -> Self {
        self.similarity = similarity;
        self
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Score `records` against `candidate` and decide. Records whose name
    /// is empty, and scores that are not finite, are dropped.
    pub fn score_records(&self, candidate: &Candidate, records: Vec<DirectoryRecord>) -> ResolutionResult {
        let scored: Vec<ScoredRecord> = records
            .into_iter()
            .filter_map(|record| {
                let name = record.display_name();
                if normalize_name(&name).is_empty() {
                    debug!("Skipping record {} with empty name", record.id);
                    return None;
                }
                let score = self.similarity.score(&candidate.display, &name);
                if !score.is_finite() {
                    warn!("Ignoring non-finite score for record {}", record.id);
                    return None;
                }
                debug!("'{}' vs '{}' (id {}) = {:.3}", candidate.display, name, record.id, score);
                Some(ScoredRecord { record, score })
            })
            .collect();
        decide(scored, &self.config)
    }

    /// Resolve one candidate. An empty candidate is `NotFound` without a
    /// directory call.
    ///
    /// The directory is searched with `display`, not the folded `key`: the
    /// LMS matches with an accent-sensitive SQL `LIKE`, so "Joao" would miss
    /// a record stored as "João". Scoring still compares folded forms.
    pub async fn resolve(&self, candidate: &Candidate) -> Result<ResolutionResult, DirectoryError> {
        if candidate.key.trim().is_empty() {
            return Ok(ResolutionResult::NotFound);
        }
        let records = self.directory.search(&candidate.display).await?;
        let result = self.score_records(candidate, records);
        info!(
            "Resolved '{}' → {}",
            candidate.display,
            match &result {
                ResolutionResult::Matched { record, score } =>
                    format!("matched id {} ({:.3})", record.id, score),
                ResolutionResult::Ambiguous { candidates } =>
                    format!("ambiguous between {} records", candidates.len()),
                ResolutionResult::NotFound => "not found".to_string(),
            }
        );
        Ok(result)
    }

    /// Resolve candidates tier by tier, highest confidence first. Within a
    /// tier every candidate is tried:
    /// * any `Ambiguous` → the one with the best top score, and lower tiers
    ///   are never consulted;
    /// * otherwise one matched identity → `Matched`; two different matched
    ///   identities → `Ambiguous` between them;
    /// * all `NotFound` → next tier.
    ///
    /// Directory errors stop the search immediately.
    pub async fn resolve_first(&self, candidates: &[Candidate]) -> Result<ResolutionResult, DirectoryError> {
        let mut ordered: Vec<&Candidate> = candidates.iter().collect();
        ordered.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        for tier in ordered.chunk_by(|a, b| a.confidence.total_cmp(&b.confidence).is_eq()) {
            let mut best_ambiguous: Option<ResolutionResult> = None;
            let mut matched: Vec<ScoredRecord> = Vec::new();
            for candidate in tier {
                match self.resolve(candidate).await? {
                    ResolutionResult::Matched { record, score } => {
                        if !matched.iter().any(|m| m.record.id == record.id) {
                            matched.push(ScoredRecord { record, score });
                        }
                    }
                    amb @ ResolutionResult::Ambiguous { .. } => {
                        let better = best_ambiguous
                            .as_ref()
                            .is_none_or(|b| amb.top_score() > b.top_score());
                        if better {
                            best_ambiguous = Some(amb);
                        }
                    }
                    ResolutionResult::NotFound => {}
                }
            }

            if let Some(amb) = best_ambiguous {
                debug!(
                    "Tier at confidence {:.2} is ambiguous; lower tiers not tried",
                    tier[0].confidence
                );
                return Ok(amb);
            }
            if matched.len() > 1 {
                warn!(
                    "Candidates at confidence {:.2} matched {} different identities",
                    tier[0].confidence,
                    matched.len()
                );
                return Ok(decide_conflict(matched));
            }
            if let Some(top) = matched.pop() {
                return Ok(ResolutionResult::Matched {
                    record: top.record,
                    score: top.score,
                });
            }
        }
        Ok(ResolutionResult::NotFound)
    }

    /// Manual override: the operator names the identity directly.
    pub async fn resolve_override(&self, identity_id: i64) -> Result<ResolutionResult, DirectoryError> {
        let record = self.directory.get_user(identity_id).await?;
        info!("Manual override → id {}", record.id);
        Ok(ResolutionResult::Matched { record, score: 1.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: i64, name: &str) -> DirectoryRecord {
        DirectoryRecord {
            id,
            username: format!("u{id}"),
            firstname: String::new(),
            lastname: String::new(),
            fullname: name.to_string(),
            email: String::new(),
            suspended: false,
            courses: Vec::new(),
        }
    }

    fn scored(id: i64, score: f64) -> ScoredRecord {
        ScoredRecord {
            record: rec(id, "X Y"),
            score,
        }
    }

    #[test]
    fn empty_is_not_found() {
        assert_eq!(decide(vec![], &MatchConfig::default()), ResolutionResult::NotFound);
    }

    #[test]
    fn below_floor_is_not_found() {
        let r = decide(vec![scored(1, 0.39), scored(2, 0.2)], &MatchConfig::default());
        assert_eq!(r, ResolutionResult::NotFound);
    }

    #[test]
    fn single_record_at_threshold_matches() {
        let r = decide(vec![scored(1, 0.85)], &MatchConfig::default());
        assert!(matches!(r, ResolutionResult::Matched { score, .. } if score == 0.85));
    }

    #[test]
    fn at_threshold_within_margin_is_ambiguous() {
        let r = decide(vec![scored(1, 0.85), scored(2, 0.80)], &MatchConfig::default());
        assert!(matches!(r, ResolutionResult::Ambiguous { .. }));
    }

    #[test]
    fn exact_margin_matches_despite_float_error() {
        // 0.95 - 0.85 is 0.09999999999999998 in f64.
        let r = decide(vec![scored(2, 0.85), scored(1, 0.95)], &MatchConfig::default());
        match r {
            ResolutionResult::Matched { record, .. } => assert_eq!(record.id, 1),
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn ambiguous_keeps_top_k_in_order() {
        let config = MatchConfig {
            top_k: 2,
            ..MatchConfig::default()
        };
        let r = decide(
            vec![scored(3, 0.7), scored(1, 0.8), scored(2, 0.8), scored(4, 0.5)],
            &config,
        );
        match r {
            ResolutionResult::Ambiguous { candidates } => {
                let ids: Vec<i64> = candidates.iter().map(|c| c.record.id).collect();
                assert_eq!(ids, vec![1, 2]);
            }
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn reasons() {
        assert_eq!(ResolutionResult::NotFound.reason(), Some(ReasonCode::IdentityNotFound));
        assert_eq!(
            ResolutionResult::Ambiguous { candidates: vec![] }.reason(),
            Some(ReasonCode::IdentityAmbiguous)
        );
    }

    #[test]
    fn fixed_metric_drives_scoring() {
        use crate::config::DirectoryConfig;
        use crate::directory::ScriptedTransport;
        use crate::pipeline::extract::CandidateSource;

        let directory = Arc::new(DirectoryClient::with_transport(
            Arc::new(ScriptedTransport::new()),
            &DirectoryConfig::default(),
        ));
        let fixed = |_: &str, record: &str| if record.contains("Santos") { 0.80 } else { 0.78 };
        let resolver = IdentityResolver::new(directory, MatchConfig::default())
            .with_similarity(Arc::new(fixed));

        let candidate = Candidate::new("Maria Souza", CandidateSource::Filename, 0.3);
        let r = resolver.score_records(
            &candidate,
            vec![rec(1, "Maria Souza Lima"), rec(2, "Maria Souza Santos"), rec(3, "   ")],
        );
        match r {
            ResolutionResult::Ambiguous { candidates } => {
                assert_eq!(candidates.len(), 2);
                assert_eq!(candidates[0].record.id, 2);
                assert_eq!(candidates[0].score, 0.80);
            }
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn non_finite_scores_are_dropped() {
        use crate::config::DirectoryConfig;
        use crate::directory::ScriptedTransport;
        use crate::pipeline::extract::CandidateSource;

        let directory = Arc::new(DirectoryClient::with_transport(
            Arc::new(ScriptedTransport::new()),
            &DirectoryConfig::default(),
        ));
        let broken = |_: &str, record: &str| if record.contains("Lima") { f64::NAN } else { 0.95 };
        let resolver = IdentityResolver::new(directory, MatchConfig::default())
            .with_similarity(Arc::new(broken));

        let candidate = Candidate::new("Maria Souza", CandidateSource::Filename, 0.3);
        let r = resolver.score_records(
            &candidate,
            vec![rec(1, "Maria Souza Lima"), rec(2, "Maria Souza Santos")],
        );
        match r {
            ResolutionResult::Matched { record, score } => {
                assert_eq!(record.id, 2);
                assert_eq!(score, 0.95);
            }
            other => panic!("expected a match, got {other:?}"),
        }

        let only_nan = resolver.score_records(&candidate, vec![rec(1, "Maria Souza Lima")]);
        assert_eq!(only_nan, ResolutionResult::NotFound);
    }

    #[test]
    fn conflicting_matches_become_ambiguous() {
        let r = decide_conflict(vec![scored(7, 0.9), scored(3, 1.0)]);
        match r {
            ResolutionResult::Ambiguous { candidates } => {
                let ids: Vec<i64> = candidates.iter().map(|c| c.record.id).collect();
                assert_eq!(ids, vec![3, 7]);
            }
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }
}
