//! Directory-backed flows without a PDF engine: resolving extracted names
//! against a scripted directory, then issuing and verifying tokens.
//!
//! Run with:
//!   cargo test --test resolution

use diploma_stamp::directory::{
    RetryPolicy, ScriptedReply, ScriptedTransport, TransportError, FN_SEARCH_USERS,
    FN_USERS_BY_FIELD,
};
use diploma_stamp::{
    verify_payload, Candidate, CandidateSource, DirectoryClient, DirectoryConfig, DirectoryError,
    IdentityResolver, Issuer, MatchConfig, NameExtractor, ResolutionResult, VerificationToken,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const DIPLOMA_FN: &str = "local_diploma_data_get_user_diploma_details";
const JAN_15_NOON: i64 = 1736942400;

// ── Helpers ──────────────────────────────────────────────────────────────────

fn client(transport: ScriptedTransport) -> (Arc<DirectoryClient>, Arc<ScriptedTransport>) {
    let transport = Arc::new(transport);
    let config = DirectoryConfig::default();
    let policy = RetryPolicy {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        ..RetryPolicy::from_config(&config)
    };
    let client = DirectoryClient::with_transport(transport.clone(), &config).with_policy(policy);
    (Arc::new(client), transport)
}

fn users(list: Value) -> ScriptedTransport {
    ScriptedTransport::new().reply(FN_SEARCH_USERS, ScriptedReply::json(json!({ "users": list })))
}

fn resolver(transport: ScriptedTransport) -> (IdentityResolver, Arc<ScriptedTransport>) {
    let (dir, transport) = client(transport);
    (IdentityResolver::new(dir, MatchConfig::default()), transport)
}

fn from_filename(name: &str) -> Candidate {
    Candidate::new(name, CandidateSource::Filename, 0.5)
}

fn matched_id(result: &ResolutionResult) -> i64 {
    match result {
        ResolutionResult::Matched { record, .. } => record.id,
        other => panic!("expected a match, got {other:?}"),
    }
}

// ── Resolution ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn accents_and_case_do_not_prevent_a_match() {
    let (r, _) = resolver(users(json!([
        {"id": 123, "firstname": "João", "lastname": "Silva", "fullname": "João Silva"},
        {"id": 124, "firstname": "Joana", "lastname": "Prado", "fullname": "Joana Prado"}
    ])));
    let result = r.resolve(&from_filename("JOAO SILVA")).await.unwrap();
    assert_eq!(matched_id(&result), 123);
}

#[tokio::test]
async fn swapped_word_order_searches_both_criteria() {
    let (r, transport) = resolver(users(json!([
        {"id": 123, "firstname": "João", "lastname": "Silva", "fullname": "João Silva"}
    ])));
    let result = r.resolve(&from_filename("Silva João")).await.unwrap();
    assert_eq!(matched_id(&result), 123);

    let values: Vec<String> = transport
        .calls()
        .iter()
        .filter_map(|c| c.param("criteria[0][value]").map(str::to_string))
        .collect();
    assert_eq!(values, vec!["Silva%".to_string(), "%João%".to_string()]);
}

#[tokio::test]
async fn homonyms_are_ambiguous_in_id_order() {
    let (r, _) = resolver(users(json!([
        {"id": 9, "fullname": "Maria Souza"},
        {"id": 4, "fullname": "Maria Souza"}
    ])));
    match r.resolve(&from_filename("Maria Souza")).await.unwrap() {
        ResolutionResult::Ambiguous { candidates } => {
            let ids: Vec<i64> = candidates.iter().map(|c| c.record.id).collect();
            assert_eq!(ids, vec![4, 9]);
        }
        other => panic!("expected ambiguity, got {other:?}"),
    }
}

#[tokio::test]
async fn suspended_accounts_are_never_matched() {
    let (r, _) = resolver(users(json!([
        {"id": 5, "fullname": "Pedro Alves", "suspended": 1}
    ])));
    let result = r.resolve(&from_filename("Pedro Alves")).await.unwrap();
    assert_eq!(result, ResolutionResult::NotFound);
}

#[tokio::test]
async fn lower_tier_is_tried_when_higher_finds_nobody() {
    let (r, _) = resolver(users(json!([
        {"id": 31, "fullname": "Ana Beatriz Costa"}
    ])));
    let candidates = vec![
        Candidate::new("Zyx Qwv", CandidateSource::Filename, 0.9),
        Candidate::new("Ana Beatriz Costa", CandidateSource::Filename, 0.3),
    ];
    let result = r.resolve_first(&candidates).await.unwrap();
    assert_eq!(matched_id(&result), 31);
}

#[tokio::test]
async fn ambiguous_labelled_name_is_not_overridden_by_a_signatory() {
    let extractor = NameExtractor::new(&MatchConfig::default()).unwrap();
    let pages = vec!["DIPLOMA\nNome: Maria Souza\nCurso: Direito\nReitor\nCarlos Pereira\n".to_string()];
    let candidates = extractor.candidates_from_pages(&pages, None);
    assert_eq!(candidates[0].display, "Maria Souza");
    assert!(candidates.iter().any(|c| c.display == "Carlos Pereira"));

    let (r, _) = resolver(users(json!([
        {"id": 1, "fullname": "Maria Souza Santos"},
        {"id": 2, "fullname": "Maria Souza Lima"},
        {"id": 9, "fullname": "Carlos Pereira"}
    ])));
    match r.resolve_first(&candidates).await.unwrap() {
        ResolutionResult::Ambiguous { candidates } => {
            let mut top: Vec<i64> = candidates.iter().take(2).map(|c| c.record.id).collect();
            top.sort_unstable();
            assert_eq!(top, vec![1, 2]);
        }
        other => panic!("expected ambiguity, got {other:?}"),
    }
}

#[tokio::test]
async fn equal_tier_candidates_naming_different_people_are_ambiguous() {
    let (r, _) = resolver(users(json!([
        {"id": 4, "fullname": "Rui Lima"},
        {"id": 5, "fullname": "Ana Costa"}
    ])));
    let candidates = vec![
        Candidate::new("Rui Lima", CandidateSource::Filename, 0.6),
        Candidate::new("Ana Costa", CandidateSource::Filename, 0.6),
    ];
    assert!(matches!(
        r.resolve_first(&candidates).await.unwrap(),
        ResolutionResult::Ambiguous { .. }
    ));
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let transport = ScriptedTransport::new().reply_sequence(
        FN_SEARCH_USERS,
        vec![
            ScriptedReply::fail(TransportError::Timeout),
            ScriptedReply::json(json!({"users": [{"id": 2, "fullname": "Rui Lima"}]})),
        ],
    );
    let (r, transport) = resolver(transport);
    let result = r.resolve(&from_filename("Rui Lima")).await.unwrap();
    assert_eq!(matched_id(&result), 2);
    // one retried call for the first criterion, one call for the second
    assert_eq!(transport.call_count(FN_SEARCH_USERS), 3);
}

#[tokio::test]
async fn invalid_token_is_an_auth_error_without_retries() {
    let transport = ScriptedTransport::new().reply(
        FN_SEARCH_USERS,
        ScriptedReply::json(json!({
            "exception": "moodle_exception",
            "errorcode": "invalidtoken",
            "message": "Invalid token - token not found"
        })),
    );
    let (r, transport) = resolver(transport);
    let err = r.resolve(&from_filename("Rui Lima")).await.unwrap_err();
    assert!(matches!(err, DirectoryError::Auth { .. }), "got {err:?}");
    assert_eq!(transport.total_calls(), 1);
}

#[tokio::test]
async fn extracted_text_resolves_end_to_end() {
    let extractor = NameExtractor::new(&MatchConfig::default()).unwrap();
    let pages = vec![
        "UNIVERSIDADE EXEMPLO\nConfere o título de Bacharel a\nCARLOS EDUARDO MENDES\n".to_string(),
    ];
    let candidates = extractor.candidates_from_pages(&pages, Some("diploma_0042.pdf"));
    assert!(!candidates.is_empty());

    let (r, _) = resolver(users(json!([
        {"id": 88, "firstname": "Carlos Eduardo", "lastname": "Mendes",
         "fullname": "Carlos Eduardo Mendes"}
    ])));
    let result = r.resolve_first(&candidates).await.unwrap();
    assert_eq!(matched_id(&result), 88);
}

// ── Tokens ───────────────────────────────────────────────────────────────────

fn verification_directory(completed: bool, time: i64) -> ScriptedTransport {
    ScriptedTransport::new()
        .reply(
            FN_USERS_BY_FIELD,
            ScriptedReply::json(json!([{"id": 123, "fullname": "João Silva"}])),
        )
        .reply(
            DIPLOMA_FN,
            ScriptedReply::json(json!({
                "status": "success",
                "user": {"id": 123, "fullname": "João Silva"},
                "courses": [{"id": 45, "fullname": "Engenharia Civil", "shortname": "ENG",
                             "completion": {"completed": completed, "timecompleted": time}}],
                "timestamp": JAN_15_NOON
            })),
        )
}

async fn issued_payload(issuer: &Issuer) -> String {
    let (dir, _) = client(verification_directory(true, JAN_15_NOON));
    let record = dir.get_user(123).await.unwrap();
    let fact = dir.get_completion(123, 45).await.unwrap();
    issuer
        .issue_at(&record, &fact, JAN_15_NOON + 60, [7; 8])
        .unwrap()
        .to_qr_payload()
        .unwrap()
}

fn issuer() -> Issuer {
    Issuer::new("Example University", b"a-long-enough-secret".to_vec())
}

#[tokio::test]
async fn issued_payload_verifies() {
    let payload = issued_payload(&issuer()).await;
    let (dir, _) = client(verification_directory(true, JAN_15_NOON));
    let response = verify_payload(&payload, &issuer(), &dir).await;
    assert!(response.valid, "{response:?}");
    assert_eq!(response.course_name.as_deref(), Some("Engenharia Civil"));
}

#[tokio::test]
async fn edited_payload_fails_verification() {
    let payload = issued_payload(&issuer()).await;
    let mut token = VerificationToken::from_qr_payload(&payload).unwrap();
    token.student_id = 124;
    let forged = token.to_qr_payload().unwrap();

    let (dir, transport) = client(verification_directory(true, JAN_15_NOON));
    let response = verify_payload(&forged, &issuer(), &dir).await;
    assert!(!response.valid);
    assert_eq!(transport.total_calls(), 0);
}

#[tokio::test]
async fn another_secret_cannot_verify() {
    let payload = issued_payload(&issuer()).await;
    let other = Issuer::new("Example University", b"some-other-secret-value".to_vec());
    let (dir, _) = client(verification_directory(true, JAN_15_NOON));
    assert!(!verify_payload(&payload, &other, &dir).await.valid);
}

#[tokio::test]
async fn completion_revoked_after_issuing_fails_verification() {
    let payload = issued_payload(&issuer()).await;
    let (dir, _) = client(verification_directory(false, 0));
    let response = verify_payload(&payload, &issuer(), &dir).await;
    assert!(!response.valid);
    assert!(response.error.unwrap().contains("not completed"));
}
