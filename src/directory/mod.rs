//! Client for the academic-record directory (an LMS web-service endpoint).
//!
//! ## Layers
//!
//! ```text
//! DirectoryClient   typed operations (search, get_completion, …)
//!   │   RetryPolicy   bounded exponential backoff, transient errors only
//!   ▼
//! DirectoryTransport   one function call → raw JSON
//!   ├─ HttpTransport       reqwest form POST to /webservice/rest/server.php
//!   └─ ScriptedTransport   canned replies for tests and offline runs
//! ```
//!
//! Every response is decoded through [`schema`] before it leaves this module.
//! The client keeps no cache: a record lives only as long as the resolution
//! call that fetched it. It is `Send + Sync` and meant to be shared behind an
//! `Arc` by all concurrently processed documents; the HTTP transport pools
//! connections internally.

pub mod http;
pub mod retry;
pub mod schema;
pub mod scripted;

pub use http::HttpTransport;
pub use retry::{RetryFailure, RetryPolicy};
pub use schema::{CompletionFact, DirectoryRecord, SiteInfo};
pub use scripted::{ScriptedReply, ScriptedTransport};

use crate::config::DirectoryConfig;
use crate::error::DirectoryError;
use schema::{DiplomaEnvelope, EnvelopeStatus, UserList, WireEnrolment, WireSiteInfo, WireUser};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// User search by name criteria.
pub const FN_SEARCH_USERS: &str = "core_user_get_users";
/// User lookup by id.
pub const FN_USERS_BY_FIELD: &str = "core_user_get_users_by_field";
/// Courses a user is enrolled in, with the completion flag.
pub const FN_USER_COURSES: &str = "core_enrol_get_users_courses";
/// Site information, used for the connectivity self-test.
pub const FN_SITE_INFO: &str = "core_webservice_get_site_info";

// ── Transport seam ───────────────────────────────────────────────────────

/// Low-level failure of a single call, before retry and classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Timeout,
    Connect(String),
    Status { status: u16, body: String },
    Decode(String),
}

impl TransportError {
    /// Timeouts, connection failures, HTTP 429 and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout | TransportError::Connect(_) => true,
            TransportError::Status { status, .. } => *status == 429 || *status >= 500,
            TransportError::Decode(_) => false,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "request timed out"),
            TransportError::Connect(e) => write!(f, "connection failed: {e}"),
            TransportError::Status { status, body } if body.is_empty() => {
                write!(f, "HTTP {status}")
            }
            TransportError::Status { status, body } => write!(f, "HTTP {status}: {body}"),
            TransportError::Decode(e) => write!(f, "invalid JSON: {e}"),
        }
    }
}

pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<serde_json::Value, TransportError>> + Send + 'a>>;

/// Executes one web-service function with the given parameters.
pub trait DirectoryTransport: Send + Sync {
    fn call<'a>(&'a self, function: &'a str, params: &'a [(String, String)])
        -> TransportFuture<'a>;
}

// ── Health ───────────────────────────────────────────────────────────────

/// Outcome of [`DirectoryClient::self_test`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub connected: bool,
    pub site: Option<SiteInfo>,
    /// Functions this crate calls that the token is not allowed to use.
    pub missing_functions: Vec<String>,
    pub error: Option<String>,
}

impl HealthReport {
    /// Connected and every required function available.
    pub fn is_healthy(&self) -> bool {
        self.connected && self.missing_functions.is_empty()
    }
}

// ── Client ───────────────────────────────────────────────────────────────

/// Typed, retrying client for the directory service.
#[derive(Clone)]
pub struct DirectoryClient {
    transport: Arc<dyn DirectoryTransport>,
    policy: RetryPolicy,
    diploma_function: String,
}

impl fmt::Debug for DirectoryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryClient")
            .field("transport", &"<dyn DirectoryTransport>")
            .field("policy", &self.policy)
            .field("diploma_function", &self.diploma_function)
            .finish()
    }
}

impl DirectoryClient {
    /// Client over HTTP using `config`'s URL, token, timeout and retry settings.
    pub fn http(config: &DirectoryConfig) -> Result<Self, DirectoryError> {
        let transport = HttpTransport::new(config)?;
        Ok(Self::with_transport(Arc::new(transport), config))
    }

    /// Client over any transport.
    pub fn with_transport(transport: Arc<dyn DirectoryTransport>, config: &DirectoryConfig) -> Self {
        Self {
            transport,
            policy: RetryPolicy::from_config(config),
            diploma_function: config.diploma_function.clone(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Find people whose name may match `term`.
    ///
    /// Two criteria queries are merged: first word as a `firstname` prefix
    /// and last word inside `lastname`, so swapped word order still finds
    /// the record. Suspended accounts are dropped. An empty term returns
    /// nothing without a network call.
    pub async fn search(&self, term: &str) -> Result<Vec<DirectoryRecord>, DirectoryError> {
        let words: Vec<&str> = term.split_whitespace().collect();
        let (Some(first), Some(last)) = (words.first(), words.last()) else {
            return Ok(Vec::new());
        };

        let mut found: BTreeMap<i64, DirectoryRecord> = BTreeMap::new();
        for (key, value) in [("firstname", format!("{first}%")), ("lastname", format!("%{last}%"))] {
            let params = vec![
                ("criteria[0][key]".to_string(), key.to_string()),
                ("criteria[0][value]".to_string(), value),
            ];
            let list: UserList = self.call_decoded(FN_SEARCH_USERS, params).await?;
            for user in list.users {
                if user.suspended {
                    debug!("Skipping suspended user {}", user.id);
                    continue;
                }
                found.entry(user.id).or_insert_with(|| user.into_record(Vec::new()));
            }
        }

        info!("Directory search '{}' → {} record(s)", term, found.len());
        Ok(found.into_values().collect())
    }

    /// Fetch one person by id.
    pub async fn get_user(&self, identity_id: i64) -> Result<DirectoryRecord, DirectoryError> {
        let params = vec![
            ("field".to_string(), "id".to_string()),
            ("values[0]".to_string(), identity_id.to_string()),
        ];
        let users: Vec<WireUser> = self.call_decoded(FN_USERS_BY_FIELD, params).await?;
        users
            .into_iter()
            .find(|u| u.id == identity_id)
            .map(|u| u.into_record(Vec::new()))
            .ok_or_else(|| DirectoryError::request(format!("user {identity_id} does not exist")))
    }

    /// Courses the person is enrolled in, with the LMS completion flag.
    /// Completion times are not part of this listing; use
    /// [`get_completion`](Self::get_completion) for the authoritative fact.
    pub async fn enrolments(&self, identity_id: i64) -> Result<Vec<CompletionFact>, DirectoryError> {
        let params = vec![("userid".to_string(), identity_id.to_string())];
        let courses: Vec<WireEnrolment> = self.call_decoded(FN_USER_COURSES, params).await?;
        Ok(courses.into_iter().map(|c| c.into_fact(identity_id)).collect())
    }

    /// Completion of `course_id` by `identity_id`, from the diploma function.
    pub async fn get_completion(
        &self,
        identity_id: i64,
        course_id: i64,
    ) -> Result<CompletionFact, DirectoryError> {
        let params = vec![
            ("userid".to_string(), identity_id.to_string()),
            ("courseid".to_string(), course_id.to_string()),
        ];
        let function = self.diploma_function.clone();
        let env: DiplomaEnvelope = self.call_decoded(&function, params).await?;

        if env.status == EnvelopeStatus::Error {
            return Err(DirectoryError::request(
                env.message.unwrap_or_else(|| format!("{function} returned status 'error'")),
            ));
        }
        if let Some(user) = &env.user {
            if user.id != identity_id {
                return Err(DirectoryError::request(format!(
                    "{function} answered for user {} instead of {identity_id}",
                    user.id
                )));
            }
        }
        debug!("{} answered at {}", function, env.timestamp);

        env.courses
            .into_iter()
            .find(|c| c.id == course_id)
            .map(|c| c.into_fact(identity_id))
            .ok_or_else(|| {
                DirectoryError::request(format!(
                    "user {identity_id} is not enrolled in course {course_id}"
                ))
            })
    }

    /// Connectivity self-test for health reporting. Never fails.
    pub async fn self_test(&self) -> HealthReport {
        match self.call_decoded::<WireSiteInfo>(FN_SITE_INFO, Vec::new()).await {
            Ok(info) => {
                let site = SiteInfo::from(info);
                let missing = if site.functions.is_empty() {
                    Vec::new()
                } else {
                    self.required_functions()
                        .into_iter()
                        .filter(|f| !site.functions.iter().any(|have| have == f))
                        .collect()
                };
                if !missing.is_empty() {
                    warn!("Directory token lacks functions: {}", missing.join(", "));
                }
                HealthReport {
                    connected: true,
                    site: Some(site),
                    missing_functions: missing,
                    error: None,
                }
            }
            Err(e) => {
                warn!("Directory self-test failed: {}", e);
                HealthReport {
                    connected: false,
                    site: None,
                    missing_functions: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn required_functions(&self) -> Vec<String> {
        [FN_SEARCH_USERS, FN_USERS_BY_FIELD, FN_USER_COURSES]
            .into_iter()
            .map(str::to_string)
            .chain(std::iter::once(self.diploma_function.clone()))
            .collect()
    }

    async fn call_decoded<T: serde::de::DeserializeOwned>(
        &self,
        function: &str,
        params: Vec<(String, String)>,
    ) -> Result<T, DirectoryError> {
        let value = self.call(function, params).await?;
        schema::decode(function, value)
    }

    /// One function call under the retry policy, with failures classified.
    async fn call(
        &self,
        function: &str,
        params: Vec<(String, String)>,
    ) -> Result<serde_json::Value, DirectoryError> {
        let transport = &self.transport;
        let params = params.as_slice();
        self.policy
            .run(function, move || transport.call(function, params))
            .await
            .map_err(|failure| classify(function, failure))
    }
}

/// Map a final transport failure onto the directory error taxonomy.
fn classify(function: &str, failure: RetryFailure<TransportError>) -> DirectoryError {
    match failure {
        RetryFailure::Fatal(TransportError::Status { status, body }) if status == 401 || status == 403 => {
            DirectoryError::Auth {
                message: format!("{function}: HTTP {status} {body}").trim_end().to_string(),
            }
        }
        RetryFailure::Fatal(e @ (TransportError::Timeout | TransportError::Connect(_))) => {
            DirectoryError::Unavailable {
                attempts: 1,
                last_error: format!("{function}: {e}"),
            }
        }
        RetryFailure::Fatal(e) => DirectoryError::request(format!("{function}: {e}")),
        RetryFailure::Exhausted { attempts, last } => DirectoryError::Unavailable {
            attempts,
            last_error: format!("{function}: {last}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client(transport: ScriptedTransport) -> (DirectoryClient, Arc<ScriptedTransport>) {
        let transport = Arc::new(transport);
        let client = DirectoryClient::with_transport(transport.clone(), &DirectoryConfig::default());
        (client, transport)
    }

    fn user(id: i64, first: &str, last: &str) -> serde_json::Value {
        json!({"id": id, "username": format!("u{id}"), "firstname": first, "lastname": last,
               "fullname": format!("{first} {last}"), "email": format!("u{id}@x.edu")})
    }

    #[tokio::test]
    async fn search_merges_criteria_and_drops_suspended() {
        let mut suspended = user(3, "Maria", "Lima");
        suspended["suspended"] = json!(true);
        let (client, transport) = client(
            ScriptedTransport::new().reply(
                FN_SEARCH_USERS,
                ScriptedReply::json(json!({"users": [user(1, "Maria", "Souza"), user(2, "Maria", "Souza Santos"), suspended]})),
            ),
        );
        let records = client.search("Maria Souza").await.unwrap();
        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(transport.call_count(FN_SEARCH_USERS), 2);

        let calls = transport.calls();
        assert!(calls[0].params.contains(&("criteria[0][value]".into(), "Maria%".into())));
        assert!(calls[1].params.contains(&("criteria[0][value]".into(), "%Souza%".into())));
    }

    #[tokio::test]
    async fn empty_search_makes_no_call() {
        let (client, transport) = client(ScriptedTransport::new());
        assert!(client.search("   ").await.unwrap().is_empty());
        assert_eq!(transport.total_calls(), 0);
    }

    #[tokio::test]
    async fn completion_is_read_from_envelope() {
        let (client, _) = client(ScriptedTransport::new().reply(
            "local_diploma_data_get_user_diploma_details",
            ScriptedReply::json(json!({
                "status": "success",
                "user": user(123, "João", "Silva"),
                "courses": [
                    {"id": 44, "fullname": "Other", "shortname": "O", "completion": {"completed": false}},
                    {"id": 45, "fullname": "Engenharia Civil", "shortname": "ENG",
                     "completion": {"completed": true, "timecompleted": 1736942400, "grade": "A"}}
                ],
                "timestamp": 1736942500
            })),
        ));
        let fact = client.get_completion(123, 45).await.unwrap();
        assert!(fact.completed);
        assert_eq!(fact.course_name, "Engenharia Civil");
        assert_eq!(fact.time_completed, Some(1736942400));
    }

    #[tokio::test]
    async fn envelope_error_status_is_request_error() {
        let (client, _) = client(ScriptedTransport::new().reply(
            "local_diploma_data_get_user_diploma_details",
            ScriptedReply::json(json!({"status": "error", "message": "Course not found", "timestamp": 1})),
        ));
        let err = client.get_completion(1, 2).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Request { ref message } if message == "Course not found"));
    }

    #[tokio::test]
    async fn missing_course_is_request_error() {
        let (client, _) = client(ScriptedTransport::new().reply(
            "local_diploma_data_get_user_diploma_details",
            ScriptedReply::json(json!({"status": "success", "courses": [], "timestamp": 1})),
        ));
        let err = client.get_completion(1, 2).await.unwrap_err();
        assert!(err.to_string().contains("not enrolled"), "got: {err}");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_exhaust_into_unavailable() {
        let (client, transport) = client(
            ScriptedTransport::new().reply(FN_USERS_BY_FIELD, ScriptedReply::fail(TransportError::Timeout)),
        );
        let err = client.get_user(7).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Unavailable { attempts: 3, .. }), "got: {err:?}");
        assert_eq!(transport.call_count(FN_USERS_BY_FIELD), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_then_success() {
        let (client, transport) = client(ScriptedTransport::new().reply_sequence(
            FN_USERS_BY_FIELD,
            vec![
                ScriptedReply::fail(TransportError::Status { status: 502, body: "bad gateway".into() }),
                ScriptedReply::json(json!([user(7, "Ana", "Costa")])),
            ],
        ));
        let rec = client.get_user(7).await.unwrap();
        assert_eq!(rec.display_name(), "Ana Costa");
        assert_eq!(transport.call_count(FN_USERS_BY_FIELD), 2);
    }

    #[tokio::test]
    async fn http_403_is_auth_and_not_retried() {
        let (client, transport) = client(ScriptedTransport::new().reply(
            FN_USER_COURSES,
            ScriptedReply::fail(TransportError::Status { status: 403, body: "forbidden".into() }),
        ));
        let err = client.enrolments(7).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Auth { .. }));
        assert_eq!(transport.call_count(FN_USER_COURSES), 1);
    }

    #[tokio::test]
    async fn invalid_token_exception_is_auth_and_not_retried() {
        let (client, transport) = client(ScriptedTransport::new().reply(
            FN_USERS_BY_FIELD,
            ScriptedReply::json(json!({"exception": "moodle_exception", "errorcode": "invalidtoken", "message": "Invalid token"})),
        ));
        let err = client.get_user(1).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Auth { .. }));
        assert_eq!(transport.call_count(FN_USERS_BY_FIELD), 1);
    }

    #[tokio::test]
    async fn unknown_user_is_request_error() {
        let (client, _) = client(
            ScriptedTransport::new().reply(FN_USERS_BY_FIELD, ScriptedReply::json(json!([]))),
        );
        let err = client.get_user(99).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Request { .. }));
    }

    #[tokio::test]
    async fn enrolments_carry_completion_flag() {
        let (client, _) = client(ScriptedTransport::new().reply(
            FN_USER_COURSES,
            ScriptedReply::json(json!([
                {"id": 45, "fullname": "Engenharia", "shortname": "ENG", "completed": true},
                {"id": 46, "fullname": "Direito", "shortname": "DIR"}
            ])),
        ));
        let courses = client.enrolments(123).await.unwrap();
        assert_eq!(courses.len(), 2);
        assert!(courses[0].completed);
        assert!(!courses[1].completed);
        assert_eq!(courses[1].identity_id, 123);
    }

    #[tokio::test]
    async fn self_test_reports_missing_functions() {
        let (client, _) = client(ScriptedTransport::new().reply(
            FN_SITE_INFO,
            ScriptedReply::json(json!({
                "sitename": "Campus", "siteurl": "https://moodle.example.edu", "release": "4.1",
                "username": "ws", "functions": [
                    {"name": FN_SEARCH_USERS}, {"name": FN_USERS_BY_FIELD}, {"name": FN_USER_COURSES}
                ]
            })),
        ));
        let report = client.self_test().await;
        assert!(report.connected);
        assert!(!report.is_healthy());
        assert_eq!(
            report.missing_functions,
            vec!["local_diploma_data_get_user_diploma_details".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn self_test_never_fails() {
        let (client, _) = client(
            ScriptedTransport::new().reply(FN_SITE_INFO, ScriptedReply::fail(TransportError::Connect("refused".into()))),
        );
        let report = client.self_test().await;
        assert!(!report.connected);
        assert!(report.error.unwrap().contains("refused"));
    }

    #[test]
    fn transient_classification() {
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::Status { status: 429, body: String::new() }.is_transient());
        assert!(TransportError::Status { status: 500, body: String::new() }.is_transient());
        assert!(!TransportError::Status { status: 400, body: String::new() }.is_transient());
        assert!(!TransportError::Decode("eof".into()).is_transient());
    }
}
