//! Response shapes of the directory service.
//!
//! The service answers with loosely-typed JSON: flags arrive as `true`, `1`
//! or `"1"`, grades as strings or numbers, missing completion times as `0`
//! or `null`. Each response is decoded into an explicit wire struct here and
//! then converted into the crate's own types, so nothing downstream ever sees
//! a raw `serde_json::Value`. A payload that does not fit its struct is a
//! [`DirectoryError::Request`].

use crate::error::DirectoryError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

// ── Public model ─────────────────────────────────────────────────────────

/// A person as known to the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub id: i64,
    pub username: String,
    pub firstname: String,
    pub lastname: String,
    pub fullname: String,
    pub email: String,
    pub suspended: bool,
    /// Enrolment and completion facts, when the call that produced the
    /// record returns them.
    pub courses: Vec<CompletionFact>,
}

impl DirectoryRecord {
    /// The name used for matching and display: `fullname`, or
    /// `firstname lastname` when the service leaves `fullname` blank.
    pub fn display_name(&self) -> String {
        let full = self.fullname.trim();
        if !full.is_empty() {
            return full.to_string();
        }
        format!("{} {}", self.firstname.trim(), self.lastname.trim())
            .trim()
            .to_string()
    }
}

/// Completion state of one person in one course.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionFact {
    pub identity_id: i64,
    pub course_id: i64,
    pub course_name: String,
    pub course_shortname: String,
    pub completed: bool,
    /// Completion time, epoch seconds. `None` when unknown.
    pub time_completed: Option<i64>,
    pub grade: Option<String>,
}

/// Result of `core_webservice_get_site_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteInfo {
    pub site_name: String,
    pub site_url: String,
    pub release: String,
    pub username: String,
    pub functions: Vec<String>,
}

// ── Wire shapes ──────────────────────────────────────────────────────────

/// Error object the service returns (with HTTP 200) for failed calls.
#[derive(Debug, Deserialize)]
pub(crate) struct ServiceException {
    pub exception: String,
    #[serde(default)]
    pub errorcode: String,
    #[serde(default)]
    pub message: String,
}

impl ServiceException {
    const AUTH_CODES: &'static [&'static str] = &[
        "invalidtoken",
        "accessexception",
        "invalidlogin",
        "forbidden_web_service",
        "webservicesnotenabled",
    ];

    pub fn into_error(self) -> DirectoryError {
        let message = format!("{} ({}): {}", self.errorcode, self.exception, self.message);
        if Self::AUTH_CODES.contains(&self.errorcode.as_str()) {
            DirectoryError::Auth { message }
        } else {
            DirectoryError::Request { message }
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireUser {
    pub id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub firstname: String,
    #[serde(default)]
    pub lastname: String,
    #[serde(default)]
    pub fullname: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, deserialize_with = "flag")]
    pub suspended: bool,
}

impl WireUser {
    pub fn into_record(self, courses: Vec<CompletionFact>) -> DirectoryRecord {
        DirectoryRecord {
            id: self.id,
            username: self.username,
            firstname: self.firstname,
            lastname: self.lastname,
            fullname: self.fullname,
            email: self.email,
            suspended: self.suspended,
            courses,
        }
    }
}

/// `core_user_get_users`.
#[derive(Debug, Deserialize)]
pub(crate) struct UserList {
    pub users: Vec<WireUser>,
}

/// One entry of `core_enrol_get_users_courses`.
#[derive(Debug, Deserialize)]
pub(crate) struct WireEnrolment {
    pub id: i64,
    #[serde(default)]
    pub fullname: String,
    #[serde(default)]
    pub shortname: String,
    #[serde(default, deserialize_with = "flag")]
    pub completed: bool,
}

impl WireEnrolment {
    pub fn into_fact(self, identity_id: i64) -> CompletionFact {
        CompletionFact {
            identity_id,
            course_id: self.id,
            course_name: self.fullname,
            course_shortname: self.shortname,
            completed: self.completed,
            time_completed: None,
            grade: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum EnvelopeStatus {
    Success,
    Error,
}

/// Response of the diploma-details function.
#[derive(Debug, Deserialize)]
pub(crate) struct DiplomaEnvelope {
    pub status: EnvelopeStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub user: Option<WireUser>,
    #[serde(default)]
    pub courses: Vec<WireCourse>,
    pub timestamp: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireCourse {
    pub id: i64,
    #[serde(default)]
    pub fullname: String,
    #[serde(default)]
    pub shortname: String,
    #[serde(default)]
    pub completion: Option<WireCompletion>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireCompletion {
    #[serde(default, deserialize_with = "flag")]
    pub completed: bool,
    #[serde(default, deserialize_with = "epoch")]
    pub timecompleted: Option<i64>,
    #[serde(default, deserialize_with = "grade")]
    pub grade: Option<String>,
}

impl WireCourse {
    pub fn into_fact(self, identity_id: i64) -> CompletionFact {
        let (completed, time_completed, grade) = match self.completion {
            Some(c) => (c.completed, c.timecompleted, c.grade),
            None => (false, None, None),
        };
        CompletionFact {
            identity_id,
            course_id: self.id,
            course_name: self.fullname,
            course_shortname: self.shortname,
            completed,
            time_completed,
            grade,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireSiteInfo {
    #[serde(default)]
    pub sitename: String,
    #[serde(default)]
    pub siteurl: String,
    #[serde(default)]
    pub release: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub functions: Vec<WireFunction>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireFunction {
    pub name: String,
}

impl From<WireSiteInfo> for SiteInfo {
    fn from(w: WireSiteInfo) -> Self {
        SiteInfo {
            site_name: w.sitename,
            site_url: w.siteurl,
            release: w.release,
            username: w.username,
            functions: w.functions.into_iter().map(|f| f.name).collect(),
        }
    }
}

// ── Decoding ─────────────────────────────────────────────────────────────

/// Decode a response body, turning service exceptions and shape mismatches
/// into [`DirectoryError`]s.
pub(crate) fn decode<T: DeserializeOwned>(
    function: &str,
    value: serde_json::Value,
) -> Result<T, DirectoryError> {
    if value.get("exception").is_some() {
        let exc: ServiceException = serde_json::from_value(value).map_err(|e| {
            DirectoryError::request(format!("{function}: unreadable error object: {e}"))
        })?;
        return Err(exc.into_error());
    }
    serde_json::from_value(value).map_err(|e| {
        DirectoryError::request(format!("{function}: unexpected response shape: {e}"))
    })
}

// ── Lenient scalar decoders ──────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum FlagRepr {
    Bool(bool),
    Int(i64),
    Str(String),
}

fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    let repr = Option::<FlagRepr>::deserialize(d)?;
    Ok(match repr {
        None => false,
        Some(FlagRepr::Bool(b)) => b,
        Some(FlagRepr::Int(i)) => i != 0,
        Some(FlagRepr::Str(s)) => matches!(s.trim(), "1" | "true" | "yes"),
    })
}

fn epoch<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    let v = Option::<i64>::deserialize(d)?;
    Ok(v.filter(|&t| t > 0))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GradeRepr {
    Str(String),
    Num(f64),
}

fn grade<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let repr = Option::<GradeRepr>::deserialize(d)?;
    Ok(match repr {
        None => None,
        Some(GradeRepr::Str(s)) if s.trim().is_empty() || s.trim() == "-" => None,
        Some(GradeRepr::Str(s)) => Some(s.trim().to_string()),
        Some(GradeRepr::Num(n)) => Some(n.to_string()),
    })
}
