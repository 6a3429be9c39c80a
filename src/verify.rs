//! Verification query: is a scanned token genuine and still backed by the
//! directory?
//!
//! Checks run in order and stop at the first failure:
//!
//! 1. the token names this issuer's institution;
//! 2. its verification code is valid for its fields under the issuer secret;
//! 3. the student exists in the directory;
//! 4. the directory has a completion record for the course;
//! 5. that record says the course is completed;
//! 6. the recorded completion date equals the token's.
//!
//! Steps 1–2 need only the secret. Steps 3–6 catch diplomas whose record
//! was revoked or changed after issuing.

use crate::directory::DirectoryClient;
use crate::error::TokenError;
use crate::pipeline::token::{completion_date, Issuer, VerificationToken};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Answer to a verification query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResponse {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_date: Option<NaiveDate>,
    /// UTC date the check ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerificationResponse {
    pub fn invalid(error: impl Into<String>) -> Self {
        let error = error.into();
        warn!("Verification failed: {}", error);
        Self {
            valid: false,
            student_name: None,
            course_name: None,
            completion_date: None,
            verification_date: None,
            error: Some(error),
        }
    }
}

/// Check a decoded token against `issuer` and the live directory.
pub async fn verify_token(
    token: &VerificationToken,
    issuer: &Issuer,
    directory: &DirectoryClient,
) -> VerificationResponse {
    if token.institution != issuer.institution() {
        return VerificationResponse::invalid(format!(
            "token was issued by '{}', not '{}'",
            token.institution,
            issuer.institution()
        ));
    }
    match issuer.check(token) {
        Ok(()) => {}
        Err(TokenError::InvalidCode) => {
            return VerificationResponse::invalid("verification code does not match the token");
        }
        Err(e) => return VerificationResponse::invalid(e.to_string()),
    }

    let record = match directory.get_user(token.student_id).await {
        Ok(r) => r,
        Err(e) => {
            return VerificationResponse::invalid(format!(
                "student {} could not be confirmed: {e}",
                token.student_id
            ))
        }
    };
    let fact = match directory.get_completion(token.student_id, token.course_id).await {
        Ok(f) => f,
        Err(e) => {
            return VerificationResponse::invalid(format!(
                "completion of course {} could not be confirmed: {e}",
                token.course_id
            ))
        }
    };
    if !fact.completed {
        return VerificationResponse::invalid(format!(
            "course {} is not completed according to the directory",
            token.course_id
        ));
    }
    if completion_date(fact.time_completed) != Some(token.completion_date) {
        return VerificationResponse::invalid(
            "completion date does not match the directory record",
        );
    }

    info!(
        "Verified diploma of student {} for course {}",
        token.student_id, token.course_id
    );
    VerificationResponse {
        valid: true,
        student_name: Some(record.display_name()),
        course_name: Some(fact.course_name),
        completion_date: Some(token.completion_date),
        verification_date: Some(Utc::now().date_naive()),
        error: None,
    }
}

/// Decode the text of a scanned QR, then [`verify_token`].
pub async fn verify_payload(
    payload: &str,
    issuer: &Issuer,
    directory: &DirectoryClient,
) -> VerificationResponse {
    match VerificationToken::from_qr_payload(payload) {
        Ok(token) => verify_token(&token, issuer, directory).await,
        Err(e) => VerificationResponse::invalid(e.to_string()),
    }
}
