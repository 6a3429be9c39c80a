//! Verification tokens: the payload embedded in a diploma's QR code.
//!
//! ## Wire format
//!
//! ```json
//! {"student_id":123,"course_id":45,"completion_date":"2025-01-15",
//!  "verification_code":"v1.9f1c….4be0…","timestamp":1736942400,
//!  "institution":"Example University"}
//! ```
//!
//! ## Verification code
//!
//! `v1.<nonce>.<tag>` where `nonce` is 8 random bytes and `tag` is the first
//! 16 bytes of HMAC-SHA-256, both hex. The MAC covers every other field of
//! the token plus the nonce, so a token replayed with a different student,
//! course, date or institution fails [`Issuer::check`]. The token is
//! self-contained: checking it needs only the issuer secret.

use crate::directory::{CompletionFact, DirectoryRecord};
use crate::error::TokenError;
use chrono::{DateTime, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Format version carried in every verification code.
pub const CODE_VERSION: &str = "v1";

const NONCE_LEN: usize = 8;
const TAG_LEN: usize = 16;

/// Payload embedded in the QR. Field order is the JSON key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerificationToken {
    pub student_id: i64,
    pub course_id: i64,
    pub completion_date: NaiveDate,
    pub verification_code: String,
    /// Issue time, epoch seconds.
    pub timestamp: i64,
    pub institution: String,
}

impl VerificationToken {
    /// Compact JSON for the QR code.
    pub fn to_qr_payload(&self) -> Result<String, TokenError> {
        serde_json::to_string(self).map_err(|e| TokenError::Malformed(e.to_string()))
    }

    /// Parse a scanned QR payload.
    pub fn from_qr_payload(payload: &str) -> Result<Self, TokenError> {
        serde_json::from_str(payload.trim()).map_err(|e| TokenError::Malformed(e.to_string()))
    }
}

/// The institution issuing diplomas and the secret keying its codes.
#[derive(Clone)]
pub struct Issuer {
    institution: String,
    secret: Vec<u8>,
}

impl fmt::Debug for Issuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Issuer")
            .field("institution", &self.institution)
            .field("secret", &if self.secret.is_empty() { "<unset>" } else { "<redacted>" })
            .finish()
    }
}

impl Issuer {
    pub fn new(institution: impl Into<String>, secret: Vec<u8>) -> Self {
        Self {
            institution: institution.into(),
            secret,
        }
    }

    pub fn institution(&self) -> &str {
        &self.institution
    }

    pub fn secret_len(&self) -> usize {
        self.secret.len()
    }

    /// Build a token issued at `issued_at` (epoch seconds) with `nonce`.
    pub fn issue_at(
        &self,
        record: &DirectoryRecord,
        fact: &CompletionFact,
        issued_at: i64,
        nonce: [u8; NONCE_LEN],
    ) -> Result<VerificationToken, TokenError> {
        let incomplete = |detail: &str| TokenError::IncompleteData {
            identity_id: record.id,
            course_id: fact.course_id,
            detail: detail.to_string(),
        };

        if fact.identity_id != record.id {
            return Err(incomplete(&format!(
                "completion fact belongs to identity {}",
                fact.identity_id
            )));
        }
        if !fact.completed {
            return Err(incomplete("course not completed"));
        }
        let completion_date = completion_date(fact.time_completed)
            .ok_or_else(|| incomplete("completion time missing"))?;

        let nonce_hex = hex::encode(nonce);
        let mut token = VerificationToken {
            student_id: record.id,
            course_id: fact.course_id,
            completion_date,
            verification_code: String::new(),
            timestamp: issued_at,
            institution: self.institution.clone(),
        };
        let tag = self.mac(&token, &nonce_hex)?.finalize().into_bytes();
        token.verification_code = format!(
            "{CODE_VERSION}.{nonce_hex}.{}",
            hex::encode(&tag[..TAG_LEN])
        );
        Ok(token)
    }

    /// Check that `token`'s code was produced by this issuer for exactly
    /// these field values. Constant-time comparison.
    pub fn check(&self, token: &VerificationToken) -> Result<(), TokenError> {
        let mut parts = token.verification_code.split('.');
        let (Some(version), Some(nonce_hex), Some(tag_hex), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed(
                "verification code must have three dot-separated parts".into(),
            ));
        };
        if version != CODE_VERSION {
            return Err(TokenError::Malformed(format!(
                "unsupported code version '{version}'"
            )));
        }
        let nonce = hex::decode(nonce_hex)
            .map_err(|e| TokenError::Malformed(format!("nonce: {e}")))?;
        let tag = hex::decode(tag_hex).map_err(|e| TokenError::Malformed(format!("tag: {e}")))?;
        if nonce.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(TokenError::Malformed("nonce or tag has the wrong length".into()));
        }

        self.mac(token, nonce_hex)?
            .verify_truncated_left(&tag)
            .map_err(|_| TokenError::InvalidCode)
    }

    fn mac(&self, token: &VerificationToken, nonce_hex: &str) -> Result<HmacSha256, TokenError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| TokenError::Malformed("issuer secret rejected by HMAC".into()))?;
        let message = format!(
            "{CODE_VERSION}\n{}\n{}\n{}\n{}\n{}\n{}",
            token.student_id,
            token.course_id,
            token.completion_date,
            token.timestamp,
            token.institution,
            nonce_hex.to_ascii_lowercase(),
        );
        mac.update(message.as_bytes());
        Ok(mac)
    }
}

/// UTC calendar date of a completion time. `None` for missing or
/// non-positive times.
pub fn completion_date(time_completed: Option<i64>) -> Option<NaiveDate> {
    time_completed
        .filter(|t| *t > 0)
        .and_then(|t| DateTime::from_timestamp(t, 0))
        .map(|dt| dt.date_naive())
}

/// Build a token for `record`'s completion of `fact`'s course, issued now
/// with a fresh random nonce.
pub fn build(
    record: &DirectoryRecord,
    fact: &CompletionFact,
    issuer: &Issuer,
) -> Result<VerificationToken, TokenError> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    issuer.issue_at(record, fact, Utc::now().timestamp(), nonce)
}
