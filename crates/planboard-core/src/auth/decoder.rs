//! Structural decoding of bearer credentials.
//!
//! Signatures are not checked here; the server verifies every request.
//! The decoded claims are only used to show identity locally and to notice
//! expiry without a round trip.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::models::{IdentityClaims, Role};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed credential: {0}")]
    Malformed(String),

    #[error("Credential is missing required claim `{0}`")]
    MissingRequiredField(&'static str),

    #[error("Credential expired at {expired_at}")]
    Expired { expired_at: DateTime<Utc> },
}

/// Claim set as issued by the auth server. The username may arrive under
/// any of three keys depending on the server version.
#[derive(Debug, Deserialize)]
struct RawClaims {
    username: Option<String>,
    sub: Option<String>,
    identity: Option<String>,
    company_name: Option<String>,
    role: Option<String>,
    exp: Option<f64>,
}

/// Decode a credential against the current clock.
#[cfg(test)]
fn decode(credential: &str) -> Result<IdentityClaims, DecodeError> {
    decode_at(credential, Utc::now())
}

pub fn decode_at(credential: &str, now: DateTime<Utc>) -> Result<IdentityClaims, DecodeError> {
    let raw = raw_claims(credential)?;

    let username = [raw.username, raw.sub, raw.identity]
        .into_iter()
        .flatten()
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .ok_or(DecodeError::MissingRequiredField("username"))?;

    let company_name = raw
        .company_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or(DecodeError::MissingRequiredField("company_name"))?;

    let expires_at = match raw.exp {
        Some(exp) => Some(timestamp(exp)?),
        None => None,
    };

    if let Some(expired_at) = expires_at.filter(|at| *at <= now) {
        return Err(DecodeError::Expired { expired_at });
    }

    Ok(IdentityClaims {
        username,
        company_name,
        role: raw.role.map(Role::from).unwrap_or_default(),
        expires_at,
    })
}

/// Only the `exp` claim, for credentials that carry no identity claims.
pub fn expiry(credential: &str) -> Result<Option<DateTime<Utc>>, DecodeError> {
    raw_claims(credential)?.exp.map(timestamp).transpose()
}

fn raw_claims(credential: &str) -> Result<RawClaims, DecodeError> {
    let payload = payload_segment(credential)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| DecodeError::Malformed(format!("payload is not base64url: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| DecodeError::Malformed(format!("payload is not a claim set: {}", e)))
}

fn payload_segment(credential: &str) -> Result<&str, DecodeError> {
    let mut parts = credential.trim().split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(payload), Some(_), None) if !header.is_empty() && !payload.is_empty() => {
            Ok(payload)
        }
        _ => Err(DecodeError::Malformed(
            "expected three dot-separated segments".to_string(),
        )),
    }
}

fn timestamp(exp: f64) -> Result<DateTime<Utc>, DecodeError> {
    if !exp.is_finite() {
        return Err(DecodeError::Malformed("exp is not a number".to_string()));
    }
    DateTime::from_timestamp(exp.trunc() as i64, 0)
        .ok_or_else(|| DecodeError::Malformed(format!("exp {} is out of range", exp)))
}

/// Build an unsigned credential around a claim payload.
#[cfg(test)]
pub(crate) fn test_token(claims: serde_json::Value) -> String {
    format!(
        "{}.{}.signature",
        URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    )
}

// ============================================================================
// Tests
// ============================================================================
