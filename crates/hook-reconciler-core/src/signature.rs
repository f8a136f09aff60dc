//! # Signature Verification
//!
//! Pure functions that authenticate a raw webhook body against the signature
//! a provider sent with it. Each provider family signs differently:
//!
//! | Scheme               | Signed bytes          | Algorithm   | Encoding | Header comparison |
//! |----------------------|-----------------------|-------------|----------|-------------------|
//! | `UrlAndBody`         | `url ++ body`         | HMAC-SHA1   | base64   | case-sensitive    |
//! | `TimestampAndBody`   | `timestamp ++ body`   | HMAC-SHA256 | hex      | case-insensitive  |
//! | `Body { algorithm }` | `body`                | configured  | hex      | case-insensitive  |
//!
//! Verification fails closed: an empty secret, a missing header, missing
//! context, or any decoding problem yields `false`. Digest comparison is
//! constant time.
//!
//! Timestamp freshness for the calendar scheme is a separate check,
//! [`check_timestamp_freshness`], so callers can distinguish a forged
//! signature from a replayed one.

use crate::{Timestamp, WebhookSource};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::Sha256;
use std::time::Duration;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// Prefixes some providers put in front of the digest (`sha256=abcd...`).
const SCHEME_PREFIXES: [&str; 3] = ["sha1", "sha256", "v1"];

// ============================================================================
// Types
// ============================================================================

/// Keyed-hash algorithm for the generic body scheme
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureAlgorithm {
    /// HMAC-SHA1, used by legacy integrations
    #[serde(alias = "sha1")]
    HmacSha1,
    /// HMAC-SHA256
    #[default]
    #[serde(alias = "sha256")]
    HmacSha256,
}

/// How a provider family signs its webhooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    /// HMAC-SHA1 over the full request URL followed by the raw body (telephony)
    UrlAndBody,
    /// HMAC-SHA256 over the signing timestamp followed by the raw body (calendar)
    TimestampAndBody,
    /// HMAC over the raw body only (SMS delivery, review platforms)
    Body { algorithm: SignatureAlgorithm },
}

impl SignatureScheme {
    /// Scheme used by a source; `algorithm` applies to the generic body scheme only
    pub fn for_source(source: WebhookSource, algorithm: SignatureAlgorithm) -> Self {
        match source {
            WebhookSource::Telephony => Self::UrlAndBody,
            WebhookSource::Calendar => Self::TimestampAndBody,
            WebhookSource::SmsDelivery | WebhookSource::ReviewPlatform => {
                Self::Body { algorithm }
            }
        }
    }
}

/// Request context some schemes fold into the signed bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationContext {
    /// Full URL the provider posted to (required by `UrlAndBody`)
    pub url: Option<String>,
    /// Raw signing timestamp header value (required by `TimestampAndBody`)
    pub timestamp: Option<String>,
}

impl VerificationContext {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            timestamp: None,
        }
    }

    pub fn with_timestamp(timestamp: impl Into<String>) -> Self {
        Self {
            url: None,
            timestamp: Some(timestamp.into()),
        }
    }
}

/// Shared secret for one provider integration.
///
/// The value is wiped from memory on drop and never printed by `Debug`.
#[derive(Clone)]
pub struct WebhookSecret(Zeroizing<String>);

impl WebhookSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Get secret as string (only for immediate use)
    pub fn expose_secret(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSecret")
            .field("length", &self.0.len())
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// Why a signing timestamp was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FreshnessError {
    #[error("Signing timestamp '{value}' is not unix seconds or RFC3339")]
    Unparseable { value: String },

    #[error("Signing timestamp is {age_seconds}s old (maximum {max_age_seconds}s)")]
    Expired {
        age_seconds: i64,
        max_age_seconds: u64,
    },

    #[error("Signing timestamp is {skew_seconds}s in the future")]
    FromFuture { skew_seconds: i64 },
}

// ============================================================================
// Operations
// ============================================================================

/// Check `signature_header` against the signature `scheme` computes for `raw_body`.
///
/// Never panics and never returns an error: anything inconclusive is `false`.
pub fn verify(
    scheme: &SignatureScheme,
    raw_body: &[u8],
    signature_header: &str,
    secret: &str,
    context: &VerificationContext,
) -> bool {
    let header = signature_header.trim();
    if secret.is_empty() || header.is_empty() {
        return false;
    }
    let provided = strip_scheme_prefix(header);

    match scheme {
        SignatureScheme::UrlAndBody => {
            let Some(url) = context.url.as_deref() else {
                return false;
            };
            let Some(digest) = keyed_hash(
                SignatureAlgorithm::HmacSha1,
                secret.as_bytes(),
                &[url.as_bytes(), raw_body],
            ) else {
                return false;
            };
            let expected = BASE64.encode(digest);
            expected.as_bytes().ct_eq(provided.as_bytes()).into()
        }
        SignatureScheme::TimestampAndBody => {
            let Some(timestamp) = context.timestamp.as_deref() else {
                return false;
            };
            verify_hex(
                SignatureAlgorithm::HmacSha256,
                secret.as_bytes(),
                &[timestamp.trim().as_bytes(), raw_body],
                provided,
            )
        }
        SignatureScheme::Body { algorithm } => {
            verify_hex(*algorithm, secret.as_bytes(), &[raw_body], provided)
        }
    }
}

/// Compute the header value a provider would send for `raw_body`.
///
/// Returns `None` when the secret is empty or the scheme's context is missing.
pub fn sign(
    scheme: &SignatureScheme,
    raw_body: &[u8],
    secret: &str,
    context: &VerificationContext,
) -> Option<String> {
    if secret.is_empty() {
        return None;
    }

    match scheme {
        SignatureScheme::UrlAndBody => {
            let url = context.url.as_deref()?;
            let digest = keyed_hash(
                SignatureAlgorithm::HmacSha1,
                secret.as_bytes(),
                &[url.as_bytes(), raw_body],
            )?;
            Some(BASE64.encode(digest))
        }
        SignatureScheme::TimestampAndBody => {
            let timestamp = context.timestamp.as_deref()?;
            let digest = keyed_hash(
                SignatureAlgorithm::HmacSha256,
                secret.as_bytes(),
                &[timestamp.trim().as_bytes(), raw_body],
            )?;
            Some(hex::encode(digest))
        }
        SignatureScheme::Body { algorithm } => {
            let digest = keyed_hash(*algorithm, secret.as_bytes(), &[raw_body])?;
            Some(hex::encode(digest))
        }
    }
}

/// Parse a signing timestamp given as unix seconds, unix milliseconds, or RFC3339.
pub fn parse_signing_timestamp(value: &str) -> Option<Timestamp> {
    let value = value.trim();
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
        let raw: i64 = value.parse().ok()?;
        // Thirteen digits and up is milliseconds
        let seconds = if raw >= 1_000_000_000_000 { raw / 1000 } else { raw };
        let dt = chrono::DateTime::from_timestamp(seconds, 0)?;
        return Some(Timestamp::from_datetime(dt));
    }
    Timestamp::from_rfc3339(value).ok()
}

/// Reject signing timestamps older than `max_age`, or further than `max_age` ahead of `now`.
pub fn check_timestamp_freshness(
    timestamp: &str,
    max_age: Duration,
    now: Timestamp,
) -> Result<(), FreshnessError> {
    let signed_at = parse_signing_timestamp(timestamp).ok_or_else(|| {
        FreshnessError::Unparseable {
            value: timestamp.to_string(),
        }
    })?;

    let age_seconds = now
        .as_datetime()
        .signed_duration_since(*signed_at.as_datetime())
        .num_seconds();
    let max_age_seconds = max_age.as_secs();

    if age_seconds > max_age_seconds as i64 {
        return Err(FreshnessError::Expired {
            age_seconds,
            max_age_seconds,
        });
    }
    if -age_seconds > max_age_seconds as i64 {
        return Err(FreshnessError::FromFuture {
            skew_seconds: -age_seconds,
        });
    }

    Ok(())
}

// ============================================================================
// Private helpers
// ============================================================================

fn strip_scheme_prefix(header: &str) -> &str {
    match header.split_once('=') {
        Some((prefix, rest)) if SCHEME_PREFIXES.contains(&prefix.to_ascii_lowercase().as_str()) => {
            rest
        }
        _ => header,
    }
}

fn keyed_hash(algorithm: SignatureAlgorithm, key: &[u8], parts: &[&[u8]]) -> Option<Vec<u8>> {
    match algorithm {
        SignatureAlgorithm::HmacSha1 => {
            let mut mac = HmacSha1::new_from_slice(key).ok()?;
            for part in parts {
                mac.update(part);
            }
            Some(mac.finalize().into_bytes().to_vec())
        }
        SignatureAlgorithm::HmacSha256 => {
            let mut mac = HmacSha256::new_from_slice(key).ok()?;
            for part in parts {
                mac.update(part);
            }
            Some(mac.finalize().into_bytes().to_vec())
        }
    }
}

/// Hex decoding accepts either case, which makes the comparison case-insensitive.
fn verify_hex(algorithm: SignatureAlgorithm, key: &[u8], parts: &[&[u8]], provided: &str) -> bool {
    let Ok(provided_bytes) = hex::decode(provided) else {
        return false;
    };
    let Some(expected) = keyed_hash(algorithm, key, parts) else {
        return false;
    };
    expected.ct_eq(&provided_bytes).into()
}

#[cfg(test)]
#[path = "signature_tests.rs"]
mod tests;
