//! Verification of the `Stripe-Signature` webhook header.
//!
//! The header looks like `t=1700000000,v1=<hex>,v1=<hex>`; each `v1` value is
//! `hex(HMAC_SHA256(secret, "<t>.<raw body>"))`. Any matching `v1` entry is accepted.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header has no timestamp")]
    MissingTimestamp,
    #[error("signature header has no v1 signature")]
    MissingSignature,
    #[error("signature timestamp is outside the tolerance window")]
    TimestampOutOfTolerance,
    #[error("no signature matches the payload")]
    Mismatch,
}

#[derive(Debug, PartialEq, Eq)]
pub struct SignatureHeader<'a> {
    pub timestamp: i64,
    pub signatures: Vec<&'a str>,
}

pub fn parse_header(header: &str) -> Result<SignatureHeader<'_>, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" if !value.is_empty() => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::MissingTimestamp)?;
    if signatures.is_empty() {
        return Err(SignatureError::MissingSignature);
    }
    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

pub fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Builds a header value the way the provider would sign `payload`.
pub fn sign_header(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    format!(
        "t={},v1={}",
        timestamp,
        compute_signature(secret, timestamp, payload)
    )
}

pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now_unix: i64,
) -> Result<(), SignatureError> {
    let parsed = parse_header(header)?;
    if now_unix.abs_diff(parsed.timestamp) > tolerance_secs.max(0) as u64 {
        return Err(SignatureError::TimestampOutOfTolerance);
    }

    let expected = compute_signature(secret, parsed.timestamp, payload);
    let matched = parsed
        .signatures
        .iter()
        .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));
    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test123secret456";
    const NOW: i64 = 1_760_000_000;

    #[test]
    fn accepts_valid_signature() {
        let payload = br#"{"id":"evt_1","type":"checkout.session.completed"}"#;
        let header = sign_header(SECRET, NOW, payload);
        assert_eq!(verify_signature(payload, &header, SECRET, 300, NOW), Ok(()));
    }

    #[test]
    fn rejects_tampered_body() {
        let payload = br#"{"id":"evt_1","amount":100}"#;
        let header = sign_header(SECRET, NOW, payload);
        let tampered = br#"{"id":"evt_1","amount":900}"#;
        assert_eq!(
            verify_signature(tampered, &header, SECRET, 300, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_wrong_secret() {
        let payload = b"{}";
        let header = sign_header("whsec_other", NOW, payload);
        assert_eq!(
            verify_signature(payload, &header, SECRET, 300, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_stale_timestamp() {
        let payload = b"{}";
        let header = sign_header(SECRET, NOW - 600, payload);
        assert_eq!(
            verify_signature(payload, &header, SECRET, 300, NOW),
            Err(SignatureError::TimestampOutOfTolerance)
        );
    }

    #[test]
    fn accepts_any_matching_v1_entry() {
        let payload = b"{}";
        let good = compute_signature(SECRET, NOW, payload);
        let header = format!("t={NOW},v1=deadbeef,v0=ignored,v1={good}");
        assert_eq!(verify_signature(payload, &header, SECRET, 300, NOW), Ok(()));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        assert_eq!(
            parse_header("v1=abc").unwrap_err(),
            SignatureError::MissingTimestamp
        );
        assert_eq!(
            parse_header("t=12").unwrap_err(),
            SignatureError::MissingSignature
        );
        assert_eq!(
            parse_header("garbage").unwrap_err(),
            SignatureError::MissingTimestamp
        );
        for header in [
            "t=-9223372036854775808,v1=00",
            "t=9223372036854775807,v1=00",
        ] {
            assert_eq!(
                verify_signature(b"{}", header, SECRET, 300, NOW),
                Err(SignatureError::TimestampOutOfTolerance)
            );
        }
    }
}
