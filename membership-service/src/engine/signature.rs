//! Signed webhook deliveries.
//!
//! The processor signs each delivery with `t=<unix seconds>,v1=<hex>` where the
//! hex digest is HMAC-SHA256 over `"{t}.{body}"`. A header may carry several
//! `v1` entries while the endpoint secret is being rolled.

use crate::error::MembershipError;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "billing-signature";

struct SignatureHeader<'a> {
    timestamp: i64,
    signatures: Vec<&'a str>,
}

fn parse_header(header: &str) -> Result<SignatureHeader<'_>, MembershipError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(value.parse::<i64>().map_err(|_| {
                    MembershipError::InvalidSignature("timestamp is not a number".to_string())
                })?)
            }
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    match timestamp {
        Some(timestamp) if !signatures.is_empty() => Ok(SignatureHeader {
            timestamp,
            signatures,
        }),
        _ => Err(MembershipError::InvalidSignature(
            "malformed signature header".to_string(),
        )),
    }
}

fn mac_for(secret: &str, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, MembershipError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| MembershipError::InvalidSignature("invalid signing secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Check `header` against `payload`, rejecting deliveries older or newer than
/// `tolerance_secs` relative to `now`.
pub fn verify_signature(
    header: &str,
    payload: &[u8],
    secret: &str,
    tolerance_secs: i64,
    now: DateTime<Utc>,
) -> Result<(), MembershipError> {
    if secret.is_empty() {
        return Err(MembershipError::InvalidSignature(
            "webhook secret not configured".to_string(),
        ));
    }

    let parsed = parse_header(header)?;

    let skew = now
        .timestamp()
        .checked_sub(parsed.timestamp)
        .map(i64::unsigned_abs);
    let within_tolerance = matches!(
        (skew, u64::try_from(tolerance_secs)),
        (Some(skew), Ok(tolerance)) if skew <= tolerance
    );
    if !within_tolerance {
        return Err(MembershipError::InvalidSignature(
            "timestamp outside tolerance window".to_string(),
        ));
    }

    let mac = mac_for(secret, parsed.timestamp, payload)?;
    let matched = parsed.signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });

    if matched {
        Ok(())
    } else {
        Err(MembershipError::InvalidSignature(
            "no matching signature".to_string(),
        ))
    }
}

/// Build a signature header for `payload`. Used by tests and replay tooling.
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> Result<String, MembershipError> {
    let digest = mac_for(secret, timestamp, payload)?.finalize().into_bytes();
    Ok(format!("t={},v1={}", timestamp, hex::encode(digest)))
}
