//! Webhook signature verification.

use crate::error::{PaymentError, Result, codes};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age, in seconds, of a signed Stripe timestamp.
pub const STRIPE_TOLERANCE_SECS: i64 = 300;

fn invalid_signature(message: &str) -> PaymentError {
    PaymentError::authentication(codes::INVALID_SIGNATURE, message)
}

fn hmac_sha256(secret: &str, parts: &[&[u8]]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| PaymentError::internal(codes::PROVIDER_CONFIG, "Invalid webhook secret"))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Parses a `Stripe-Signature` header: `t=<unix>,v1=<hex>[,v1=<hex>...]`.
/// Unknown schemes (`v0`) are ignored.
pub fn parse_stripe_header(header: &str) -> Result<(i64, Vec<String>)> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" if !value.is_empty() => signatures.push(value.to_string()),
            _ => {}
        }
    }

    match timestamp {
        Some(t) if !signatures.is_empty() => Ok((t, signatures)),
        _ => Err(invalid_signature("Invalid signature header format")),
    }
}

/// Hex HMAC-SHA256 of `"<timestamp>.<payload>"`.
pub fn stripe_signature(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String> {
    let prefix = format!("{timestamp}.");
    Ok(hex::encode(hmac_sha256(secret, &[prefix.as_bytes(), payload])?))
}

/// Verifies a Stripe webhook against `now` (Unix seconds), rejecting
/// timestamps further than `tolerance_secs` away.
pub fn verify_stripe_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<()> {
    let (timestamp, candidates) = parse_stripe_header(header)?;

    if now.abs_diff(timestamp) > tolerance_secs.unsigned_abs() {
        return Err(invalid_signature("Timestamp outside tolerance window"));
    }

    let expected = stripe_signature(secret, timestamp, payload)?;
    let matched = candidates
        .iter()
        .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));

    if matched {
        Ok(())
    } else {
        Err(invalid_signature("Webhook signature mismatch"))
    }
}

/// Base64 HMAC-SHA256 of the raw payload.
pub fn paypal_signature(secret: &str, payload: &[u8]) -> Result<String> {
    Ok(BASE64.encode(hmac_sha256(secret, &[payload])?))
}

pub fn verify_paypal_signature(payload: &[u8], signature: &str, secret: &str) -> Result<()> {
    let expected = paypal_signature(secret, payload)?;
    if bool::from(expected.as_bytes().ct_eq(signature.trim().as_bytes())) {
        Ok(())
    } else {
        Err(invalid_signature("Webhook signature mismatch"))
    }
}
