//! Signature verification for the four supported webhook schemes.

use crate::error::{Error, Result};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Result of a successful verification: the extracted idempotency key and
/// the signed timestamp, if the scheme carries one.
#[derive(Debug, Clone)]
pub struct VerifiedHeader {
    pub timestamp: Option<i64>,
}

/// Compare two byte strings in constant time by first hashing both sides,
/// matching the teacher's auth-check pattern so timing leaks nothing about
/// either the length or content of the secret comparison.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let hash_a = Sha256::digest(a);
    let hash_b = Sha256::digest(b);
    hash_a.ct_eq(&hash_b).into()
}

fn hmac_hex(key: &[u8], message: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::MalformedHeader(format!("invalid key length: {e}")))?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Stripe-like scheme: header is `t=<seconds>,v1=<hex hmac>`, signed message
/// is `"{t}.{body}"`.
pub fn verify_payments(secret: &str, header: &str, body: &[u8]) -> Result<VerifiedHeader> {
    let mut timestamp: Option<i64> = None;
    let mut v1: Option<&str> = None;

    for part in header.split(',') {
        let mut kv = part.splitn(2, '=');
        let key = kv.next().unwrap_or("");
        let value = kv.next();
        match key {
            "t" => {
                timestamp = value.and_then(|v| v.parse::<i64>().ok());
            }
            "v1" => v1 = value,
            _ => {}
        }
    }

    let timestamp =
        timestamp.ok_or_else(|| Error::MalformedHeader("missing t= field".to_string()))?;
    let v1 = v1.ok_or_else(|| Error::MalformedHeader("missing v1= field".to_string()))?;

    let mut signed_payload = timestamp.to_string().into_bytes();
    signed_payload.push(b'.');
    signed_payload.extend_from_slice(body);

    let expected = hmac_hex(secret.as_bytes(), &signed_payload)?;
    if !constant_time_eq(expected.as_bytes(), v1.as_bytes()) {
        return Err(Error::InvalidSignature);
    }

    Ok(VerifiedHeader {
        timestamp: Some(timestamp),
    })
}

/// WorkOS-like scheme: identical framing to [`verify_payments`] but the
/// timestamp is carried in milliseconds rather than seconds.
pub fn verify_identity(secret: &str, header: &str, body: &[u8]) -> Result<VerifiedHeader> {
    let mut timestamp_ms: Option<i64> = None;
    let mut v1: Option<&str> = None;

    for part in header.split(',') {
        let mut kv = part.splitn(2, '=');
        let key = kv.next().unwrap_or("");
        let value = kv.next();
        match key {
            "t" => {
                timestamp_ms = value.and_then(|v| v.parse::<i64>().ok());
            }
            "v1" => v1 = value,
            _ => {}
        }
    }

    let timestamp_ms =
        timestamp_ms.ok_or_else(|| Error::MalformedHeader("missing t= field".to_string()))?;
    let v1 = v1.ok_or_else(|| Error::MalformedHeader("missing v1= field".to_string()))?;

    let mut signed_payload = timestamp_ms.to_string().into_bytes();
    signed_payload.push(b'.');
    signed_payload.extend_from_slice(body);

    let expected = hmac_hex(secret.as_bytes(), &signed_payload)?;
    if !constant_time_eq(expected.as_bytes(), v1.as_bytes()) {
        return Err(Error::InvalidSignature);
    }

    Ok(VerifiedHeader {
        timestamp: Some(timestamp_ms / 1000),
    })
}

/// GitHub-like scheme: header is `sha256=<hex hmac>` over the raw body, with
/// no timestamp carried in the signature itself (replay tolerance for this
/// provider is enforced against `received_at` instead).
pub fn verify_source_control(secret: &str, header: &str, body: &[u8]) -> Result<VerifiedHeader> {
    let hex_sig = header
        .strip_prefix("sha256=")
        .ok_or_else(|| Error::MalformedHeader("missing sha256= prefix".to_string()))?;

    let expected = hmac_hex(secret.as_bytes(), body)?;
    if !constant_time_eq(expected.as_bytes(), hex_sig.as_bytes()) {
        return Err(Error::InvalidSignature);
    }

    Ok(VerifiedHeader { timestamp: None })
}

/// Svix-like scheme: three headers (`svix-id`, `svix-timestamp`,
/// `svix-signature`), signed message is `"{id}.{timestamp}.{body}"`. The
/// signature header may carry multiple space-separated `v1,<base64>` values
/// from key rotation; any one matching is sufficient.
pub fn verify_email(
    secret: &str,
    svix_id: &str,
    svix_timestamp: &str,
    svix_signature: &str,
    body: &[u8],
) -> Result<VerifiedHeader> {
    let timestamp: i64 = svix_timestamp
        .parse()
        .map_err(|_| Error::MalformedHeader("svix-timestamp not an integer".to_string()))?;

    let mut signed_payload = format!("{svix_id}.{svix_timestamp}.").into_bytes();
    signed_payload.extend_from_slice(body);

    let key = secret
        .strip_prefix("whsec_")
        .unwrap_or(secret)
        .as_bytes()
        .to_vec();
    let key = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &key)
        .unwrap_or(key);

    let expected = {
        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| Error::MalformedHeader(format!("invalid key length: {e}")))?;
        mac.update(&signed_payload);
        base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            mac.finalize().into_bytes(),
        )
    };

    for candidate in svix_signature.split_whitespace() {
        let Some((version, sig)) = candidate.split_once(',') else {
            continue;
        };
        if version != "v1" {
            continue;
        }
        if constant_time_eq(expected.as_bytes(), sig.as_bytes()) {
            return Ok(VerifiedHeader {
                timestamp: Some(timestamp),
            });
        }
    }

    Err(Error::InvalidSignature)
}

/// Check a verified timestamp against the replay tolerance window. `now` and
/// `timestamp` are both unix seconds.
pub fn check_replay_tolerance(timestamp: i64, now: i64, tolerance_ms: i64) -> Result<()> {
    let tolerance_s = tolerance_ms / 1000;
    let delta = (now - timestamp).abs();
    if delta > tolerance_s {
        return Err(Error::ReplayTooOld);
    }
    Ok(())
}
