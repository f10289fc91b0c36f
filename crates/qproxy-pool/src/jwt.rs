use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Reads the `exp` claim (unix seconds) out of a JWT without verifying it.
/// Tokens that are not JWTs, or carry no `exp`, yield `None` and are treated
/// as non-expiring.
pub fn token_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    claims.get("exp")?.as_i64()
}
