//! Transport encoding for invite tokens.
//!
//! A token is the JSON [`InviteToken`] wrapped in URL-safe base64 so it can
//! be pasted into chat or email without escaping.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use beacon_types::{InviteToken, INVITE_TOKEN_TYPE};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid invite token: {0}")]
    InvalidFormat(String),
}

/// Encodes a token for out-of-band transport.
pub fn encode_invite_token(token: &InviteToken) -> Result<String, TokenError> {
    let json = serde_json::to_vec(token)
        .map_err(|e| TokenError::InvalidFormat(format!("cannot serialize token: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Decodes and validates a transported token.
///
/// Surrounding whitespace and trailing `=` padding are tolerated since
/// operators copy tokens by hand.
///
/// # Errors
///
/// Returns [`TokenError::InvalidFormat`] for bad base64, bad JSON, a wrong
/// `type` tag, or an empty required field.
pub fn decode_invite_token(encoded: &str) -> Result<InviteToken, TokenError> {
    let trimmed = encoded.trim().trim_end_matches('=');
    if trimmed.is_empty() {
        return Err(TokenError::InvalidFormat("empty token".to_string()));
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|e| TokenError::InvalidFormat(format!("invalid base64: {e}")))?;
    let token: InviteToken = serde_json::from_slice(&bytes)
        .map_err(|e| TokenError::InvalidFormat(format!("invalid JSON: {e}")))?;

    if token.token_type != INVITE_TOKEN_TYPE {
        return Err(TokenError::InvalidFormat(format!(
            "unexpected token type {:?}",
            token.token_type
        )));
    }
    for (field, value) in [
        ("invite_id", &token.invite_id),
        ("secret", &token.secret),
        ("origin_domain", &token.origin_domain),
        ("origin_fingerprint", &token.origin_fingerprint),
        ("mesh_url", &token.mesh_url),
    ] {
        if value.trim().is_empty() {
            return Err(TokenError::InvalidFormat(format!("missing {field}")));
        }
    }
    if !token.mesh_url.starts_with("http://") && !token.mesh_url.starts_with("https://") {
        return Err(TokenError::InvalidFormat("mesh_url must be http(s)".to_string()));
    }
    Ok(token)
}
