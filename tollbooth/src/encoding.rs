//! Base64 helpers for the x402 wire format.
//!
//! Payment envelopes, 402 challenge headers, and settlement receipts all
//! travel as standard (non-URL) base64 of a JSON document.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Errors decoding a base64-encoded JSON document.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The input was not valid base64.
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    /// The decoded bytes were not the expected JSON shape.
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes a value as standard base64 of its JSON serialization.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized to JSON.
pub fn encode_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(b64.encode(serde_json::to_vec(value)?))
}

/// Decodes a standard-base64 JSON document into a typed value.
///
/// # Errors
///
/// Returns [`DecodeError`] if the input is not base64 or not the expected JSON.
pub fn decode_json<T: DeserializeOwned>(input: &str) -> Result<T, DecodeError> {
    let bytes = b64.decode(input.trim())?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Decodes standard base64 into raw bytes.
///
/// # Errors
///
/// Returns an error if the input is not valid base64.
pub fn decode_bytes(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    b64.decode(input.trim())
}

/// Encodes raw bytes as standard base64.
pub fn encode_bytes<T: AsRef<[u8]>>(input: T) -> String {
    b64.encode(input.as_ref())
}
