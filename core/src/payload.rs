//! The scannable out-of-band payload that carries a secret.
//!
//! The credential at a spot encodes `{"secret":"<value>"}`. Decoding happens
//! entirely on the client: a payload that does not decode is rejected
//! locally and never reaches the ledger.

use crate::commitment::Secret;
use crate::error::MarketError;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct SecretPayload {
    secret: serde_json::Value,
}

/// Encodes a secret into the payload string printed on the credential.
///
/// # Errors
///
/// Returns [`MarketError::MalformedPayload`] if serialization fails.
pub fn encode(secret: &Secret) -> Result<String, MarketError> {
    let payload = SecretPayload {
        secret: serde_json::Value::String(secret.expose().to_string()),
    };
    serde_json::to_string(&payload).map_err(|e| MarketError::MalformedPayload {
        reason: e.to_string(),
    })
}

/// Decodes a scanned payload into the secret it carries.
///
/// # Errors
///
/// Returns [`MarketError::MalformedPayload`] when the input is not JSON, has
/// no `secret` field, the field is not a string, or the string is empty.
pub fn decode(raw: &str) -> Result<Secret, MarketError> {
    let payload: SecretPayload =
        serde_json::from_str(raw).map_err(|e| MarketError::MalformedPayload {
            reason: e.to_string(),
        })?;

    match payload.secret {
        serde_json::Value::String(s) if !s.is_empty() => Ok(Secret::new(s)),
        serde_json::Value::String(_) => Err(MarketError::MalformedPayload {
            reason: "secret is empty".to_string(),
        }),
        _ => Err(MarketError::MalformedPayload {
            reason: "secret is not a string".to_string(),
        }),
    }
}
