//! Commit-reveal authentication of physical presence.
//!
//! The host commits `keccak256(secret)` to the ledger and prints the secret
//! on a credential at the spot. A renter proves presence by revealing the
//! secret; the reveal is accepted when it hashes to the commitment.
//!
//! The secret never enters ledger state before it is revealed.

use crate::error::MarketError;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

/// The pre-image of a commitment.
///
/// `Debug` is redacted so secrets do not leak into logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wraps a revealed secret string exactly as scanned.
    #[must_use]
    pub const fn new(value: String) -> Self {
        Self(value)
    }

    /// Generates a fresh secret: 256 random bits, base64url without padding
    /// (43 characters).
    #[must_use]
    pub fn generate() -> Self {
        use base64::Engine;
        use rand::RngCore;

        let mut rng = rand::thread_rng();
        let mut random_bytes = [0u8; 32];
        rng.fill_bytes(&mut random_bytes);
        Self(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes))
    }

    /// The secret text
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// `keccak256` of a secret's UTF-8 bytes, as stored in the ledger's
/// `bytes32` commitment field.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Commitment([u8; 32]);

impl Commitment {
    /// Computes the commitment to `secret`.
    #[must_use]
    pub fn of(secret: &Secret) -> Self {
        let digest = Keccak256::digest(secret.expose().as_bytes());
        Self(digest.into())
    }

    /// Creates a commitment from raw digest bytes (as read from the ledger)
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for Commitment {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MarketError::InvalidCommitment {
            input: s.to_string(),
        };
        let digits = s.strip_prefix("0x").ok_or_else(invalid)?;
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(digits, &mut bytes).map_err(|_| invalid())?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Commitment {
    type Error = MarketError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Commitment> for String {
    fn from(commitment: Commitment) -> Self {
        commitment.to_string()
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commitment({self})")
    }
}

/// Generates a secret and its commitment.
///
/// The secret goes on the physical credential; only the commitment is sent
/// to the ledger.
#[must_use]
pub fn commit() -> (Secret, Commitment) {
    let secret = Secret::generate();
    let commitment = Commitment::of(&secret);
    (secret, commitment)
}

/// Checks a revealed secret against a commitment.
///
/// Pure and free of side effects. The digest comparison is constant-time.
#[must_use]
pub fn verify(secret: &Secret, commitment: &Commitment) -> bool {
    let candidate = Commitment::of(secret);
    constant_time_eq::constant_time_eq(candidate.as_bytes(), commitment.as_bytes())
}
