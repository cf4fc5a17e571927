//! Error taxonomy of the marketplace.
//!
//! Every failure a caller can observe is a [`MarketError`]. The variants are
//! grouped by where they originate ([`ErrorOrigin`]): rejected locally before
//! anything is sent, rejected by the ledger, or lost in transport. Callers
//! branch on the variant; only [`MarketError::AuthenticationFailed`] is a
//! security signal.

use crate::booking::BookingStatus;
use crate::types::{Address, BookingId, SpotId, Units};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Kind of ledger record an id refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// A parking spot
    Spot,
    /// A booking
    Booking,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spot => write!(f, "spot"),
            Self::Booking => write!(f, "booking"),
        }
    }
}

/// The mutating operations of the marketplace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Create a spot
    CreateSpot,
    /// Overwrite a spot's mutable fields
    UpdateSpot,
    /// Reserve a spot
    Reserve,
    /// Reveal the secret to start a stay
    CheckIn,
    /// Reveal the secret to end a stay and settle
    CheckOut,
    /// Cancel a reservation before check-in
    Cancel,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateSpot => "create spot",
            Self::UpdateSpot => "update spot",
            Self::Reserve => "reserve",
            Self::CheckIn => "check in",
            Self::CheckOut => "check out",
            Self::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

/// Where an error was produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorOrigin {
    /// Rejected before contacting the ledger
    Local,
    /// Rejected by the ledger's rules
    Ledger,
    /// The ledger could not be reached or answered incoherently
    Transport,
}

/// Every error the marketplace surfaces.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketError {
    /// The referenced spot or booking does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Kind of record
        kind: EntityKind,
        /// Ledger index that was looked up
        id: u64,
    },

    /// The caller is not the identity allowed to perform the operation.
    #[error("{caller} is not allowed to {operation}")]
    Unauthorized {
        /// Identity that attempted the operation
        caller: Address,
        /// Operation that was refused
        operation: Operation,
    },

    /// The booking's current status does not allow the operation.
    #[error("cannot {operation} {booking_id}: status is {status}")]
    InvalidState {
        /// Booking that was targeted
        booking_id: BookingId,
        /// Status at the time of the attempt
        status: BookingStatus,
        /// Operation that was refused
        operation: Operation,
    },

    /// The revealed secret does not hash to the spot's commitment.
    #[error("secret does not match the commitment for {booking_id}")]
    AuthenticationFailed {
        /// Booking whose check-in or check-out was refused
        booking_id: BookingId,
    },

    /// The value attached to a reservation differs from the required deposit.
    #[error("attached value {attached} does not equal required deposit {required}")]
    ValueMismatch {
        /// Deposit the ledger requires
        required: Units,
        /// Value that was attached
        attached: Units,
    },

    /// The spot is deactivated and cannot be reserved.
    #[error("{spot_id} is not active")]
    SpotInactive {
        /// Spot that was targeted
        spot_id: SpotId,
    },

    /// Requested stay length outside `1..=ceiling`.
    #[error("max hours {requested} outside 1..={ceiling}")]
    InvalidMaxHours {
        /// Requested hours
        requested: u32,
        /// Inclusive upper bound
        ceiling: u32,
    },

    /// A textual amount could not be turned into units.
    #[error("invalid amount {input:?}: {reason}")]
    InvalidAmount {
        /// The offending input
        input: String,
        /// Why it was rejected
        reason: String,
    },

    /// A textual identity could not be parsed.
    #[error("invalid address {input:?}")]
    InvalidAddress {
        /// The offending input
        input: String,
    },

    /// A textual commitment could not be parsed.
    #[error("invalid commitment {input:?}")]
    InvalidCommitment {
        /// The offending input
        input: String,
    },

    /// The scanned payload is not a well-formed secret payload.
    #[error("malformed payload: {reason}")]
    MalformedPayload {
        /// Why decoding failed
        reason: String,
    },

    /// No signing identity is available for a mutating call.
    #[error("no signing identity available")]
    MissingIdentity,

    /// The signer's identity differs from the caller the call was built for.
    #[error("signer {signer} does not match caller {caller}")]
    IdentityMismatch {
        /// Caller the call was prepared for
        caller: Address,
        /// Identity the signer actually holds
        signer: Address,
    },

    /// A settlement or deposit computation left the unit domain.
    #[error("arithmetic overflow computing {context}")]
    Overflow {
        /// What was being computed
        context: String,
    },

    /// Another attempt for the same action is still in flight.
    #[error("an attempt for {action} is already in progress")]
    SubmissionRejected {
        /// The action key that is busy
        action: String,
    },

    /// The signer declined or failed to sign.
    #[error("signature declined: {reason}")]
    SignatureDeclined {
        /// Reason reported by the signer
        reason: String,
    },

    /// The caller stopped waiting for the attempt.
    #[error("attempt abandoned while {phase}")]
    Abandoned {
        /// Phase the attempt was in
        phase: String,
    },

    /// The ledger rejected the call for a reason with no dedicated variant.
    #[error("ledger reverted: {reason}")]
    Reverted {
        /// Revert reason as reported
        reason: String,
    },

    /// A wait on the ledger exceeded its bound.
    #[error("timed out while {phase}")]
    Timeout {
        /// Phase that timed out
        phase: String,
    },

    /// The ledger could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    /// The ledger answered with data that breaks its own guarantees.
    #[error("ledger protocol violation: {0}")]
    ProtocolViolation(String),
}

impl MarketError {
    /// Shorthand for a missing spot
    #[must_use]
    pub const fn spot_not_found(id: SpotId) -> Self {
        Self::NotFound {
            kind: EntityKind::Spot,
            id: id.index(),
        }
    }

    /// Shorthand for a missing booking
    #[must_use]
    pub const fn booking_not_found(id: BookingId) -> Self {
        Self::NotFound {
            kind: EntityKind::Booking,
            id: id.index(),
        }
    }

    /// Shorthand for an overflow while computing `context`
    #[must_use]
    pub fn overflow(context: &str) -> Self {
        Self::Overflow {
            context: context.to_string(),
        }
    }

    /// Classifies where this error was produced.
    ///
    /// The domain rejections (`NotFound`, `Unauthorized`, `InvalidState`,
    /// `AuthenticationFailed`, `ValueMismatch`, `SpotInactive`) are the
    /// ledger's verdicts. The client pre-checks some of them, but the
    /// ledger is the authority that produces them.
    #[must_use]
    pub const fn origin(&self) -> ErrorOrigin {
        match self {
            Self::NotFound { .. }
            | Self::Unauthorized { .. }
            | Self::InvalidState { .. }
            | Self::AuthenticationFailed { .. }
            | Self::ValueMismatch { .. }
            | Self::SpotInactive { .. }
            | Self::Reverted { .. } => ErrorOrigin::Ledger,
            Self::InvalidMaxHours { .. }
            | Self::InvalidAmount { .. }
            | Self::InvalidAddress { .. }
            | Self::InvalidCommitment { .. }
            | Self::MalformedPayload { .. }
            | Self::MissingIdentity
            | Self::IdentityMismatch { .. }
            | Self::Overflow { .. }
            | Self::SubmissionRejected { .. }
            | Self::SignatureDeclined { .. }
            | Self::Abandoned { .. } => ErrorOrigin::Local,
            Self::Timeout { .. } | Self::Transport(_) | Self::ProtocolViolation(_) => {
                ErrorOrigin::Transport
            },
        }
    }

    /// True only for a failed reveal. Other failures are user-facing
    /// validation errors.
    #[must_use]
    pub const fn is_security_event(&self) -> bool {
        matches!(self, Self::AuthenticationFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_authentication_failure_is_security_event() {
        let auth = MarketError::AuthenticationFailed {
            booking_id: BookingId::new(0),
        };
        let unauthorized = MarketError::Unauthorized {
            caller: Address::ZERO,
            operation: Operation::CheckIn,
        };
        let state = MarketError::InvalidState {
            booking_id: BookingId::new(0),
            status: BookingStatus::Completed,
            operation: Operation::CheckIn,
        };

        assert!(auth.is_security_event());
        assert!(!unauthorized.is_security_event());
        assert!(!state.is_security_event());
        assert!(!MarketError::spot_not_found(SpotId::new(3)).is_security_event());
    }

    #[test]
    fn origins_are_classified() {
        assert_eq!(
            MarketError::MalformedPayload {
                reason: "x".into()
            }
            .origin(),
            ErrorOrigin::Local
        );
        assert_eq!(
            MarketError::InvalidMaxHours {
                requested: 0,
                ceiling: 72
            }
            .origin(),
            ErrorOrigin::Local
        );
        assert_eq!(
            MarketError::ValueMismatch {
                required: Units::new(2),
                attached: Units::new(1)
            }
            .origin(),
            ErrorOrigin::Ledger
        );
        assert_eq!(
            MarketError::Transport("connection refused".into()).origin(),
            ErrorOrigin::Transport
        );
    }

    #[test]
    fn messages_name_the_record() {
        let err = MarketError::booking_not_found(BookingId::new(7));
        assert_eq!(err.to_string(), "booking 7 not found");

        let err = MarketError::InvalidState {
            booking_id: BookingId::new(2),
            status: BookingStatus::Cancelled,
            operation: Operation::CheckOut,
        };
        assert_eq!(
            err.to_string(),
            "cannot check out booking #2: status is cancelled"
        );
    }
}
