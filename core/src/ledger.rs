//! Boundary of the external ledger.
//!
//! The ledger is the authority on spot and booking state. It is reached
//! through two traits: [`LedgerReader`] for point reads and counts, and
//! [`LedgerWriter`] for the two-phase mutation protocol (obtain a signed
//! submission, then wait for its confirmation).
//!
//! # Dyn Compatibility
//!
//! Both traits return `Pin<Box<dyn Future>>` instead of using `async fn` so
//! they can be shared as `Arc<dyn Ledger>` inside effects.

use crate::booking::Booking;
use crate::commitment::{Commitment, Secret};
use crate::error::{MarketError, Operation};
use crate::settlement::FeeSchedule;
use crate::spot::{Spot, SpotUpdate};
use crate::types::{Address, BookingId, Caller, SpotId, Units};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use tokio::sync::broadcast;

/// Boxed future returned by ledger operations.
pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, MarketError>> + Send + 'a>>;

/// Read side of the ledger.
///
/// Reads are independent: any of them may fail on its own without
/// affecting the others.
pub trait LedgerReader: Send + Sync {
    /// Number of spots ever created. Indices `0..count` are valid.
    fn spots_count(&self) -> LedgerFuture<'_, u64>;

    /// Reads one spot; `None` if the index was never assigned.
    fn spot(&self, id: SpotId) -> LedgerFuture<'_, Option<Spot>>;

    /// Number of bookings ever created.
    fn bookings_count(&self) -> LedgerFuture<'_, u64>;

    /// Reads one booking; `None` if the index was never assigned.
    fn booking(&self, id: BookingId) -> LedgerFuture<'_, Option<Booking>>;

    /// Current platform fee configuration.
    fn fee_schedule(&self) -> LedgerFuture<'_, FeeSchedule>;

    /// Change notifications, if the ledger pushes them.
    ///
    /// Notifications only say that something changed; consumers reload
    /// explicitly.
    fn subscribe_events(&self) -> Option<broadcast::Receiver<LedgerEvent>> {
        None
    }
}

/// Write side of the ledger.
pub trait LedgerWriter: Send + Sync {
    /// Signature phase: has `caller` sign `call` and hands it to the ledger.
    ///
    /// Resolves once the submission is accepted for inclusion; the call may
    /// still be rejected at confirmation.
    fn submit(&self, caller: Caller, call: LedgerCall) -> LedgerFuture<'_, TxHash>;

    /// Confirmation phase: waits for the ledger's verdict on a submission.
    ///
    /// Resolves with the receipt of a successful call, or with the error the
    /// ledger rejected it with.
    fn confirm(&self, tx: TxHash) -> LedgerFuture<'_, Receipt>;
}

/// A full ledger connection.
pub trait Ledger: LedgerReader + LedgerWriter {}

impl<T: LedgerReader + LedgerWriter + ?Sized> Ledger for T {}

/// A mutating call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerCall {
    /// `createSpot(rate, commitment)`
    CreateSpot {
        /// Hourly rate
        rate_per_hour: Units,
        /// Commitment to the spot's secret
        commitment: Commitment,
    },
    /// `updateSpot(id, rate, active, commitment)`, overwriting all three
    UpdateSpot {
        /// Target spot
        spot_id: SpotId,
        /// New values
        update: SpotUpdate,
    },
    /// `bookSpot(id, max_hours)` with the deposit attached
    BookSpot {
        /// Target spot
        spot_id: SpotId,
        /// Requested hours
        max_hours: u32,
        /// Value attached to the call
        deposit: Units,
    },
    /// `checkIn(booking, secret)`
    CheckIn {
        /// Target booking
        booking_id: BookingId,
        /// Revealed secret
        secret: Secret,
    },
    /// `checkOut(booking, secret)`
    CheckOut {
        /// Target booking
        booking_id: BookingId,
        /// Revealed secret
        secret: Secret,
    },
    /// `cancelBeforeCheckIn(booking)`
    CancelBeforeCheckIn {
        /// Target booking
        booking_id: BookingId,
    },
}

impl LedgerCall {
    /// Value transferred with the call
    #[must_use]
    pub const fn attached_value(&self) -> Units {
        match self {
            Self::BookSpot { deposit, .. } => *deposit,
            _ => Units::ZERO,
        }
    }

    /// Ledger function name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CreateSpot { .. } => "createSpot",
            Self::UpdateSpot { .. } => "updateSpot",
            Self::BookSpot { .. } => "bookSpot",
            Self::CheckIn { .. } => "checkIn",
            Self::CheckOut { .. } => "checkOut",
            Self::CancelBeforeCheckIn { .. } => "cancelBeforeCheckIn",
        }
    }

    /// The marketplace operation this call performs
    #[must_use]
    pub const fn operation(&self) -> Operation {
        match self {
            Self::CreateSpot { .. } => Operation::CreateSpot,
            Self::UpdateSpot { .. } => Operation::UpdateSpot,
            Self::BookSpot { .. } => Operation::Reserve,
            Self::CheckIn { .. } => Operation::CheckIn,
            Self::CheckOut { .. } => Operation::CheckOut,
            Self::CancelBeforeCheckIn { .. } => Operation::Cancel,
        }
    }
}

/// Identifier of a submitted call.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TxHash([u8; 32]);

impl TxHash {
    /// Creates a hash from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for TxHash {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MarketError::ProtocolViolation(format!("invalid transaction hash {s:?}"));
        let digits = s.strip_prefix("0x").ok_or_else(invalid)?;
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(digits, &mut bytes).map_err(|_| invalid())?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for TxHash {
    type Error = MarketError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TxHash> for String {
    fn from(hash: TxHash) -> Self {
        hash.to_string()
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({self})")
    }
}

/// Events the ledger emits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    /// A spot was created
    SpotCreated {
        /// New spot
        spot_id: SpotId,
        /// Its owner
        owner: Address,
        /// Its rate
        rate_per_hour: Units,
    },
    /// A spot was overwritten
    SpotUpdated {
        /// Updated spot
        spot_id: SpotId,
        /// New rate
        rate_per_hour: Units,
        /// New active flag
        active: bool,
    },
    /// A booking was created
    BookingCreated {
        /// New booking
        booking_id: BookingId,
        /// Reserved spot
        spot_id: SpotId,
        /// Renter
        renter: Address,
        /// Escrowed deposit
        deposit: Units,
        /// Requested hours
        max_hours: u32,
    },
    /// A renter checked in
    CheckedIn {
        /// Booking
        booking_id: BookingId,
        /// Ledger time of the check-in
        at: DateTime<Utc>,
    },
    /// A renter checked out and the deposit was split
    CheckedOut {
        /// Booking
        booking_id: BookingId,
        /// Ledger time of the check-out
        at: DateTime<Utc>,
        /// Charged amount
        cost: Units,
        /// Amount paid to the spot owner
        host_paid: Units,
        /// Amount returned to the renter
        refund: Units,
    },
    /// The ledger's administrator started a handover
    OwnershipTransferStarted {
        /// Current administrator
        previous_owner: Address,
        /// Proposed administrator
        new_owner: Address,
    },
    /// The ledger's administrator changed
    OwnershipTransferred {
        /// Former administrator
        previous_owner: Address,
        /// New administrator
        new_owner: Address,
    },
}

/// Amounts moved by a confirmed check-out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutAmounts {
    /// Charged amount
    pub cost: Units,
    /// Paid to the spot owner
    pub host_paid: Units,
    /// Returned to the renter
    pub refund: Units,
}

/// Proof that a call was confirmed, with the events it produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// The confirmed submission
    pub tx_hash: TxHash,
    /// Events in emission order
    pub events: Vec<LedgerEvent>,
}

impl Receipt {
    /// Id of the spot created by this call
    #[must_use]
    pub fn created_spot_id(&self) -> Option<SpotId> {
        self.events.iter().find_map(|e| match e {
            LedgerEvent::SpotCreated { spot_id, .. } => Some(*spot_id),
            _ => None,
        })
    }

    /// Id of the booking created by this call
    #[must_use]
    pub fn created_booking_id(&self) -> Option<BookingId> {
        self.events.iter().find_map(|e| match e {
            LedgerEvent::BookingCreated { booking_id, .. } => Some(*booking_id),
            _ => None,
        })
    }

    /// Amounts settled by a check-out in this call
    #[must_use]
    pub fn checkout(&self) -> Option<CheckoutAmounts> {
        self.events.iter().find_map(|e| match e {
            LedgerEvent::CheckedOut {
                cost,
                host_paid,
                refund,
                ..
            } => Some(CheckoutAmounts {
                cost: *cost,
                host_paid: *host_paid,
                refund: *refund,
            }),
            _ => None,
        })
    }
}
