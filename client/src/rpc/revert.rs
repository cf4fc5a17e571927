//! Typed errors for ledger reverts.
//!
//! A revert carries at most a free-form reason string. The state that
//! rejected the call is re-read after the fact and the same rule is run
//! locally, which recovers the error the ledger enforced.

use chrono::{DateTime, Utc};
use parkmarket_core::{
    Booking, BookingId, BookingPolicy, Caller, FeeSchedule, LedgerCall, MarketError, Spot,
};

/// Ledger state read back after a revert.
#[derive(Clone, Debug)]
pub(super) struct Observed {
    pub spot: Option<Spot>,
    pub booking: Option<Booking>,
    pub fees: Option<FeeSchedule>,
    pub now: DateTime<Utc>,
}

/// Replays `call` against `observed` and returns the rule it breaks.
///
/// `None` if the call would pass on the observed state, or if the state
/// needed to tell is missing.
pub(super) fn replay(
    caller: &Caller,
    call: &LedgerCall,
    observed: &Observed,
    policy: &BookingPolicy,
) -> Option<MarketError> {
    match call {
        LedgerCall::CreateSpot { .. } => None,
        LedgerCall::UpdateSpot { spot_id, update } => match observed.spot.clone() {
            Some(mut spot) => spot.apply_update(caller, update.clone()).err(),
            None => Some(MarketError::spot_not_found(*spot_id)),
        },
        LedgerCall::BookSpot {
            spot_id,
            max_hours,
            deposit,
        } => match &observed.spot {
            Some(spot) => {
                Booking::reserve(BookingId::new(0), spot, caller, *max_hours, *deposit, policy)
                    .err()
            },
            None => Some(MarketError::spot_not_found(*spot_id)),
        },
        LedgerCall::CheckIn { booking_id, secret } => {
            let mut booking = match observed.booking.clone() {
                Some(booking) => booking,
                None => return Some(MarketError::booking_not_found(*booking_id)),
            };
            let commitment = observed.spot.as_ref()?.commitment;
            booking
                .check_in(caller, secret, &commitment, observed.now)
                .err()
        },
        LedgerCall::CheckOut { booking_id, secret } => {
            let mut booking = match observed.booking.clone() {
                Some(booking) => booking,
                None => return Some(MarketError::booking_not_found(*booking_id)),
            };
            let commitment = observed.spot.as_ref()?.commitment;
            let fees = observed.fees.as_ref()?;
            booking
                .check_out(caller, secret, &commitment, observed.now, fees, policy)
                .err()
        },
        LedgerCall::CancelBeforeCheckIn { booking_id } => match observed.booking.clone() {
            Some(mut booking) => booking.cancel(caller).err(),
            None => Some(MarketError::booking_not_found(*booking_id)),
        },
    }
}
