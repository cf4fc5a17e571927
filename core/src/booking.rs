//! The booking state machine.
//!
//! ```text
//! Reserved ──check_in──▶ CheckedIn ──check_out──▶ Completed
//!     │
//!     └──cancel──▶ Cancelled
//! ```
//!
//! Transitions are one-way; `Completed` and `Cancelled` reject everything.
//! Each operation checks, in order: caller identity, current status, then
//! the revealed secret. A failed operation leaves the booking unchanged.

use crate::commitment::{self, Commitment, Secret};
use crate::error::{MarketError, Operation};
use crate::settlement::{FeeSchedule, Settlement};
use crate::spot::Spot;
use crate::types::{Address, BookingId, Caller, SpotId, Units};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Booking status, with the ledger's numeric encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BookingStatus {
    /// Deposit escrowed, renter not yet present
    Reserved,
    /// Renter revealed the secret at arrival
    CheckedIn,
    /// Renter revealed the secret at departure and the deposit was split
    Completed,
    /// Reservation withdrawn before arrival, deposit refunded
    Cancelled,
}

impl BookingStatus {
    /// Decodes the ledger's `uint8` status.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Reserved),
            1 => Some(Self::CheckedIn),
            2 => Some(Self::Completed),
            3 => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// The ledger's `uint8` encoding
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Reserved => 0,
            Self::CheckedIn => 1,
            Self::Completed => 2,
            Self::Cancelled => 3,
        }
    }

    /// Whether no further transition is possible
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Which operation a scanned secret should drive in this status.
    #[must_use]
    pub const fn next_scan_action(self) -> Option<ScanAction> {
        match self {
            Self::Reserved => Some(ScanAction::CheckIn),
            Self::CheckedIn => Some(ScanAction::CheckOut),
            Self::Completed | Self::Cancelled => None,
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reserved => "reserved",
            Self::CheckedIn => "checked in",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What a scanned credential means for a booking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanAction {
    /// Start the stay
    CheckIn,
    /// End the stay and settle
    CheckOut,
}

/// Reservation and billing rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingPolicy {
    /// Inclusive upper bound on `max_hours`
    pub max_hours_ceiling: u32,
    /// Length of a billing hour in seconds
    pub hour_seconds: i64,
    /// Hours charged for a stay shorter than that
    pub minimum_billable_hours: u32,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            max_hours_ceiling: 72,
            hour_seconds: 3_600,
            minimum_billable_hours: 1,
        }
    }
}

impl BookingPolicy {
    /// Checks `1 <= max_hours <= ceiling`.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::InvalidMaxHours`] when out of range.
    pub const fn check_max_hours(&self, max_hours: u32) -> Result<(), MarketError> {
        if max_hours == 0 || max_hours > self.max_hours_ceiling {
            return Err(MarketError::InvalidMaxHours {
                requested: max_hours,
                ceiling: self.max_hours_ceiling,
            });
        }
        Ok(())
    }

    /// Started hours between two instants; zero if `to` is not after `from`.
    #[must_use]
    pub fn elapsed_hours(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
        let seconds = u64::try_from((to - from).num_seconds()).unwrap_or(0);
        let hour = u64::try_from(self.hour_seconds.max(1)).unwrap_or(1);
        seconds.div_ceil(hour)
    }

    /// `rate * max_hours`, the exact value a reservation must attach.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::InvalidMaxHours`] or [`MarketError::Overflow`].
    pub fn required_deposit(&self, rate_per_hour: Units, max_hours: u32) -> Result<Units, MarketError> {
        self.check_max_hours(max_hours)?;
        rate_per_hour
            .checked_mul_hours(max_hours)
            .ok_or_else(|| MarketError::overflow("deposit"))
    }
}

/// A reservation of a spot by a renter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    /// Ledger index, the booking's permanent identity
    pub id: BookingId,
    /// Reserved spot
    pub spot_id: SpotId,
    /// Identity that reserved and pays
    pub renter: Address,
    /// Escrowed amount, `rate_per_hour * max_hours`
    pub deposit: Units,
    /// Spot rate at reservation time
    pub rate_per_hour: Units,
    /// Upper bound on billed hours
    pub max_hours: u32,
    /// Set by a successful check-in
    pub checked_in_at: Option<DateTime<Utc>>,
    /// Set by a successful check-out
    pub checked_out_at: Option<DateTime<Utc>>,
    /// Current status
    pub status: BookingStatus,
}

impl Booking {
    /// Validates a reservation and builds the new booking.
    ///
    /// # Errors
    ///
    /// - [`MarketError::SpotInactive`] if the spot is deactivated
    /// - [`MarketError::InvalidMaxHours`] if `max_hours` is out of range
    /// - [`MarketError::Overflow`] if the deposit cannot be represented
    /// - [`MarketError::ValueMismatch`] if `attached` is not the deposit
    pub fn reserve(
        id: BookingId,
        spot: &Spot,
        caller: &Caller,
        max_hours: u32,
        attached: Units,
        policy: &BookingPolicy,
    ) -> Result<Self, MarketError> {
        if !spot.active {
            return Err(MarketError::SpotInactive { spot_id: spot.id });
        }
        let deposit = policy.required_deposit(spot.rate_per_hour, max_hours)?;
        if attached != deposit {
            return Err(MarketError::ValueMismatch {
                required: deposit,
                attached,
            });
        }

        Ok(Self {
            id,
            spot_id: spot.id,
            renter: caller.identity,
            deposit,
            rate_per_hour: spot.rate_per_hour,
            max_hours,
            checked_in_at: None,
            checked_out_at: None,
            status: BookingStatus::Reserved,
        })
    }

    /// Withdraws a reservation before check-in.
    ///
    /// # Errors
    ///
    /// [`MarketError::Unauthorized`] for anyone but the renter,
    /// [`MarketError::InvalidState`] unless `Reserved`.
    pub fn cancel(&mut self, caller: &Caller) -> Result<Settlement, MarketError> {
        self.authorize(caller, Operation::Cancel)?;
        self.require(BookingStatus::Reserved, Operation::Cancel)?;
        self.status = BookingStatus::Cancelled;
        Ok(Settlement::cancellation(self.deposit))
    }

    /// Starts the stay by revealing the spot's secret.
    ///
    /// # Errors
    ///
    /// [`MarketError::Unauthorized`], [`MarketError::InvalidState`] unless
    /// `Reserved`, then [`MarketError::AuthenticationFailed`] if the secret
    /// does not match `commitment`.
    pub fn check_in(
        &mut self,
        caller: &Caller,
        secret: &Secret,
        commitment: &Commitment,
        now: DateTime<Utc>,
    ) -> Result<(), MarketError> {
        self.authorize(caller, Operation::CheckIn)?;
        self.require(BookingStatus::Reserved, Operation::CheckIn)?;
        self.authenticate(secret, commitment)?;
        self.checked_in_at = Some(now);
        self.status = BookingStatus::CheckedIn;
        Ok(())
    }

    /// Ends the stay by revealing the secret again and settles the deposit.
    ///
    /// The settlement is computed before any field changes, so an error
    /// leaves the booking as it was.
    ///
    /// # Errors
    ///
    /// [`MarketError::Unauthorized`], [`MarketError::InvalidState`] unless
    /// `CheckedIn`, [`MarketError::AuthenticationFailed`], or an arithmetic
    /// error from the settlement.
    pub fn check_out(
        &mut self,
        caller: &Caller,
        secret: &Secret,
        commitment: &Commitment,
        now: DateTime<Utc>,
        fees: &FeeSchedule,
        policy: &BookingPolicy,
    ) -> Result<Settlement, MarketError> {
        self.authorize(caller, Operation::CheckOut)?;
        self.require(BookingStatus::CheckedIn, Operation::CheckOut)?;
        self.authenticate(secret, commitment)?;

        let settlement = self.settle_at(now, fees, policy)?;
        self.checked_out_at = Some(now);
        self.status = BookingStatus::Completed;
        Ok(settlement)
    }

    /// What a check-out at `now` would settle, for display.
    ///
    /// `None` unless the booking is checked in.
    #[must_use]
    pub fn projected_settlement(
        &self,
        now: DateTime<Utc>,
        fees: &FeeSchedule,
        policy: &BookingPolicy,
    ) -> Option<Settlement> {
        if self.status != BookingStatus::CheckedIn {
            return None;
        }
        self.settle_at(now, fees, policy).ok()
    }

    fn settle_at(
        &self,
        now: DateTime<Utc>,
        fees: &FeeSchedule,
        policy: &BookingPolicy,
    ) -> Result<Settlement, MarketError> {
        let checked_in_at = self.checked_in_at.ok_or_else(|| {
            MarketError::ProtocolViolation(format!("{} is checked in without a timestamp", self.id))
        })?;
        Settlement::at_checkout(
            self.deposit,
            self.rate_per_hour,
            self.max_hours,
            checked_in_at,
            now,
            fees,
            policy,
        )
    }

    fn authorize(&self, caller: &Caller, operation: Operation) -> Result<(), MarketError> {
        if caller.is(&self.renter) {
            Ok(())
        } else {
            Err(MarketError::Unauthorized {
                caller: caller.identity,
                operation,
            })
        }
    }

    fn require(&self, expected: BookingStatus, operation: Operation) -> Result<(), MarketError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(MarketError::InvalidState {
                booking_id: self.id,
                status: self.status,
                operation,
            })
        }
    }

    fn authenticate(&self, secret: &Secret, commitment: &Commitment) -> Result<(), MarketError> {
        if commitment::verify(secret, commitment) {
            Ok(())
        } else {
            Err(MarketError::AuthenticationFailed {
                booking_id: self.id,
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    const HOST: Address = Address::from_bytes([1; 20]);
    const RENTER: Address = Address::from_bytes([2; 20]);
    const STRANGER: Address = Address::from_bytes([3; 20]);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
    }

    fn fees() -> FeeSchedule {
        FeeSchedule::new(500, Address::from_bytes([0xfe; 20])).unwrap()
    }

    fn fixture() -> (Spot, Secret, Booking) {
        let secret = Secret::new("abc123".into());
        let spot = Spot::create(SpotId::new(0), HOST, Units::new(1_000), Commitment::of(&secret));
        let booking = Booking::reserve(
            BookingId::new(0),
            &spot,
            &Caller::new(RENTER),
            3,
            Units::new(3_000),
            &BookingPolicy::default(),
        )
        .unwrap();
        (spot, secret, booking)
    }

    #[test]
    fn reserve_computes_deposit() {
        let (_, _, booking) = fixture();
        assert_eq!(booking.deposit, Units::new(3_000));
        assert_eq!(booking.status, BookingStatus::Reserved);
        assert_eq!(booking.checked_in_at, None);
    }

    #[test]
    fn reserve_rejects_wrong_value_and_bad_hours() {
        let (spot, _, _) = fixture();
        let policy = BookingPolicy::default();
        let renter = Caller::new(RENTER);

        let err = Booking::reserve(BookingId::new(1), &spot, &renter, 3, Units::new(2_999), &policy)
            .unwrap_err();
        assert_eq!(
            err,
            MarketError::ValueMismatch {
                required: Units::new(3_000),
                attached: Units::new(2_999)
            }
        );

        for hours in [0, 73] {
            let err = Booking::reserve(BookingId::new(1), &spot, &renter, hours, Units::ZERO, &policy)
                .unwrap_err();
            assert!(matches!(err, MarketError::InvalidMaxHours { .. }));
        }
    }

    #[test]
    fn reserve_rejects_inactive_spot() {
        let (mut spot, _, _) = fixture();
        spot.active = false;
        let err = Booking::reserve(
            BookingId::new(1),
            &spot,
            &Caller::new(RENTER),
            1,
            Units::new(1_000),
            &BookingPolicy::default(),
        )
        .unwrap_err();
        assert_eq!(err, MarketError::SpotInactive { spot_id: SpotId::new(0) });
    }

    #[test]
    fn full_stay() {
        let (spot, secret, mut booking) = fixture();
        let renter = Caller::new(RENTER);

        booking.check_in(&renter, &secret, &spot.commitment, t0()).unwrap();
        assert_eq!(booking.status, BookingStatus::CheckedIn);
        assert_eq!(booking.checked_in_at, Some(t0()));

        let out = t0() + Duration::minutes(90);
        let s = booking
            .check_out(&renter, &secret, &spot.commitment, out, &fees(), &BookingPolicy::default())
            .unwrap();
        assert_eq!(booking.status, BookingStatus::Completed);
        assert_eq!(booking.checked_out_at, Some(out));
        assert_eq!(s.cost, Units::new(2_000));
        assert_eq!(s.fee, Units::new(100));
        assert_eq!(s.host_payout, Units::new(1_900));
        assert_eq!(s.refund, Units::new(1_000));
    }

    #[test]
    fn wrong_secret_changes_nothing() {
        let (spot, _, mut booking) = fixture();
        let before = booking.clone();

        let err = booking
            .check_in(&Caller::new(RENTER), &Secret::new("wrong".into()), &spot.commitment, t0())
            .unwrap_err();

        assert!(err.is_security_event());
        assert_eq!(booking, before);
    }

    #[test]
    fn identity_is_checked_before_status_and_secret() {
        let (spot, _, mut booking) = fixture();
        booking.status = BookingStatus::Completed;

        let err = booking
            .check_in(&Caller::new(STRANGER), &Secret::new("wrong".into()), &spot.commitment, t0())
            .unwrap_err();
        assert!(matches!(err, MarketError::Unauthorized { .. }));
    }

    #[test]
    fn terminal_booking_reports_state_not_authentication() {
        let (spot, _, mut booking) = fixture();
        booking.cancel(&Caller::new(RENTER)).unwrap();

        let err = booking
            .check_in(&Caller::new(RENTER), &Secret::new("wrong".into()), &spot.commitment, t0())
            .unwrap_err();
        assert!(matches!(
            err,
            MarketError::InvalidState {
                status: BookingStatus::Cancelled,
                operation: Operation::CheckIn,
                ..
            }
        ));
    }

    #[test]
    fn cancel_only_before_check_in() {
        let (spot, secret, mut booking) = fixture();
        let renter = Caller::new(RENTER);

        assert!(matches!(
            booking.cancel(&Caller::new(HOST)).unwrap_err(),
            MarketError::Unauthorized { .. }
        ));

        booking.check_in(&renter, &secret, &spot.commitment, t0()).unwrap();
        assert!(matches!(
            booking.cancel(&renter).unwrap_err(),
            MarketError::InvalidState { .. }
        ));
    }

    #[test]
    fn cancel_refunds_deposit() {
        let (_, _, mut booking) = fixture();
        let s = booking.cancel(&Caller::new(RENTER)).unwrap();
        assert_eq!(s.refund, booking.deposit);
        assert_eq!(booking.status, BookingStatus::Cancelled);
    }

    #[test]
    fn rotated_commitment_invalidates_old_secret() {
        let (spot, secret, mut booking) = fixture();
        let (_, rotated) = commitment::commit();
        assert_ne!(rotated, spot.commitment);

        let err = booking
            .check_in(&Caller::new(RENTER), &secret, &rotated, t0())
            .unwrap_err();
        assert!(err.is_security_event());
    }

    #[test]
    fn scan_routing_follows_status() {
        assert_eq!(BookingStatus::Reserved.next_scan_action(), Some(ScanAction::CheckIn));
        assert_eq!(BookingStatus::CheckedIn.next_scan_action(), Some(ScanAction::CheckOut));
        assert_eq!(BookingStatus::Completed.next_scan_action(), None);
        assert_eq!(BookingStatus::Cancelled.next_scan_action(), None);
    }

    #[test]
    fn status_codes_match_ledger_encoding() {
        for code in 0..4u8 {
            assert_eq!(BookingStatus::from_code(code).unwrap().code(), code);
        }
        assert_eq!(BookingStatus::from_code(4), None);
    }

    #[test]
    fn projection_only_while_checked_in() {
        let (spot, secret, mut booking) = fixture();
        let policy = BookingPolicy::default();
        assert!(booking.projected_settlement(t0(), &fees(), &policy).is_none());

        booking.check_in(&Caller::new(RENTER), &secret, &spot.commitment, t0()).unwrap();
        let projected = booking
            .projected_settlement(t0() + Duration::minutes(10), &fees(), &policy)
            .unwrap();
        assert_eq!(projected.billable_hours, 1);
        assert_eq!(booking.status, BookingStatus::CheckedIn);
    }

    #[derive(Clone, Debug)]
    enum Step {
        CheckIn { by_renter: bool, right_secret: bool },
        CheckOut { by_renter: bool, right_secret: bool },
        Cancel { by_renter: bool },
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (any::<bool>(), any::<bool>())
                .prop_map(|(by_renter, right_secret)| Step::CheckIn { by_renter, right_secret }),
            (any::<bool>(), any::<bool>())
                .prop_map(|(by_renter, right_secret)| Step::CheckOut { by_renter, right_secret }),
            any::<bool>().prop_map(|by_renter| Step::Cancel { by_renter }),
        ]
    }

    const fn rank(status: BookingStatus) -> u8 {
        match status {
            BookingStatus::Reserved => 0,
            BookingStatus::CheckedIn => 1,
            BookingStatus::Completed | BookingStatus::Cancelled => 2,
        }
    }

    proptest! {
        #[test]
        fn status_only_moves_forward(steps in proptest::collection::vec(step(), 0..20)) {
            let (spot, secret, mut booking) = fixture();
            let wrong = Secret::new("nope".into());
            let policy = BookingPolicy::default();
            let mut check_ins = 0;
            let mut check_outs = 0;

            for (i, s) in steps.into_iter().enumerate() {
                let before = booking.clone();
                let now = t0() + Duration::minutes(i64::try_from(i).unwrap() * 30);
                let who = |by_renter: bool| Caller::new(if by_renter { RENTER } else { STRANGER });
                let pick = |right: bool| if right { &secret } else { &wrong };

                let result = match s {
                    Step::CheckIn { by_renter, right_secret } => booking
                        .check_in(&who(by_renter), pick(right_secret), &spot.commitment, now)
                        .map(|()| check_ins += 1),
                    Step::CheckOut { by_renter, right_secret } => booking
                        .check_out(&who(by_renter), pick(right_secret), &spot.commitment, now, &fees(), &policy)
                        .map(|_| check_outs += 1),
                    Step::Cancel { by_renter } => booking.cancel(&who(by_renter)).map(|_| ()),
                };

                if result.is_err() {
                    prop_assert_eq!(&booking, &before);
                }
                prop_assert!(rank(booking.status) >= rank(before.status));
                if before.status.is_terminal() {
                    prop_assert!(result.is_err());
                }
            }
            prop_assert!(check_ins <= 1);
            prop_assert!(check_outs <= 1);
        }
    }
}
