//! Deposit, cost, fee, payout and refund arithmetic.
//!
//! All amounts are integers in the smallest currency unit. Every operation
//! is checked; a computation that leaves the unit domain is an error, never
//! a wrap.

use crate::booking::BookingPolicy;
use crate::error::MarketError;
use crate::types::{Address, Units};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Basis points in 100%.
pub const BPS_DENOMINATOR: u16 = 10_000;

/// The platform fee configuration, read from the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Fee in basis points of the cost
    pub fee_bps: u16,
    /// Identity receiving the fee
    pub fee_recipient: Address,
}

impl FeeSchedule {
    /// Creates a fee schedule.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::ProtocolViolation`] if the fee exceeds 100%.
    pub fn new(fee_bps: u16, fee_recipient: Address) -> Result<Self, MarketError> {
        if fee_bps > BPS_DENOMINATOR {
            return Err(MarketError::ProtocolViolation(format!(
                "fee of {fee_bps} bps exceeds 100%"
            )));
        }
        Ok(Self {
            fee_bps,
            fee_recipient,
        })
    }

    /// `floor(cost * fee_bps / 10000)`, computed without an intermediate
    /// product that could overflow.
    #[must_use]
    pub fn fee_on(&self, cost: Units) -> Units {
        let bps = u128::from(self.fee_bps.min(BPS_DENOMINATOR));
        let denom = u128::from(BPS_DENOMINATOR);
        let raw = cost.raw();
        Units::new((raw / denom) * bps + (raw % denom) * bps / denom)
    }
}

/// The three-way split of a booking's deposit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    /// Started hours between check-in and check-out
    pub elapsed_hours: u64,
    /// Hours actually charged: at least the policy minimum, at most `max_hours`
    pub billable_hours: u32,
    /// `rate * billable_hours`
    pub cost: Units,
    /// Platform fee taken from the cost
    pub fee: Units,
    /// `cost - fee`, paid to the spot owner
    pub host_payout: Units,
    /// `deposit - cost`, returned to the renter
    pub refund: Units,
}

impl Settlement {
    /// Computes the checkout split for a stay.
    ///
    /// Elapsed time is rounded up to whole hours; an overstay past
    /// `max_hours` is charged as `max_hours`, so the cost never exceeds the
    /// deposit.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::Overflow`] if the cost cannot be represented
    /// or exceeds the deposit (which only happens when the deposit was not
    /// `rate * max_hours`).
    pub fn at_checkout(
        deposit: Units,
        rate_per_hour: Units,
        max_hours: u32,
        checked_in_at: DateTime<Utc>,
        checked_out_at: DateTime<Utc>,
        fees: &FeeSchedule,
        policy: &BookingPolicy,
    ) -> Result<Self, MarketError> {
        let elapsed_hours = policy.elapsed_hours(checked_in_at, checked_out_at);
        let charged = elapsed_hours.max(u64::from(policy.minimum_billable_hours));
        let billable_hours = u32::try_from(charged.min(u64::from(max_hours))).unwrap_or(max_hours);

        let cost = rate_per_hour
            .checked_mul_hours(billable_hours)
            .ok_or_else(|| MarketError::overflow("cost"))?;
        let refund = deposit
            .checked_sub(cost)
            .ok_or_else(|| MarketError::overflow("refund"))?;
        let fee = fees.fee_on(cost);
        let host_payout = cost
            .checked_sub(fee)
            .ok_or_else(|| MarketError::overflow("host payout"))?;

        Ok(Self {
            elapsed_hours,
            billable_hours,
            cost,
            fee,
            host_payout,
            refund,
        })
    }

    /// The split of a cancelled reservation: the whole deposit is refunded.
    #[must_use]
    pub const fn cancellation(deposit: Units) -> Self {
        Self {
            elapsed_hours: 0,
            billable_hours: 0,
            cost: Units::ZERO,
            fee: Units::ZERO,
            host_payout: Units::ZERO,
            refund: deposit,
        }
    }

    /// Sum of everything paid out; equals the deposit for any valid split.
    #[must_use]
    pub fn total(&self) -> Option<Units> {
        self.host_payout
            .checked_add(self.fee)
            .and_then(|v| v.checked_add(self.refund))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    fn fees(bps: u16) -> FeeSchedule {
        FeeSchedule::new(bps, Address::from_bytes([0xfe; 20])).unwrap()
    }

    #[test]
    fn two_and_a_half_hours_bill_three() {
        let rate = Units::new(1_000);
        let s = Settlement::at_checkout(
            Units::new(5_000),
            rate,
            5,
            start(),
            start() + Duration::minutes(150),
            &fees(250),
            &BookingPolicy::default(),
        )
        .unwrap();

        assert_eq!(s.elapsed_hours, 3);
        assert_eq!(s.billable_hours, 3);
        assert_eq!(s.cost, Units::new(3_000));
        assert_eq!(s.fee, Units::new(75));
        assert_eq!(s.host_payout, Units::new(2_925));
        assert_eq!(s.refund, Units::new(2_000));
        assert_eq!(s.total(), Some(Units::new(5_000)));
    }

    #[test]
    fn overstay_is_capped_at_deposit() {
        let s = Settlement::at_checkout(
            Units::new(2_000),
            Units::new(1_000),
            2,
            start(),
            start() + Duration::hours(30),
            &fees(0),
            &BookingPolicy::default(),
        )
        .unwrap();

        assert_eq!(s.elapsed_hours, 30);
        assert_eq!(s.billable_hours, 2);
        assert_eq!(s.cost, Units::new(2_000));
        assert_eq!(s.refund, Units::ZERO);
    }

    #[test]
    fn immediate_checkout_bills_minimum() {
        let s = Settlement::at_checkout(
            Units::new(3_000),
            Units::new(1_000),
            3,
            start(),
            start(),
            &fees(0),
            &BookingPolicy::default(),
        )
        .unwrap();
        assert_eq!(s.billable_hours, 1);
        assert_eq!(s.refund, Units::new(2_000));
    }

    #[test]
    fn exact_hour_is_not_rounded_up() {
        let s = Settlement::at_checkout(
            Units::new(3_000),
            Units::new(1_000),
            3,
            start(),
            start() + Duration::hours(2),
            &fees(0),
            &BookingPolicy::default(),
        )
        .unwrap();
        assert_eq!(s.billable_hours, 2);
    }

    #[test]
    fn fee_above_hundred_percent_is_rejected() {
        assert!(FeeSchedule::new(10_001, Address::ZERO).is_err());
        assert!(FeeSchedule::new(10_000, Address::ZERO).is_ok());
    }

    #[test]
    fn fee_handles_large_costs() {
        let schedule = fees(10_000);
        assert_eq!(schedule.fee_on(Units::new(u128::MAX)), Units::new(u128::MAX));
    }

    #[test]
    fn cancellation_refunds_everything() {
        let s = Settlement::cancellation(Units::new(4_000));
        assert_eq!(s.refund, Units::new(4_000));
        assert_eq!(s.total(), Some(Units::new(4_000)));
    }

    proptest! {
        #[test]
        fn split_never_exceeds_deposit(
            rate in 0u128..1_000_000_000_000_000_000,
            max_hours in 1u32..=72,
            minutes in 0i64..10_000,
            bps in 0u16..=10_000,
        ) {
            let deposit = Units::new(rate * u128::from(max_hours));
            let s = Settlement::at_checkout(
                deposit,
                Units::new(rate),
                max_hours,
                start(),
                start() + Duration::minutes(minutes),
                &fees(bps),
                &BookingPolicy::default(),
            ).unwrap();

            prop_assert!(s.billable_hours >= 1);
            prop_assert!(s.billable_hours <= max_hours);
            prop_assert!(s.cost <= deposit);
            prop_assert!(s.host_payout.raw() + s.fee.raw() <= deposit.raw());
            prop_assert_eq!(s.refund.raw() + s.cost.raw(), deposit.raw());
            prop_assert_eq!(s.total(), Some(deposit));
        }
    }
}
