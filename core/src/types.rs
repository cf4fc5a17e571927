//! Identifier, identity and currency-unit types shared by the whole workspace.

use crate::error::MarketError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of decimals of the ledger's native currency (wei per ether).
pub const NATIVE_DECIMALS: u32 = 18;

/// Position of a spot in the ledger's spot sequence.
///
/// Stable and never reused: a spot's index is its identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpotId(u64);

impl SpotId {
    /// Creates a `SpotId` from its ledger index
    #[must_use]
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    /// Returns the ledger index
    #[must_use]
    pub const fn index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SpotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spot #{}", self.0)
    }
}

/// Position of a booking in the ledger's booking sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BookingId(u64);

impl BookingId {
    /// Creates a `BookingId` from its ledger index
    #[must_use]
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    /// Returns the ledger index
    #[must_use]
    pub const fn index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "booking #{}", self.0)
    }
}

/// A 20-byte ledger identity.
///
/// Parsing accepts any hex casing; comparison is on the raw bytes, so two
/// textual forms differing only in case are the same identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address([u8; 20]);

impl Address {
    /// The all-zero identity. The ledger returns it for unset records.
    pub const ZERO: Self = Self([0u8; 20]);

    /// Creates an address from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Checks whether this is the zero address
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl FromStr for Address {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MarketError::InvalidAddress {
            input: s.to_string(),
        };
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(invalid)?;
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(digits, &mut bytes).map_err(|_| invalid())?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Address {
    type Error = MarketError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

/// The identity on whose behalf an operation is performed.
///
/// Passed explicitly into every lifecycle operation; there is no ambient
/// "connected account".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Caller {
    /// Identity that signs and pays for the call
    pub identity: Address,
}

impl Caller {
    /// Creates a caller context for the given identity
    #[must_use]
    pub const fn new(identity: Address) -> Self {
        Self { identity }
    }

    /// Checks whether this caller is `other`
    #[must_use]
    pub fn is(&self, other: &Address) -> bool {
        self.identity == *other
    }
}

/// Amount in the ledger's smallest currency unit.
///
/// The ledger's numeric domain is wider, but every amount the marketplace
/// handles (rates, deposits, payouts) fits in `u128`; anything larger is
/// rejected rather than truncated.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Units(u128);

impl Units {
    /// Zero units
    pub const ZERO: Self = Self(0);

    /// Creates an amount from raw units
    #[must_use]
    pub const fn new(raw: u128) -> Self {
        Self(raw)
    }

    /// Returns the raw amount
    #[must_use]
    pub const fn raw(&self) -> u128 {
        self.0
    }

    /// Checks if this amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Checked addition
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Checked subtraction
    #[must_use]
    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        match self.0.checked_sub(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Checked multiplication by a whole number of hours
    #[must_use]
    pub const fn checked_mul_hours(self, hours: u32) -> Option<Self> {
        match self.0.checked_mul(hours as u128) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Parses a decimal string into units with the given number of decimals.
    ///
    /// `"0.001"` with 18 decimals is `1_000_000_000_000_000`. Signs,
    /// exponents, more fractional digits than `decimals`, and values that
    /// overflow are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::InvalidAmount`] if the input is not a
    /// non-negative decimal representable in the unit domain.
    pub fn parse_decimal(input: &str, decimals: u32) -> Result<Self, MarketError> {
        let invalid = |reason: &str| MarketError::InvalidAmount {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty amount"));
        }

        let (whole, fraction) = match trimmed.split_once('.') {
            Some((w, f)) => (w, f),
            None => (trimmed, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid("no digits"));
        }
        if !whole.chars().all(|c| c.is_ascii_digit())
            || !fraction.chars().all(|c| c.is_ascii_digit())
        {
            return Err(invalid("only digits and a single decimal point are allowed"));
        }
        if fraction.len() > decimals as usize {
            return Err(invalid("more fractional digits than the unit precision"));
        }

        let scale = 10u128
            .checked_pow(decimals)
            .ok_or_else(|| invalid("unsupported precision"))?;
        let whole_units = if whole.is_empty() {
            0
        } else {
            whole
                .parse::<u128>()
                .map_err(|_| invalid("amount too large"))?
        };

        let mut padded = fraction.to_string();
        padded.extend(std::iter::repeat_n('0', decimals as usize - fraction.len()));
        let fraction_units = if padded.is_empty() {
            0
        } else {
            padded
                .parse::<u128>()
                .map_err(|_| invalid("amount too large"))?
        };

        whole_units
            .checked_mul(scale)
            .and_then(|v| v.checked_add(fraction_units))
            .map(Self)
            .ok_or_else(|| invalid("amount too large"))
    }

    /// Parses an amount expressed in the native currency (18 decimals).
    ///
    /// # Errors
    ///
    /// See [`Units::parse_decimal`].
    pub fn parse_ether(input: &str) -> Result<Self, MarketError> {
        Self::parse_decimal(input, NATIVE_DECIMALS)
    }

    /// Formats the amount as a decimal string with trailing zeros trimmed.
    #[must_use]
    pub fn format_decimal(&self, decimals: u32) -> String {
        let Some(scale) = 10u128.checked_pow(decimals) else {
            return self.0.to_string();
        };
        let whole = self.0 / scale;
        let fraction = self.0 % scale;
        if fraction == 0 {
            return whole.to_string();
        }
        let digits = format!("{fraction:0width$}", width = decimals as usize);
        format!("{whole}.{}", digits.trim_end_matches('0'))
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_decimal(NATIVE_DECIMALS))
    }
}
