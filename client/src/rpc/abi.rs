//! Contract ABI encoding for the marketplace ledger.
//!
//! Only the shapes the marketplace uses are supported: static words
//! (`uint`, `address`, `bool`, `bytes32`) and trailing dynamic `string`
//! arguments.

use chrono::{DateTime, Utc};
use parkmarket_core::{
    Address, Booking, BookingId, BookingStatus, Commitment, LedgerCall, LedgerEvent, MarketError,
    Spot, SpotId, Units,
};
use sha3::{Digest, Keccak256};

const WORD: usize = 32;

/// Keccak-256 of `bytes`
#[must_use]
pub fn keccak(bytes: &[u8]) -> [u8; 32] {
    Keccak256::digest(bytes).into()
}

/// Four-byte function selector of a canonical signature
#[must_use]
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Event topic of a canonical signature
#[must_use]
pub fn topic(signature: &str) -> [u8; 32] {
    keccak(signature.as_bytes())
}

/// One ABI argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    /// Any `uintN`
    Uint(u128),
    /// `address`
    Address(Address),
    /// `bool`
    Bool(bool),
    /// `bytes32`
    Bytes32([u8; 32]),
    /// `string`
    String(String),
}

fn uint_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

fn static_word(token: &Token) -> Option<[u8; 32]> {
    match token {
        Token::Uint(v) => Some(uint_word(*v)),
        Token::Address(a) => {
            let mut word = [0u8; 32];
            word[12..].copy_from_slice(a.as_bytes());
            Some(word)
        },
        Token::Bool(b) => Some(uint_word(u128::from(*b))),
        Token::Bytes32(bytes) => Some(*bytes),
        Token::String(_) => None,
    }
}

/// Encodes a call: selector, head words, then dynamic tails.
#[must_use]
pub fn encode_call(signature: &str, tokens: &[Token]) -> Vec<u8> {
    let head_len = WORD * tokens.len();
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for token in tokens {
        if let Some(word) = static_word(token) {
            head.extend_from_slice(&word);
        } else if let Token::String(s) = token {
            head.extend_from_slice(&uint_word((head_len + tail.len()) as u128));
            tail.extend_from_slice(&uint_word(s.len() as u128));
            tail.extend_from_slice(s.as_bytes());
            let padding = (WORD - s.len() % WORD) % WORD;
            tail.resize(tail.len() + padding, 0);
        }
    }

    let mut out = selector(signature).to_vec();
    out.extend_from_slice(&head);
    out.extend_from_slice(&tail);
    out
}

/// Calldata for a mutating ledger call.
#[must_use]
pub fn encode_ledger_call(call: &LedgerCall) -> Vec<u8> {
    match call {
        LedgerCall::CreateSpot {
            rate_per_hour,
            commitment,
        } => encode_call(
            "createSpot(uint256,bytes32)",
            &[
                Token::Uint(rate_per_hour.raw()),
                Token::Bytes32(*commitment.as_bytes()),
            ],
        ),
        LedgerCall::UpdateSpot { spot_id, update } => encode_call(
            "updateSpot(uint256,uint256,bool,bytes32)",
            &[
                Token::Uint(u128::from(spot_id.index())),
                Token::Uint(update.rate_per_hour.raw()),
                Token::Bool(update.active),
                Token::Bytes32(*update.commitment.as_bytes()),
            ],
        ),
        LedgerCall::BookSpot {
            spot_id, max_hours, ..
        } => encode_call(
            "bookSpot(uint256,uint32)",
            &[
                Token::Uint(u128::from(spot_id.index())),
                Token::Uint(u128::from(*max_hours)),
            ],
        ),
        LedgerCall::CheckIn { booking_id, secret } => encode_call(
            "checkIn(uint256,string)",
            &[
                Token::Uint(u128::from(booking_id.index())),
                Token::String(secret.expose().to_string()),
            ],
        ),
        LedgerCall::CheckOut { booking_id, secret } => encode_call(
            "checkOut(uint256,string)",
            &[
                Token::Uint(u128::from(booking_id.index())),
                Token::String(secret.expose().to_string()),
            ],
        ),
        LedgerCall::CancelBeforeCheckIn { booking_id } => encode_call(
            "cancelBeforeCheckIn(uint256)",
            &[Token::Uint(u128::from(booking_id.index()))],
        ),
    }
}

/// Read-only calls.
pub mod views {
    /// `spotsCount()`
    pub const SPOTS_COUNT: &str = "spotsCount()";
    /// `spots(uint256)`
    pub const SPOTS: &str = "spots(uint256)";
    /// `bookingsCount()`
    pub const BOOKINGS_COUNT: &str = "bookingsCount()";
    /// `bookings(uint256)`
    pub const BOOKINGS: &str = "bookings(uint256)";
    /// `feeBps()`
    pub const FEE_BPS: &str = "feeBps()";
    /// `feeRecipient()`
    pub const FEE_RECIPIENT: &str = "feeRecipient()";
}

/// Return data or log data split into 32-byte words.
#[derive(Clone, Copy, Debug)]
pub struct Words<'a>(&'a [u8]);

impl<'a> Words<'a> {
    /// Wraps raw bytes.
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self(data)
    }

    /// Number of complete words
    #[must_use]
    pub const fn len(&self) -> usize {
        self.0.len() / WORD
    }

    /// True if there is no complete word
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn word(&self, i: usize) -> Result<&'a [u8], MarketError> {
        self.0.get(i * WORD..(i + 1) * WORD).ok_or_else(|| {
            MarketError::ProtocolViolation(format!(
                "expected at least {} words, got {} bytes",
                i + 1,
                self.0.len()
            ))
        })
    }

    /// Word `i` as an unsigned integer that fits in 128 bits.
    ///
    /// # Errors
    ///
    /// [`MarketError::ProtocolViolation`] if the word is missing,
    /// [`MarketError::Overflow`] if it does not fit.
    pub fn uint(&self, i: usize) -> Result<u128, MarketError> {
        decode_uint(self.word(i)?)
    }

    /// Word `i` as a `u64`.
    ///
    /// # Errors
    ///
    /// As [`Words::uint`].
    pub fn u64(&self, i: usize) -> Result<u64, MarketError> {
        u64::try_from(self.uint(i)?).map_err(|_| MarketError::overflow("64-bit ledger field"))
    }

    /// Word `i` as a `u32`.
    ///
    /// # Errors
    ///
    /// As [`Words::uint`].
    pub fn u32(&self, i: usize) -> Result<u32, MarketError> {
        u32::try_from(self.uint(i)?).map_err(|_| MarketError::overflow("32-bit ledger field"))
    }

    /// Word `i` as an address.
    ///
    /// # Errors
    ///
    /// [`MarketError::ProtocolViolation`] if the word is missing.
    pub fn address(&self, i: usize) -> Result<Address, MarketError> {
        Ok(decode_address(self.word(i)?))
    }

    /// Word `i` as a bool.
    ///
    /// # Errors
    ///
    /// [`MarketError::ProtocolViolation`] if the word is missing.
    pub fn bool(&self, i: usize) -> Result<bool, MarketError> {
        Ok(self.uint(i)? != 0)
    }

    /// Word `i` as raw bytes.
    ///
    /// # Errors
    ///
    /// [`MarketError::ProtocolViolation`] if the word is missing.
    pub fn bytes32(&self, i: usize) -> Result<[u8; 32], MarketError> {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.word(i)?);
        Ok(out)
    }
}

fn decode_uint(word: &[u8]) -> Result<u128, MarketError> {
    let (high, low) = word.split_at(WORD / 2);
    if high.iter().any(|b| *b != 0) {
        return Err(MarketError::overflow("ledger integer"));
    }
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(low);
    Ok(u128::from_be_bytes(bytes))
}

fn decode_address(word: &[u8]) -> Address {
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&word[12..]);
    Address::from_bytes(bytes)
}

fn timestamp(seconds: u64) -> Result<DateTime<Utc>, MarketError> {
    i64::try_from(seconds)
        .ok()
        .and_then(|s| DateTime::from_timestamp(s, 0))
        .ok_or_else(|| MarketError::ProtocolViolation(format!("timestamp {seconds} out of range")))
}

fn optional_timestamp(seconds: u64) -> Result<Option<DateTime<Utc>>, MarketError> {
    if seconds == 0 {
        Ok(None)
    } else {
        timestamp(seconds).map(Some)
    }
}

/// Decodes the return data of `spots(id)`.
///
/// An unset record (zero owner) is `None`.
///
/// # Errors
///
/// [`MarketError::ProtocolViolation`] or [`MarketError::Overflow`] on
/// malformed data.
pub fn decode_spot(id: SpotId, data: &[u8]) -> Result<Option<Spot>, MarketError> {
    let words = Words::new(data);
    let owner = words.address(0)?;
    if owner.is_zero() {
        return Ok(None);
    }
    Ok(Some(Spot {
        id,
        owner,
        rate_per_hour: Units::new(words.uint(1)?),
        active: words.bool(2)?,
        commitment: Commitment::from_bytes(words.bytes32(3)?),
    }))
}

/// Decodes the return data of `bookings(id)`.
///
/// An unset record (zero renter) is `None`.
///
/// # Errors
///
/// [`MarketError::ProtocolViolation`] on malformed data or an unknown
/// status code.
pub fn decode_booking(id: BookingId, data: &[u8]) -> Result<Option<Booking>, MarketError> {
    let words = Words::new(data);
    let renter = words.address(1)?;
    if renter.is_zero() {
        return Ok(None);
    }
    let code = u8::try_from(words.uint(7)?)
        .map_err(|_| MarketError::ProtocolViolation("status code out of range".into()))?;
    let status = BookingStatus::from_code(code)
        .ok_or_else(|| MarketError::ProtocolViolation(format!("unknown status code {code}")))?;

    Ok(Some(Booking {
        id,
        spot_id: SpotId::new(words.u64(0)?),
        renter,
        deposit: Units::new(words.uint(2)?),
        rate_per_hour: Units::new(words.uint(3)?),
        max_hours: words.u32(4)?,
        checked_in_at: optional_timestamp(words.u64(5)?)?,
        checked_out_at: optional_timestamp(words.u64(6)?)?,
        status,
    }))
}

/// Decodes one marketplace log.
///
/// Logs with an unknown first topic yield `None`.
///
/// # Errors
///
/// [`MarketError::ProtocolViolation`] if a known event is malformed.
pub fn decode_log(topics: &[[u8; 32]], data: &[u8]) -> Result<Option<LedgerEvent>, MarketError> {
    let Some(signature) = topics.first() else {
        return Ok(None);
    };
    let indexed = Words::new(topics.get(1..).map_or(&[][..], |t| t.as_flattened()));
    let body = Words::new(data);

    let event = if *signature == topic("SpotCreated(uint256,address,uint256)") {
        LedgerEvent::SpotCreated {
            spot_id: SpotId::new(indexed.u64(0)?),
            owner: indexed.address(1)?,
            rate_per_hour: Units::new(body.uint(0)?),
        }
    } else if *signature == topic("SpotUpdated(uint256,uint256,bool)") {
        LedgerEvent::SpotUpdated {
            spot_id: SpotId::new(indexed.u64(0)?),
            rate_per_hour: Units::new(body.uint(0)?),
            active: body.bool(1)?,
        }
    } else if *signature == topic("BookingCreated(uint256,uint256,address,uint256,uint32)") {
        LedgerEvent::BookingCreated {
            booking_id: BookingId::new(indexed.u64(0)?),
            spot_id: SpotId::new(indexed.u64(1)?),
            renter: indexed.address(2)?,
            deposit: Units::new(body.uint(0)?),
            max_hours: body.u32(1)?,
        }
    } else if *signature == topic("CheckedIn(uint256,uint64)") {
        LedgerEvent::CheckedIn {
            booking_id: BookingId::new(indexed.u64(0)?),
            at: timestamp(body.u64(0)?)?,
        }
    } else if *signature == topic("CheckedOut(uint256,uint64,uint256,uint256,uint256)") {
        LedgerEvent::CheckedOut {
            booking_id: BookingId::new(indexed.u64(0)?),
            at: timestamp(body.u64(0)?)?,
            cost: Units::new(body.uint(1)?),
            host_paid: Units::new(body.uint(2)?),
            refund: Units::new(body.uint(3)?),
        }
    } else if *signature == topic("OwnershipTransferStarted(address,address)") {
        LedgerEvent::OwnershipTransferStarted {
            previous_owner: indexed.address(0)?,
            new_owner: indexed.address(1)?,
        }
    } else if *signature == topic("OwnershipTransferred(address,address)") {
        LedgerEvent::OwnershipTransferred {
            previous_owner: indexed.address(0)?,
            new_owner: indexed.address(1)?,
        }
    } else {
        return Ok(None);
    };
    Ok(Some(event))
}
