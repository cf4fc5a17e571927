//! Materializing ledger collections from a count and independent point reads.
//!
//! The ledger exposes spots and bookings as `count()` plus `get(i)` for
//! `i in 0..count`. [`read_all`] fetches the count, fires every point read
//! at once, and writes each completion into its own slot. A failed point
//! read marks that slot unavailable; it never aborts the read, never shifts
//! the other entries, and is never retried within the same read.

use futures::stream::{FuturesUnordered, StreamExt};
use parkmarket_core::ledger::{LedgerFuture, LedgerReader};
use parkmarket_core::{
    Address, Booking, BookingId, EntityKind, MarketError, Spot, SpotId,
};
use parkmarket_runtime::metrics::LedgerReadMetrics;
use std::ops::Range;
use std::time::Instant;

/// An indexed collection on the ledger.
pub trait IndexedSource: Send + Sync {
    /// Item type stored at each index
    type Item: Clone + Send;

    /// Kind of record, used in not-found errors
    const KIND: EntityKind;

    /// Metric label
    const NAME: &'static str;

    /// Number of items. Valid indices are `0..count`.
    fn count(&self) -> LedgerFuture<'_, u64>;

    /// Reads the item at `index`.
    fn get(&self, index: u64) -> LedgerFuture<'_, Option<Self::Item>>;
}

/// The spots collection of a ledger.
pub struct Spots<'a, L: LedgerReader + ?Sized>(pub &'a L);

impl<L: LedgerReader + ?Sized> IndexedSource for Spots<'_, L> {
    type Item = Spot;
    const KIND: EntityKind = EntityKind::Spot;
    const NAME: &'static str = "spots";

    fn count(&self) -> LedgerFuture<'_, u64> {
        self.0.spots_count()
    }

    fn get(&self, index: u64) -> LedgerFuture<'_, Option<Spot>> {
        self.0.spot(SpotId::new(index))
    }
}

/// The bookings collection of a ledger.
pub struct Bookings<'a, L: LedgerReader + ?Sized>(pub &'a L);

impl<L: LedgerReader + ?Sized> IndexedSource for Bookings<'_, L> {
    type Item = Booking;
    const KIND: EntityKind = EntityKind::Booking;
    const NAME: &'static str = "bookings";

    fn count(&self) -> LedgerFuture<'_, u64> {
        self.0.bookings_count()
    }

    fn get(&self, index: u64) -> LedgerFuture<'_, Option<Booking>> {
        self.0.booking(BookingId::new(index))
    }
}

/// Outcome of one point read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Slot<T> {
    /// The item was read
    Available(T),
    /// The read failed; the item is excluded from every derived view
    Unavailable {
        /// Why the read failed
        reason: MarketError,
    },
}

/// One index of a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry<T> {
    /// Ledger index, the item's permanent id
    pub index: u64,
    /// What the read produced
    pub slot: Slot<T>,
}

impl<T> Entry<T> {
    /// The item, if it was read
    #[must_use]
    pub const fn item(&self) -> Option<&T> {
        match &self.slot {
            Slot::Available(item) => Some(item),
            Slot::Unavailable { .. } => None,
        }
    }
}

/// Index-ordered result of one collection read.
///
/// Holds exactly one entry per index in `0..count`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionSnapshot<T> {
    entries: Vec<Entry<T>>,
}

impl<T> CollectionSnapshot<T> {
    /// A confirmed-empty collection (`count == 0`)
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// The count this snapshot was read at
    #[must_use]
    pub fn count(&self) -> u64 {
        self.entries.len() as u64
    }

    /// True if the ledger reported no items at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, in index order
    #[must_use]
    pub fn entries(&self) -> &[Entry<T>] {
        &self.entries
    }

    /// The entry at `index`
    #[must_use]
    pub fn get(&self, index: u64) -> Option<&Entry<T>> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.entries.get(i))
    }

    /// Items that were read, with their indices
    pub fn available(&self) -> impl Iterator<Item = (u64, &T)> {
        self.entries
            .iter()
            .filter_map(|e| e.item().map(|item| (e.index, item)))
    }

    /// Indices whose read failed, with the reason
    pub fn unavailable(&self) -> impl Iterator<Item = (u64, &MarketError)> {
        self.entries.iter().filter_map(|e| match &e.slot {
            Slot::Unavailable { reason } => Some((e.index, reason)),
            Slot::Available(_) => None,
        })
    }

    /// Number of failed point reads
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.unavailable().count()
    }

    /// Filter view: available items matching `predicate`, keeping their
    /// ledger index.
    pub fn matching<'a, F>(&'a self, predicate: F) -> Vec<(u64, &'a T)>
    where
        F: Fn(&T) -> bool,
    {
        self.available()
            .filter(|(_, item)| predicate(item))
            .collect()
    }

    /// How this snapshot's count relates to an earlier one.
    #[must_use]
    pub fn change_since(&self, previous: Option<&Self>) -> CountChange {
        CountChange::between(previous.map_or(0, Self::count), self.count())
    }
}

impl CollectionSnapshot<Spot> {
    /// Spots that can currently be reserved
    #[must_use]
    pub fn active_spots(&self) -> Vec<(u64, &Spot)> {
        self.matching(|spot| spot.active)
    }

    /// Spots owned by `owner`
    #[must_use]
    pub fn owned_by(&self, owner: &Address) -> Vec<(u64, &Spot)> {
        self.matching(|spot| spot.owner == *owner)
    }
}

impl CollectionSnapshot<Booking> {
    /// Bookings made by `renter`
    #[must_use]
    pub fn bookings_for(&self, renter: &Address) -> Vec<(u64, &Booking)> {
        self.matching(|booking| booking.renter == *renter)
    }
}

/// Difference between two counts of the same collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CountChange {
    /// Same count
    Unchanged,
    /// New items were appended at these indices
    Appended(Range<u64>),
    /// The count went down, which the ledger never does
    Regressed {
        /// Earlier count
        from: u64,
        /// Later count
        to: u64,
    },
}

impl CountChange {
    /// Compares two counts.
    #[must_use]
    pub const fn between(from: u64, to: u64) -> Self {
        if to == from {
            Self::Unchanged
        } else if to > from {
            Self::Appended(from..to)
        } else {
            Self::Regressed { from, to }
        }
    }

    /// The change as a protocol violation, if it is one
    #[must_use]
    pub fn violation(&self, collection: &str) -> Option<MarketError> {
        match self {
            Self::Regressed { from, to } => Some(MarketError::ProtocolViolation(format!(
                "{collection} count went from {from} to {to}"
            ))),
            Self::Unchanged | Self::Appended(_) => None,
        }
    }
}

/// Reads a whole collection.
///
/// # Errors
///
/// Only a failed count read fails the whole read. Point-read failures are
/// recorded in their slots.
#[tracing::instrument(skip(source), fields(collection = S::NAME))]
pub async fn read_all<S: IndexedSource>(
    source: &S,
) -> Result<CollectionSnapshot<S::Item>, MarketError> {
    let started = Instant::now();
    let count = source.count().await?;
    let len = usize::try_from(count).map_err(|_| MarketError::overflow("collection count"))?;

    let mut slots: Vec<Option<Slot<S::Item>>> = Vec::with_capacity(len);
    slots.resize_with(len, || None);

    let mut reads: FuturesUnordered<_> = (0..count)
        .map(|index| async move { (index, source.get(index).await) })
        .collect();

    while let Some((index, result)) = reads.next().await {
        let slot = match result {
            Ok(Some(item)) => Slot::Available(item),
            Ok(None) => Slot::Unavailable {
                reason: MarketError::NotFound {
                    kind: S::KIND,
                    id: index,
                },
            },
            Err(reason) => {
                tracing::debug!(index, %reason, "Point read failed");
                Slot::Unavailable { reason }
            },
        };
        if let Some(target) = usize::try_from(index).ok().and_then(|i| slots.get_mut(i)) {
            *target = Some(slot);
        }
    }

    let entries: Vec<Entry<S::Item>> = slots
        .into_iter()
        .zip(0..count)
        .map(|(slot, index)| Entry {
            index,
            slot: slot.unwrap_or_else(|| Slot::Unavailable {
                reason: MarketError::Transport(format!("read of index {index} did not complete")),
            }),
        })
        .collect();

    let snapshot = CollectionSnapshot { entries };
    let failed = snapshot.failed_count();
    LedgerReadMetrics::record_collection(S::NAME, count, failed, started.elapsed());
    if failed > 0 {
        tracing::warn!(count, failed, "Collection read with unavailable entries");
    } else {
        tracing::debug!(count, "Collection read");
    }
    Ok(snapshot)
}
