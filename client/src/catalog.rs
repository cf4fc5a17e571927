//! Catalog state: the spots and bookings views a client displays.
//!
//! Loads are always caller-triggered ([`CatalogAction::RefreshSpots`],
//! [`CatalogAction::RefreshBookings`]). Ledger notifications only mark a
//! view stale so the caller knows a refresh would show something new.

use crate::collection::{self, Bookings, CollectionSnapshot, CountChange, Spots};
use parkmarket_core::{
    Booking, Ledger, LedgerEvent, MarketError, SmallVec, Spot, effect::Effect, reducer::Reducer,
    smallvec,
};
use std::sync::Arc;

/// Load state of one collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CollectionState<T> {
    /// Never requested
    NotLoaded,
    /// A read is in flight
    Loading {
        /// Snapshot shown while reloading
        previous: Option<CollectionSnapshot<T>>,
    },
    /// Last read succeeded
    Loaded {
        /// The snapshot
        snapshot: CollectionSnapshot<T>,
        /// Count change against the snapshot it replaced
        change: CountChange,
        /// The ledger reported changes since this snapshot was read
        stale: bool,
    },
    /// Last read failed as a whole
    Failed {
        /// Why
        error: MarketError,
        /// Last good snapshot, if any
        previous: Option<CollectionSnapshot<T>>,
    },
}

impl<T> Default for CollectionState<T> {
    fn default() -> Self {
        Self::NotLoaded
    }
}

impl<T> CollectionState<T> {
    /// The newest snapshot available, whatever the load state
    #[must_use]
    pub const fn snapshot(&self) -> Option<&CollectionSnapshot<T>> {
        match self {
            Self::NotLoaded => None,
            Self::Loading { previous } | Self::Failed { previous, .. } => previous.as_ref(),
            Self::Loaded { snapshot, .. } => Some(snapshot),
        }
    }

    /// True while a read is in flight
    #[must_use]
    pub const fn is_loading(&self) -> bool {
        matches!(self, Self::Loading { .. })
    }

    /// True only if a completed read found no items
    #[must_use]
    pub fn is_confirmed_empty(&self) -> bool {
        matches!(self, Self::Loaded { snapshot, .. } if snapshot.is_empty())
    }

    /// True if loaded and the ledger has reported changes since
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        matches!(self, Self::Loaded { stale: true, .. })
    }

    fn begin(&mut self) -> bool {
        if self.is_loading() {
            return false;
        }
        let previous = match std::mem::take(self) {
            Self::Loaded { snapshot, .. } => Some(snapshot),
            Self::Failed { previous, .. } => previous,
            Self::NotLoaded | Self::Loading { .. } => None,
        };
        *self = Self::Loading { previous };
        true
    }

    fn finish(&mut self, name: &str, result: Result<CollectionSnapshot<T>, MarketError>) {
        let previous = match std::mem::take(self) {
            Self::Loading { previous } | Self::Failed { previous, .. } => previous,
            Self::Loaded { snapshot, .. } => Some(snapshot),
            Self::NotLoaded => None,
        };

        *self = match result {
            Ok(snapshot) => {
                let change = snapshot.change_since(previous.as_ref());
                if let Some(error) = change.violation(name) {
                    tracing::warn!(collection = name, %error, "Discarding snapshot");
                    Self::Failed { error, previous }
                } else {
                    Self::Loaded {
                        snapshot,
                        change,
                        stale: false,
                    }
                }
            },
            Err(error) => {
                tracing::warn!(collection = name, %error, "Collection read failed");
                Self::Failed { error, previous }
            },
        };
    }

    fn mark_stale(&mut self) {
        if let Self::Loaded { stale, .. } = self {
            *stale = true;
        }
    }
}

/// Spots and bookings as last read.
#[derive(Clone, Debug, Default)]
pub struct CatalogState {
    /// All spots
    pub spots: CollectionState<Spot>,
    /// All bookings
    pub bookings: CollectionState<Booking>,
}

/// Catalog inputs.
#[derive(Clone, Debug)]
pub enum CatalogAction {
    /// Read all spots
    RefreshSpots,
    /// Read all bookings
    RefreshBookings,
    /// A spots read finished
    SpotsLoaded(Result<CollectionSnapshot<Spot>, MarketError>),
    /// A bookings read finished
    BookingsLoaded(Result<CollectionSnapshot<Booking>, MarketError>),
    /// The ledger emitted an event
    LedgerNotified(LedgerEvent),
}

/// Dependencies of [`CatalogReducer`].
#[derive(Clone)]
pub struct CatalogEnvironment {
    /// Ledger to read from
    pub ledger: Arc<dyn Ledger>,
}

/// Reducer for [`CatalogState`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CatalogReducer;

impl Reducer for CatalogReducer {
    type State = CatalogState;
    type Action = CatalogAction;
    type Environment = CatalogEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            CatalogAction::RefreshSpots => {
                if !state.spots.begin() {
                    return smallvec![Effect::None];
                }
                let ledger = Arc::clone(&env.ledger);
                smallvec![Effect::future(async move {
                    Some(CatalogAction::SpotsLoaded(
                        collection::read_all(&Spots(&*ledger)).await,
                    ))
                })]
            },
            CatalogAction::RefreshBookings => {
                if !state.bookings.begin() {
                    return smallvec![Effect::None];
                }
                let ledger = Arc::clone(&env.ledger);
                smallvec![Effect::future(async move {
                    Some(CatalogAction::BookingsLoaded(
                        collection::read_all(&Bookings(&*ledger)).await,
                    ))
                })]
            },
            CatalogAction::SpotsLoaded(result) => {
                state.spots.finish("spots", result);
                smallvec![Effect::None]
            },
            CatalogAction::BookingsLoaded(result) => {
                state.bookings.finish("bookings", result);
                smallvec![Effect::None]
            },
            CatalogAction::LedgerNotified(event) => {
                match event {
                    LedgerEvent::SpotCreated { .. } | LedgerEvent::SpotUpdated { .. } => {
                        state.spots.mark_stale();
                    },
                    LedgerEvent::BookingCreated { .. }
                    | LedgerEvent::CheckedIn { .. }
                    | LedgerEvent::CheckedOut { .. } => state.bookings.mark_stale(),
                    LedgerEvent::OwnershipTransferStarted { .. }
                    | LedgerEvent::OwnershipTransferred { .. } => {},
                }
                smallvec![Effect::None]
            },
        }
    }
}
