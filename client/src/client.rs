//! High-level marketplace operations.
//!
//! [`MarketplaceClient`] is what an application drives: it validates what
//! can be validated locally, routes every mutating call through the
//! [`TransactionTracker`], and keeps the catalog views in a store.

use crate::catalog::{
    CatalogAction, CatalogEnvironment, CatalogReducer, CatalogState, CollectionState,
};
use crate::transaction::{
    ActionKey, Timeouts, TransactionEnvironment, TransactionTracker, TxPhase,
};
use parkmarket_core::environment::{Clock, SystemClock};
use parkmarket_core::ledger::CheckoutAmounts;
use parkmarket_core::{
    Booking, BookingId, BookingPolicy, Caller, Ledger, LedgerCall, MarketError, Operation,
    Receipt, ScanAction, Secret, Settlement, Spot, SpotId, SpotUpdate, Units, commitment,
    payload,
};
use parkmarket_runtime::{Store, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

type CatalogStore = Store<CatalogState, CatalogAction, CatalogEnvironment, CatalogReducer>;

/// A spot created by [`MarketplaceClient::create_spot`].
#[derive(Clone, Debug)]
pub struct CreatedSpot {
    /// The new spot
    pub spot_id: SpotId,
    /// The secret whose commitment the spot holds
    pub secret: Secret,
    /// Scannable payload carrying the secret
    pub payload: String,
}

/// Credential of a spot creation that was submitted but never confirmed.
///
/// The call may still land, and the spot it creates only opens with this
/// secret. Hold on to the payload until the spot shows up in the catalog.
#[derive(Clone, Debug)]
pub struct UnconfirmedSpot {
    /// The secret whose commitment was submitted
    pub secret: Secret,
    /// Scannable payload carrying the secret
    pub payload: String,
}

/// Why [`MarketplaceClient::create_spot`] returned no spot.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{error}")]
pub struct CreateSpotError {
    /// What went wrong
    pub error: MarketError,
    /// Set when the creation may still confirm
    pub unconfirmed: Option<UnconfirmedSpot>,
}

impl From<MarketError> for CreateSpotError {
    fn from(error: MarketError) -> Self {
        Self {
            error,
            unconfirmed: None,
        }
    }
}

/// Settings for a [`MarketplaceClient`].
#[derive(Clone)]
pub struct ClientSettings {
    /// Transaction wait bounds
    pub timeouts: Timeouts,
    /// Clock for durations and quotes
    pub clock: Arc<dyn Clock>,
    /// Local reservation checks
    pub policy: BookingPolicy,
    /// Upper bound on a catalog refresh
    pub refresh_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            clock: Arc::new(SystemClock),
            policy: BookingPolicy::default(),
            refresh_timeout: Duration::from_secs(30),
        }
    }
}

/// Entry point for marketplace operations.
///
/// Cheap to clone; clones share the catalog and the transaction tracker.
#[derive(Clone)]
pub struct MarketplaceClient {
    ledger: Arc<dyn Ledger>,
    identity: Option<Caller>,
    catalog: CatalogStore,
    transactions: TransactionTracker,
    settings: ClientSettings,
}

fn store_error(error: StoreError) -> MarketError {
    match error {
        StoreError::Timeout => MarketError::Timeout {
            phase: "refreshing".into(),
        },
        other => MarketError::Transport(other.to_string()),
    }
}

impl MarketplaceClient {
    /// Creates a read-only client. Use [`MarketplaceClient::with_identity`]
    /// before any mutating call.
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>, settings: ClientSettings) -> Self {
        let catalog = Store::new(
            CatalogState::default(),
            CatalogReducer,
            CatalogEnvironment {
                ledger: Arc::clone(&ledger),
            },
        );
        let transactions = TransactionTracker::new(TransactionEnvironment {
            ledger: Arc::clone(&ledger),
            clock: Arc::clone(&settings.clock),
            timeouts: settings.timeouts,
        });
        Self {
            ledger,
            identity: None,
            catalog,
            transactions,
            settings,
        }
    }

    /// A client acting as `caller`, sharing this client's state.
    #[must_use]
    pub fn with_identity(&self, caller: Caller) -> Self {
        Self {
            identity: Some(caller),
            ..self.clone()
        }
    }

    /// The identity mutating calls are signed as
    #[must_use]
    pub const fn identity(&self) -> Option<Caller> {
        self.identity
    }

    fn caller(&self) -> Result<Caller, MarketError> {
        self.identity.ok_or(MarketError::MissingIdentity)
    }

    async fn read_spot(&self, id: SpotId) -> Result<Spot, MarketError> {
        self.ledger
            .spot(id)
            .await?
            .ok_or(MarketError::spot_not_found(id))
    }

    async fn read_booking(&self, id: BookingId) -> Result<Booking, MarketError> {
        self.ledger
            .booking(id)
            .await?
            .ok_or(MarketError::booking_not_found(id))
    }

    /// Creates a spot at `rate_per_hour` with a freshly generated secret.
    ///
    /// # Errors
    ///
    /// [`MarketError::MissingIdentity`] without an identity, otherwise
    /// whatever the transaction fails with. When the wait ends before the
    /// ledger settled the call ([`MarketError::Timeout`],
    /// [`MarketError::Abandoned`] or a transport failure), the error hands
    /// back the credential as [`CreateSpotError::unconfirmed`].
    #[tracing::instrument(skip(self))]
    pub async fn create_spot(&self, rate_per_hour: Units) -> Result<CreatedSpot, CreateSpotError> {
        let caller = self.caller()?;
        let (secret, commitment) = commitment::commit();
        let payload = payload::encode(&secret)?;

        let receipt = match self
            .transactions
            .track(
                caller,
                LedgerCall::CreateSpot {
                    rate_per_hour,
                    commitment,
                },
            )
            .await
        {
            Ok(receipt) => receipt,
            Err(
                error @ (MarketError::Timeout { .. }
                | MarketError::Abandoned { .. }
                | MarketError::Transport(_)),
            ) => {
                tracing::warn!(%error, "Spot creation unsettled; returning its credential");
                return Err(CreateSpotError {
                    error,
                    unconfirmed: Some(UnconfirmedSpot { secret, payload }),
                });
            },
            Err(error) => return Err(error.into()),
        };
        let spot_id = receipt.created_spot_id().ok_or_else(|| {
            MarketError::ProtocolViolation("createSpot confirmed without SpotCreated".into())
        })?;

        tracing::info!(%spot_id, "Spot created");
        Ok(CreatedSpot {
            spot_id,
            secret,
            payload,
        })
    }

    /// Overwrites a spot's rate, active flag and commitment.
    ///
    /// Build `update` from [`SpotUpdate::from_current`] to change only some
    /// fields.
    ///
    /// # Errors
    ///
    /// [`MarketError::MissingIdentity`], or the ledger's rejection.
    #[tracing::instrument(skip(self, update))]
    pub async fn update_spot(
        &self,
        spot_id: SpotId,
        update: SpotUpdate,
    ) -> Result<Receipt, MarketError> {
        let caller = self.caller()?;
        self.transactions
            .track(caller, LedgerCall::UpdateSpot { spot_id, update })
            .await
    }

    /// Reserves `spot_id` for up to `max_hours`, attaching the deposit.
    ///
    /// # Errors
    ///
    /// Local: [`MarketError::MissingIdentity`],
    /// [`MarketError::InvalidMaxHours`], [`MarketError::NotFound`],
    /// [`MarketError::SpotInactive`], and [`MarketError::Unauthorized`] for
    /// the spot's own owner. Otherwise the ledger's rejection.
    #[tracing::instrument(skip(self))]
    pub async fn reserve(&self, spot_id: SpotId, max_hours: u32) -> Result<BookingId, MarketError> {
        let caller = self.caller()?;
        self.settings.policy.check_max_hours(max_hours)?;

        let spot = self.read_spot(spot_id).await?;
        if caller.is(&spot.owner) {
            return Err(MarketError::Unauthorized {
                caller: caller.identity,
                operation: Operation::Reserve,
            });
        }
        if !spot.active {
            return Err(MarketError::SpotInactive { spot_id });
        }
        let deposit = self
            .settings
            .policy
            .required_deposit(spot.rate_per_hour, max_hours)?;

        let receipt = self
            .transactions
            .track(
                caller,
                LedgerCall::BookSpot {
                    spot_id,
                    max_hours,
                    deposit,
                },
            )
            .await?;
        receipt.created_booking_id().ok_or_else(|| {
            MarketError::ProtocolViolation("bookSpot confirmed without BookingCreated".into())
        })
    }

    /// Checks in with a scanned payload.
    ///
    /// # Errors
    ///
    /// [`MarketError::MalformedPayload`] before contacting the ledger,
    /// otherwise the ledger's rejection.
    #[tracing::instrument(skip(self, scanned))]
    pub async fn check_in(&self, booking_id: BookingId, scanned: &str) -> Result<Receipt, MarketError> {
        let caller = self.caller()?;
        let secret = payload::decode(scanned)?;
        self.transactions
            .track(caller, LedgerCall::CheckIn { booking_id, secret })
            .await
    }

    /// Checks out with a scanned payload and returns what was settled.
    ///
    /// # Errors
    ///
    /// [`MarketError::MalformedPayload`] before contacting the ledger,
    /// otherwise the ledger's rejection.
    #[tracing::instrument(skip(self, scanned))]
    pub async fn check_out(
        &self,
        booking_id: BookingId,
        scanned: &str,
    ) -> Result<CheckoutAmounts, MarketError> {
        let caller = self.caller()?;
        let secret = payload::decode(scanned)?;
        let receipt = self
            .transactions
            .track(caller, LedgerCall::CheckOut { booking_id, secret })
            .await?;
        receipt.checkout().ok_or_else(|| {
            MarketError::ProtocolViolation("checkOut confirmed without CheckedOut".into())
        })
    }

    /// Routes a scan to check-in or check-out by the booking's status.
    ///
    /// # Errors
    ///
    /// [`MarketError::InvalidState`] for a finished booking, otherwise as
    /// [`MarketplaceClient::check_in`] and [`MarketplaceClient::check_out`].
    pub async fn scan(&self, booking_id: BookingId, scanned: &str) -> Result<ScanAction, MarketError> {
        let booking = self.read_booking(booking_id).await?;
        match booking.status.next_scan_action() {
            Some(ScanAction::CheckIn) => {
                self.check_in(booking_id, scanned).await?;
                Ok(ScanAction::CheckIn)
            },
            Some(ScanAction::CheckOut) => {
                self.check_out(booking_id, scanned).await?;
                Ok(ScanAction::CheckOut)
            },
            None => Err(MarketError::InvalidState {
                booking_id,
                status: booking.status,
                operation: Operation::CheckIn,
            }),
        }
    }

    /// Withdraws a reservation before check-in.
    ///
    /// # Errors
    ///
    /// [`MarketError::MissingIdentity`], or the ledger's rejection.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, booking_id: BookingId) -> Result<Receipt, MarketError> {
        let caller = self.caller()?;
        self.transactions
            .track(caller, LedgerCall::CancelBeforeCheckIn { booking_id })
            .await
    }

    /// What checking out of `booking_id` now would settle.
    ///
    /// # Errors
    ///
    /// Read failures; `Ok(None)` unless the booking is checked in.
    pub async fn quote(&self, booking_id: BookingId) -> Result<Option<Settlement>, MarketError> {
        let booking = self.read_booking(booking_id).await?;
        let fees = self.ledger.fee_schedule().await?;
        Ok(booking.projected_settlement(
            self.settings.clock.now(),
            &fees,
            &self.settings.policy,
        ))
    }

    /// Reloads all spots and returns the resulting state.
    ///
    /// # Errors
    ///
    /// [`MarketError::Timeout`] if the read does not finish within the
    /// configured bound. A failed read is reported inside the state.
    pub async fn refresh_spots(&self) -> Result<CollectionState<Spot>, MarketError> {
        self.refresh(CatalogAction::RefreshSpots, |a| {
            matches!(a, CatalogAction::SpotsLoaded(_))
        })
        .await?;
        Ok(self.catalog.state(|s| s.spots.clone()).await)
    }

    /// Reloads all bookings and returns the resulting state.
    ///
    /// # Errors
    ///
    /// As [`MarketplaceClient::refresh_spots`].
    pub async fn refresh_bookings(&self) -> Result<CollectionState<Booking>, MarketError> {
        self.refresh(CatalogAction::RefreshBookings, |a| {
            matches!(a, CatalogAction::BookingsLoaded(_))
        })
        .await?;
        Ok(self.catalog.state(|s| s.bookings.clone()).await)
    }

    /// A refresh requested while one is in flight is ignored by the
    /// reducer, so the waiter picks up the completion of the running read.
    async fn refresh<F>(&self, action: CatalogAction, done: F) -> Result<(), MarketError>
    where
        F: Fn(&CatalogAction) -> bool,
    {
        self.catalog
            .send_and_wait_for(action, done, self.settings.refresh_timeout)
            .await
            .map(|_| ())
            .map_err(store_error)
    }

    /// The current catalog, without reading the ledger.
    pub async fn catalog(&self) -> CatalogState {
        self.catalog.state(Clone::clone).await
    }

    /// Bookings of this client's identity from the last bookings read.
    ///
    /// # Errors
    ///
    /// [`MarketError::MissingIdentity`] without an identity.
    pub async fn my_bookings(&self) -> Result<Vec<Booking>, MarketError> {
        let renter = self.caller()?.identity;
        Ok(self
            .catalog
            .state(|s| {
                s.bookings
                    .snapshot()
                    .map(|snapshot| {
                        snapshot
                            .bookings_for(&renter)
                            .into_iter()
                            .map(|(_, booking)| booking.clone())
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .await)
    }

    /// Phase of the attempt under `key`.
    pub async fn transaction_phase(&self, key: ActionKey) -> TxPhase {
        self.transactions.phase(key).await
    }

    /// Stops waiting for the attempt under `key`.
    pub async fn abandon(&self, key: ActionKey) {
        self.transactions.abandon(key).await;
    }

    /// Forwards ledger notifications into the catalog so views are marked
    /// stale. `None` if the ledger does not push notifications.
    #[must_use]
    pub fn watch_ledger(&self) -> Option<JoinHandle<()>> {
        let mut events = self.ledger.subscribe_events()?;
        let catalog = self.catalog.clone();
        Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if catalog.send(CatalogAction::LedgerNotified(event)).await.is_err() {
                            break;
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Ledger notifications lagged");
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }

    /// Stops both stores, waiting up to `timeout` for running effects.
    ///
    /// # Errors
    ///
    /// [`StoreError::ShutdownTimeout`] if effects are still running.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
        self.transactions.shutdown(timeout).await?;
        self.catalog.shutdown(timeout).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parkmarket_core::Address;
    use parkmarket_testing::{InMemoryLedger, test_clock};

    fn client() -> MarketplaceClient {
        MarketplaceClient::new(
            Arc::new(InMemoryLedger::new(test_clock())),
            ClientSettings::default(),
        )
    }

    #[tokio::test]
    async fn mutations_need_an_identity() {
        assert_eq!(
            client().create_spot(Units::new(1)).await.unwrap_err().error,
            MarketError::MissingIdentity
        );
    }

    #[tokio::test]
    async fn bad_hours_are_rejected_locally() {
        let client = client().with_identity(Caller::new(Address::from_bytes([2; 20])));
        let err = client.reserve(SpotId::new(0), 0).await.unwrap_err();
        assert!(matches!(err, MarketError::InvalidMaxHours { requested: 0, .. }));
        let err = client.reserve(SpotId::new(0), 73).await.unwrap_err();
        assert!(matches!(err, MarketError::InvalidMaxHours { requested: 73, .. }));
    }

    #[tokio::test]
    async fn malformed_payload_never_reaches_the_ledger() {
        let client = client().with_identity(Caller::new(Address::from_bytes([2; 20])));
        let err = client.check_in(BookingId::new(0), "not json").await.unwrap_err();
        assert!(matches!(err, MarketError::MalformedPayload { .. }));
        assert_eq!(
            client.transaction_phase(ActionKey::Booking(BookingId::new(0))).await,
            TxPhase::Idle
        );
    }
}
