//! End-to-end host and renter flows against the in-memory ledger

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use parkmarket_client::{
    ActionKey, ClientSettings, CollectionState, CountChange, MarketplaceClient, Timeouts, TxPhase,
};
use parkmarket_core::commitment::Secret;
use parkmarket_core::environment::Clock;
use parkmarket_core::{
    Address, BookingId, BookingStatus, Caller, Commitment, LedgerCall, MarketError, ScanAction,
    SpotId, Units, payload,
};
use parkmarket_testing::{InMemoryLedger, ManualClock, test_clock};
use std::sync::Arc;
use std::time::Duration;

const HOST: Address = Address::from_bytes([0x11; 20]);
const RENTER: Address = Address::from_bytes([0x22; 20]);

struct Market {
    ledger: InMemoryLedger,
    clock: ManualClock,
    host: MarketplaceClient,
    renter: MarketplaceClient,
}

fn market_with(timeouts: Timeouts) -> Market {
    let clock = ManualClock::starting_at(test_clock().now());
    let ledger = InMemoryLedger::new(clock.clone());
    let settings = ClientSettings {
        timeouts,
        clock: Arc::new(clock.clone()),
        ..ClientSettings::default()
    };
    let anonymous = MarketplaceClient::new(Arc::new(ledger.clone()), settings);
    Market {
        host: anonymous.with_identity(Caller::new(HOST)),
        renter: anonymous.with_identity(Caller::new(RENTER)),
        ledger,
        clock,
    }
}

fn market() -> Market {
    market_with(Timeouts::default())
}

fn scanned(secret: &str) -> String {
    payload::encode(&Secret::new(secret.into())).unwrap()
}

async fn listed_spot(ledger: &InMemoryLedger, secret: &str, rate: u128) -> SpotId {
    ledger
        .execute(
            Caller::new(HOST),
            LedgerCall::CreateSpot {
                rate_per_hour: Units::new(rate),
                commitment: Commitment::of(&Secret::new(secret.into())),
            },
        )
        .await
        .unwrap()
        .created_spot_id()
        .unwrap()
}

#[tokio::test]
async fn stay_is_billed_by_started_hour() {
    let m = market();
    let spot = listed_spot(&m.ledger, "abc123", 1_000).await;

    let booking = m.renter.reserve(spot, 3).await.unwrap();
    assert_eq!(m.ledger.escrow(), Units::new(3_000));

    let err = m.renter.check_in(booking, &scanned("wrong")).await.unwrap_err();
    assert!(matches!(err, MarketError::AuthenticationFailed { .. }));
    assert_eq!(m.ledger.booking_now(booking).unwrap().status, BookingStatus::Reserved);

    m.renter.check_in(booking, &scanned("abc123")).await.unwrap();
    assert_eq!(m.ledger.booking_now(booking).unwrap().status, BookingStatus::CheckedIn);

    m.clock.advance(chrono::Duration::hours(2));
    let amounts = m.renter.check_out(booking, &scanned("abc123")).await.unwrap();

    assert_eq!(amounts.cost, Units::new(2_000));
    assert_eq!(amounts.refund, Units::new(1_000));
    assert_eq!(m.ledger.balance_of(&RENTER), Units::new(1_000));
    assert_eq!(m.ledger.balance_of(&HOST), Units::new(1_950));
    assert_eq!(m.ledger.escrow(), Units::ZERO);
    assert_eq!(m.ledger.booking_now(booking).unwrap().status, BookingStatus::Completed);

    let again = m.renter.check_out(booking, &scanned("abc123")).await.unwrap_err();
    assert!(matches!(
        again,
        MarketError::InvalidState {
            status: BookingStatus::Completed,
            ..
        }
    ));
}

#[tokio::test]
async fn overstay_is_capped_at_the_deposit() {
    let m = market();
    let spot = listed_spot(&m.ledger, "abc123", 1_000).await;
    let booking = m.renter.reserve(spot, 3).await.unwrap();
    m.renter.check_in(booking, &scanned("abc123")).await.unwrap();

    m.clock.advance(chrono::Duration::hours(10));
    let amounts = m.renter.check_out(booking, &scanned("abc123")).await.unwrap();

    assert_eq!(amounts.cost, Units::new(3_000));
    assert_eq!(amounts.refund, Units::ZERO);
}

#[tokio::test]
async fn cancel_before_check_in_refunds_everything() {
    let m = market();
    let spot = listed_spot(&m.ledger, "abc123", 1_000).await;
    let booking = m.renter.reserve(spot, 2).await.unwrap();

    m.renter.cancel(booking).await.unwrap();

    assert_eq!(m.ledger.balance_of(&RENTER), Units::new(2_000));
    assert_eq!(m.ledger.booking_now(booking).unwrap().status, BookingStatus::Cancelled);

    let err = m.renter.check_in(booking, &scanned("abc123")).await.unwrap_err();
    assert!(matches!(
        err,
        MarketError::InvalidState {
            status: BookingStatus::Cancelled,
            ..
        }
    ));
}

#[tokio::test]
async fn only_the_renter_may_cancel() {
    let m = market();
    let spot = listed_spot(&m.ledger, "abc123", 1_000).await;
    let booking = m.renter.reserve(spot, 2).await.unwrap();

    let err = m.host.cancel(booking).await.unwrap_err();

    assert!(matches!(err, MarketError::Unauthorized { .. }));
    assert_eq!(m.ledger.escrow(), Units::new(2_000));
}

#[tokio::test]
async fn owner_cannot_book_own_spot() {
    let m = market();
    let spot = listed_spot(&m.ledger, "abc123", 1_000).await;

    let err = m.host.reserve(spot, 2).await.unwrap_err();

    assert!(matches!(err, MarketError::Unauthorized { caller, .. } if caller == HOST));
    assert_eq!(m.ledger.escrow(), Units::ZERO);
}

#[tokio::test]
async fn created_spot_payload_drives_both_scans() {
    let m = market();
    let created = m.host.create_spot(Units::new(500)).await.unwrap();
    assert_eq!(created.spot_id, SpotId::new(0));

    let booking = m.renter.reserve(created.spot_id, 4).await.unwrap();
    assert_eq!(booking, BookingId::new(0));

    assert_eq!(
        m.renter.scan(booking, &created.payload).await.unwrap(),
        ScanAction::CheckIn
    );

    m.clock.advance(chrono::Duration::minutes(90));
    let quote = m.renter.quote(booking).await.unwrap().unwrap();
    assert_eq!(quote.billable_hours, 2);
    assert_eq!(quote.cost, Units::new(1_000));

    assert_eq!(
        m.renter.scan(booking, &created.payload).await.unwrap(),
        ScanAction::CheckOut
    );
    assert!(matches!(
        m.renter.scan(booking, &created.payload).await.unwrap_err(),
        MarketError::InvalidState { .. }
    ));
}

#[tokio::test]
async fn rotated_secret_replaces_the_old_one() {
    let m = market();
    let spot = listed_spot(&m.ledger, "old", 1_000).await;
    let booking = m.renter.reserve(spot, 2).await.unwrap();

    let current = m.ledger.spot_now(spot).unwrap();
    let update = parkmarket_core::SpotUpdate::from_current(&current)
        .with_commitment(Commitment::of(&Secret::new("new".into())));
    m.host.update_spot(spot, update).await.unwrap();

    let err = m.renter.check_in(booking, &scanned("old")).await.unwrap_err();
    assert!(matches!(err, MarketError::AuthenticationFailed { .. }));
    m.renter.check_in(booking, &scanned("new")).await.unwrap();
}

#[tokio::test]
async fn concurrent_check_ins_are_single_flight() {
    let m = market();
    let spot = listed_spot(&m.ledger, "abc123", 1_000).await;
    let booking = m.renter.reserve(spot, 1).await.unwrap();
    m.ledger.delay_signatures(Duration::from_millis(200));

    let payload = scanned("abc123");
    let (first, second) = tokio::join!(
        m.renter.check_in(booking, &payload),
        m.renter.check_in(booking, &payload)
    );

    let (ok, rejected) = match (first, second) {
        (Ok(receipt), Err(err)) | (Err(err), Ok(receipt)) => (receipt, err),
        other => panic!("expected exactly one submission, got {other:?}"),
    };
    assert!(!ok.events.is_empty());
    assert!(matches!(rejected, MarketError::SubmissionRejected { .. }));
    assert_eq!(m.ledger.booking_now(booking).unwrap().status, BookingStatus::CheckedIn);
}

#[tokio::test]
async fn declined_signature_frees_the_key() {
    let m = market();
    let spot = listed_spot(&m.ledger, "abc123", 1_000).await;
    let booking = m.renter.reserve(spot, 1).await.unwrap();
    m.ledger.decline_signatures_from(RENTER);

    let err = m.renter.check_in(booking, &scanned("abc123")).await.unwrap_err();

    assert!(matches!(err, MarketError::SignatureDeclined { .. }));
    assert_eq!(
        m.renter.transaction_phase(ActionKey::Booking(booking)).await,
        TxPhase::Idle
    );
    assert_eq!(m.ledger.booking_now(booking).unwrap().status, BookingStatus::Reserved);
}

#[tokio::test]
async fn confirmation_timeout_does_not_retract_the_call() {
    let m = market_with(Timeouts {
        signature: Duration::from_secs(5),
        confirmation: Duration::from_millis(50),
    });
    let spot = listed_spot(&m.ledger, "abc123", 1_000).await;
    let booking = m.renter.reserve(spot, 1).await.unwrap();
    m.ledger.delay_confirmations(Duration::from_millis(300));

    let err = m.renter.check_in(booking, &scanned("abc123")).await.unwrap_err();
    assert!(matches!(err, MarketError::Timeout { .. }));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(m.ledger.booking_now(booking).unwrap().status, BookingStatus::CheckedIn);
}

#[tokio::test]
async fn unconfirmed_creation_hands_back_a_working_payload() {
    let m = market_with(Timeouts {
        signature: Duration::from_secs(5),
        confirmation: Duration::from_millis(50),
    });
    m.ledger.delay_confirmations(Duration::from_millis(300));

    let err = m.host.create_spot(Units::new(1_000)).await.unwrap_err();
    assert!(matches!(err.error, MarketError::Timeout { .. }));
    let pending = err.unconfirmed.expect("timed out creation keeps its credential");

    tokio::time::sleep(Duration::from_millis(500)).await;
    let spot = m.ledger.spot_now(SpotId::new(0)).unwrap();
    assert_eq!(spot.commitment, Commitment::of(&pending.secret));

    let booking = m.renter.reserve(spot.id, 1).await.unwrap();
    m.renter.check_in(booking, &pending.payload).await.unwrap();
    assert_eq!(m.ledger.booking_now(booking).unwrap().status, BookingStatus::CheckedIn);
}

#[tokio::test]
async fn rejected_creation_has_no_credential() {
    let m = market();
    m.ledger.decline_signatures_from(HOST);

    let err = m.host.create_spot(Units::new(1_000)).await.unwrap_err();

    assert!(matches!(err.error, MarketError::SignatureDeclined { .. }));
    assert!(err.unconfirmed.is_none());
}

#[tokio::test]
async fn dropped_wait_does_not_block_the_next_creation() {
    let m = market();
    m.ledger.delay_confirmations(Duration::from_millis(100));

    let dropped =
        tokio::time::timeout(Duration::from_millis(20), m.host.create_spot(Units::new(1_000)))
            .await;
    assert!(dropped.is_err());
    tokio::time::sleep(Duration::from_millis(300)).await;

    let created = m.host.create_spot(Units::new(1_000)).await.unwrap();
    assert_eq!(created.spot_id, SpotId::new(1));
    assert_eq!(m.host.transaction_phase(ActionKey::CreateSpot).await, TxPhase::Idle);
}

#[tokio::test]
async fn malformed_payload_never_reaches_the_ledger() {
    let m = market();
    let spot = listed_spot(&m.ledger, "abc123", 1_000).await;
    let booking = m.renter.reserve(spot, 1).await.unwrap();
    m.ledger.decline_signatures_from(RENTER);

    let err = m.renter.check_in(booking, "not a payload").await.unwrap_err();

    assert!(matches!(err, MarketError::MalformedPayload { .. }));
}

#[tokio::test]
async fn failed_point_read_is_isolated() {
    let m = market();
    for i in 0..5u8 {
        listed_spot(&m.ledger, &format!("secret-{i}"), 1_000).await;
    }
    m.ledger.fail_spot_read(2);

    let state = m.renter.refresh_spots().await.unwrap();
    let snapshot = state.snapshot().unwrap();

    assert_eq!(snapshot.count(), 5);
    assert_eq!(snapshot.failed_count(), 1);
    let indices: Vec<u64> = snapshot.active_spots().into_iter().map(|(i, _)| i).collect();
    assert_eq!(indices, vec![0, 1, 3, 4]);
    assert_eq!(snapshot.get(3).unwrap().item().unwrap().id, SpotId::new(3));
}

#[tokio::test]
async fn slow_point_reads_overlap_and_keep_index_order() {
    let m = market();
    for i in 0..5u8 {
        listed_spot(&m.ledger, &format!("secret-{i}"), 1_000).await;
    }
    m.ledger.delay_read(0, Duration::from_millis(200));
    m.ledger.delay_read(3, Duration::from_millis(150));

    let started = std::time::Instant::now();
    let state = m.renter.refresh_spots().await.unwrap();
    let elapsed = started.elapsed();

    let snapshot = state.snapshot().unwrap();
    let indices: Vec<u64> = snapshot.entries().iter().map(|e| e.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    let ids: Vec<SpotId> = snapshot.available().map(|(_, spot)| spot.id).collect();
    assert_eq!(ids, (0..5).map(SpotId::new).collect::<Vec<_>>());
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(340), "reads ran one after another: {elapsed:?}");
}

#[tokio::test]
async fn refresh_reports_appends() {
    let m = market();
    listed_spot(&m.ledger, "a", 1_000).await;
    listed_spot(&m.ledger, "b", 1_000).await;
    m.renter.refresh_spots().await.unwrap();

    listed_spot(&m.ledger, "c", 1_000).await;
    let state = m.renter.refresh_spots().await.unwrap();

    match state {
        CollectionState::Loaded { change, snapshot, .. } => {
            assert_eq!(change, CountChange::Appended(2..3));
            assert_eq!(snapshot.count(), 3);
        },
        other => panic!("expected loaded spots, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_catalog_is_distinguished_from_failure() {
    let m = market();
    assert!(m.renter.refresh_bookings().await.unwrap().is_confirmed_empty());

    m.ledger.fail_counts(true);
    let state = m.renter.refresh_bookings().await.unwrap();
    assert!(matches!(state, CollectionState::Failed { .. }));
    assert!(!state.is_confirmed_empty());
}

#[tokio::test]
async fn my_bookings_filters_by_identity() {
    let m = market();
    let spot = listed_spot(&m.ledger, "abc123", 1_000).await;
    let other = Caller::new(Address::from_bytes([0x33; 20]));
    m.ledger
        .execute(
            other,
            LedgerCall::BookSpot {
                spot_id: spot,
                max_hours: 1,
                deposit: Units::new(1_000),
            },
        )
        .await
        .unwrap();
    let mine = m.renter.reserve(spot, 2).await.unwrap();

    m.renter.refresh_bookings().await.unwrap();
    let bookings = m.renter.my_bookings().await.unwrap();

    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].id, mine);
}

#[tokio::test]
async fn ledger_notifications_mark_views_stale() {
    let m = market();
    listed_spot(&m.ledger, "a", 1_000).await;
    m.renter.refresh_spots().await.unwrap();
    let watcher = m.renter.watch_ledger().unwrap();

    listed_spot(&m.ledger, "b", 1_000).await;

    let stale = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if m.renter.catalog().await.spots.is_stale() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(stale.is_ok());
    watcher.abort();
}
