//! A reference ledger kept in memory.
//!
//! Submissions are queued at `submit` and executed at `confirm`, one at a
//! time under a lock, using the same lifecycle rules the deployed ledger
//! enforces. Two submissions racing for the same booking are therefore
//! serialized here exactly as they would be on the ledger: the second one
//! sees the first one's effect.
//!
//! Faults can be injected per read index, per count, per signer, and as
//! latency, so collection readers and transaction trackers can be tested
//! against partial failure and arbitrary completion order.

use parkmarket_core::booking::BookingPolicy;
use parkmarket_core::environment::Clock;
use parkmarket_core::ledger::{LedgerFuture, LedgerReader, LedgerWriter};
use parkmarket_core::{
    Address, Booking, BookingId, Caller, Commitment, FeeSchedule, LedgerCall, LedgerEvent,
    MarketError, Receipt, Spot, SpotId, TxHash, Units,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

/// Default fee recipient used by [`InMemoryLedger::new`].
pub const DEFAULT_FEE_RECIPIENT: Address = Address::from_bytes([0xfe; 20]);

/// Default fee used by [`InMemoryLedger::new`], in basis points.
pub const DEFAULT_FEE_BPS: u16 = 250;

#[derive(Default)]
struct Faults {
    failing_spot_reads: HashSet<u64>,
    failing_booking_reads: HashSet<u64>,
    read_delays: HashMap<u64, Duration>,
    failing_counts: bool,
    declining_signers: HashSet<Address>,
    signature_delay: Option<Duration>,
    confirmation_delay: Option<Duration>,
}

struct Pending {
    caller: Caller,
    call: LedgerCall,
}

struct LedgerState {
    spots: Vec<Spot>,
    bookings: Vec<Booking>,
    fees: FeeSchedule,
    balances: HashMap<Address, Units>,
    escrow: Units,
    pending: HashMap<TxHash, Pending>,
    next_tx: u64,
    faults: Faults,
}

impl LedgerState {
    fn empty(fees: FeeSchedule) -> Self {
        Self {
            spots: Vec::new(),
            bookings: Vec::new(),
            fees,
            balances: HashMap::new(),
            escrow: Units::ZERO,
            pending: HashMap::new(),
            next_tx: 0,
            faults: Faults::default(),
        }
    }
}

/// In-memory ledger with fault injection.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct InMemoryLedger {
    state: Arc<Mutex<LedgerState>>,
    clock: Arc<dyn Clock>,
    policy: BookingPolicy,
    events: broadcast::Sender<LedgerEvent>,
}

impl std::fmt::Debug for InMemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("InMemoryLedger")
            .field("spots", &state.spots.len())
            .field("bookings", &state.bookings.len())
            .field("pending", &state.pending.len())
            .finish_non_exhaustive()
    }
}

impl InMemoryLedger {
    /// Creates an empty ledger with the default fee schedule.
    #[must_use]
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self::with_fee_schedule(
            clock,
            FeeSchedule {
                fee_bps: DEFAULT_FEE_BPS,
                fee_recipient: DEFAULT_FEE_RECIPIENT,
            },
        )
    }

    /// Creates an empty ledger with an explicit fee schedule.
    #[must_use]
    pub fn with_fee_schedule(clock: impl Clock + 'static, fees: FeeSchedule) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Arc::new(Mutex::new(LedgerState::empty(fees))),
            clock: Arc::new(clock),
            policy: BookingPolicy::default(),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submits and confirms in one step.
    ///
    /// # Errors
    ///
    /// Whatever `submit` or `confirm` fail with.
    pub async fn execute(&self, caller: Caller, call: LedgerCall) -> Result<Receipt, MarketError> {
        let tx = self.submit(caller, call).await?;
        self.confirm(tx).await
    }

    /// Makes the point read of spot `index` fail.
    pub fn fail_spot_read(&self, index: u64) {
        self.lock().faults.failing_spot_reads.insert(index);
    }

    /// Makes the point read of booking `index` fail.
    pub fn fail_booking_read(&self, index: u64) {
        self.lock().faults.failing_booking_reads.insert(index);
    }

    /// Delays point reads of `index` (spots and bookings alike).
    pub fn delay_read(&self, index: u64, delay: Duration) {
        self.lock().faults.read_delays.insert(index, delay);
    }

    /// Makes both count reads fail.
    pub fn fail_counts(&self, failing: bool) {
        self.lock().faults.failing_counts = failing;
    }

    /// Clears all read faults.
    pub fn heal_reads(&self) {
        let mut state = self.lock();
        state.faults.failing_spot_reads.clear();
        state.faults.failing_booking_reads.clear();
        state.faults.read_delays.clear();
        state.faults.failing_counts = false;
    }

    /// Makes `signer` decline every signature request.
    pub fn decline_signatures_from(&self, signer: Address) {
        self.lock().faults.declining_signers.insert(signer);
    }

    /// Delays every signature.
    pub fn delay_signatures(&self, delay: Duration) {
        self.lock().faults.signature_delay = Some(delay);
    }

    /// Delays every confirmation.
    pub fn delay_confirmations(&self, delay: Duration) {
        self.lock().faults.confirmation_delay = Some(delay);
    }

    /// Balance credited to `address` by settlements and refunds.
    #[must_use]
    pub fn balance_of(&self, address: &Address) -> Units {
        self.lock()
            .balances
            .get(address)
            .copied()
            .unwrap_or(Units::ZERO)
    }

    /// Deposits currently held for open bookings.
    #[must_use]
    pub fn escrow(&self) -> Units {
        self.lock().escrow
    }

    /// Snapshot of a booking, bypassing read faults.
    #[must_use]
    pub fn booking_now(&self, id: BookingId) -> Option<Booking> {
        usize::try_from(id.index())
            .ok()
            .and_then(|i| self.lock().bookings.get(i).cloned())
    }

    /// Snapshot of a spot, bypassing read faults.
    #[must_use]
    pub fn spot_now(&self, id: SpotId) -> Option<Spot> {
        usize::try_from(id.index())
            .ok()
            .and_then(|i| self.lock().spots.get(i).cloned())
    }

    async fn read_latency(&self, index: u64) {
        let delay = self.lock().faults.read_delays.get(&index).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn count(&self, of: fn(&LedgerState) -> usize) -> Result<u64, MarketError> {
        let state = self.lock();
        if state.faults.failing_counts {
            return Err(MarketError::Transport("count read failed".to_string()));
        }
        u64::try_from(of(&state)).map_err(|e| MarketError::ProtocolViolation(e.to_string()))
    }

    fn credit(state: &mut LedgerState, to: Address, amount: Units) -> Result<(), MarketError> {
        let balance = state.balances.entry(to).or_insert(Units::ZERO);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| MarketError::overflow("balance"))?;
        Ok(())
    }

    fn release_escrow(state: &mut LedgerState, amount: Units) -> Result<(), MarketError> {
        state.escrow = state
            .escrow
            .checked_sub(amount)
            .ok_or_else(|| MarketError::overflow("escrow"))?;
        Ok(())
    }

    /// Applies a call to the ledger state. Validation happens before any
    /// mutation, so a rejected call leaves the state untouched.
    fn apply(
        &self,
        state: &mut LedgerState,
        caller: Caller,
        call: LedgerCall,
    ) -> Result<Vec<LedgerEvent>, MarketError> {
        let now = self.clock.now();
        match call {
            LedgerCall::CreateSpot {
                rate_per_hour,
                commitment,
            } => {
                let spot_id = SpotId::new(state.spots.len() as u64);
                state.spots.push(Spot::create(
                    spot_id,
                    caller.identity,
                    rate_per_hour,
                    commitment,
                ));
                Ok(vec![LedgerEvent::SpotCreated {
                    spot_id,
                    owner: caller.identity,
                    rate_per_hour,
                }])
            },
            LedgerCall::UpdateSpot { spot_id, update } => {
                let spot = spot_mut(state, spot_id)?;
                spot.apply_update(&caller, update)?;
                Ok(vec![LedgerEvent::SpotUpdated {
                    spot_id,
                    rate_per_hour: spot.rate_per_hour,
                    active: spot.active,
                }])
            },
            LedgerCall::BookSpot {
                spot_id,
                max_hours,
                deposit,
            } => {
                let booking_id = BookingId::new(state.bookings.len() as u64);
                let spot = spot_mut(state, spot_id)?;
                let booking =
                    Booking::reserve(booking_id, spot, &caller, max_hours, deposit, &self.policy)?;
                state.escrow = state
                    .escrow
                    .checked_add(deposit)
                    .ok_or_else(|| MarketError::overflow("escrow"))?;
                state.bookings.push(booking);
                Ok(vec![LedgerEvent::BookingCreated {
                    booking_id,
                    spot_id,
                    renter: caller.identity,
                    deposit,
                    max_hours,
                }])
            },
            LedgerCall::CheckIn { booking_id, secret } => {
                let commitment = commitment_for(state, booking_id)?;
                booking_mut(state, booking_id)?.check_in(&caller, &secret, &commitment, now)?;
                Ok(vec![LedgerEvent::CheckedIn {
                    booking_id,
                    at: now,
                }])
            },
            LedgerCall::CheckOut { booking_id, secret } => {
                let commitment = commitment_for(state, booking_id)?;
                let fees = state.fees;
                let mut staged = booking_mut(state, booking_id)?.clone();
                let settlement =
                    staged.check_out(&caller, &secret, &commitment, now, &fees, &self.policy)?;
                let host = spot_mut(state, staged.spot_id)?.owner;

                // Balance changes are applied to a copy and swapped in whole.
                let mut next = LedgerState {
                    balances: state.balances.clone(),
                    escrow: state.escrow,
                    ..LedgerState::empty(fees)
                };
                Self::release_escrow(&mut next, staged.deposit)?;
                Self::credit(&mut next, host, settlement.host_payout)?;
                Self::credit(&mut next, fees.fee_recipient, settlement.fee)?;
                Self::credit(&mut next, staged.renter, settlement.refund)?;
                state.balances = next.balances;
                state.escrow = next.escrow;
                *booking_mut(state, booking_id)? = staged;

                Ok(vec![LedgerEvent::CheckedOut {
                    booking_id,
                    at: now,
                    cost: settlement.cost,
                    host_paid: settlement.host_payout,
                    refund: settlement.refund,
                }])
            },
            LedgerCall::CancelBeforeCheckIn { booking_id } => {
                let mut staged = booking_mut(state, booking_id)?.clone();
                let settlement = staged.cancel(&caller)?;

                let mut next = LedgerState {
                    balances: state.balances.clone(),
                    escrow: state.escrow,
                    ..LedgerState::empty(state.fees)
                };
                Self::release_escrow(&mut next, settlement.refund)?;
                Self::credit(&mut next, staged.renter, settlement.refund)?;
                state.balances = next.balances;
                state.escrow = next.escrow;
                *booking_mut(state, booking_id)? = staged;
                Ok(Vec::new())
            },
        }
    }
}

fn spot_mut(state: &mut LedgerState, id: SpotId) -> Result<&mut Spot, MarketError> {
    usize::try_from(id.index())
        .ok()
        .and_then(|i| state.spots.get_mut(i))
        .ok_or(MarketError::spot_not_found(id))
}

fn booking_mut(state: &mut LedgerState, id: BookingId) -> Result<&mut Booking, MarketError> {
    usize::try_from(id.index())
        .ok()
        .and_then(|i| state.bookings.get_mut(i))
        .ok_or(MarketError::booking_not_found(id))
}

/// The commitment a reveal for `booking_id` is checked against: the
/// spot's current one.
fn commitment_for(
    state: &mut LedgerState,
    booking_id: BookingId,
) -> Result<Commitment, MarketError> {
    let spot_id = booking_mut(state, booking_id)?.spot_id;
    Ok(spot_mut(state, spot_id)?.commitment)
}

impl LedgerReader for InMemoryLedger {
    fn spots_count(&self) -> LedgerFuture<'_, u64> {
        Box::pin(async move { self.count(|s| s.spots.len()) })
    }

    fn spot(&self, id: SpotId) -> LedgerFuture<'_, Option<Spot>> {
        Box::pin(async move {
            self.read_latency(id.index()).await;
            let state = self.lock();
            if state.faults.failing_spot_reads.contains(&id.index()) {
                return Err(MarketError::Transport(format!("read of {id} failed")));
            }
            Ok(usize::try_from(id.index())
                .ok()
                .and_then(|i| state.spots.get(i).cloned()))
        })
    }

    fn bookings_count(&self) -> LedgerFuture<'_, u64> {
        Box::pin(async move { self.count(|s| s.bookings.len()) })
    }

    fn booking(&self, id: BookingId) -> LedgerFuture<'_, Option<Booking>> {
        Box::pin(async move {
            self.read_latency(id.index()).await;
            let state = self.lock();
            if state.faults.failing_booking_reads.contains(&id.index()) {
                return Err(MarketError::Transport(format!("read of {id} failed")));
            }
            Ok(usize::try_from(id.index())
                .ok()
                .and_then(|i| state.bookings.get(i).cloned()))
        })
    }

    fn fee_schedule(&self) -> LedgerFuture<'_, FeeSchedule> {
        Box::pin(async move { Ok(self.lock().fees) })
    }

    fn subscribe_events(&self) -> Option<broadcast::Receiver<LedgerEvent>> {
        Some(self.events.subscribe())
    }
}

impl LedgerWriter for InMemoryLedger {
    fn submit(&self, caller: Caller, call: LedgerCall) -> LedgerFuture<'_, TxHash> {
        Box::pin(async move {
            let (declined, delay) = {
                let state = self.lock();
                (
                    state.faults.declining_signers.contains(&caller.identity),
                    state.faults.signature_delay,
                )
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if declined {
                return Err(MarketError::SignatureDeclined {
                    reason: "user rejected the request".to_string(),
                });
            }

            let mut state = self.lock();
            state.next_tx += 1;
            let mut bytes = [0u8; 32];
            bytes[24..].copy_from_slice(&state.next_tx.to_be_bytes());
            let tx = TxHash::from_bytes(bytes);
            tracing::debug!(%tx, function = call.name(), caller = %caller.identity, "Submission queued");
            state.pending.insert(tx, Pending { caller, call });
            Ok(tx)
        })
    }

    fn confirm(&self, tx: TxHash) -> LedgerFuture<'_, Receipt> {
        Box::pin(async move {
            let delay = self.lock().faults.confirmation_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let events = {
                let mut state = self.lock();
                let pending = state.pending.remove(&tx).ok_or_else(|| {
                    MarketError::ProtocolViolation(format!("unknown transaction {tx}"))
                })?;
                let function = pending.call.name();
                match self.apply(&mut state, pending.caller, pending.call) {
                    Ok(events) => events,
                    Err(error) => {
                        tracing::debug!(%tx, function, %error, "Submission reverted");
                        return Err(error);
                    },
                }
            };

            for event in &events {
                let _ = self.events.send(event.clone());
            }
            Ok(Receipt { tx_hash: tx, events })
        })
    }
}
