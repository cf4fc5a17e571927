//! Progress of mutating ledger calls.
//!
//! Each UI-visible action (an [`ActionKey`]) has at most one attempt in
//! flight. An attempt moves
//! `Idle → AwaitingSignature → AwaitingConfirmation → {Confirmed | Failed}`
//! and is identified by a [`TxId`] so results that arrive for an attempt
//! that is no longer current are recognised and dropped.
//!
//! The tracker owns no business rules: every rejection it reports either
//! comes from the ledger or is the single-flight guard itself.

use chrono::{DateTime, Utc};
use parkmarket_core::environment::Clock;
use parkmarket_core::{
    BookingId, Caller, Ledger, LedgerCall, MarketError, Receipt, SmallVec, SpotId, TxHash,
    effect::Effect, reducer::Reducer, smallvec,
};
use parkmarket_runtime::metrics::TransactionMetrics;
use parkmarket_runtime::{Store, StoreError};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// The UI-visible action an attempt belongs to.
///
/// Check-in, check-out and cancel of one booking share a key: the booking
/// can only be moved by one of them at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionKey {
    /// Creating a new spot
    CreateSpot,
    /// Updating an existing spot
    Spot(SpotId),
    /// Reserving a spot
    Reserve(SpotId),
    /// Moving an existing booking
    Booking(BookingId),
}

impl ActionKey {
    /// The key a call is tracked under
    #[must_use]
    pub const fn for_call(call: &LedgerCall) -> Self {
        match call {
            LedgerCall::CreateSpot { .. } => Self::CreateSpot,
            LedgerCall::UpdateSpot { spot_id, .. } => Self::Spot(*spot_id),
            LedgerCall::BookSpot { spot_id, .. } => Self::Reserve(*spot_id),
            LedgerCall::CheckIn { booking_id, .. }
            | LedgerCall::CheckOut { booking_id, .. }
            | LedgerCall::CancelBeforeCheckIn { booking_id } => Self::Booking(*booking_id),
        }
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateSpot => f.write_str("create spot"),
            Self::Spot(id) => write!(f, "update {id}"),
            Self::Reserve(id) => write!(f, "reserve {id}"),
            Self::Booking(id) => write!(f, "{id}"),
        }
    }
}

/// Correlation id of one attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TxId(Uuid);

impl TxId {
    /// Generate a new attempt id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an attempt stands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxPhase {
    /// Nothing in flight; a submission is accepted
    Idle,
    /// Waiting for the signer
    AwaitingSignature,
    /// Signed and handed to the ledger
    AwaitingConfirmation {
        /// The submission
        tx_hash: TxHash,
    },
    /// The ledger accepted the call
    Confirmed {
        /// Its receipt
        receipt: Receipt,
    },
    /// The attempt ended without effect on this client's side
    Failed {
        /// Why
        error: MarketError,
    },
}

impl TxPhase {
    /// True once the attempt can no longer change
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed { .. } | Self::Failed { .. })
    }

    /// True while waiting on the signer or the ledger
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        matches!(
            self,
            Self::AwaitingSignature | Self::AwaitingConfirmation { .. }
        )
    }

    const fn describe(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingSignature => "awaiting signature",
            Self::AwaitingConfirmation { .. } => "awaiting confirmation",
            Self::Confirmed { .. } => "confirmed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// One attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedTransaction {
    /// Attempt id
    pub id: TxId,
    /// Ledger function being called
    pub function: &'static str,
    /// Current phase
    pub phase: TxPhase,
    /// When the attempt was submitted
    pub started_at: DateTime<Utc>,
}

/// All attempts, one per key.
#[derive(Clone, Debug, Default)]
pub struct TransactionState {
    attempts: HashMap<ActionKey, TrackedTransaction>,
}

impl TransactionState {
    /// Phase of the attempt under `key`, `Idle` if there is none
    #[must_use]
    pub fn phase(&self, key: &ActionKey) -> TxPhase {
        self.attempts
            .get(key)
            .map_or(TxPhase::Idle, |t| t.phase.clone())
    }

    /// The attempt under `key`
    #[must_use]
    pub fn attempt(&self, key: &ActionKey) -> Option<&TrackedTransaction> {
        self.attempts.get(key)
    }

    /// Number of attempts still waiting
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.attempts.values().filter(|t| t.phase.is_waiting()).count()
    }

    fn current_mut(&mut self, key: &ActionKey, id: TxId) -> Option<&mut TrackedTransaction> {
        self.attempts.get_mut(key).filter(|t| t.id == id)
    }
}

/// Tracker inputs.
#[derive(Clone, Debug)]
pub enum TransactionAction {
    /// Start an attempt
    Submit {
        /// Action the attempt belongs to
        key: ActionKey,
        /// New attempt id
        id: TxId,
        /// Signing identity
        caller: Caller,
        /// The call
        call: LedgerCall,
    },
    /// The signer produced a submission
    Signed {
        /// Action key
        key: ActionKey,
        /// Attempt id
        id: TxId,
        /// Submission hash
        tx_hash: TxHash,
    },
    /// The ledger confirmed the call
    Confirmed {
        /// Action key
        key: ActionKey,
        /// Attempt id
        id: TxId,
        /// Receipt
        receipt: Receipt,
    },
    /// Signing or confirmation failed
    Failed {
        /// Action key
        key: ActionKey,
        /// Attempt id
        id: TxId,
        /// Why
        error: MarketError,
    },
    /// The signature wait expired
    SignatureTimedOut {
        /// Action key
        key: ActionKey,
        /// Attempt id
        id: TxId,
    },
    /// The confirmation wait expired
    ConfirmationTimedOut {
        /// Action key
        key: ActionKey,
        /// Attempt id
        id: TxId,
    },
    /// A submission was refused because the key was busy
    SubmissionRejected {
        /// Busy key
        key: ActionKey,
        /// Refused attempt id
        id: TxId,
    },
    /// Stop waiting for the attempt under `key`
    Abandon {
        /// Action key
        key: ActionKey,
    },
    /// Notification that an attempt was abandoned
    Abandoned {
        /// Action key
        key: ActionKey,
        /// Attempt id
        id: TxId,
    },
    /// Return a finished key to `Idle`
    Reset {
        /// Action key
        key: ActionKey,
    },
}

impl TransactionAction {
    /// Attempt this action reports on, for actions produced by effects
    #[must_use]
    pub const fn attempt(&self) -> Option<TxId> {
        match self {
            Self::Signed { id, .. }
            | Self::Confirmed { id, .. }
            | Self::Failed { id, .. }
            | Self::SignatureTimedOut { id, .. }
            | Self::ConfirmationTimedOut { id, .. }
            | Self::SubmissionRejected { id, .. }
            | Self::Abandoned { id, .. } => Some(*id),
            Self::Submit { .. } | Self::Abandon { .. } | Self::Reset { .. } => None,
        }
    }

    /// The outcome this action settles its attempt with, given whether the
    /// attempt had been signed. Timeouts for a phase already left settle
    /// nothing.
    fn outcome(&self, signed: bool) -> Option<Result<Receipt, MarketError>> {
        match self {
            Self::Confirmed { receipt, .. } => Some(Ok(receipt.clone())),
            Self::Failed { error, .. } => Some(Err(error.clone())),
            Self::SignatureTimedOut { .. } if !signed => Some(Err(MarketError::Timeout {
                phase: TxPhase::AwaitingSignature.describe().to_string(),
            })),
            Self::ConfirmationTimedOut { .. } if signed => Some(Err(MarketError::Timeout {
                phase: "awaiting confirmation".to_string(),
            })),
            Self::Abandoned { .. } => Some(Err(MarketError::Abandoned {
                phase: "waiting".to_string(),
            })),
            _ => None,
        }
    }
}

/// Bounds on the two waits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// How long to wait for the signer
    pub signature: Duration,
    /// How long to wait for the ledger's verdict
    pub confirmation: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            signature: Duration::from_secs(300),
            confirmation: Duration::from_secs(120),
        }
    }
}

/// Dependencies of [`TransactionReducer`].
#[derive(Clone)]
pub struct TransactionEnvironment {
    /// Ledger to submit to
    pub ledger: Arc<dyn Ledger>,
    /// Clock for attempt durations
    pub clock: Arc<dyn Clock>,
    /// Wait bounds
    pub timeouts: Timeouts,
}

/// Reducer for [`TransactionState`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TransactionReducer;

impl TransactionReducer {
    fn finish(
        tracked: &mut TrackedTransaction,
        phase: TxPhase,
        outcome: &'static str,
        env: &TransactionEnvironment,
    ) {
        if let TxPhase::Failed { error } = &phase {
            if error.is_security_event() {
                TransactionMetrics::record_authentication_failure();
                tracing::warn!(attempt = %tracked.id, %error, "Secret rejected by the ledger");
            } else {
                tracing::info!(attempt = %tracked.id, function = tracked.function, %error, "Attempt failed");
            }
        } else {
            tracing::info!(attempt = %tracked.id, function = tracked.function, "Attempt confirmed");
        }
        let elapsed = (env.clock.now() - tracked.started_at)
            .to_std()
            .unwrap_or_default();
        TransactionMetrics::record_completed(tracked.function, outcome, elapsed);
        tracked.phase = phase;
    }

    fn ignore_late(key: ActionKey, id: TxId, what: &str) -> SmallVec<[Effect<TransactionAction>; 4]> {
        tracing::debug!(%key, attempt = %id, what, "Ignoring result for an attempt that is no longer waiting");
        smallvec![Effect::None]
    }
}

impl Reducer for TransactionReducer {
    type State = TransactionState;
    type Action = TransactionAction;
    type Environment = TransactionEnvironment;

    #[allow(clippy::too_many_lines)]
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            TransactionAction::Submit {
                key,
                id,
                caller,
                call,
            } => {
                if state.attempts.get(&key).is_some_and(|t| !t.phase.is_terminal()) {
                    TransactionMetrics::record_rejected();
                    tracing::debug!(%key, attempt = %id, "Submission refused, key is busy");
                    return smallvec![Effect::future(async move {
                        Some(TransactionAction::SubmissionRejected { key, id })
                    })];
                }

                let function = call.name();
                TransactionMetrics::record_submitted(function);
                // A finished attempt nobody reset yields to the new one.
                state.attempts.insert(
                    key,
                    TrackedTransaction {
                        id,
                        function,
                        phase: TxPhase::AwaitingSignature,
                        started_at: env.clock.now(),
                    },
                );

                let ledger = Arc::clone(&env.ledger);
                smallvec![
                    Effect::future(async move {
                        Some(match ledger.submit(caller, call).await {
                            Ok(tx_hash) => TransactionAction::Signed { key, id, tx_hash },
                            Err(error) => TransactionAction::Failed { key, id, error },
                        })
                    }),
                    Effect::Delay {
                        duration: env.timeouts.signature,
                        action: Box::new(TransactionAction::SignatureTimedOut { key, id }),
                    },
                ]
            },

            TransactionAction::Signed { key, id, tx_hash } => {
                let Some(tracked) = state
                    .current_mut(&key, id)
                    .filter(|t| t.phase == TxPhase::AwaitingSignature)
                else {
                    tracing::warn!(%key, attempt = %id, %tx_hash, "Signed after the attempt stopped waiting; the call may still confirm");
                    return smallvec![Effect::None];
                };
                tracked.phase = TxPhase::AwaitingConfirmation { tx_hash };

                let ledger = Arc::clone(&env.ledger);
                smallvec![
                    Effect::future(async move {
                        Some(match ledger.confirm(tx_hash).await {
                            Ok(receipt) => TransactionAction::Confirmed { key, id, receipt },
                            Err(error) => TransactionAction::Failed { key, id, error },
                        })
                    }),
                    Effect::Delay {
                        duration: env.timeouts.confirmation,
                        action: Box::new(TransactionAction::ConfirmationTimedOut { key, id }),
                    },
                ]
            },

            TransactionAction::Confirmed { key, id, receipt } => {
                match state.current_mut(&key, id).filter(|t| t.phase.is_waiting()) {
                    Some(tracked) => {
                        Self::finish(tracked, TxPhase::Confirmed { receipt }, "confirmed", env);
                        smallvec![Effect::None]
                    },
                    None => Self::ignore_late(key, id, "confirmation"),
                }
            },

            TransactionAction::Failed { key, id, error } => {
                match state.current_mut(&key, id).filter(|t| t.phase.is_waiting()) {
                    Some(tracked) => {
                        Self::finish(tracked, TxPhase::Failed { error }, "failed", env);
                        smallvec![Effect::None]
                    },
                    None => Self::ignore_late(key, id, "failure"),
                }
            },

            TransactionAction::SignatureTimedOut { key, id } => {
                match state
                    .current_mut(&key, id)
                    .filter(|t| t.phase == TxPhase::AwaitingSignature)
                {
                    Some(tracked) => {
                        let error = MarketError::Timeout {
                            phase: TxPhase::AwaitingSignature.describe().to_string(),
                        };
                        Self::finish(tracked, TxPhase::Failed { error }, "timeout", env);
                        smallvec![Effect::None]
                    },
                    None => smallvec![Effect::None],
                }
            },

            TransactionAction::ConfirmationTimedOut { key, id } => {
                match state
                    .current_mut(&key, id)
                    .filter(|t| matches!(t.phase, TxPhase::AwaitingConfirmation { .. }))
                {
                    Some(tracked) => {
                        let error = MarketError::Timeout {
                            phase: tracked.phase.describe().to_string(),
                        };
                        Self::finish(tracked, TxPhase::Failed { error }, "timeout", env);
                        smallvec![Effect::None]
                    },
                    None => smallvec![Effect::None],
                }
            },

            TransactionAction::Abandon { key } => {
                let Some(tracked) = state.attempts.get_mut(&key).filter(|t| t.phase.is_waiting())
                else {
                    return smallvec![Effect::None];
                };
                let id = tracked.id;
                let error = MarketError::Abandoned {
                    phase: tracked.phase.describe().to_string(),
                };
                Self::finish(tracked, TxPhase::Failed { error }, "abandoned", env);
                smallvec![Effect::future(async move {
                    Some(TransactionAction::Abandoned { key, id })
                })]
            },

            TransactionAction::Reset { key } => {
                match state.attempts.get(&key) {
                    Some(tracked) if tracked.phase.is_terminal() => {
                        state.attempts.remove(&key);
                    },
                    Some(tracked) => {
                        tracing::debug!(%key, attempt = %tracked.id, "Not resetting an attempt in flight");
                    },
                    None => {},
                }
                smallvec![Effect::None]
            },

            TransactionAction::SubmissionRejected { .. } | TransactionAction::Abandoned { .. } => {
                smallvec![Effect::None]
            },
        }
    }
}

/// Runs mutating calls through a [`TransactionReducer`] store.
#[derive(Clone)]
pub struct TransactionTracker {
    store: Store<TransactionState, TransactionAction, TransactionEnvironment, TransactionReducer>,
}

impl TransactionTracker {
    /// Creates a tracker over `env`.
    #[must_use]
    pub fn new(env: TransactionEnvironment) -> Self {
        Self {
            store: Store::new(TransactionState::default(), TransactionReducer, env),
        }
    }

    /// Submits `call` as `caller` and waits for its terminal outcome.
    ///
    /// The key is returned to `Idle` once the outcome has been read, so the
    /// next call for the same action is a fresh attempt.
    ///
    /// # Errors
    ///
    /// - [`MarketError::SubmissionRejected`] if an attempt for the same key
    ///   is in flight; the ledger is not contacted
    /// - the ledger's rejection, [`MarketError::Timeout`], or
    ///   [`MarketError::Abandoned`] otherwise
    #[tracing::instrument(skip(self, call), fields(function = call.name()))]
    pub async fn track(&self, caller: Caller, call: LedgerCall) -> Result<Receipt, MarketError> {
        let key = ActionKey::for_call(&call);
        let id = TxId::new();
        let mut actions = self.store.subscribe_actions();

        self.store
            .send(TransactionAction::Submit {
                key,
                id,
                caller,
                call,
            })
            .await
            .map_err(store_error)?;

        let mut signed = false;
        loop {
            let observed = match actions.recv().await {
                Ok(TransactionAction::SubmissionRejected { id: rejected, .. }) if rejected == id => {
                    return Err(MarketError::SubmissionRejected {
                        action: key.to_string(),
                    });
                },
                Ok(action) if action.attempt() == Some(id) => {
                    signed |= matches!(action, TransactionAction::Signed { .. });
                    Some(action)
                },
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Tracker observer lagged");
                    None
                },
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(MarketError::Transport("transaction tracker stopped".into()));
                },
            };

            let recorded = self
                .store
                .state(|s| s.attempt(&key).filter(|t| t.id == id).map(|t| t.phase.clone()))
                .await;
            let outcome = match recorded {
                Some(TxPhase::Confirmed { receipt }) => Ok(receipt),
                Some(TxPhase::Failed { error }) => Err(error),
                Some(_) => continue,
                // A newer attempt already replaced the finished record; the
                // action that finished it carries the outcome.
                None => match observed {
                    Some(action) => match action.outcome(signed) {
                        Some(outcome) => return outcome,
                        None => continue,
                    },
                    None => {
                        return Err(MarketError::Abandoned {
                            phase: "superseded".into(),
                        });
                    },
                },
            };
            self.reset(key).await;
            return outcome;
        }
    }

    /// Stops waiting for the attempt under `key`. The call itself, if
    /// already submitted, may still confirm on the ledger.
    pub async fn abandon(&self, key: ActionKey) {
        if let Err(error) = self.store.send(TransactionAction::Abandon { key }).await {
            tracing::debug!(%error, "Abandon not delivered");
        }
    }

    /// Phase of the attempt under `key`.
    pub async fn phase(&self, key: ActionKey) -> TxPhase {
        self.store.state(|s| s.phase(&key)).await
    }

    /// Stops accepting submissions and waits for running effects.
    ///
    /// # Errors
    ///
    /// [`StoreError::ShutdownTimeout`] if effects are still running after
    /// `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
        self.store.shutdown(timeout).await
    }

    async fn reset(&self, key: ActionKey) {
        if let Err(error) = self.store.send(TransactionAction::Reset { key }).await {
            tracing::debug!(%error, "Reset not delivered");
        }
    }
}

fn store_error(error: StoreError) -> MarketError {
    MarketError::Transport(error.to_string())
}
