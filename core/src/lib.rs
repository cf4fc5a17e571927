//! # Parkmarket Core
//!
//! Domain model and protocol rules for a parking marketplace settled on a
//! shared ledger.
//!
//! A host commits a parking spot to the ledger together with the hash of a
//! secret printed on a credential at the spot. A renter reserves the spot
//! against a refundable deposit and later proves physical presence by
//! revealing that secret at check-in and check-out. This crate holds the
//! pieces of that protocol that must agree bit-for-bit with the ledger:
//!
//! - [`commitment`]: secret/commitment generation and reveal verification
//! - [`payload`]: the scannable out-of-band payload carrying the secret
//! - [`spot`]: the spot lifecycle (create, full-overwrite update)
//! - [`booking`]: the booking state machine
//! - [`settlement`]: deposit, cost, fee, payout and refund arithmetic
//! - [`ledger`]: the boundary traits of the external ledger
//!
//! It also carries the architecture primitives shared by the other crates:
//!
//! - **State**: Domain state for a feature
//! - **Action**: All possible inputs to a reducer (commands and results)
//! - **Reducer**: Pure function `(State, Action, Environment) → (State, Effects)`
//! - **Effect**: Side effect descriptions (not execution)
//! - **Environment**: Injected dependencies via traits
//!
//! ## Example
//!
//! ```
//! use parkmarket_core::commitment;
//!
//! let (secret, commitment) = commitment::commit();
//! assert!(commitment::verify(&secret, &commitment));
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{SmallVec, smallvec};

pub mod booking;
pub mod commitment;
pub mod error;
pub mod ledger;
pub mod payload;
pub mod settlement;
pub mod spot;
pub mod types;

pub use booking::{Booking, BookingPolicy, BookingStatus, ScanAction};
pub use commitment::{Commitment, Secret};
pub use error::{EntityKind, ErrorOrigin, MarketError, Operation};
pub use ledger::{Ledger, LedgerCall, LedgerEvent, LedgerReader, LedgerWriter, Receipt, TxHash};
pub use settlement::{FeeSchedule, Settlement};
pub use spot::{Spot, SpotUpdate};
pub use types::{Address, BookingId, Caller, SpotId, Units};

/// Reducer module - The core trait for business logic
///
/// Reducers are pure functions: `(State, Action, Environment) → (State, Effects)`
///
/// They contain all business logic and are deterministic and testable.
pub mod reducer {
    use super::effect::Effect;
    use smallvec::SmallVec;

    /// The Reducer trait - core abstraction for business logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The domain state this reducer operates on
    /// - `Action`: The action type this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    ///
    /// # Example
    ///
    /// ```ignore
    /// impl Reducer for TransactionReducer {
    ///     type State = TransactionState;
    ///     type Action = TransactionAction;
    ///     type Environment = TransactionEnvironment;
    ///
    ///     fn reduce(
    ///         &self,
    ///         state: &mut TransactionState,
    ///         action: TransactionAction,
    ///         env: &TransactionEnvironment,
    ///     ) -> SmallVec<[Effect<TransactionAction>; 4]> {
    ///         match action {
    ///             TransactionAction::Reset { key } => {
    ///                 state.reset(key);
    ///                 smallvec![Effect::None]
    ///             }
    ///             _ => smallvec![Effect::None],
    ///         }
    ///     }
    /// }
    /// ```
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// Reduce an action into state changes and effects
        ///
        /// This is a pure function that:
        /// 1. Validates the action
        /// 2. Updates state in place
        /// 3. Returns effect descriptions to be executed
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Effect module - Side effect descriptions
///
/// Effects describe side effects to be performed by the runtime.
/// They are values (not execution); ledger round-trips are expressed as
/// [`Effect::Future`] values whose output is fed back into the reducer.
pub mod effect {
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    /// Effect type - describes a side effect to be executed
    ///
    /// Effects are NOT executed immediately. They are descriptions of what should happen,
    /// returned from reducers and executed by the Store runtime.
    pub enum Effect<Action> {
        /// No-op effect
        None,

        /// Run effects in parallel
        Parallel(Vec<Effect<Action>>),

        /// Run effects sequentially
        Sequential(Vec<Effect<Action>>),

        /// Delayed action (for timeouts)
        Delay {
            /// How long to wait
            duration: Duration,
            /// Action to dispatch after delay
            action: Box<Action>,
        },

        /// Arbitrary async computation
        ///
        /// Returns `Option<Action>` - if Some, the action is fed back into the reducer
        Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>),
    }

    // Manual Debug implementation since Future doesn't implement Debug
    impl<Action> std::fmt::Debug for Effect<Action>
    where
        Action: std::fmt::Debug,
    {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Parallel(effects) => {
                    f.debug_tuple("Effect::Parallel").field(effects).finish()
                },
                Effect::Sequential(effects) => {
                    f.debug_tuple("Effect::Sequential").field(effects).finish()
                },
                Effect::Delay { duration, action } => f
                    .debug_struct("Effect::Delay")
                    .field("duration", duration)
                    .field("action", action)
                    .finish(),
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Combine effects to run in parallel
        #[must_use]
        pub const fn merge(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Parallel(effects)
        }

        /// Chain effects to run sequentially
        #[must_use]
        pub const fn chain(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Sequential(effects)
        }

        /// Wrap a future producing a follow-up action
        #[must_use]
        pub fn future<F>(fut: F) -> Effect<Action>
        where
            F: Future<Output = Option<Action>> + Send + 'static,
        {
            Effect::Future(Box::pin(fut))
        }
    }
}

/// Environment module - Dependency injection traits
///
/// All external dependencies are abstracted behind traits and injected
/// via the Environment parameter.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Check-in and check-out timestamps, and therefore billable hours,
    /// are derived from the clock, so tests substitute a fixed or manually
    /// advanced clock.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::effect::Effect;
    use super::environment::{Clock, SystemClock};

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }

    #[test]
    fn effect_debug_hides_future() {
        let effect: Effect<u8> = Effect::future(async { Some(1) });
        assert_eq!(format!("{effect:?}"), "Effect::Future(<future>)");

        let merged: Effect<u8> = Effect::merge(vec![Effect::None]);
        assert_eq!(format!("{merged:?}"), "Effect::Parallel([Effect::None])");
    }
}
