//! Spot lifecycle: creation and owner-only full-overwrite updates.
//!
//! Spots are never deleted. A host takes a spot off the market by
//! deactivating it.

use crate::commitment::Commitment;
use crate::error::{MarketError, Operation};
use crate::types::{Address, Caller, SpotId, Units};
use serde::{Deserialize, Serialize};

/// A parking spot as recorded on the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spot {
    /// Ledger index, the spot's permanent identity
    pub id: SpotId,
    /// Identity that created the spot
    pub owner: Address,
    /// Price per started hour, in the smallest currency unit
    pub rate_per_hour: Units,
    /// Whether the spot accepts new reservations
    pub active: bool,
    /// Hash of the secret printed at the spot
    pub commitment: Commitment,
}

impl Spot {
    /// Builds the record the ledger stores for a newly created spot.
    ///
    /// New spots are always active.
    #[must_use]
    pub const fn create(
        id: SpotId,
        owner: Address,
        rate_per_hour: Units,
        commitment: Commitment,
    ) -> Self {
        Self {
            id,
            owner,
            rate_per_hour,
            active: true,
            commitment,
        }
    }

    /// Applies an owner update.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::Unauthorized`] if `caller` is not the owner.
    /// The spot is left untouched on error.
    pub fn apply_update(&mut self, caller: &Caller, update: SpotUpdate) -> Result<(), MarketError> {
        if !caller.is(&self.owner) {
            return Err(MarketError::Unauthorized {
                caller: caller.identity,
                operation: Operation::UpdateSpot,
            });
        }
        self.rate_per_hour = update.rate_per_hour;
        self.active = update.active;
        self.commitment = update.commitment;
        Ok(())
    }
}

/// The mutable fields of a spot, all of which an update overwrites.
///
/// There is no partial update: every field written into the struct
/// replaces the spot's field, so an update built by hand must restate the
/// values it means to keep. Start from [`SpotUpdate::from_current`] to
/// change one field and keep the rest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotUpdate {
    /// New hourly rate
    pub rate_per_hour: Units,
    /// New active flag
    pub active: bool,
    /// New commitment
    pub commitment: Commitment,
}

impl SpotUpdate {
    /// Copies a spot's current mutable fields.
    #[must_use]
    pub const fn from_current(spot: &Spot) -> Self {
        Self {
            rate_per_hour: spot.rate_per_hour,
            active: spot.active,
            commitment: spot.commitment,
        }
    }

    /// Replaces the rate
    #[must_use]
    pub const fn with_rate(mut self, rate_per_hour: Units) -> Self {
        self.rate_per_hour = rate_per_hour;
        self
    }

    /// Replaces the active flag
    #[must_use]
    pub const fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Replaces the commitment
    #[must_use]
    pub const fn with_commitment(mut self, commitment: Commitment) -> Self {
        self.commitment = commitment;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::commitment;

    fn owner() -> Address {
        Address::from_bytes([1; 20])
    }

    #[test]
    fn created_spots_are_active() {
        let (_, c) = commitment::commit();
        let spot = Spot::create(SpotId::new(0), owner(), Units::new(1000), c);
        assert!(spot.active);
        assert_eq!(spot.commitment, c);
    }

    #[test]
    fn owner_can_deactivate_keeping_other_fields() {
        let (_, c) = commitment::commit();
        let mut spot = Spot::create(SpotId::new(0), owner(), Units::new(1000), c);

        let update = SpotUpdate::from_current(&spot).with_active(false);
        spot.apply_update(&Caller::new(owner()), update).unwrap();

        assert!(!spot.active);
        assert_eq!(spot.rate_per_hour, Units::new(1000));
        assert_eq!(spot.commitment, c);
    }

    #[test]
    fn hand_built_update_overwrites_every_field() {
        let (_, c) = commitment::commit();
        let (_, rotated) = commitment::commit();
        let mut spot = Spot::create(SpotId::new(0), owner(), Units::new(1000), c);

        let update = SpotUpdate {
            rate_per_hour: Units::new(250),
            active: false,
            commitment: rotated,
        };
        spot.apply_update(&Caller::new(owner()), update).unwrap();

        assert_eq!(spot.rate_per_hour, Units::new(250));
        assert!(!spot.active);
        assert_eq!(spot.commitment, rotated);
    }

    #[test]
    fn non_owner_update_is_rejected_without_change() {
        let (_, c) = commitment::commit();
        let mut spot = Spot::create(SpotId::new(0), owner(), Units::new(1000), c);
        let before = spot.clone();

        let stranger = Caller::new(Address::from_bytes([9; 20]));
        let err = spot
            .apply_update(&stranger, SpotUpdate::from_current(&spot).with_rate(Units::ZERO))
            .unwrap_err();

        assert!(matches!(err, MarketError::Unauthorized { .. }));
        assert_eq!(spot, before);
    }
}
