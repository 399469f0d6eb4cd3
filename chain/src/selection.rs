//! Stake-weighted block proposer selection.
//!
//! Selection for a slot is a pure function of `(epoch_seed, slot, snapshot)`:
//! eligible validators are laid out as consecutive stake intervals in address
//! order, `SHA-256(epoch_seed || slot)` picks a point inside the total stake,
//! and the interval containing that point owns the slot. Any node holding the
//! same snapshot can recompute and check the proposer of a block.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ChainError, Result};
use crate::registry::ValidatorRegistry;
use crate::types::{Address, Hash, Slot};

// ---------------------------------------------------------------------------
// RegistrySnapshot
// ---------------------------------------------------------------------------

/// Eligible validators and their stake at a point in time, ordered by address.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    entries: Vec<(Address, u64)>,
}

impl RegistrySnapshot {
    /// Build a snapshot. Zero-stake entries are dropped; ordering of the input
    /// does not matter. A repeated address keeps its last stake.
    pub fn new(entries: impl IntoIterator<Item = (Address, u64)>) -> Self {
        let ordered: BTreeMap<Address, u64> = entries
            .into_iter()
            .filter(|(_, stake)| *stake > 0)
            .collect();
        Self {
            entries: ordered.into_iter().collect(),
        }
    }

    pub fn entries(&self) -> &[(Address, u64)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_stake(&self) -> u128 {
        self.entries.iter().map(|(_, s)| u128::from(*s)).sum()
    }

    pub fn stake_of(&self, address: &Address) -> u64 {
        self.entries
            .binary_search_by(|(a, _)| a.cmp(address))
            .map(|i| self.entries[i].1)
            .unwrap_or(0)
    }

    /// Commitment to the snapshot contents.
    pub fn hash(&self) -> Hash {
        let mut bytes = Vec::with_capacity(self.entries.len() * 40);
        for (address, stake) in &self.entries {
            bytes.extend_from_slice(address.as_bytes());
            bytes.extend_from_slice(&stake.to_le_bytes());
        }
        Hash::compute(&bytes)
    }

    /// Exclusive upper bound of each validator's stake interval.
    fn cumulative_bounds(&self) -> Vec<u128> {
        self.entries
            .iter()
            .scan(0u128, |acc, (_, stake)| {
                *acc += u128::from(*stake);
                Some(*acc)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Pure selection
// ---------------------------------------------------------------------------

/// `SHA-256(epoch_seed || slot)` with both integers little-endian.
pub fn selection_hash(epoch_seed: u64, slot: Slot) -> Hash {
    Hash::compute_parts(&[&epoch_seed.to_le_bytes(), &slot.to_le_bytes()])
}

/// Reduce the selection hash to a point in `[0, total_stake)`.
pub fn selection_point(epoch_seed: u64, slot: Slot, total_stake: u128) -> u128 {
    let digest = selection_hash(epoch_seed, slot);
    let mut head = [0u8; 16];
    head.copy_from_slice(&digest.as_bytes()[..16]);
    u128::from_be_bytes(head) % total_stake
}

/// Select the proposer for `slot`.
///
/// Fails with `NoEligibleValidators` when the snapshot carries no stake; the
/// slot is then skipped rather than retried with stale state.
pub fn select_validator(snapshot: &RegistrySnapshot, epoch_seed: u64, slot: Slot) -> Result<Address> {
    let total = snapshot.total_stake();
    if total == 0 {
        return Err(ChainError::NoEligibleValidators);
    }

    let bounds = snapshot.cumulative_bounds();
    let point = selection_point(epoch_seed, slot, total);
    let index = bounds.partition_point(|end| *end <= point);

    snapshot
        .entries
        .get(index)
        .map(|(address, _)| address.clone())
        .ok_or(ChainError::NoEligibleValidators)
}

/// Derive the next epoch seed from the previous seed and the latest finalized
/// block, so the seed cannot be ground by a single proposer.
pub fn derive_epoch_seed(previous_seed: u64, finalized: &Hash) -> u64 {
    let digest = Hash::compute_parts(&[&previous_seed.to_le_bytes(), finalized.as_bytes()]);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

// ---------------------------------------------------------------------------
// SelectionEngine
// ---------------------------------------------------------------------------

/// Runs selection against the shared registry and records slot assignments.
#[derive(Clone, Debug)]
pub struct SelectionEngine {
    registry: Arc<RwLock<ValidatorRegistry>>,
}

impl SelectionEngine {
    pub fn new(registry: Arc<RwLock<ValidatorRegistry>>) -> Self {
        Self { registry }
    }

    /// Select the proposer for `slot` and mark it as the pending slot owner.
    pub fn select_for_slot(&self, epoch_seed: u64, slot: Slot) -> Result<Address> {
        let snapshot = self.registry.read().snapshot();
        let proposer = match select_validator(&snapshot, epoch_seed, slot) {
            Ok(proposer) => proposer,
            Err(err) => {
                warn!(slot, error = %err, "block production skipped");
                return Err(err);
            }
        };

        self.registry.write().record_assignment(slot, &proposer)?;
        debug!(slot, proposer = %proposer, "slot assigned");
        Ok(proposer)
    }

    /// Proposers for `count` consecutive slots starting at `first_slot`,
    /// computed against a single snapshot. Does not record assignments. The
    /// range is clamped below `Slot::MAX`.
    pub fn epoch_schedule(
        &self,
        epoch_seed: u64,
        first_slot: Slot,
        count: u64,
    ) -> Result<Vec<(Slot, Address)>> {
        let snapshot = self.registry.read().snapshot();
        (first_slot..first_slot.saturating_add(count))
            .map(|slot| select_validator(&snapshot, epoch_seed, slot).map(|a| (slot, a)))
            .collect()
    }

    /// Check that `proposer` is the rightful owner of `slot`.
    pub fn verify_proposer(
        snapshot: &RegistrySnapshot,
        epoch_seed: u64,
        slot: Slot,
        proposer: &Address,
    ) -> bool {
        select_validator(snapshot, epoch_seed, slot).is_ok_and(|expected| &expected == proposer)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use sha2::{Digest, Sha256};

    fn addr(byte: u8) -> Address {
        Address::from_bytes([byte; 32])
    }

    #[test]
    fn test_selection_scenario_recomputed() {
        // {A: 100, B: 300}, epoch_seed = 7, slot = 3
        let a = addr(0xA);
        let b = addr(0xB);
        let snapshot = RegistrySnapshot::new(vec![(b.clone(), 300), (a.clone(), 100)]);

        let selected = select_validator(&snapshot, 7, 3).expect("stake present");

        // Independent recomputation.
        let mut hasher = Sha256::new();
        hasher.update(7u64.to_le_bytes());
        hasher.update(3u64.to_le_bytes());
        let digest = hasher.finalize();
        let mut head = [0u8; 16];
        head.copy_from_slice(&digest[..16]);
        let point = u128::from_be_bytes(head) % 400;
        let expected = if point < 100 { a } else { b };

        assert_eq!(selected, expected);
    }

    #[test]
    fn test_selection_deterministic_across_input_order() {
        let forward = RegistrySnapshot::new((1..=5).map(|i| (addr(i), u64::from(i) * 10)));
        let reverse = RegistrySnapshot::new((1..=5).rev().map(|i| (addr(i), u64::from(i) * 10)));
        assert_eq!(forward, reverse);
        assert_eq!(forward.hash(), reverse.hash());

        for slot in 0..50 {
            assert_eq!(
                select_validator(&forward, 42, slot).unwrap(),
                select_validator(&reverse, 42, slot).unwrap()
            );
        }
    }

    #[test]
    fn test_selection_zero_stake_fails() {
        assert!(matches!(
            select_validator(&RegistrySnapshot::default(), 1, 1),
            Err(ChainError::NoEligibleValidators)
        ));
        let zeroes = RegistrySnapshot::new(vec![(addr(1), 0), (addr(2), 0)]);
        assert!(zeroes.is_empty());
        assert!(select_validator(&zeroes, 1, 1).is_err());
    }

    #[test]
    fn test_selection_single_validator_always_wins() {
        let snapshot = RegistrySnapshot::new(vec![(addr(3), 1)]);
        for slot in 0..20 {
            assert_eq!(select_validator(&snapshot, 9, slot).unwrap(), addr(3));
        }
    }

    #[test]
    fn test_selection_roughly_stake_proportional() {
        let snapshot = RegistrySnapshot::new(vec![(addr(1), 100), (addr(2), 300)]);
        let heavy = (0..4_000)
            .filter(|slot| select_validator(&snapshot, 11, *slot).unwrap() == addr(2))
            .count();
        // Expect ~3000; allow generous tolerance.
        assert!((2_700..=3_300).contains(&heavy), "heavy validator won {heavy} slots");
    }

    #[test]
    fn test_interval_boundaries() {
        let snapshot = RegistrySnapshot::new(vec![(addr(1), 100), (addr(2), 300)]);
        let bounds = snapshot.cumulative_bounds();
        assert_eq!(bounds, vec![100, 400]);
        assert_eq!(bounds.partition_point(|end| *end <= 0), 0);
        assert_eq!(bounds.partition_point(|end| *end <= 99), 0);
        assert_eq!(bounds.partition_point(|end| *end <= 100), 1);
        assert_eq!(bounds.partition_point(|end| *end <= 399), 1);
    }

    #[test]
    fn test_engine_records_assignment() {
        let registry = Arc::new(RwLock::new(
            ValidatorRegistry::with_validators(
                RegistryConfig::default(),
                vec![(addr(1), 100), (addr(2), 300)],
            )
            .unwrap(),
        ));
        let engine = SelectionEngine::new(registry.clone());

        let proposer = engine.select_for_slot(7, 3).unwrap();
        let reg = registry.read();
        let (slot, pending) = reg.pending_slot().expect("pending slot recorded");
        assert_eq!(slot, 3);
        assert_eq!(pending, &proposer);
        assert!(SelectionEngine::verify_proposer(&reg.snapshot(), 7, 3, &proposer));
    }

    #[test]
    fn test_engine_schedule_matches_pure_function() {
        let registry = Arc::new(RwLock::new(
            ValidatorRegistry::with_validators(
                RegistryConfig::default(),
                (1..=4).map(|i| (addr(i), 50)),
            )
            .unwrap(),
        ));
        let engine = SelectionEngine::new(registry.clone());
        let schedule = engine.epoch_schedule(5, 10, 8).unwrap();
        let snapshot = registry.read().snapshot();
        assert_eq!(schedule.len(), 8);
        for (slot, proposer) in schedule {
            assert_eq!(select_validator(&snapshot, 5, slot).unwrap(), proposer);
        }
        assert!(registry.read().pending_slot().is_none());
    }

    #[test]
    fn test_schedule_stops_at_last_slot() {
        let registry = Arc::new(RwLock::new(
            ValidatorRegistry::with_validators(RegistryConfig::default(), vec![(addr(1), 10)]).unwrap(),
        ));
        let engine = SelectionEngine::new(registry);
        let schedule = engine.epoch_schedule(1, Slot::MAX - 2, 10).unwrap();
        let slots: Vec<Slot> = schedule.iter().map(|(slot, _)| *slot).collect();
        assert_eq!(slots, vec![Slot::MAX - 2, Slot::MAX - 1]);
    }

    #[test]
    fn test_derive_epoch_seed_changes_with_finality() {
        let s1 = derive_epoch_seed(7, &Hash::compute(b"block-a"));
        let s2 = derive_epoch_seed(7, &Hash::compute(b"block-b"));
        assert_ne!(s1, s2);
        assert_eq!(s1, derive_epoch_seed(7, &Hash::compute(b"block-a")));
    }
}
