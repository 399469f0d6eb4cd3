//! Validator registry: identity, stake, trust and jail status.
//!
//! The registry is the single owner of `Validator` records. Callers read
//! through shared references and mutate only through the methods below, so
//! stake and jail invariants are enforced in one place.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::error::{ChainError, Result};
use crate::selection::RegistrySnapshot;
use crate::types::{Address, BalanceDelta, Beneficiary, DeltaKind, Epoch, Slot};

/// Trust score assigned to newly registered validators.
pub const INITIAL_TRUST_SCORE: f64 = 0.5;

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// On-chain state for a registered validator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub stake: u64,
    /// Slot fulfilment reputation in [0, 1].
    pub trust_score: f64,
    pub active: bool,
    pub jailed_until_epoch: Option<Epoch>,
    pub last_active_epoch: Epoch,
}

impl Validator {
    fn new(address: Address, stake: u64, epoch: Epoch) -> Self {
        Self {
            address,
            stake,
            trust_score: INITIAL_TRUST_SCORE,
            active: true,
            jailed_until_epoch: None,
            last_active_epoch: epoch,
        }
    }

    /// Eligible for selection and reward distribution.
    pub fn is_eligible(&self) -> bool {
        self.active && self.jailed_until_epoch.is_none() && self.stake > 0
    }
}

/// Per-epoch slot bookkeeping for one validator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct SlotRecord {
    assigned: u64,
    produced: u64,
}

/// Outcome of closing an epoch.
#[derive(Clone, Debug, Default, Serialize)]
pub struct EpochReport {
    pub closed_epoch: Epoch,
    pub rewards: Vec<(Address, u64)>,
    pub jailed: Vec<Address>,
    pub released: Vec<Address>,
    pub balance_deltas: Vec<BalanceDelta>,
}

// ---------------------------------------------------------------------------
// ValidatorRegistry
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct ValidatorRegistry {
    config: RegistryConfig,
    validators: BTreeMap<Address, Validator>,
    current_epoch: Epoch,
    pending_slot: Option<(Slot, Address)>,
    slot_records: HashMap<Address, SlotRecord>,
    /// Slashes since the last epoch close, handed out with the next report.
    pending_deltas: Vec<BalanceDelta>,
}

impl ValidatorRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            validators: BTreeMap::new(),
            current_epoch: 0,
            pending_slot: None,
            slot_records: HashMap::new(),
            pending_deltas: Vec::new(),
        }
    }

    /// Build a registry pre-populated with `(address, stake)` pairs.
    pub fn with_validators(
        config: RegistryConfig,
        validators: impl IntoIterator<Item = (Address, u64)>,
    ) -> Result<Self> {
        let mut registry = Self::new(config);
        for (address, stake) in validators {
            registry.add_validator(address, stake)?;
        }
        Ok(registry)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn current_epoch(&self) -> Epoch {
        self.current_epoch
    }

    pub fn get(&self, address: &Address) -> Option<&Validator> {
        self.validators.get(address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.validators.contains_key(address)
    }

    /// Validators ordered by address.
    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.values()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn is_eligible(&self, address: &Address) -> bool {
        self.validators.get(address).is_some_and(Validator::is_eligible)
    }

    /// Sum of stake over eligible validators.
    pub fn total_active_stake(&self) -> u128 {
        self.validators
            .values()
            .filter(|v| v.is_eligible())
            .map(|v| u128::from(v.stake))
            .sum()
    }

    /// Stake of each eligible validator, ordered by address.
    pub fn active_stakes(&self) -> BTreeMap<Address, u64> {
        self.validators
            .values()
            .filter(|v| v.is_eligible())
            .map(|v| (v.address.clone(), v.stake))
            .collect()
    }

    /// Immutable view used by the selection engine.
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot::new(self.active_stakes())
    }

    pub fn pending_slot(&self) -> Option<(Slot, &Address)> {
        self.pending_slot.as_ref().map(|(slot, addr)| (*slot, addr))
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    pub fn add_validator(&mut self, address: Address, stake: u64) -> Result<()> {
        if self.validators.contains_key(&address) {
            return Err(ChainError::DuplicateValidator(address.to_hex()));
        }
        if stake < self.config.min_stake {
            return Err(ChainError::InvalidStake(format!(
                "stake {stake} below minimum {}",
                self.config.min_stake
            )));
        }

        info!(validator = %address, stake, "validator registered");
        self.validators
            .insert(address.clone(), Validator::new(address, stake, self.current_epoch));
        Ok(())
    }

    /// Remove a validator unless it owns the pending slot.
    pub fn remove_validator(&mut self, address: &Address) -> Result<Validator> {
        if let Some((slot, pending)) = &self.pending_slot {
            if pending == address {
                return Err(ChainError::ValidatorBusy {
                    address: address.to_hex(),
                    slot: *slot,
                });
            }
        }

        let removed = self
            .validators
            .remove(address)
            .ok_or_else(|| ChainError::ValidatorNotFound(address.to_hex()))?;
        self.slot_records.remove(address);
        info!(validator = %address, "validator removed");
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Stake and status mutation
    // -----------------------------------------------------------------------

    fn validator_mut(&mut self, address: &Address) -> Result<&mut Validator> {
        self.validators
            .get_mut(address)
            .ok_or_else(|| ChainError::ValidatorNotFound(address.to_hex()))
    }

    /// Exclude a validator from selection and rewards until `until_epoch`.
    pub fn jail(&mut self, address: &Address, until_epoch: Epoch) -> Result<()> {
        let validator = self.validator_mut(address)?;
        validator.active = false;
        // A longer existing sentence is never shortened.
        let until = validator
            .jailed_until_epoch
            .map_or(until_epoch, |current| current.max(until_epoch));
        validator.jailed_until_epoch = Some(until);
        warn!(validator = %address, until_epoch = until, "validator jailed");
        Ok(())
    }

    /// Burn `fraction` of a validator's stake. Returns the amount burned.
    pub fn slash(&mut self, address: &Address, fraction: f64) -> Result<u64> {
        if !(0.0..=1.0).contains(&fraction) || fraction.is_nan() {
            return Err(ChainError::InvalidStake(format!(
                "slash fraction out of range [0, 1]: {fraction}"
            )));
        }
        let min_stake = self.config.min_stake;
        let validator = self.validator_mut(address)?;
        let amount = ((validator.stake as f64) * fraction).floor() as u64;
        let amount = amount.min(validator.stake);
        validator.stake -= amount;
        if validator.stake < min_stake {
            validator.active = false;
        }
        warn!(validator = %address, amount, remaining = validator.stake, "validator slashed");
        if amount > 0 {
            self.pending_deltas.push(BalanceDelta {
                beneficiary: Beneficiary::Validator(address.clone()),
                delta: -i128::from(amount),
                kind: DeltaKind::Slash,
            });
        }
        Ok(amount)
    }

    /// Credit `amount` to a validator's stake and queue the reward event.
    pub fn reward(&mut self, address: &Address, amount: u64) -> Result<()> {
        self.credit(address, amount)?;
        if amount > 0 {
            self.pending_deltas.push(BalanceDelta {
                beneficiary: Beneficiary::Validator(address.clone()),
                delta: i128::from(amount),
                kind: DeltaKind::BlockReward,
            });
        }
        debug!(validator = %address, amount, "validator rewarded");
        Ok(())
    }

    /// Bond additional stake. No ledger event: the funds come from the
    /// validator's own balance.
    pub fn add_stake(&mut self, address: &Address, amount: u64) -> Result<()> {
        self.credit(address, amount)
    }

    fn credit(&mut self, address: &Address, amount: u64) -> Result<()> {
        let validator = self.validator_mut(address)?;
        validator.stake = validator
            .stake
            .checked_add(amount)
            .ok_or_else(|| ChainError::InvalidStake("stake overflow".into()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Slot bookkeeping
    // -----------------------------------------------------------------------

    /// Record that `address` was selected to propose at `slot`.
    pub fn record_assignment(&mut self, slot: Slot, address: &Address) -> Result<()> {
        if !self.validators.contains_key(address) {
            return Err(ChainError::ValidatorNotFound(address.to_hex()));
        }
        self.slot_records.entry(address.clone()).or_default().assigned += 1;
        self.pending_slot = Some((slot, address.clone()));
        Ok(())
    }

    /// Record a block actually produced by `address` at `slot`.
    pub fn record_block_produced(&mut self, slot: Slot, address: &Address) -> Result<()> {
        let epoch = self.current_epoch;
        let validator = self.validator_mut(address)?;
        validator.last_active_epoch = epoch;
        self.slot_records.entry(address.clone()).or_default().produced += 1;
        if matches!(&self.pending_slot, Some((pending, owner)) if *pending == slot && owner == address)
        {
            self.pending_slot = None;
        }
        Ok(())
    }

    /// Close the current epoch.
    ///
    /// Block producers share `epoch_block_reward` in proportion to the blocks
    /// they produced. Validators that missed more than
    /// `missed_slot_jail_fraction` of their assigned slots are jailed for
    /// `jail_epochs`. Trust scores move toward the slot fulfilment ratio and
    /// jails that have run out are released.
    pub fn process_epoch_end(&mut self) -> EpochReport {
        let closed_epoch = self.current_epoch;
        let mut report = EpochReport {
            closed_epoch,
            balance_deltas: std::mem::take(&mut self.pending_deltas),
            ..EpochReport::default()
        };

        let records = std::mem::take(&mut self.slot_records);
        let total_produced: u128 = self
            .validators
            .values()
            .filter(|v| v.is_eligible())
            .filter_map(|v| records.get(&v.address))
            .map(|r| u128::from(r.produced))
            .sum();

        let reward_pool = u128::from(self.config.epoch_block_reward);
        let jail_until = closed_epoch + 1 + self.config.jail_epochs;
        let smoothing = self.config.trust_smoothing;
        let jail_fraction = self.config.missed_slot_jail_fraction;

        for validator in self.validators.values_mut() {
            let record = records.get(&validator.address).copied().unwrap_or_default();

            if validator.is_eligible() && record.produced > 0 && total_produced > 0 {
                let share = reward_pool * u128::from(record.produced) / total_produced;
                let share = u64::try_from(share).unwrap_or(u64::MAX);
                if share > 0 {
                    validator.stake = validator.stake.saturating_add(share);
                    report.rewards.push((validator.address.clone(), share));
                    report.balance_deltas.push(BalanceDelta {
                        beneficiary: Beneficiary::Validator(validator.address.clone()),
                        delta: i128::from(share),
                        kind: DeltaKind::BlockReward,
                    });
                }
            }

            if record.assigned > 0 {
                let fulfilled = record.produced.min(record.assigned) as f64 / record.assigned as f64;
                validator.trust_score =
                    ((1.0 - smoothing) * validator.trust_score + smoothing * fulfilled).clamp(0.0, 1.0);

                let missed = 1.0 - fulfilled;
                if missed > jail_fraction && validator.jailed_until_epoch.is_none() {
                    validator.active = false;
                    validator.jailed_until_epoch = Some(jail_until);
                    warn!(
                        validator = %validator.address,
                        assigned = record.assigned,
                        produced = record.produced,
                        until_epoch = jail_until,
                        "validator jailed for missed slots"
                    );
                    report.jailed.push(validator.address.clone());
                }
            }
        }

        self.current_epoch += 1;
        self.pending_slot = None;
        let epoch = self.current_epoch;
        for validator in self.validators.values_mut() {
            if let Some(until) = validator.jailed_until_epoch {
                if until <= epoch {
                    validator.jailed_until_epoch = None;
                    validator.active = validator.stake >= self.config.min_stake;
                    info!(validator = %validator.address, epoch, "validator released from jail");
                    report.released.push(validator.address.clone());
                }
            }
        }

        info!(
            epoch = closed_epoch,
            rewarded = report.rewards.len(),
            jailed = report.jailed.len(),
            released = report.released.len(),
            "epoch closed"
        );
        report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::from_bytes([byte; 32])
    }

    fn registry(stakes: &[(u8, u64)]) -> ValidatorRegistry {
        ValidatorRegistry::with_validators(
            RegistryConfig::default(),
            stakes.iter().map(|(b, s)| (addr(*b), *s)),
        )
        .expect("valid registry")
    }

    #[test]
    fn test_add_duplicate_rejected() {
        let mut reg = registry(&[(1, 100)]);
        let err = reg.add_validator(addr(1), 50).unwrap_err();
        assert!(matches!(err, ChainError::DuplicateValidator(_)));
        assert_eq!(reg.get(&addr(1)).unwrap().stake, 100);
    }

    #[test]
    fn test_add_below_min_stake_rejected() {
        let mut reg = registry(&[]);
        assert!(matches!(
            reg.add_validator(addr(1), 0),
            Err(ChainError::InvalidStake(_))
        ));
    }

    #[test]
    fn test_remove_busy_validator() {
        let mut reg = registry(&[(1, 100), (2, 100)]);
        reg.record_assignment(7, &addr(1)).unwrap();

        let err = reg.remove_validator(&addr(1)).unwrap_err();
        assert!(matches!(err, ChainError::ValidatorBusy { slot: 7, .. }));

        // Other validators can still leave.
        assert!(reg.remove_validator(&addr(2)).is_ok());

        // Once the slot is produced the validator is free.
        reg.record_block_produced(7, &addr(1)).unwrap();
        assert!(reg.remove_validator(&addr(1)).is_ok());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_remove_unknown() {
        let mut reg = registry(&[]);
        assert!(matches!(
            reg.remove_validator(&addr(9)),
            Err(ChainError::ValidatorNotFound(_))
        ));
    }

    #[test]
    fn test_jail_excludes_from_active_stake() {
        let mut reg = registry(&[(1, 100), (2, 300)]);
        assert_eq!(reg.total_active_stake(), 400);

        reg.jail(&addr(2), 3).unwrap();
        assert!(!reg.is_eligible(&addr(2)));
        assert_eq!(reg.total_active_stake(), 100);
        assert_eq!(reg.snapshot().entries().len(), 1);
    }

    #[test]
    fn test_jail_released_at_until_epoch() {
        let mut reg = registry(&[(1, 100)]);
        reg.jail(&addr(1), 2).unwrap();

        let report = reg.process_epoch_end(); // epoch 0 -> 1
        assert!(report.released.is_empty());
        assert!(!reg.is_eligible(&addr(1)));

        let report = reg.process_epoch_end(); // epoch 1 -> 2
        assert_eq!(report.released, vec![addr(1)]);
        assert!(reg.is_eligible(&addr(1)));
    }

    #[test]
    fn test_slash_never_negative() {
        let mut reg = registry(&[(1, 101)]);
        assert_eq!(reg.slash(&addr(1), 0.5).unwrap(), 50);
        assert_eq!(reg.get(&addr(1)).unwrap().stake, 51);

        assert_eq!(reg.slash(&addr(1), 1.0).unwrap(), 51);
        let v = reg.get(&addr(1)).unwrap();
        assert_eq!(v.stake, 0);
        assert!(!v.is_eligible());

        assert!(reg.slash(&addr(1), 1.5).is_err());
        assert!(reg.slash(&addr(1), f64::NAN).is_err());

        let report = reg.process_epoch_end();
        let slashed: i128 = report
            .balance_deltas
            .iter()
            .filter(|d| d.kind == DeltaKind::Slash)
            .map(|d| d.delta)
            .sum();
        assert_eq!(slashed, -101);
    }

    #[test]
    fn test_epoch_end_rewards_proportional_to_blocks() {
        let mut reg = registry(&[(1, 100), (2, 100), (3, 100)]);
        for slot in 0..3 {
            reg.record_assignment(slot, &addr(1)).unwrap();
            reg.record_block_produced(slot, &addr(1)).unwrap();
        }
        reg.record_assignment(3, &addr(2)).unwrap();
        reg.record_block_produced(3, &addr(2)).unwrap();

        let report = reg.process_epoch_end();
        // 1000 split 3:1
        assert_eq!(report.rewards, vec![(addr(1), 750), (addr(2), 250)]);
        assert_eq!(reg.get(&addr(1)).unwrap().stake, 850);
        assert_eq!(reg.get(&addr(3)).unwrap().stake, 100);
        assert_eq!(report.balance_deltas.len(), 2);
        assert_eq!(reg.current_epoch(), 1);
    }

    #[test]
    fn test_epoch_end_jails_missed_slots() {
        let mut reg = registry(&[(1, 100), (2, 100)]);
        // addr(1) misses 3 of 4 slots, addr(2) produces its only slot
        for slot in 0..4 {
            reg.record_assignment(slot, &addr(1)).unwrap();
        }
        reg.record_block_produced(0, &addr(1)).unwrap();
        reg.record_assignment(4, &addr(2)).unwrap();
        reg.record_block_produced(4, &addr(2)).unwrap();

        let report = reg.process_epoch_end();
        assert_eq!(report.jailed, vec![addr(1)]);
        let jailed = reg.get(&addr(1)).unwrap();
        assert_eq!(jailed.jailed_until_epoch, Some(3));
        assert!(jailed.trust_score < INITIAL_TRUST_SCORE);
        assert!(reg.get(&addr(2)).unwrap().trust_score > INITIAL_TRUST_SCORE);
    }

    #[test]
    fn test_jailed_validator_not_rewarded() {
        let mut reg = registry(&[(1, 100), (2, 100)]);
        reg.record_assignment(0, &addr(1)).unwrap();
        reg.record_block_produced(0, &addr(1)).unwrap();
        reg.record_assignment(1, &addr(2)).unwrap();
        reg.record_block_produced(1, &addr(2)).unwrap();
        reg.jail(&addr(2), 5).unwrap();

        let report = reg.process_epoch_end();
        assert_eq!(report.rewards, vec![(addr(1), 1_000)]);
    }

    #[test]
    fn test_reward_emits_event_but_add_stake_does_not() {
        let mut reg = registry(&[(1, 100)]);
        reg.reward(&addr(1), 40).unwrap();
        reg.add_stake(&addr(1), 60).unwrap();
        assert_eq!(reg.get(&addr(1)).unwrap().stake, 200);
        assert!(reg.reward(&addr(9), 1).is_err());

        let report = reg.process_epoch_end();
        assert_eq!(report.balance_deltas.len(), 1);
        assert_eq!(report.balance_deltas[0].delta, 40);
        // Drained once.
        assert!(reg.process_epoch_end().balance_deltas.is_empty());
    }
}
