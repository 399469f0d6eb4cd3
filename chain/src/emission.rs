//! Epoch emission: budget, pool split and payout schedule.
//!
//! All amounts are integer token units. Every division floors, so the sum of
//! payouts never exceeds the budget; whatever a pool cannot distribute stays
//! undistributed and is reported as such.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::archive::StateBackend;
use crate::config::{EmissionConfig, BPS_DENOMINATOR};
use crate::error::Result;
use crate::merkle::compute_merkle_root;
use crate::types::{Address, BalanceDelta, Beneficiary, DeltaKind, Epoch, Hash, SubnetId, Uid};

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

/// `0.5 ^ (epoch / halving_interval)`. A zero interval disables halving.
pub fn epoch_multiplier(epoch: Epoch, halving_interval_epochs: u64) -> f64 {
    if halving_interval_epochs == 0 {
        return 1.0;
    }
    let halvings = epoch / halving_interval_epochs;
    if halvings >= 64 {
        return 0.0;
    }
    0.5f64.powi(halvings as i32)
}

/// `min(floor(base_reward × multiplier × utility), remaining_supply)`.
pub fn emission_budget(
    config: &EmissionConfig,
    epoch: Epoch,
    utility_score: f64,
    remaining_supply: u64,
) -> u64 {
    let utility = if utility_score.is_finite() {
        utility_score.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let raw = config.base_reward as f64 * epoch_multiplier(epoch, config.halving_interval_epochs) * utility;
    (raw.floor() as u64).min(remaining_supply)
}

// ---------------------------------------------------------------------------
// Supply ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SupplyState {
    minted: u64,
    reserved: u64,
}

/// Token supply shared by every subnet. Rounds reserve their budget before
/// building a schedule and settle it once the datum is committed, so the sum
/// over all subnets never passes `max_supply`.
#[derive(Debug)]
pub struct SupplyLedger {
    max_supply: u64,
    state: Mutex<SupplyState>,
}

impl SupplyLedger {
    pub fn new(max_supply: u64, minted: u64) -> Self {
        Self {
            max_supply,
            state: Mutex::new(SupplyState {
                minted: minted.min(max_supply),
                reserved: 0,
            }),
        }
    }

    /// Rebuild the minted total from the latest datum of each subnet.
    pub fn recover(max_supply: u64, backend: &dyn StateBackend, subnets: &[SubnetId]) -> Result<Self> {
        let mut minted = 0u64;
        for subnet_id in subnets {
            if let Some(datum) = backend.latest(*subnet_id)? {
                minted = minted.saturating_add(datum.cumulative_emission);
            }
        }
        Ok(Self::new(max_supply, minted))
    }

    pub fn max_supply(&self) -> u64 {
        self.max_supply
    }

    pub fn minted(&self) -> u64 {
        self.state.lock().minted
    }

    /// Supply neither minted nor held by an open reservation.
    pub fn remaining(&self) -> u64 {
        let state = self.state.lock();
        self.max_supply - state.minted - state.reserved
    }

    /// Hold up to `wanted` tokens. The grant is released when the
    /// reservation drops unless it was settled first.
    pub fn reserve(&self, wanted: u64) -> SupplyReservation<'_> {
        let mut state = self.state.lock();
        let available = self.max_supply - state.minted - state.reserved;
        let amount = wanted.min(available);
        state.reserved += amount;
        SupplyReservation {
            ledger: self,
            amount,
            settled: false,
        }
    }
}

#[derive(Debug)]
pub struct SupplyReservation<'a> {
    ledger: &'a SupplyLedger,
    amount: u64,
    settled: bool,
}

impl SupplyReservation<'_> {
    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// Mint `paid` (at most the reserved amount) and hand the rest back.
    pub fn settle(mut self, paid: u64) {
        let paid = paid.min(self.amount);
        let mut state = self.ledger.state.lock();
        state.reserved -= self.amount;
        state.minted += paid;
        self.settled = true;
    }
}

impl Drop for SupplyReservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.ledger.state.lock().reserved -= self.amount;
            debug!(amount = self.amount, "supply reservation released");
        }
    }
}

// ---------------------------------------------------------------------------
// Pools
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Pool {
    Miner,
    Validator,
    Dao,
}

impl Pool {
    fn tag(self) -> u8 {
        match self {
            Pool::Miner => 0,
            Pool::Validator => 1,
            Pool::Dao => 2,
        }
    }

    fn delta_kind(self) -> DeltaKind {
        match self {
            Pool::Miner => DeltaKind::MinerEmission,
            Pool::Validator => DeltaKind::ValidatorEmission,
            Pool::Dao => DeltaKind::TreasuryEmission,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSplit {
    pub miner: u64,
    pub validator: u64,
    pub dao: u64,
}

impl PoolSplit {
    pub fn total(&self) -> u64 {
        self.miner + self.validator + self.dao
    }
}

/// Split `budget` by basis points. The DAO pool absorbs rounding, so the
/// pools always sum to the budget.
pub fn split_pools(budget: u64, config: &EmissionConfig) -> PoolSplit {
    let share = |bps: u16| -> u64 {
        (u128::from(budget) * u128::from(bps) / u128::from(BPS_DENOMINATOR)) as u64
    };
    let miner = share(config.miner_share_bps);
    let validator = share(config.validator_share_bps).min(budget - miner);
    PoolSplit {
        miner,
        validator,
        dao: budget - miner - validator,
    }
}

/// Floor-divide `pool` proportionally to `weights`. Non-positive and
/// non-finite weights receive nothing; the result never sums above `pool`.
fn distribute<K: Clone>(pool: u64, weights: &[(K, f64)]) -> Vec<(K, u64)> {
    let usable = |w: f64| w.is_finite() && w > 0.0;
    let total: f64 = weights.iter().map(|(_, w)| *w).filter(|w| usable(*w)).sum();
    if pool == 0 || total <= 0.0 {
        return Vec::new();
    }

    let mut remaining = pool;
    let mut shares = Vec::with_capacity(weights.len());
    for (key, weight) in weights {
        if !usable(*weight) {
            continue;
        }
        let amount = ((pool as f64) * (*weight / total)).floor() as u64;
        let amount = amount.min(remaining);
        remaining -= amount;
        if amount > 0 {
            shares.push((key.clone(), amount));
        }
    }
    shares
}

// ---------------------------------------------------------------------------
// EmissionSchedule
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub beneficiary: Beneficiary,
    pub pool: Pool,
    pub amount: u64,
}

impl Payout {
    pub fn leaf_hash(&self) -> Hash {
        let mut bytes = Vec::with_capacity(48);
        match &self.beneficiary {
            Beneficiary::Validator(address) => {
                bytes.push(0);
                bytes.extend_from_slice(address.as_bytes());
            }
            Beneficiary::Miner { subnet, uid } => {
                bytes.push(1);
                bytes.extend_from_slice(&subnet.0.to_le_bytes());
                bytes.extend_from_slice(&uid.0.to_le_bytes());
            }
            Beneficiary::Treasury => bytes.push(2),
        }
        bytes.push(self.pool.tag());
        bytes.extend_from_slice(&self.amount.to_le_bytes());
        Hash::compute(&bytes)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmissionSchedule {
    pub subnet_id: SubnetId,
    pub epoch: Epoch,
    pub budget: u64,
    pub pools: PoolSplit,
    pub payouts: Vec<Payout>,
}

impl EmissionSchedule {
    /// Pay miners by consensus score, validators by `validator_weights`
    /// (stake weight plus task rewards) and the DAO pool to the treasury.
    pub fn build(
        subnet_id: SubnetId,
        epoch: Epoch,
        budget: u64,
        config: &EmissionConfig,
        consensus_scores: &BTreeMap<Uid, f64>,
        validator_weights: &BTreeMap<Address, f64>,
    ) -> Self {
        let pools = split_pools(budget, config);
        let mut payouts = Vec::new();

        let miners: Vec<(Uid, f64)> = consensus_scores.iter().map(|(u, s)| (*u, *s)).collect();
        payouts.extend(distribute(pools.miner, &miners).into_iter().map(|(uid, amount)| Payout {
            beneficiary: Beneficiary::Miner { subnet: subnet_id, uid },
            pool: Pool::Miner,
            amount,
        }));

        let validators: Vec<(Address, f64)> = validator_weights
            .iter()
            .map(|(a, w)| (a.clone(), *w))
            .collect();
        payouts.extend(distribute(pools.validator, &validators).into_iter().map(
            |(address, amount)| Payout {
                beneficiary: Beneficiary::Validator(address),
                pool: Pool::Validator,
                amount,
            },
        ));

        if pools.dao > 0 {
            payouts.push(Payout {
                beneficiary: Beneficiary::Treasury,
                pool: Pool::Dao,
                amount: pools.dao,
            });
        }

        Self {
            subnet_id,
            epoch,
            budget,
            pools,
            payouts,
        }
    }

    pub fn total_paid(&self) -> u64 {
        self.payouts.iter().map(|p| p.amount).sum()
    }

    /// Budget left unpaid by flooring or by empty pools.
    pub fn undistributed(&self) -> u64 {
        self.budget.saturating_sub(self.total_paid())
    }

    pub fn paid_from(&self, pool: Pool) -> u64 {
        self.payouts
            .iter()
            .filter(|p| p.pool == pool)
            .map(|p| p.amount)
            .sum()
    }

    pub fn root(&self) -> Hash {
        let leaves: Vec<Hash> = self.payouts.iter().map(Payout::leaf_hash).collect();
        compute_merkle_root(&leaves)
    }

    pub fn balance_deltas(&self) -> Vec<BalanceDelta> {
        self.payouts
            .iter()
            .map(|p| BalanceDelta {
                beneficiary: p.beneficiary.clone(),
                delta: i128::from(p.amount),
                kind: p.pool.delta_kind(),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
