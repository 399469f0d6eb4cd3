//! Consensus scoring over validators' weight matrices.
//!
//! For every participant each validator contributes one value, its
//! normalised weight for that participant (0 when it did not score the
//! participant). Values are sorted, `floor(n × trim_fraction)` are dropped
//! from each end, and the survivors are averaged weighted by validator stake.
//! Up to `trim_fraction` of validators pushing extreme values therefore
//! cannot move a participant's score outside the honest range.

use std::collections::{BTreeMap, BTreeSet};

use crate::merkle::compute_merkle_root;
use crate::types::{Address, Hash, Uid};

// ---------------------------------------------------------------------------
// Trimmed mean
// ---------------------------------------------------------------------------

/// Stake-weighted mean of `(value, stake)` pairs after trimming both tails.
///
/// At least one value always survives trimming. When every surviving stake
/// is zero the plain mean is used instead.
pub fn trimmed_weighted_mean(values: &mut [(f64, u64)], trim_fraction: f64) -> f64 {
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    values.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let mut trim = (n as f64 * trim_fraction.clamp(0.0, 0.5)).floor() as usize;
    if 2 * trim >= n {
        trim = (n - 1) / 2;
    }
    let kept = &values[trim..n - trim];

    let total_stake: u128 = kept.iter().map(|(_, s)| u128::from(*s)).sum();
    if total_stake == 0 {
        return kept.iter().map(|(v, _)| v).sum::<f64>() / kept.len() as f64;
    }
    kept.iter()
        .map(|(v, s)| v * (*s as f64))
        .sum::<f64>()
        / total_stake as f64
}

// ---------------------------------------------------------------------------
// Consensus scores
// ---------------------------------------------------------------------------

/// Consensus score per participant, ordered by ascending uid.
///
/// `rows` holds each validator's normalised weights; `stakes` their stake.
pub fn compute_consensus_scores(
    rows: &BTreeMap<Address, BTreeMap<Uid, f64>>,
    stakes: &BTreeMap<Address, u64>,
    trim_fraction: f64,
) -> BTreeMap<Uid, f64> {
    let participants: BTreeSet<Uid> = rows.values().flat_map(|row| row.keys().copied()).collect();

    participants
        .into_iter()
        .map(|uid| {
            let mut values: Vec<(f64, u64)> = rows
                .iter()
                .map(|(validator, row)| {
                    let weight = row.get(&uid).copied().unwrap_or(0.0);
                    let stake = stakes.get(validator).copied().unwrap_or(0);
                    (weight, stake)
                })
                .collect();
            (uid, trimmed_weighted_mean(&mut values, trim_fraction))
        })
        .collect()
}

/// Participants ordered by score descending; equal scores by ascending uid.
pub fn ranked(scores: &BTreeMap<Uid, f64>) -> Vec<(Uid, f64)> {
    let mut ranking: Vec<(Uid, f64)> = scores.iter().map(|(u, s)| (*u, *s)).collect();
    ranking.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranking
}

/// `SHA-256(uid_le || score_bits_le)`
pub fn score_leaf(uid: Uid, score: f64) -> Hash {
    Hash::compute_parts(&[&uid.0.to_le_bytes(), &score.to_bits().to_le_bytes()])
}

/// Merkle root over consensus scores in ascending uid order.
pub fn scores_root(scores: &BTreeMap<Uid, f64>) -> Hash {
    let leaves: Vec<Hash> = scores.iter().map(|(u, s)| score_leaf(*u, *s)).collect();
    compute_merkle_root(&leaves)
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

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_trimmed_mean_drops_tails() {
        let mut values = vec![(0.1, 1), (0.5, 1), (0.5, 1), (0.5, 1), (0.9, 1)];
        assert!(close(trimmed_weighted_mean(&mut values, 0.2), 0.5));
    }

    #[test]
    fn test_trimmed_mean_stake_weighted() {
        let mut values = vec![(0.2, 100), (0.6, 300)];
        // n = 2, trim = 0: full weighted mean.
        assert!(close(trimmed_weighted_mean(&mut values, 0.2), 0.5));
    }

    #[test]
    fn test_trimmed_mean_keeps_one_value() {
        let mut values = vec![(0.3, 10), (0.7, 10), (0.9, 10)];
        // floor(3 * 0.49) = 1: only the median survives.
        assert!(close(trimmed_weighted_mean(&mut values, 0.49), 0.7));
        let mut single = vec![(0.4, 5)];
        assert!(close(trimmed_weighted_mean(&mut single, 0.4), 0.4));
        assert_eq!(trimmed_weighted_mean(&mut [], 0.2), 0.0);
    }

    #[test]
    fn test_trimmed_mean_zero_stake_falls_back_to_plain_mean() {
        let mut values = vec![(0.2, 0), (0.4, 0)];
        assert!(close(trimmed_weighted_mean(&mut values, 0.0), 0.3));
    }

    #[test]
    fn test_missing_participant_counts_as_zero() {
        let rows = BTreeMap::from([
            (addr(1), BTreeMap::from([(Uid(1), 1.0)])),
            (addr(2), BTreeMap::from([(Uid(2), 1.0)])),
        ]);
        let stakes = BTreeMap::from([(addr(1), 100), (addr(2), 100)]);
        let scores = compute_consensus_scores(&rows, &stakes, 0.0);
        assert!(close(scores[&Uid(1)], 0.5));
        assert!(close(scores[&Uid(2)], 0.5));
    }

    #[test]
    fn test_adversary_within_trim_fraction_has_no_effect() {
        let honest = BTreeMap::from([(Uid(1), 0.6), (Uid(2), 0.4)]);
        let mut rows: BTreeMap<Address, BTreeMap<Uid, f64>> =
            (1..=4).map(|i| (addr(i), honest.clone())).collect();
        rows.insert(addr(9), BTreeMap::from([(Uid(2), 1.0)]));
        let stakes: BTreeMap<Address, u64> = rows.keys().map(|a| (a.clone(), 100)).collect();

        let scores = compute_consensus_scores(&rows, &stakes, 0.2);
        assert!(close(scores[&Uid(1)], 0.6));
        assert!(close(scores[&Uid(2)], 0.4));
    }

    #[test]
    fn test_ranked_breaks_ties_by_uid() {
        let scores = BTreeMap::from([(Uid(3), 0.25), (Uid(1), 0.25), (Uid(2), 0.5)]);
        let ranking: Vec<Uid> = ranked(&scores).into_iter().map(|(u, _)| u).collect();
        assert_eq!(ranking, vec![Uid(2), Uid(1), Uid(3)]);
    }

    #[test]
    fn test_scores_root_changes_with_score() {
        let a = BTreeMap::from([(Uid(1), 0.5), (Uid(2), 0.5)]);
        let b = BTreeMap::from([(Uid(1), 0.5), (Uid(2), 0.51)]);
        assert_ne!(scores_root(&a), scores_root(&b));
        assert_eq!(scores_root(&BTreeMap::new()), Hash::zero());
    }
}
