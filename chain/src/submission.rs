//! Signed score submissions from validators.
//!
//! A submission carries one validator's scores for the participants of a
//! subnet in a given epoch. The payload is a tagged, versioned schema: unknown
//! fields and unknown versions are rejected at decode time.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::RoundConfig;
use crate::error::{ChainError, Result};
use crate::types::{Address, Epoch, Hash, Hashable, Keypair, Signature, SubnetId, Uid};

/// Current score submission schema.
pub const SCORE_SCHEMA_VERSION: u16 = 1;

// ---------------------------------------------------------------------------
// ScoreSubmission
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoreSubmission {
    pub schema_version: u16,
    pub subnet_id: SubnetId,
    pub epoch: Epoch,
    pub validator_id: Address,
    /// Raw, non-negative scores per participant. Normalised by the round.
    pub scores: BTreeMap<Uid, f64>,
    /// Unix milliseconds at signing time.
    pub timestamp: u64,
    pub signature: Signature,
}

#[derive(Deserialize)]
struct SchemaHeader {
    schema_version: u16,
}

impl ScoreSubmission {
    /// Create a new unsigned submission.
    pub fn new(
        subnet_id: SubnetId,
        epoch: Epoch,
        validator_id: Address,
        scores: BTreeMap<Uid, f64>,
        timestamp: u64,
    ) -> Self {
        Self {
            schema_version: SCORE_SCHEMA_VERSION,
            subnet_id,
            epoch,
            validator_id,
            scores,
            timestamp,
            signature: Signature::empty(),
        }
    }

    /// Return the signable bytes (everything except the signature field).
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(56 + self.scores.len() * 12);
        bytes.extend_from_slice(&self.schema_version.to_le_bytes());
        bytes.extend_from_slice(&self.subnet_id.0.to_le_bytes());
        bytes.extend_from_slice(&self.epoch.to_le_bytes());
        bytes.extend_from_slice(self.validator_id.as_bytes());
        bytes.extend_from_slice(&(self.scores.len() as u64).to_le_bytes());
        for (uid, score) in &self.scores {
            bytes.extend_from_slice(&uid.0.to_le_bytes());
            bytes.extend_from_slice(&score.to_le_bytes());
        }
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes
    }

    /// Sign this submission with a keypair.
    pub fn sign(&mut self, keypair: &Keypair) {
        self.signature = keypair.sign(&self.signable_bytes());
    }

    /// Verify the signature is valid for the validator address.
    pub fn verify_signature(&self) -> bool {
        crate::types::verify_signature(&self.validator_id, &self.signable_bytes(), &self.signature)
    }

    /// Identity of this exact signed payload, used for replay detection.
    pub fn replay_key(&self) -> Hash {
        self.hash()
    }

    /// Scores rescaled to sum to 1. Empty when the total is not positive.
    pub fn normalized_weights(&self) -> BTreeMap<Uid, f64> {
        let total: f64 = self.scores.values().sum();
        if !(total.is_finite() && total > 0.0) {
            return BTreeMap::new();
        }
        self.scores
            .iter()
            .map(|(uid, score)| (*uid, score / total))
            .collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a wire payload, rejecting unknown schema versions and fields.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header: SchemaHeader = serde_json::from_slice(bytes)
            .map_err(|e| ChainError::MalformedSubmission(e.to_string()))?;
        if header.schema_version != SCORE_SCHEMA_VERSION {
            return Err(ChainError::UnsupportedSchema {
                expected: SCORE_SCHEMA_VERSION,
                got: header.schema_version,
            });
        }
        serde_json::from_slice(bytes).map_err(|e| ChainError::MalformedSubmission(e.to_string()))
    }
}

impl Hashable for ScoreSubmission {
    fn to_hash_bytes(&self) -> Vec<u8> {
        let mut bytes = self.signable_bytes();
        bytes.extend_from_slice(self.signature.as_bytes());
        bytes
    }
}

// ---------------------------------------------------------------------------
// Stateless validation
// ---------------------------------------------------------------------------

/// Stateless checks for one round: schema, target, scores, freshness,
/// signature. Replay detection is stateful and lives in [`ReplayGuard`].
#[derive(Debug)]
pub struct SubmissionValidator<'a> {
    config: &'a RoundConfig,
    subnet_id: SubnetId,
    epoch: Epoch,
    stakes: &'a BTreeMap<Address, u64>,
    now_ms: u64,
}

impl<'a> SubmissionValidator<'a> {
    pub fn new(
        config: &'a RoundConfig,
        subnet_id: SubnetId,
        epoch: Epoch,
        stakes: &'a BTreeMap<Address, u64>,
        now_ms: u64,
    ) -> Self {
        Self {
            config,
            subnet_id,
            epoch,
            stakes,
            now_ms,
        }
    }

    pub fn check(&self, submission: &ScoreSubmission) -> Result<()> {
        if submission.schema_version != SCORE_SCHEMA_VERSION {
            return Err(ChainError::UnsupportedSchema {
                expected: SCORE_SCHEMA_VERSION,
                got: submission.schema_version,
            });
        }
        if submission.subnet_id != self.subnet_id {
            return Err(ChainError::MalformedSubmission(format!(
                "submission for {} in round of {}",
                submission.subnet_id, self.subnet_id
            )));
        }
        if submission.epoch != self.epoch {
            return Err(ChainError::EpochMismatch {
                expected: self.epoch,
                got: submission.epoch,
            });
        }
        if !self.stakes.contains_key(&submission.validator_id) {
            return Err(ChainError::MalformedSubmission(format!(
                "validator {} has no eligible stake",
                submission.validator_id
            )));
        }
        self.check_scores(submission)?;

        if submission.timestamp.abs_diff(self.now_ms) > self.config.freshness_window_ms {
            return Err(ChainError::StaleSubmission {
                timestamp: submission.timestamp,
                now: self.now_ms,
                window_ms: self.config.freshness_window_ms,
            });
        }
        if !submission.verify_signature() {
            return Err(ChainError::InvalidSignature);
        }
        Ok(())
    }

    fn check_scores(&self, submission: &ScoreSubmission) -> Result<()> {
        if submission.scores.is_empty() {
            return Err(ChainError::MalformedSubmission("no scores".into()));
        }
        if submission.scores.len() > self.config.max_scores_per_submission {
            return Err(ChainError::MalformedSubmission(format!(
                "{} scores exceeds limit {}",
                submission.scores.len(),
                self.config.max_scores_per_submission
            )));
        }
        if let Some((uid, score)) = submission
            .scores
            .iter()
            .find(|(_, s)| !s.is_finite() || **s < 0.0)
        {
            return Err(ChainError::MalformedSubmission(format!(
                "invalid score {score} for {uid}"
            )));
        }
        let sum: f64 = submission.scores.values().sum();
        if !sum.is_finite() || sum <= 0.0 {
            return Err(ChainError::MalformedSubmission(format!("scores sum to {sum}")));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ReplayGuard
// ---------------------------------------------------------------------------

/// Remembers signed payloads that were already counted in a committed round,
/// grouped by the epoch they were counted in.
#[derive(Clone, Debug, Default)]
pub struct ReplayGuard {
    seen: BTreeMap<Epoch, HashSet<Hash>>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &Hash) -> bool {
        self.seen.values().any(|keys| keys.contains(key))
    }

    pub fn check(&self, submission: &ScoreSubmission) -> Result<()> {
        let key = submission.replay_key();
        if self.contains(&key) {
            return Err(ChainError::ReplayedSubmission(key.to_hex()));
        }
        Ok(())
    }

    /// Record keys once their round has committed.
    pub fn extend(&mut self, epoch: Epoch, keys: impl IntoIterator<Item = Hash>) {
        self.seen.entry(epoch).or_default().extend(keys);
    }

    /// Forget epochs older than `epoch`. Their submissions already fail the
    /// epoch check. Returns how many keys were dropped.
    pub fn prune_below(&mut self, epoch: Epoch) -> usize {
        let kept = self.seen.split_off(&epoch);
        let dropped = std::mem::replace(&mut self.seen, kept);
        dropped.values().map(HashSet::len).sum()
    }

    pub fn len(&self) -> usize {
        self.seen.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.values().all(HashSet::is_empty)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    fn signed(kp: &Keypair, scores: &[(u32, f64)], timestamp: u64) -> ScoreSubmission {
        let scores = scores.iter().map(|(u, s)| (Uid(*u), *s)).collect();
        let mut sub = ScoreSubmission::new(SubnetId(1), 4, kp.address(), scores, timestamp);
        sub.sign(kp);
        sub
    }

    fn stakes_for(kp: &Keypair) -> BTreeMap<Address, u64> {
        BTreeMap::from([(kp.address(), 100)])
    }

    #[test]
    fn test_valid_submission_passes() {
        let kp = Keypair::generate();
        let config = RoundConfig::default();
        let stakes = stakes_for(&kp);
        let validator = SubmissionValidator::new(&config, SubnetId(1), 4, &stakes, NOW);
        let sub = signed(&kp, &[(1, 3.0), (2, 1.0)], NOW - 1_000);
        assert!(validator.check(&sub).is_ok());
    }

    #[test]
    fn test_stale_and_future_rejected() {
        let kp = Keypair::generate();
        let config = RoundConfig::default();
        let stakes = stakes_for(&kp);
        let validator = SubmissionValidator::new(&config, SubnetId(1), 4, &stakes, NOW);

        let old = signed(&kp, &[(1, 1.0)], NOW - config.freshness_window_ms - 1);
        assert!(matches!(validator.check(&old), Err(ChainError::StaleSubmission { .. })));

        let future = signed(&kp, &[(1, 1.0)], NOW + config.freshness_window_ms + 1);
        assert!(matches!(validator.check(&future), Err(ChainError::StaleSubmission { .. })));

        let edge = signed(&kp, &[(1, 1.0)], NOW - config.freshness_window_ms);
        assert!(validator.check(&edge).is_ok());
    }

    #[test]
    fn test_tampered_scores_fail_signature() {
        let kp = Keypair::generate();
        let config = RoundConfig::default();
        let stakes = stakes_for(&kp);
        let validator = SubmissionValidator::new(&config, SubnetId(1), 4, &stakes, NOW);

        let mut sub = signed(&kp, &[(1, 1.0), (2, 1.0)], NOW);
        sub.scores.insert(Uid(2), 9.0);
        assert!(matches!(validator.check(&sub), Err(ChainError::InvalidSignature)));
    }

    #[test]
    fn test_bad_scores_rejected() {
        let kp = Keypair::generate();
        let config = RoundConfig::default();
        let stakes = stakes_for(&kp);
        let validator = SubmissionValidator::new(&config, SubnetId(1), 4, &stakes, NOW);

        for scores in [
            vec![],
            vec![(1, -1.0)],
            vec![(1, f64::NAN)],
            vec![(1, 0.0), (2, 0.0)],
            vec![(1, f64::MAX), (2, f64::MAX)],
        ] {
            let sub = signed(&kp, &scores, NOW);
            assert!(
                matches!(validator.check(&sub), Err(ChainError::MalformedSubmission(_))),
                "scores {scores:?} must be rejected"
            );
        }
    }

    #[test]
    fn test_unknown_validator_and_wrong_epoch() {
        let kp = Keypair::generate();
        let stranger = Keypair::generate();
        let config = RoundConfig::default();
        let stakes = stakes_for(&kp);
        let validator = SubmissionValidator::new(&config, SubnetId(1), 5, &stakes, NOW);

        let sub = signed(&stranger, &[(1, 1.0)], NOW);
        assert!(validator.check(&sub).is_err());

        let sub = signed(&kp, &[(1, 1.0)], NOW);
        assert!(matches!(
            validator.check(&sub),
            Err(ChainError::EpochMismatch { expected: 5, got: 4 })
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_fields_and_versions() {
        let kp = Keypair::generate();
        let sub = signed(&kp, &[(3, 0.5), (7, 0.5)], NOW);
        let bytes = sub.encode().unwrap();
        assert_eq!(ScoreSubmission::decode(&bytes).unwrap(), sub);

        let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        value["extra"] = serde_json::json!(1);
        let tampered = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            ScoreSubmission::decode(&tampered),
            Err(ChainError::MalformedSubmission(_))
        ));

        let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        value["schema_version"] = serde_json::json!(2);
        let future = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            ScoreSubmission::decode(&future),
            Err(ChainError::UnsupportedSchema { expected: 1, got: 2 })
        ));
    }

    #[test]
    fn test_normalized_weights_sum_to_one() {
        let kp = Keypair::generate();
        let sub = signed(&kp, &[(1, 3.0), (2, 1.0)], NOW);
        let w = sub.normalized_weights();
        assert!((w[&Uid(1)] - 0.75).abs() < 1e-12);
        assert!((w.values().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_replay_guard() {
        let kp = Keypair::generate();
        let sub = signed(&kp, &[(1, 1.0)], NOW);
        let mut guard = ReplayGuard::new();
        assert!(guard.check(&sub).is_ok());
        guard.extend(4, [sub.replay_key()]);
        assert!(matches!(guard.check(&sub), Err(ChainError::ReplayedSubmission(_))));

        // A fresh signature over new content is a different payload.
        let other = signed(&kp, &[(1, 1.0)], NOW + 1);
        assert!(guard.check(&other).is_ok());
    }

    #[test]
    fn test_replay_guard_prunes_old_epochs() {
        let mut guard = ReplayGuard::new();
        for epoch in 1..=5u64 {
            guard.extend(epoch, [Hash::compute(&epoch.to_le_bytes()), Hash::compute(&[epoch as u8; 2])]);
        }
        assert_eq!(guard.len(), 10);
        assert_eq!(guard.prune_below(4), 6);
        assert_eq!(guard.len(), 4);
        assert!(!guard.contains(&Hash::compute(&1u64.to_le_bytes())));
        assert!(guard.contains(&Hash::compute(&5u64.to_le_bytes())));
        assert_eq!(guard.prune_below(4), 0);
    }
}
