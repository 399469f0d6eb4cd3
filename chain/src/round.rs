//! Per-subnet consensus rounds.
//!
//! One round per epoch and subnet:
//!
//! 1. validate submissions (rejects are logged, the round goes on)
//! 2. normalise accepted scores into the weight matrix
//! 3. stake-weighted trimmed-mean consensus scores
//! 4. archive the weight matrix
//! 5. emission budget from the AI task utility score
//! 6. archive the emission schedule
//! 7. commit one new `SubnetAggregatedDatum`
//!
//! Any failure in steps 4-7 aborts the round: nothing is committed or cached,
//! the reserved supply goes back to the shared ledger and the next attempt
//! starts again at step 1. After a commit, replay keys and settled tasks of
//! older epochs are pruned.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::archive::StateBackend;
use crate::config::ChainConfig;
use crate::consensus::{compute_consensus_scores, scores_root};
use crate::emission::{emission_budget, EmissionSchedule, SupplyLedger};
use crate::error::{ChainError, Result};
use crate::fork_choice::ForkChoiceTracker;
use crate::submission::{ReplayGuard, ScoreSubmission, SubmissionValidator};
use crate::tasks::{AIResultValidator, EpochContributions};
use crate::types::{current_timestamp, Address, BalanceDelta, Epoch, Hash, Hashable, SubnetId, Uid};
use crate::weight_matrix::{WeightMatrixEntry, WeightMatrixStore};

// ---------------------------------------------------------------------------
// SubnetAggregatedDatum
// ---------------------------------------------------------------------------

/// Aggregate performance figures recorded with each datum.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub submissions_received: u32,
    pub submissions_accepted: u32,
    pub participants: u32,
    pub verified_tasks: u32,
    pub utility_score: f64,
    pub emission_budget: u64,
    pub emission_paid: u64,
}

/// The on-chain record of one subnet epoch. Replaced as a whole, never
/// patched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubnetAggregatedDatum {
    pub subnet_id: SubnetId,
    pub epoch: Epoch,
    pub total_stake: u128,
    pub weight_matrix_hash: Hash,
    pub weight_matrix_archive_ref: Hash,
    pub consensus_scores_root: Hash,
    pub emission_schedule_root: Hash,
    pub emission_schedule_archive_ref: Hash,
    pub metrics: RoundSummary,
    /// Emission paid out by this subnet up to and including this epoch.
    pub cumulative_emission: u64,
    /// Hash of the previous datum of the same subnet (zero for the first).
    pub previous: Hash,
}

impl SubnetAggregatedDatum {
    pub fn empty(subnet_id: SubnetId, epoch: Epoch) -> Self {
        Self {
            subnet_id,
            epoch,
            total_stake: 0,
            weight_matrix_hash: Hash::zero(),
            weight_matrix_archive_ref: Hash::zero(),
            consensus_scores_root: Hash::zero(),
            emission_schedule_root: Hash::zero(),
            emission_schedule_archive_ref: Hash::zero(),
            metrics: RoundSummary::default(),
            cumulative_emission: 0,
            previous: Hash::zero(),
        }
    }
}

impl Hashable for SubnetAggregatedDatum {
    fn to_hash_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(256);
        bytes.extend_from_slice(&self.subnet_id.0.to_le_bytes());
        bytes.extend_from_slice(&self.epoch.to_le_bytes());
        bytes.extend_from_slice(&self.total_stake.to_le_bytes());
        bytes.extend_from_slice(self.weight_matrix_hash.as_bytes());
        bytes.extend_from_slice(self.weight_matrix_archive_ref.as_bytes());
        bytes.extend_from_slice(self.consensus_scores_root.as_bytes());
        bytes.extend_from_slice(self.emission_schedule_root.as_bytes());
        bytes.extend_from_slice(self.emission_schedule_archive_ref.as_bytes());
        let m = &self.metrics;
        bytes.extend_from_slice(&m.submissions_received.to_le_bytes());
        bytes.extend_from_slice(&m.submissions_accepted.to_le_bytes());
        bytes.extend_from_slice(&m.participants.to_le_bytes());
        bytes.extend_from_slice(&m.verified_tasks.to_le_bytes());
        bytes.extend_from_slice(&m.utility_score.to_bits().to_le_bytes());
        bytes.extend_from_slice(&m.emission_budget.to_le_bytes());
        bytes.extend_from_slice(&m.emission_paid.to_le_bytes());
        bytes.extend_from_slice(&self.cumulative_emission.to_le_bytes());
        bytes.extend_from_slice(self.previous.as_bytes());
        bytes
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RoundMetrics {
    rounds_committed: AtomicU64,
    rounds_aborted: AtomicU64,
    submissions_accepted: AtomicU64,
    submissions_rejected: AtomicU64,
    replays_rejected: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub rounds_committed: u64,
    pub rounds_aborted: u64,
    pub submissions_accepted: u64,
    pub submissions_rejected: u64,
    pub replays_rejected: u64,
}

impl RoundMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rounds_committed: self.rounds_committed.load(Ordering::Relaxed),
            rounds_aborted: self.rounds_aborted.load(Ordering::Relaxed),
            submissions_accepted: self.submissions_accepted.load(Ordering::Relaxed),
            submissions_rejected: self.submissions_rejected.load(Ordering::Relaxed),
            replays_rejected: self.replays_rejected.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Requests and outcomes
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct RoundRequest {
    pub subnet_id: SubnetId,
    pub submissions: Vec<ScoreSubmission>,
    /// Eligible validator stakes for this epoch.
    pub stakes: BTreeMap<Address, u64>,
    /// Block that carried the submissions. Must still be canonical at commit.
    pub anchor: Option<Hash>,
    /// Clock used for the freshness check; wall clock when unset.
    pub now_ms: Option<u64>,
}

impl RoundRequest {
    pub fn new(
        subnet_id: SubnetId,
        submissions: Vec<ScoreSubmission>,
        stakes: BTreeMap<Address, u64>,
    ) -> Self {
        Self {
            subnet_id,
            submissions,
            stakes,
            anchor: None,
            now_ms: None,
        }
    }

    pub fn with_anchor(mut self, anchor: Hash) -> Self {
        self.anchor = Some(anchor);
        self
    }

    pub fn at(mut self, now_ms: u64) -> Self {
        self.now_ms = Some(now_ms);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RejectionKind {
    Invalid,
    /// Already counted in a committed round, or a second submission from the
    /// same validator in this one.
    Replay,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub validator_id: Address,
    pub replay_key: Hash,
    pub kind: RejectionKind,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct RoundOutcome {
    pub datum: SubnetAggregatedDatum,
    pub consensus_scores: BTreeMap<Uid, f64>,
    pub schedule: EmissionSchedule,
    pub rejections: Vec<Rejection>,
    /// Reward events for the ledger, applied together with the commit.
    pub balance_deltas: Vec<BalanceDelta>,
}

// ---------------------------------------------------------------------------
// ConsensusRoundOrchestrator
// ---------------------------------------------------------------------------

pub struct ConsensusRoundOrchestrator {
    subnet_id: SubnetId,
    config: ChainConfig,
    store: Arc<WeightMatrixStore>,
    backend: Arc<dyn StateBackend>,
    tasks: Option<Arc<RwLock<AIResultValidator>>>,
    fork_choice: Option<Arc<RwLock<ForkChoiceTracker>>>,
    replay_guard: ReplayGuard,
    supply: Arc<SupplyLedger>,
    metrics: Arc<RoundMetrics>,
    last_committed: Option<SubnetAggregatedDatum>,
}

impl fmt::Debug for ConsensusRoundOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsensusRoundOrchestrator")
            .field("subnet_id", &self.subnet_id)
            .field("last_epoch", &self.last_committed.as_ref().map(|d| d.epoch))
            .field("replay_keys", &self.replay_guard.len())
            .finish()
    }
}

/// Submissions that passed validation, in arrival order.
struct Accepted {
    submissions: Vec<ScoreSubmission>,
    rejections: Vec<Rejection>,
}

impl ConsensusRoundOrchestrator {
    /// Resume from the latest datum the backend holds for `subnet_id`. The
    /// supply ledger covers this subnet only until [`with_supply`](Self::with_supply)
    /// hands in the one shared by all subnets.
    pub fn new(
        subnet_id: SubnetId,
        config: ChainConfig,
        store: Arc<WeightMatrixStore>,
        backend: Arc<dyn StateBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let last_committed = backend.latest(subnet_id)?;
        let supply = SupplyLedger::new(
            config.emission.max_supply,
            last_committed.as_ref().map_or(0, |d| d.cumulative_emission),
        );
        Ok(Self {
            subnet_id,
            config,
            store,
            backend,
            tasks: None,
            fork_choice: None,
            replay_guard: ReplayGuard::new(),
            supply: Arc::new(supply),
            metrics: Arc::new(RoundMetrics::default()),
            last_committed,
        })
    }

    pub fn with_tasks(mut self, tasks: Arc<RwLock<AIResultValidator>>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn with_supply(mut self, supply: Arc<SupplyLedger>) -> Self {
        self.supply = supply;
        self
    }

    pub fn with_fork_choice(mut self, fork_choice: Arc<RwLock<ForkChoiceTracker>>) -> Self {
        self.fork_choice = Some(fork_choice);
        self
    }

    pub fn subnet_id(&self) -> SubnetId {
        self.subnet_id
    }

    pub fn supply(&self) -> &Arc<SupplyLedger> {
        &self.supply
    }

    pub fn replay_keys(&self) -> usize {
        self.replay_guard.len()
    }

    pub fn metrics(&self) -> Arc<RoundMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn last_committed(&self) -> Option<&SubnetAggregatedDatum> {
        self.last_committed.as_ref()
    }

    /// Epoch the next round will commit.
    pub fn next_epoch(&self) -> Epoch {
        self.last_committed.as_ref().map_or(1, |d| d.epoch + 1)
    }

    /// Committed weight matrix of `epoch`, verified against its datum.
    pub fn weights(&self, epoch: Epoch) -> Result<Vec<WeightMatrixEntry>> {
        self.store.get(self.subnet_id, epoch)
    }

    pub fn process_consensus_round(
        &mut self,
        subnet_id: SubnetId,
        submissions: Vec<ScoreSubmission>,
        stakes: BTreeMap<Address, u64>,
    ) -> Result<RoundOutcome> {
        self.process_round(RoundRequest::new(subnet_id, submissions, stakes))
    }

    pub fn process_round(&mut self, request: RoundRequest) -> Result<RoundOutcome> {
        if request.subnet_id != self.subnet_id {
            return Err(ChainError::MalformedSubmission(format!(
                "round for {} sent to {} orchestrator",
                request.subnet_id, self.subnet_id
            )));
        }
        let epoch = self.next_epoch();
        let now_ms = request.now_ms.unwrap_or_else(current_timestamp);
        let received = request.submissions.len();

        let accepted = self.validate(&request, epoch, now_ms);
        let counted: Vec<Hash> = accepted
            .submissions
            .iter()
            .map(ScoreSubmission::replay_key)
            .collect();
        match self.execute(&request, epoch, received, accepted) {
            Ok(outcome) => {
                self.replay_guard.extend(epoch, counted);
                self.prune(epoch);
                RoundMetrics::bump(&self.metrics.rounds_committed);
                info!(
                    subnet = %self.subnet_id,
                    epoch,
                    accepted = outcome.datum.metrics.submissions_accepted,
                    rejected = outcome.rejections.len(),
                    emission = outcome.datum.metrics.emission_paid,
                    "consensus round committed"
                );
                self.last_committed = Some(outcome.datum.clone());
                Ok(outcome)
            }
            Err(err) => {
                RoundMetrics::bump(&self.metrics.rounds_aborted);
                if err.is_retryable() {
                    warn!(subnet = %self.subnet_id, epoch, error = %err, "consensus round aborted");
                } else {
                    error!(subnet = %self.subnet_id, epoch, error = %err, "consensus round failed");
                }
                Err(err)
            }
        }
    }

    /// Drop what no later round reads. Older replay keys are covered by the
    /// epoch check, tasks settled before `epoch` were counted already.
    fn prune(&mut self, epoch: Epoch) {
        let keys = self.replay_guard.prune_below(epoch);
        let tasks = self
            .tasks
            .as_ref()
            .map_or(0, |tasks| tasks.write().prune_settled(epoch));
        let blocks = self
            .fork_choice
            .as_ref()
            .map_or(0, |fork_choice| fork_choice.write().prune_orphaned());
        if keys + tasks + blocks > 0 {
            debug!(subnet = %self.subnet_id, epoch, keys, tasks, blocks, "pruned settled state");
        }
    }

    fn validate(&self, request: &RoundRequest, epoch: Epoch, now_ms: u64) -> Accepted {
        let validator =
            SubmissionValidator::new(&self.config.round, self.subnet_id, epoch, &request.stakes, now_ms);
        let mut seen_keys = HashSet::new();
        let mut seen_validators = HashSet::new();
        let mut accepted = Accepted {
            submissions: Vec::new(),
            rejections: Vec::new(),
        };

        for submission in &request.submissions {
            let key = submission.replay_key();
            let verdict = self
                .replay_guard
                .check(submission)
                .and_then(|_| {
                    if seen_keys.contains(&key) || seen_validators.contains(&submission.validator_id) {
                        Err(ChainError::ReplayedSubmission(key.to_hex()))
                    } else {
                        Ok(())
                    }
                })
                .map_err(|err| (RejectionKind::Replay, err))
                .and_then(|_| {
                    validator
                        .check(submission)
                        .map_err(|err| (RejectionKind::Invalid, err))
                });

            match verdict {
                Ok(()) => {
                    seen_keys.insert(key);
                    seen_validators.insert(submission.validator_id.clone());
                    RoundMetrics::bump(&self.metrics.submissions_accepted);
                    accepted.submissions.push(submission.clone());
                }
                Err((kind, err)) => {
                    match kind {
                        RejectionKind::Replay => {
                            RoundMetrics::bump(&self.metrics.replays_rejected);
                            debug!(validator = %submission.validator_id, "replayed submission dropped");
                        }
                        RejectionKind::Invalid => {
                            RoundMetrics::bump(&self.metrics.submissions_rejected);
                            warn!(
                                validator = %submission.validator_id,
                                error = %err,
                                "score submission rejected"
                            );
                        }
                    }
                    accepted.rejections.push(Rejection {
                        validator_id: submission.validator_id.clone(),
                        replay_key: key,
                        kind,
                        reason: err.to_string(),
                    });
                }
            }
        }
        accepted
    }

    fn execute(
        &self,
        request: &RoundRequest,
        epoch: Epoch,
        received: usize,
        accepted: Accepted,
    ) -> Result<RoundOutcome> {
        let subnet_id = self.subnet_id;
        let stakes = &request.stakes;
        let total_stake: u128 = stakes.values().map(|s| u128::from(*s)).sum();

        if accepted.submissions.is_empty() {
            warn!(subnet = %subnet_id, epoch, received, "no valid submissions this round");
        }

        // Weight matrix.
        let entries: Vec<WeightMatrixEntry> = accepted
            .submissions
            .iter()
            .flat_map(|s| {
                s.normalized_weights()
                    .into_iter()
                    .map(|(uid, w)| WeightMatrixEntry::new(s.validator_id.clone(), uid, w))
            })
            .collect();
        let rows = WeightMatrixStore::rows(&entries);
        let consensus_scores =
            compute_consensus_scores(&rows, stakes, self.config.round.trim_fraction);
        let matrix = self.store.stage(subnet_id, epoch, entries)?;

        // Emission.
        let contributions = match &self.tasks {
            Some(tasks) => tasks.read().epoch_contributions(epoch, stakes),
            None => EpochContributions {
                utility_score: 1.0,
                ..EpochContributions::default()
            },
        };
        let previous_total = self.last_committed.as_ref().map_or(0, |d| d.cumulative_emission);
        let reservation = self.supply.reserve(emission_budget(
            &self.config.emission,
            epoch,
            contributions.utility_score,
            u64::MAX,
        ));
        let budget = reservation.amount();

        let validator_weights = validator_weights(&rows, stakes, total_stake, &contributions);
        let schedule = EmissionSchedule::build(
            subnet_id,
            epoch,
            budget,
            &self.config.emission,
            &consensus_scores,
            &validator_weights,
        );
        if schedule.total_paid() > budget {
            return Err(ChainError::IntegrityError(format!(
                "schedule pays {} over budget {budget}",
                schedule.total_paid()
            )));
        }
        let schedule_ref = self.store.archive().put(&serde_json::to_vec(&schedule)?)?;

        // Commit.
        if let (Some(anchor), Some(fork_choice)) = (request.anchor, &self.fork_choice) {
            if !fork_choice.read().is_canonical(&anchor) {
                return Err(ChainError::RoundAborted(format!(
                    "anchor block {anchor} is no longer canonical"
                )));
            }
        }

        let datum = SubnetAggregatedDatum {
            subnet_id,
            epoch,
            total_stake,
            weight_matrix_hash: matrix.commitment.merkle_root,
            weight_matrix_archive_ref: matrix.commitment.archive_ref,
            consensus_scores_root: scores_root(&consensus_scores),
            emission_schedule_root: schedule.root(),
            emission_schedule_archive_ref: schedule_ref,
            metrics: RoundSummary {
                submissions_received: saturating_u32(received),
                submissions_accepted: saturating_u32(accepted.submissions.len()),
                participants: saturating_u32(consensus_scores.len()),
                verified_tasks: saturating_u32(contributions.verified),
                utility_score: contributions.utility_score,
                emission_budget: budget,
                emission_paid: schedule.total_paid(),
            },
            cumulative_emission: previous_total + schedule.total_paid(),
            previous: self.last_committed.as_ref().map_or(Hash::zero(), |d| d.hash()),
        };
        self.backend.commit(datum.clone())?;
        reservation.settle(schedule.total_paid());
        self.store.publish(matrix);

        Ok(RoundOutcome {
            balance_deltas: schedule.balance_deltas(),
            datum,
            consensus_scores,
            schedule,
            rejections: accepted.rejections,
        })
    }
}

fn saturating_u32(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Stake weight plus task rewards, for validators that scored this round or
/// relayed a verified task.
fn validator_weights(
    rows: &BTreeMap<Address, BTreeMap<Uid, f64>>,
    stakes: &BTreeMap<Address, u64>,
    total_stake: u128,
    contributions: &EpochContributions,
) -> BTreeMap<Address, f64> {
    let stake_weight = |address: &Address| {
        if total_stake == 0 {
            0.0
        } else {
            stakes.get(address).copied().unwrap_or(0) as f64 / total_stake as f64
        }
    };
    let mut weights: BTreeMap<Address, f64> =
        rows.keys().map(|a| (a.clone(), stake_weight(a))).collect();
    for (address, reward) in &contributions.task_rewards {
        let base = stake_weight(address);
        *weights.entry(address.clone()).or_insert(base) += reward;
    }
    weights
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{MemoryArchive, MemoryStateBackend};
    use crate::block::Block;
    use crate::config::{ForkChoiceConfig, RegistryConfig};
    use crate::proof::StaticVerifier;
    use crate::registry::ValidatorRegistry;
    use crate::tasks::{AITask, TaskId};
    use crate::types::Keypair;

    const NOW: u64 = 1_700_000_000_000;

    struct Harness {
        orchestrator: ConsensusRoundOrchestrator,
        archive: Arc<MemoryArchive>,
        backend: Arc<MemoryStateBackend>,
        keys: Vec<Keypair>,
        stakes: BTreeMap<Address, u64>,
    }

    fn harness(validators: usize) -> Harness {
        harness_with(validators, |o| o)
    }

    fn harness_with(
        validators: usize,
        configure: impl FnOnce(ConsensusRoundOrchestrator) -> ConsensusRoundOrchestrator,
    ) -> Harness {
        let archive = Arc::new(MemoryArchive::new());
        let backend = Arc::new(MemoryStateBackend::new());
        let store = Arc::new(WeightMatrixStore::new(archive.clone(), backend.clone(), 16));
        let orchestrator = configure(
            ConsensusRoundOrchestrator::new(SubnetId(1), ChainConfig::default(), store, backend.clone())
                .unwrap(),
        );
        let keys: Vec<Keypair> = (0..validators).map(|_| Keypair::generate()).collect();
        let stakes = keys.iter().map(|k| (k.address(), 100)).collect();
        Harness {
            orchestrator,
            archive,
            backend,
            keys,
            stakes,
        }
    }

    fn signed(kp: &Keypair, epoch: Epoch, scores: &[(u32, f64)]) -> ScoreSubmission {
        let scores = scores.iter().map(|(u, s)| (Uid(*u), *s)).collect();
        let mut sub = ScoreSubmission::new(SubnetId(1), epoch, kp.address(), scores, NOW);
        sub.sign(kp);
        sub
    }

    fn request(stakes: &BTreeMap<Address, u64>, submissions: Vec<ScoreSubmission>) -> RoundRequest {
        RoundRequest::new(SubnetId(1), submissions, stakes.clone()).at(NOW)
    }

    #[test]
    fn test_round_commits_datum() {
        let mut h = harness(3);
        let subs = h.keys.iter().map(|k| signed(k, 1, &[(1, 3.0), (2, 1.0)])).collect();
        let outcome = h.orchestrator.process_round(request(&h.stakes, subs)).unwrap();

        assert_eq!(outcome.datum.epoch, 1);
        assert_eq!(outcome.datum.metrics.submissions_accepted, 3);
        assert!((outcome.consensus_scores[&Uid(1)] - 0.75).abs() < 1e-12);
        assert_eq!(h.backend.read(SubnetId(1), 1).unwrap(), Some(outcome.datum.clone()));
        assert_eq!(h.orchestrator.next_epoch(), 2);
        // Matrix and schedule archived.
        assert_eq!(h.archive.len(), 2);
        assert_eq!(outcome.datum.consensus_scores_root, scores_root(&outcome.consensus_scores));
        assert_eq!(outcome.datum.emission_schedule_root, outcome.schedule.root());
    }

    #[test]
    fn test_invalid_submissions_rejected_round_continues() {
        let mut h = harness(3);
        let good = signed(&h.keys[0], 1, &[(1, 1.0)]);
        let mut forged = signed(&h.keys[1], 1, &[(1, 1.0)]);
        forged.scores.insert(Uid(2), 5.0);
        let mut stale = signed(&h.keys[2], 1, &[(1, 1.0)]);
        stale.timestamp = NOW - 10 * 60 * 1_000;
        stale.sign(&h.keys[2]);

        let outcome = h
            .orchestrator
            .process_round(request(&h.stakes, vec![good, forged, stale]))
            .unwrap();
        assert_eq!(outcome.datum.metrics.submissions_accepted, 1);
        assert_eq!(outcome.rejections.len(), 2);
        assert!(outcome.rejections.iter().all(|r| r.kind == RejectionKind::Invalid));
        assert_eq!(h.orchestrator.metrics().snapshot().submissions_rejected, 2);
    }

    #[test]
    fn test_duplicate_validator_in_round_counts_as_replay() {
        let mut h = harness(2);
        let first = signed(&h.keys[0], 1, &[(1, 1.0)]);
        let second = signed(&h.keys[0], 1, &[(2, 1.0)]);
        let outcome = h
            .orchestrator
            .process_round(request(&h.stakes, vec![first, second.clone(), second]))
            .unwrap();
        assert_eq!(outcome.datum.metrics.submissions_accepted, 1);
        assert_eq!(h.orchestrator.metrics().snapshot().replays_rejected, 2);
    }

    #[test]
    fn test_emission_never_exceeds_budget() {
        let mut h = harness(4);
        for epoch in 1..=3 {
            let subs = h
                .keys
                .iter()
                .enumerate()
                .map(|(i, k)| signed(k, epoch, &[(1, 1.0 + i as f64), (2, 2.0), (3, 0.3)]))
                .collect();
            let outcome = h.orchestrator.process_round(request(&h.stakes, subs)).unwrap();
            assert!(outcome.schedule.total_paid() <= outcome.datum.metrics.emission_budget);
            let paid: i128 = outcome.balance_deltas.iter().map(|d| d.delta).sum();
            assert_eq!(paid, i128::from(outcome.schedule.total_paid()));
        }
        let latest = h.backend.latest(SubnetId(1)).unwrap().unwrap();
        assert_eq!(latest.epoch, 3);
        assert!(latest.cumulative_emission <= 3 * ChainConfig::default().emission.base_reward);
    }

    #[test]
    fn test_remaining_supply_caps_budget() {
        let archive = Arc::new(MemoryArchive::new());
        let backend = Arc::new(MemoryStateBackend::new());
        let store = Arc::new(WeightMatrixStore::new(archive, backend.clone(), 4));
        let mut config = ChainConfig::default();
        config.emission.max_supply = 15_000;
        let mut orchestrator =
            ConsensusRoundOrchestrator::new(SubnetId(1), config, store, backend).unwrap();
        let kp = Keypair::generate();
        let stakes = BTreeMap::from([(kp.address(), 10)]);

        let first = orchestrator
            .process_round(RoundRequest::new(SubnetId(1), vec![signed(&kp, 1, &[(1, 1.0)])], stakes.clone()).at(NOW))
            .unwrap();
        assert_eq!(first.datum.metrics.emission_budget, 10_000);
        let second = orchestrator
            .process_round(RoundRequest::new(SubnetId(1), vec![signed(&kp, 2, &[(1, 1.0)])], stakes).at(NOW))
            .unwrap();
        assert_eq!(second.datum.metrics.emission_budget, 15_000 - first.datum.cumulative_emission);
        assert!(second.datum.cumulative_emission <= 15_000);
    }

    #[test]
    fn test_archive_outage_aborts_without_commit() {
        let mut h = harness(2);
        let subs: Vec<ScoreSubmission> = h.keys.iter().map(|k| signed(k, 1, &[(1, 1.0)])).collect();
        h.archive.set_available(false);

        let err = h.orchestrator.process_round(request(&h.stakes, subs.clone())).unwrap_err();
        assert!(err.is_retryable());
        assert!(h.backend.is_empty());
        assert_eq!(h.orchestrator.next_epoch(), 1);
        assert_eq!(h.orchestrator.metrics().snapshot().rounds_aborted, 1);

        // Retry from validation with the same submissions succeeds.
        h.archive.set_available(true);
        let outcome = h.orchestrator.process_round(request(&h.stakes, subs)).unwrap();
        assert_eq!(outcome.datum.metrics.submissions_accepted, 2);
    }

    #[test]
    fn test_backend_failure_leaves_epoch_invisible() {
        let mut h = harness(1);
        let subs = vec![signed(&h.keys[0], 1, &[(1, 1.0)])];
        h.backend.set_available(false);
        assert!(h.orchestrator.process_round(request(&h.stakes, subs.clone())).is_err());
        assert_eq!(h.orchestrator.store.cache_len(), 0);
        assert_eq!(h.orchestrator.supply().remaining(), ChainConfig::default().emission.max_supply);

        // Another holder of the store cannot read the aborted epoch.
        h.backend.set_available(true);
        assert!(matches!(
            h.orchestrator.weights(1),
            Err(ChainError::DatumNotFound { subnet: 1, epoch: 1 })
        ));

        let outcome = h.orchestrator.process_round(request(&h.stakes, subs)).unwrap();
        assert!(h.orchestrator.store.is_cached(SubnetId(1), 1));
        assert_eq!(h.orchestrator.supply().minted(), outcome.datum.cumulative_emission);
    }

    #[test]
    fn test_subnets_share_one_supply_cap() {
        let archive = Arc::new(MemoryArchive::new());
        let backend = Arc::new(MemoryStateBackend::new());
        let store = Arc::new(WeightMatrixStore::new(archive, backend.clone(), 8));
        let mut config = ChainConfig::default();
        config.emission.max_supply = 15_000;
        let supply = Arc::new(SupplyLedger::new(config.emission.max_supply, 0));
        let kp = Keypair::generate();
        let stakes = BTreeMap::from([(kp.address(), 10)]);

        let mut outcomes = Vec::new();
        for subnet in [SubnetId(1), SubnetId(2)] {
            let mut orchestrator =
                ConsensusRoundOrchestrator::new(subnet, config.clone(), store.clone(), backend.clone())
                    .unwrap()
                    .with_supply(supply.clone());
            let scores = BTreeMap::from([(Uid(1), 1.0)]);
            let mut sub = ScoreSubmission::new(subnet, 1, kp.address(), scores, NOW);
            sub.sign(&kp);
            outcomes.push(
                orchestrator
                    .process_round(RoundRequest::new(subnet, vec![sub], stakes.clone()).at(NOW))
                    .unwrap(),
            );
        }
        let first = &outcomes[0].datum.metrics;
        let second = &outcomes[1].datum.metrics;
        assert_eq!(first.emission_budget, 10_000);
        assert_eq!(second.emission_budget, 15_000 - first.emission_paid);
        let paid = first.emission_paid + second.emission_paid;
        assert!(paid <= 15_000, "minted {paid} past max supply");
        assert_eq!(supply.minted(), paid);

        let recovered =
            SupplyLedger::recover(15_000, backend.as_ref(), &[SubnetId(1), SubnetId(2)]).unwrap();
        assert_eq!(recovered.minted(), paid);
    }

    #[test]
    fn test_replay_keys_stay_bounded() {
        let mut h = harness(3);
        for epoch in 1..=6 {
            let subs = h.keys.iter().map(|k| signed(k, epoch, &[(1, 1.0)])).collect();
            h.orchestrator.process_round(request(&h.stakes, subs)).unwrap();
            assert!(h.orchestrator.replay_keys() <= h.keys.len());
        }
        assert_eq!(h.orchestrator.replay_keys(), 3);
    }

    #[test]
    fn test_overflowing_scores_rejected_in_round() {
        let mut h = harness(2);
        let overflow = signed(&h.keys[0], 1, &[(1, f64::MAX), (2, f64::MAX)]);
        let good = signed(&h.keys[1], 1, &[(1, 1.0)]);
        let outcome = h
            .orchestrator
            .process_round(request(&h.stakes, vec![overflow, good]))
            .unwrap();
        assert_eq!(outcome.datum.metrics.submissions_accepted, 1);
        assert_eq!(outcome.datum.metrics.participants, 1);
        assert_eq!(outcome.rejections.len(), 1);
        assert_eq!(outcome.rejections[0].kind, RejectionKind::Invalid);
        assert_eq!(outcome.rejections[0].validator_id, h.keys[0].address());
    }

    #[test]
    fn test_settled_tasks_pruned_after_commit() {
        let verifier = Arc::new(StaticVerifier::accepting());
        let tasks = Arc::new(RwLock::new(AIResultValidator::new(Default::default(), verifier)));
        let mut h = harness_with(1, |o| o.with_tasks(tasks.clone()));
        {
            let mut t = tasks.write();
            t.sweep_expired(1);
            t.submit_task(AITask::new(TaskId(1), SubnetId(1), 100, Hash::zero())).unwrap();
            t.assign(&TaskId(1), Uid(1)).unwrap();
            t.submit_result(&TaskId(1), &h.keys[0].address(), vec![1], vec![]).unwrap();
        }
        let sub = signed(&h.keys[0], 1, &[(1, 1.0)]);
        let first = h.orchestrator.process_round(request(&h.stakes, vec![sub])).unwrap();
        assert_eq!(first.datum.metrics.verified_tasks, 1);
        assert!(tasks.read().task(&TaskId(1)).is_some());

        tasks.write().sweep_expired(2);
        let sub = signed(&h.keys[0], 2, &[(1, 1.0)]);
        h.orchestrator.process_round(request(&h.stakes, vec![sub])).unwrap();
        assert!(tasks.read().task(&TaskId(1)).is_none());
    }

    #[test]
    fn test_counts_saturate_at_u32_max() {
        assert_eq!(saturating_u32(7), 7);
        assert_eq!(saturating_u32(usize::MAX), u32::MAX);
    }

    #[test]
    fn test_task_utility_scales_emission() {
        let verifier = Arc::new(StaticVerifier::accepting());
        let tasks = Arc::new(RwLock::new(AIResultValidator::new(Default::default(), verifier.clone())));
        let mut h = harness_with(2, |o| o.with_tasks(tasks.clone()));
        {
            let mut t = tasks.write();
            t.sweep_expired(1);
            for id in 1..=2 {
                t.submit_task(AITask::new(TaskId(id), SubnetId(1), 100, Hash::zero())).unwrap();
                t.assign(&TaskId(id), Uid(id as u32)).unwrap();
            }
            t.submit_result(&TaskId(1), &h.keys[0].address(), vec![1], vec![]).unwrap();
            verifier.set_verdict(false);
            t.submit_result(&TaskId(2), &h.keys[1].address(), vec![1], vec![]).unwrap();
        }

        let subs = h.keys.iter().map(|k| signed(k, 1, &[(1, 1.0)])).collect();
        let outcome = h.orchestrator.process_round(request(&h.stakes, subs)).unwrap();
        assert!((outcome.datum.metrics.utility_score - 0.5).abs() < 1e-12);
        assert_eq!(outcome.datum.metrics.emission_budget, 5_000);
        assert_eq!(outcome.datum.metrics.verified_tasks, 1);
    }

    #[test]
    fn test_anchor_off_canonical_chain_aborts() {
        let genesis = Block::genesis(Address::from_bytes([0; 32]), NOW).header;
        let tracker = Arc::new(RwLock::new(ForkChoiceTracker::new(ForkChoiceConfig::default(), &genesis)));
        let mut h = harness_with(1, |o| o.with_fork_choice(tracker.clone()));
        let registry = ValidatorRegistry::with_validators(
            RegistryConfig::default(),
            vec![(h.keys[0].address(), 100)],
        )
        .unwrap();
        let orphan_anchor = Hash::compute(b"unknown block");
        let canonical = {
            let mut fc = tracker.write();
            let b1 = Block::new(genesis.hash(), 1, 0, 1, NOW, h.keys[0].address(), Default::default(), Hash::zero());
            fc.add_block(&b1.header, &registry).unwrap()
        };

        let sub = signed(&h.keys[0], 1, &[(1, 1.0)]);
        let err = h
            .orchestrator
            .process_round(request(&h.stakes, vec![sub.clone()]).with_anchor(orphan_anchor))
            .unwrap_err();
        assert!(matches!(err, ChainError::RoundAborted(_)));
        assert!(h.backend.is_empty());

        let outcome = h
            .orchestrator
            .process_round(request(&h.stakes, vec![sub]).with_anchor(canonical))
            .unwrap();
        assert_eq!(outcome.datum.epoch, 1);
    }

    #[test]
    fn test_resumes_from_backend() {
        let mut h = harness(1);
        let sub = signed(&h.keys[0], 1, &[(1, 1.0)]);
        let first = h.orchestrator.process_round(request(&h.stakes, vec![sub])).unwrap();

        let store = Arc::new(WeightMatrixStore::new(h.archive.clone(), h.backend.clone(), 4));
        let resumed =
            ConsensusRoundOrchestrator::new(SubnetId(1), ChainConfig::default(), store, h.backend.clone())
                .unwrap();
        assert_eq!(resumed.next_epoch(), 2);
        // Cold cache: served from the archive and verified.
        assert_eq!(resumed.weights(1).unwrap().len(), 1);
        assert_eq!(resumed.last_committed().unwrap().hash(), first.datum.hash());
    }

    #[test]
    fn test_wrong_subnet_rejected() {
        let mut h = harness(1);
        let err = h
            .orchestrator
            .process_consensus_round(SubnetId(2), Vec::new(), h.stakes.clone())
            .unwrap_err();
        assert!(matches!(err, ChainError::MalformedSubmission(_)));
    }
}
