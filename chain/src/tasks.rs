//! AI task lifecycle and result validation.
//!
//! ```text
//! Created -> Assigned -> ResultSubmitted -> Verified
//!                                        \-> Rejected
//! (any non-terminal state past its deadline) -> Expired
//! ```
//!
//! Results are accepted only with a proof that the configured
//! [`ProofVerifier`] accepts against the task's canonical public inputs.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TaskConfig;
use crate::error::{ChainError, Result};
use crate::proof::ProofVerifier;
use crate::types::{Address, Epoch, Hash, SubnetId, Uid};

/// Domain tag prefixed to task public inputs.
const PUBLIC_INPUTS_DOMAIN: &[u8] = b"SYNAPSE_TASK_INPUTS_V1";

// ---------------------------------------------------------------------------
// Task types
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Status of a task through its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Created,
    Assigned,
    ResultSubmitted,
    Verified,
    Rejected,
    Expired,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Verified | TaskStatus::Rejected | TaskStatus::Expired
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Created => write!(f, "CREATED"),
            TaskStatus::Assigned => write!(f, "ASSIGNED"),
            TaskStatus::ResultSubmitted => write!(f, "RESULT_SUBMITTED"),
            TaskStatus::Verified => write!(f, "VERIFIED"),
            TaskStatus::Rejected => write!(f, "REJECTED"),
            TaskStatus::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// An AI computation task handed to an off-chain miner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AITask {
    pub task_id: TaskId,
    pub subnet_id: SubnetId,
    pub miner_uid: Option<Uid>,
    pub difficulty: u32,
    /// Commitment to the task input (model, prompt, dataset slice).
    pub input_hash: Hash,
    pub created_epoch: Epoch,
    pub deadline_epoch: Epoch,
    pub status: TaskStatus,
    /// Epoch in which the task reached a terminal state.
    pub settled_epoch: Option<Epoch>,
}

impl AITask {
    /// Describe a new task. Epochs and status are set by `submit_task`.
    pub fn new(task_id: TaskId, subnet_id: SubnetId, difficulty: u32, input_hash: Hash) -> Self {
        Self {
            task_id,
            subnet_id,
            miner_uid: None,
            difficulty,
            input_hash,
            created_epoch: 0,
            deadline_epoch: 0,
            status: TaskStatus::Created,
            settled_epoch: None,
        }
    }

    /// Canonical public inputs binding a result payload to this task.
    pub fn public_inputs(&self, result_payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::with_capacity(PUBLIC_INPUTS_DOMAIN.len() + 90);
        data.extend_from_slice(PUBLIC_INPUTS_DOMAIN);
        data.extend_from_slice(&self.task_id.0.to_le_bytes());
        data.extend_from_slice(&self.subnet_id.0.to_le_bytes());
        data.extend_from_slice(&self.miner_uid.map_or(u32::MAX, |u| u.0).to_le_bytes());
        data.extend_from_slice(&self.difficulty.to_le_bytes());
        data.extend_from_slice(self.input_hash.as_bytes());
        data.extend_from_slice(Hash::compute(result_payload).as_bytes());
        data
    }
}

/// A verified result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AIResult {
    pub task_id: TaskId,
    /// Validator that relayed the miner's result on-chain.
    pub submitter: Address,
    pub result_payload: Vec<u8>,
    pub proof: Vec<u8>,
    pub quality_score: f64,
    pub verified_epoch: Epoch,
}

// ---------------------------------------------------------------------------
// Quality scoring
// ---------------------------------------------------------------------------

/// Pluggable quality function for verified results. Must return a value in
/// [0, 1]; out-of-range values are clamped.
pub trait QualityScorer: Send + Sync + fmt::Debug {
    fn score(&self, task: &AITask, result_payload: &[u8]) -> f64;
}

/// Default scorer: harder tasks score higher, empty payloads score zero.
#[derive(Clone, Debug)]
pub struct DifficultyScorer {
    pub max_difficulty: u32,
}

impl Default for DifficultyScorer {
    fn default() -> Self {
        Self { max_difficulty: 100 }
    }
}

impl QualityScorer for DifficultyScorer {
    fn score(&self, task: &AITask, result_payload: &[u8]) -> f64 {
        if result_payload.is_empty() || self.max_difficulty == 0 {
            return 0.0;
        }
        let ratio = f64::from(task.difficulty.min(self.max_difficulty)) / f64::from(self.max_difficulty);
        0.5 + 0.5 * ratio
    }
}

// ---------------------------------------------------------------------------
// Epoch contributions
// ---------------------------------------------------------------------------

/// What the task pipeline feeds into a consensus round.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EpochContributions {
    /// Mean quality over tasks settled in the epoch; 1.0 when none settled.
    pub utility_score: f64,
    /// `Σ quality × stake_weight(submitter)` per validator.
    pub task_rewards: BTreeMap<Address, f64>,
    pub verified: usize,
    pub settled: usize,
}

// ---------------------------------------------------------------------------
// AIResultValidator
// ---------------------------------------------------------------------------

pub struct AIResultValidator {
    config: TaskConfig,
    current_epoch: Epoch,
    tasks: HashMap<TaskId, AITask>,
    results: HashMap<TaskId, AIResult>,
    verifier: Arc<dyn ProofVerifier>,
    scorer: Arc<dyn QualityScorer>,
}

impl fmt::Debug for AIResultValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AIResultValidator")
            .field("current_epoch", &self.current_epoch)
            .field("tasks", &self.tasks.len())
            .field("results", &self.results.len())
            .field("verifier", &self.verifier.name())
            .finish()
    }
}

impl AIResultValidator {
    pub fn new(config: TaskConfig, verifier: Arc<dyn ProofVerifier>) -> Self {
        Self::with_scorer(config, verifier, Arc::new(DifficultyScorer::default()))
    }

    pub fn with_scorer(
        config: TaskConfig,
        verifier: Arc<dyn ProofVerifier>,
        scorer: Arc<dyn QualityScorer>,
    ) -> Self {
        Self {
            config,
            current_epoch: 0,
            tasks: HashMap::new(),
            results: HashMap::new(),
            verifier,
            scorer,
        }
    }

    pub fn current_epoch(&self) -> Epoch {
        self.current_epoch
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&AITask> {
        self.tasks.get(task_id)
    }

    pub fn result(&self, task_id: &TaskId) -> Option<&AIResult> {
        self.results.get(task_id)
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Register a task in `Created` with a deadline `task_ttl_epochs` ahead.
    pub fn submit_task(&mut self, mut task: AITask) -> Result<&AITask> {
        if self.tasks.contains_key(&task.task_id) {
            return Err(ChainError::DuplicateTask(task.task_id.to_string()));
        }
        task.status = TaskStatus::Created;
        task.miner_uid = None;
        task.created_epoch = self.current_epoch;
        task.deadline_epoch = self.current_epoch + self.config.task_ttl_epochs;
        task.settled_epoch = None;

        debug!(task = %task.task_id, deadline = task.deadline_epoch, "task created");
        let id = task.task_id;
        Ok(self.tasks.entry(id).or_insert(task))
    }

    /// Hand a `Created` task to a miner.
    pub fn assign(&mut self, task_id: &TaskId, miner_uid: Uid) -> Result<()> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ChainError::TaskNotFound(task_id.to_string()))?;
        if task.status != TaskStatus::Created {
            return Err(ChainError::AlreadyAssigned {
                task: task_id.to_string(),
                status: task.status.to_string(),
            });
        }
        task.miner_uid = Some(miner_uid);
        task.status = TaskStatus::Assigned;
        debug!(task = %task_id, miner = %miner_uid, "task assigned");
        Ok(())
    }

    /// Submit a result for an assigned task.
    ///
    /// Late results expire the task and fail with `DeadlineExceeded`. A proof
    /// the verifier rejects moves the task to `Rejected` and returns that
    /// status; an accepted proof scores the result and returns `Verified`.
    pub fn submit_result(
        &mut self,
        task_id: &TaskId,
        submitter: &Address,
        result_payload: Vec<u8>,
        proof: Vec<u8>,
    ) -> Result<TaskStatus> {
        let epoch = self.current_epoch;
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ChainError::TaskNotFound(task_id.to_string()))?;

        if epoch > task.deadline_epoch && !task.status.is_terminal() {
            task.status = TaskStatus::Expired;
            task.settled_epoch = Some(epoch);
            warn!(task = %task_id, deadline = task.deadline_epoch, epoch, "result after deadline");
            return Err(ChainError::DeadlineExceeded {
                task: task_id.to_string(),
                deadline: task.deadline_epoch,
                current: epoch,
            });
        }
        if task.status != TaskStatus::Assigned {
            return Err(ChainError::InvalidTaskState {
                from: task.status.to_string(),
                to: TaskStatus::ResultSubmitted.to_string(),
            });
        }
        task.status = TaskStatus::ResultSubmitted;

        let inputs = task.public_inputs(&result_payload);
        if !self.verifier.verify(&proof, &inputs) {
            task.status = TaskStatus::Rejected;
            task.settled_epoch = Some(epoch);
            info!(task = %task_id, verifier = self.verifier.name(), "proof rejected");
            return Ok(TaskStatus::Rejected);
        }

        let raw = self.scorer.score(task, &result_payload);
        let quality_score = if raw.is_finite() { raw.clamp(0.0, 1.0) } else { 0.0 };
        task.status = TaskStatus::Verified;
        task.settled_epoch = Some(epoch);

        debug!(task = %task_id, quality_score, "result verified");
        self.results.insert(
            *task_id,
            AIResult {
                task_id: *task_id,
                submitter: submitter.clone(),
                result_payload,
                proof,
                quality_score,
                verified_epoch: epoch,
            },
        );
        Ok(TaskStatus::Verified)
    }

    /// Advance to `current_epoch` and expire every unfinished task whose
    /// deadline has passed. Returns the expired task ids, sorted.
    pub fn sweep_expired(&mut self, current_epoch: Epoch) -> Vec<TaskId> {
        self.current_epoch = self.current_epoch.max(current_epoch);
        let epoch = self.current_epoch;

        let mut expired: Vec<TaskId> = self
            .tasks
            .values_mut()
            .filter(|t| t.deadline_epoch < epoch && !t.status.is_terminal())
            .map(|t| {
                t.status = TaskStatus::Expired;
                t.settled_epoch = Some(epoch);
                t.task_id
            })
            .collect();
        expired.sort();

        if !expired.is_empty() {
            info!(epoch, expired = expired.len(), "tasks expired");
        }
        expired
    }

    /// Utility score and per-validator task rewards for `epoch`.
    pub fn epoch_contributions(
        &self,
        epoch: Epoch,
        stakes: &BTreeMap<Address, u64>,
    ) -> EpochContributions {
        let total_stake: u128 = stakes.values().map(|s| u128::from(*s)).sum();
        let settled = self
            .tasks
            .values()
            .filter(|t| t.settled_epoch == Some(epoch))
            .count();

        let mut contributions = EpochContributions {
            utility_score: 1.0,
            settled,
            ..EpochContributions::default()
        };

        let mut quality_sum = 0.0;
        for result in self.results.values().filter(|r| r.verified_epoch == epoch) {
            contributions.verified += 1;
            quality_sum += result.quality_score;
            let stake_weight = if total_stake == 0 {
                0.0
            } else {
                stakes.get(&result.submitter).copied().unwrap_or(0) as f64 / total_stake as f64
            };
            *contributions
                .task_rewards
                .entry(result.submitter.clone())
                .or_insert(0.0) += result.quality_score * stake_weight;
        }
        if settled > 0 {
            contributions.utility_score = quality_sum / settled as f64;
        }
        contributions
    }

    /// Drop terminal tasks (and their results) settled before `epoch`.
    pub fn prune_settled(&mut self, epoch: Epoch) -> usize {
        let stale: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.settled_epoch.is_some_and(|e| e < epoch))
            .map(|t| t.task_id)
            .collect();
        for id in &stale {
            self.tasks.remove(id);
            self.results.remove(id);
        }
        stale.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
