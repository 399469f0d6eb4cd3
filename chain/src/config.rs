//! Node configuration for the consensus core.
//!
//! All tunables live here so that nothing in the consensus path is a
//! hard-coded constant. The file format is TOML; every section falls back to
//! its defaults when omitted.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ChainError, Result};

/// Basis-point denominator used for pool ratios.
pub const BPS_DENOMINATOR: u64 = 10_000;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub registry: RegistryConfig,
    pub fork_choice: ForkChoiceConfig,
    pub tasks: TaskConfig,
    pub round: RoundConfig,
    pub emission: EmissionConfig,
    pub storage: StorageConfig,
    pub retry: RetryConfig,
}

impl ChainConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    /// Reject combinations that would break consensus invariants.
    pub fn validate(&self) -> Result<()> {
        let e = &self.emission;
        let total = u64::from(e.miner_share_bps)
            + u64::from(e.validator_share_bps)
            + u64::from(e.dao_share_bps);
        if total != BPS_DENOMINATOR {
            return Err(ChainError::Config(format!(
                "emission shares must sum to {BPS_DENOMINATOR} bps, got {total}"
            )));
        }
        if !(0.0..0.5).contains(&self.round.trim_fraction) {
            return Err(ChainError::Config(format!(
                "trim_fraction must be in [0, 0.5), got {}",
                self.round.trim_fraction
            )));
        }
        if self.fork_choice.checkpoint_interval == 0 {
            return Err(ChainError::Config(
                "checkpoint_interval must be positive".into(),
            ));
        }
        if !(0.5..1.0).contains(&self.fork_choice.finality_threshold) {
            return Err(ChainError::Config(format!(
                "finality_threshold must be in [0.5, 1), got {}",
                self.fork_choice.finality_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.registry.missed_slot_jail_fraction) {
            return Err(ChainError::Config(
                "missed_slot_jail_fraction must be in [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.registry.trust_smoothing) {
            return Err(ChainError::Config("trust_smoothing must be in [0, 1]".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ChainError::Config("retry.max_attempts must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Validators missing more than this fraction of assigned slots are jailed.
    pub missed_slot_jail_fraction: f64,
    pub jail_epochs: u64,
    /// Block producer reward pool distributed at each epoch end.
    pub epoch_block_reward: u64,
    /// Weight of the latest epoch in the trust score moving average.
    pub trust_smoothing: f64,
    pub min_stake: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            missed_slot_jail_fraction: 0.5,
            jail_epochs: 2,
            epoch_block_reward: 1_000,
            trust_smoothing: 0.2,
            min_stake: 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkChoiceConfig {
    pub checkpoint_interval: u64,
    /// Fraction of total active stake a checkpoint needs, strictly exceeded.
    pub finality_threshold: f64,
}

impl Default for ForkChoiceConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 5,
            finality_threshold: 2.0 / 3.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub task_ttl_epochs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self { task_ttl_epochs: 3 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    /// Accepted clock skew for submission timestamps, in either direction.
    pub freshness_window_ms: u64,
    /// Fraction of values dropped from each end before the weighted mean.
    pub trim_fraction: f64,
    pub max_scores_per_submission: usize,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            freshness_window_ms: 5 * 60 * 1_000,
            trim_fraction: 0.2,
            max_scores_per_submission: 4_096,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmissionConfig {
    pub base_reward: u64,
    pub halving_interval_epochs: u64,
    pub miner_share_bps: u16,
    pub validator_share_bps: u16,
    pub dao_share_bps: u16,
    pub max_supply: u64,
}

impl Default for EmissionConfig {
    fn default() -> Self {
        Self {
            base_reward: 10_000,
            halving_interval_epochs: 1_000,
            miner_share_bps: 4_000,
            validator_share_bps: 4_000,
            dao_share_bps: 2_000,
            max_supply: 1_000_000_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory of the filesystem archive. In-memory archive when unset.
    pub archive_dir: Option<PathBuf>,
    /// Number of (subnet, epoch) matrices kept in the local cache.
    pub cache_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            archive_dir: None,
            cache_capacity: 64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryConfig {
    /// Exponential backoff delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}
