//! Hybrid three-tier storage for sparse validator → participant weights.
//!
//! | Tier | Where                 | Holds                                   |
//! |------|-----------------------|-----------------------------------------|
//! | 1    | `SubnetAggregatedDatum` | Merkle root + archive content hash    |
//! | 2    | local cache           | full entry list per `(subnet, epoch)`   |
//! | 3    | `ContentArchive`      | serialized matrix document              |
//!
//! Tier 2 is rebuilt from Tier 3 on a miss and is never trusted over the
//! on-chain root: anything fetched from the archive is re-hashed and its
//! Merkle root recomputed before it is served.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::archive::{ContentArchive, StateBackend};
use crate::error::{ChainError, Result};
use crate::merkle::{build_proof, compute_merkle_root, MerkleProof};
use crate::types::{Address, Epoch, Hash, SubnetId, Uid};

// ---------------------------------------------------------------------------
// Entries and commitments
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeightMatrixEntry {
    pub validator_id: Address,
    pub participant_id: Uid,
    pub weight: f64,
}

impl WeightMatrixEntry {
    pub fn new(validator_id: Address, participant_id: Uid, weight: f64) -> Self {
        Self {
            validator_id,
            participant_id,
            weight,
        }
    }

    /// `SHA-256(validator_id || participant_id_le || weight_bits_le)`
    pub fn leaf_hash(&self) -> Hash {
        Hash::compute_parts(&[
            self.validator_id.as_bytes(),
            &self.participant_id.0.to_le_bytes(),
            &self.weight.to_bits().to_le_bytes(),
        ])
    }

    fn key(&self) -> (&Address, Uid) {
        (&self.validator_id, self.participant_id)
    }
}

/// What a store operation contributes to the on-chain datum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixCommitment {
    pub merkle_root: Hash,
    pub archive_ref: Hash,
}

/// A matrix that is archived but not yet cached.
#[derive(Clone, Debug, PartialEq)]
pub struct StagedMatrix {
    pub subnet_id: SubnetId,
    pub epoch: Epoch,
    pub commitment: MatrixCommitment,
    entries: Vec<WeightMatrixEntry>,
}

/// Archived form of one epoch's matrix.
#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct MatrixDocument {
    subnet_id: SubnetId,
    epoch: Epoch,
    entries: Vec<WeightMatrixEntry>,
}

/// Sort by `(validator_id, participant_id)` and reject duplicate keys or
/// non-finite weights.
pub fn canonicalize(mut entries: Vec<WeightMatrixEntry>) -> Result<Vec<WeightMatrixEntry>> {
    if let Some(bad) = entries.iter().find(|e| !e.weight.is_finite()) {
        return Err(ChainError::MalformedSubmission(format!(
            "non-finite weight for {} / {}",
            bad.validator_id, bad.participant_id
        )));
    }
    entries.sort_by(|a, b| a.key().cmp(&b.key()));
    if let Some(pair) = entries.windows(2).find(|w| w[0].key() == w[1].key()) {
        return Err(ChainError::MalformedSubmission(format!(
            "duplicate weight for {} / {}",
            pair[0].validator_id, pair[0].participant_id
        )));
    }
    Ok(entries)
}

/// Merkle root over the leaf hashes of canonically ordered entries.
pub fn matrix_root(entries: &[WeightMatrixEntry]) -> Hash {
    let leaves: Vec<Hash> = entries.iter().map(WeightMatrixEntry::leaf_hash).collect();
    compute_merkle_root(&leaves)
}

/// Check one entry against an on-chain root. No I/O.
pub fn verify_entry(entry: &WeightMatrixEntry, proof: &MerkleProof, root: &Hash) -> bool {
    proof.verify(&entry.leaf_hash(), root)
}

// ---------------------------------------------------------------------------
// WeightMatrixStore
// ---------------------------------------------------------------------------

type CacheKey = (SubnetId, Epoch);

pub struct WeightMatrixStore {
    archive: Arc<dyn ContentArchive>,
    backend: Arc<dyn StateBackend>,
    cache: RwLock<HashMap<CacheKey, Vec<WeightMatrixEntry>>>,
    capacity: usize,
}

impl fmt::Debug for WeightMatrixStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeightMatrixStore")
            .field("archive", &self.archive.name())
            .field("cached", &self.cache.read().len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl WeightMatrixStore {
    pub fn new(
        archive: Arc<dyn ContentArchive>,
        backend: Arc<dyn StateBackend>,
        capacity: usize,
    ) -> Self {
        Self {
            archive,
            backend,
            cache: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn archive(&self) -> &Arc<dyn ContentArchive> {
        &self.archive
    }

    /// Archive the matrix and cache it right away. For callers that commit
    /// the datum themselves and accept that `get` sees the epoch before then.
    pub fn store(
        &self,
        subnet_id: SubnetId,
        epoch: Epoch,
        entries: Vec<WeightMatrixEntry>,
    ) -> Result<MatrixCommitment> {
        let staged = self.stage(subnet_id, epoch, entries)?;
        let commitment = staged.commitment;
        self.publish(staged);
        Ok(commitment)
    }

    /// Archive the matrix without caching it. The commitment goes into the
    /// pending datum; [`publish`](Self::publish) the staged entries once that
    /// datum is committed. An archive failure stages nothing.
    pub fn stage(
        &self,
        subnet_id: SubnetId,
        epoch: Epoch,
        entries: Vec<WeightMatrixEntry>,
    ) -> Result<StagedMatrix> {
        let entries = canonicalize(entries)?;
        let document = MatrixDocument {
            subnet_id,
            epoch,
            entries,
        };
        let bytes = serde_json::to_vec(&document)?;
        let archive_ref = self.archive.put(&bytes)?;
        let merkle_root = matrix_root(&document.entries);

        debug!(
            subnet = %subnet_id,
            epoch,
            entries = document.entries.len(),
            root = %merkle_root,
            "weight matrix archived"
        );
        Ok(StagedMatrix {
            subnet_id,
            epoch,
            commitment: MatrixCommitment {
                merkle_root,
                archive_ref,
            },
            entries: document.entries,
        })
    }

    /// Make a staged matrix visible to `get` through the cache.
    pub fn publish(&self, staged: StagedMatrix) {
        self.cache_insert((staged.subnet_id, staged.epoch), staged.entries);
    }

    /// Entries committed for `(subnet_id, epoch)`, from cache or archive.
    pub fn get(&self, subnet_id: SubnetId, epoch: Epoch) -> Result<Vec<WeightMatrixEntry>> {
        if let Some(entries) = self.cache.read().get(&(subnet_id, epoch)) {
            return Ok(entries.clone());
        }
        let datum = self
            .backend
            .read(subnet_id, epoch)?
            .ok_or(ChainError::DatumNotFound {
                subnet: subnet_id.0,
                epoch,
            })?;
        let commitment = MatrixCommitment {
            merkle_root: datum.weight_matrix_hash,
            archive_ref: datum.weight_matrix_archive_ref,
        };
        self.fetch_verified(subnet_id, epoch, &commitment)
    }

    /// Fetch from the archive and verify against `commitment`, bypassing
    /// the cache on the way in and refilling it on success.
    pub fn fetch_verified(
        &self,
        subnet_id: SubnetId,
        epoch: Epoch,
        commitment: &MatrixCommitment,
    ) -> Result<Vec<WeightMatrixEntry>> {
        let bytes = self.archive.get(&commitment.archive_ref).map_err(|err| {
            warn!(subnet = %subnet_id, epoch, error = %err, "weight matrix fetch failed");
            err
        })?;

        let entries = decode_verified(&bytes, subnet_id, epoch, commitment).map_err(|err| {
            error!(subnet = %subnet_id, epoch, error = %err, "archived weight matrix discarded");
            err
        })?;

        self.cache_insert((subnet_id, epoch), entries.clone());
        Ok(entries)
    }

    /// Inclusion proof for one `(validator, participant)` weight.
    pub fn prove(
        &self,
        subnet_id: SubnetId,
        epoch: Epoch,
        validator_id: &Address,
        participant_id: Uid,
    ) -> Result<Option<(WeightMatrixEntry, MerkleProof)>> {
        let entries = self.get(subnet_id, epoch)?;
        let Ok(index) = entries.binary_search_by(|e| e.key().cmp(&(validator_id, participant_id)))
        else {
            return Ok(None);
        };
        let leaves: Vec<Hash> = entries.iter().map(WeightMatrixEntry::leaf_hash).collect();
        Ok(build_proof(&leaves, index).map(|proof| (entries[index].clone(), proof)))
    }

    /// Drop a cached matrix. Returns whether it was present.
    pub fn evict(&self, subnet_id: SubnetId, epoch: Epoch) -> bool {
        self.cache.write().remove(&(subnet_id, epoch)).is_some()
    }

    pub fn is_cached(&self, subnet_id: SubnetId, epoch: Epoch) -> bool {
        self.cache.read().contains_key(&(subnet_id, epoch))
    }

    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }

    /// Per-validator weight rows, as fed to consensus scoring.
    pub fn rows(entries: &[WeightMatrixEntry]) -> BTreeMap<Address, BTreeMap<Uid, f64>> {
        let mut rows: BTreeMap<Address, BTreeMap<Uid, f64>> = BTreeMap::new();
        for entry in entries {
            rows.entry(entry.validator_id.clone())
                .or_default()
                .insert(entry.participant_id, entry.weight);
        }
        rows
    }

    fn cache_insert(&self, key: CacheKey, entries: Vec<WeightMatrixEntry>) {
        let mut cache = self.cache.write();
        cache.insert(key, entries);
        while cache.len() > self.capacity {
            let Some(oldest) = cache.keys().min_by_key(|(subnet, epoch)| (*epoch, *subnet)).copied()
            else {
                break;
            };
            cache.remove(&oldest);
        }
    }
}

fn decode_verified(
    bytes: &[u8],
    subnet_id: SubnetId,
    epoch: Epoch,
    commitment: &MatrixCommitment,
) -> Result<Vec<WeightMatrixEntry>> {
    let content_hash = Hash::compute(bytes);
    if content_hash != commitment.archive_ref {
        return Err(ChainError::IntegrityError(format!(
            "archive returned {content_hash} for {}",
            commitment.archive_ref
        )));
    }
    let document: MatrixDocument = serde_json::from_slice(bytes)
        .map_err(|err| ChainError::IntegrityError(format!("undecodable matrix: {err}")))?;
    if document.subnet_id != subnet_id || document.epoch != epoch {
        return Err(ChainError::IntegrityError(format!(
            "matrix for {} epoch {} stored under {subnet_id} epoch {epoch}",
            document.subnet_id, document.epoch
        )));
    }
    let entries = canonicalize(document.entries)
        .map_err(|err| ChainError::IntegrityError(err.to_string()))?;
    let root = matrix_root(&entries);
    if root != commitment.merkle_root {
        return Err(ChainError::IntegrityError(format!(
            "recomputed root {root} does not match committed {}",
            commitment.merkle_root
        )));
    }
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
