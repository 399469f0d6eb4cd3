//! GHOST-style fork choice with checkpoint finality.
//!
//! Blocks live in an arena keyed by hash with a separate parent → children
//! index, so branches can be walked and pruned without reference cycles.
//!
//! ```text
//! Proposed -> Canonical -> Finalized
//!          \-> Orphaned   (a conflicting branch was finalized)
//! ```

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::block::BlockHeader;
use crate::config::ForkChoiceConfig;
use crate::error::{ChainError, Result};
use crate::registry::ValidatorRegistry;
use crate::types::{Address, Hash, Hashable};

// ---------------------------------------------------------------------------
// BlockNode
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    Proposed,
    Canonical,
    Finalized,
    Orphaned,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockNode {
    pub hash: Hash,
    pub parent_hash: Hash,
    pub height: u64,
    pub producer: Address,
    /// Stake of every proposal in this subtree, the node itself included.
    pub subtree_weight: u128,
    pub status: BlockStatus,
}

impl BlockNode {
    pub fn is_finalized(&self) -> bool {
        self.status == BlockStatus::Finalized
    }
}

// ---------------------------------------------------------------------------
// ForkChoiceTracker
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct ForkChoiceTracker {
    config: ForkChoiceConfig,
    nodes: HashMap<Hash, BlockNode>,
    children: HashMap<Hash, Vec<Hash>>,
    /// Most recent vote per validator. A proposal counts as a vote.
    latest_votes: HashMap<Address, Hash>,
    finalized: Hash,
}

impl ForkChoiceTracker {
    /// Start a tree rooted at `genesis`, which is finalized from the outset.
    pub fn new(config: ForkChoiceConfig, genesis: &BlockHeader) -> Self {
        let hash = genesis.hash();
        let root = BlockNode {
            hash,
            parent_hash: genesis.parent_hash,
            height: genesis.height,
            producer: genesis.proposer.clone(),
            subtree_weight: 0,
            status: BlockStatus::Finalized,
        };
        Self {
            config,
            nodes: HashMap::from([(hash, root)]),
            children: HashMap::new(),
            latest_votes: HashMap::new(),
            finalized: hash,
        }
    }

    pub fn get(&self, hash: &Hash) -> Option<&BlockNode> {
        self.nodes.get(hash)
    }

    pub fn status(&self, hash: &Hash) -> Option<BlockStatus> {
        self.nodes.get(hash).map(|n| n.status)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn finalized_hash(&self) -> Hash {
        self.finalized
    }

    pub fn finalized_height(&self) -> u64 {
        self.nodes.get(&self.finalized).map_or(0, |n| n.height)
    }

    pub fn latest_vote(&self, validator: &Address) -> Option<&Hash> {
        self.latest_votes.get(validator)
    }

    /// Insert a block and credit its producer's stake to every ancestor.
    pub fn add_block(&mut self, header: &BlockHeader, registry: &ValidatorRegistry) -> Result<Hash> {
        let hash = header.hash();
        if self.nodes.contains_key(&hash) {
            return Err(ChainError::DuplicateBlock(hash.to_hex()));
        }
        let parent = self
            .nodes
            .get(&header.parent_hash)
            .ok_or_else(|| ChainError::UnknownParent(header.parent_hash.to_hex()))?;
        if header.height != parent.height + 1 {
            return Err(ChainError::InvalidBlock(format!(
                "height {} does not follow parent height {}",
                header.height, parent.height
            )));
        }
        if !self.descends_from_finalized(&header.parent_hash) {
            warn!(block = %hash, parent = %header.parent_hash, "block conflicts with finalized chain");
            return Err(ChainError::ConflictsWithFinalized(hash.to_hex()));
        }

        let weight = registry
            .get(&header.proposer)
            .filter(|v| v.is_eligible())
            .map_or(0, |v| u128::from(v.stake));

        self.nodes.insert(
            hash,
            BlockNode {
                hash,
                parent_hash: header.parent_hash,
                height: header.height,
                producer: header.proposer.clone(),
                subtree_weight: 0,
                status: BlockStatus::Proposed,
            },
        );
        self.children.entry(header.parent_hash).or_default().push(hash);

        let mut cursor = Some(hash);
        while let Some(current) = cursor {
            cursor = self.nodes.get_mut(&current).map(|node| {
                node.subtree_weight += weight;
                node.parent_hash
            });
        }

        self.latest_votes.insert(header.proposer.clone(), hash);
        self.refresh_canonical();
        debug!(block = %hash, height = header.height, weight, "block added");
        Ok(hash)
    }

    /// Record an explicit vote for a known, non-orphaned block.
    pub fn attest(&mut self, validator: &Address, block_hash: &Hash) -> Result<()> {
        match self.nodes.get(block_hash) {
            None => Err(ChainError::BlockNotFound(block_hash.to_hex())),
            Some(node) if node.status == BlockStatus::Orphaned => {
                Err(ChainError::ConflictsWithFinalized(block_hash.to_hex()))
            }
            Some(_) => {
                self.latest_votes.insert(validator.clone(), *block_hash);
                Ok(())
            }
        }
    }

    /// Descend from the finalized block, always into the heaviest child.
    /// Equal weights go to the lowest hash.
    pub fn canonical_head(&self) -> Hash {
        let mut head = self.finalized;
        while let Some(next) = self.heaviest_child(&head) {
            head = next;
        }
        head
    }

    /// Canonical chain from the root to the head, oldest first.
    pub fn canonical_chain(&self) -> Vec<Hash> {
        let mut chain = self.ancestry(&self.canonical_head());
        chain.reverse();
        chain
    }

    pub fn is_canonical(&self, hash: &Hash) -> bool {
        matches!(
            self.status(hash),
            Some(BlockStatus::Canonical | BlockStatus::Finalized)
        )
    }

    /// Finalize the highest checkpoint on the canonical chain whose support
    /// strictly exceeds `finality_threshold` of total active stake.
    pub fn try_finalize(&mut self, registry: &ValidatorRegistry) -> Option<Hash> {
        let total = registry.total_active_stake();
        if total == 0 {
            return None;
        }
        let finalized_height = self.finalized_height();
        let interval = self.config.checkpoint_interval.max(1);

        let candidate = self
            .canonical_chain()
            .into_iter()
            .rev()
            .filter_map(|h| self.nodes.get(&h))
            .filter(|n| n.height > finalized_height && n.height % interval == 0)
            .map(|n| n.hash)
            .find(|h| {
                let support = self.support(h, registry);
                support as f64 > self.config.finality_threshold * total as f64
            })?;

        self.finalize(candidate);
        Some(candidate)
    }

    /// Stake of eligible validators whose latest vote descends from `hash`.
    pub fn support(&self, hash: &Hash, registry: &ValidatorRegistry) -> u128 {
        self.latest_votes
            .iter()
            .filter(|(_, vote)| self.is_descendant(vote, hash))
            .filter_map(|(validator, _)| registry.get(validator))
            .filter(|v| v.is_eligible())
            .map(|v| u128::from(v.stake))
            .sum()
    }

    /// Drop orphaned nodes from the arena. Returns how many were removed.
    pub fn prune_orphaned(&mut self) -> usize {
        let orphaned: Vec<Hash> = self
            .nodes
            .values()
            .filter(|n| n.status == BlockStatus::Orphaned)
            .map(|n| n.hash)
            .collect();
        for hash in &orphaned {
            self.nodes.remove(hash);
            self.children.remove(hash);
        }
        for kids in self.children.values_mut() {
            kids.retain(|h| !orphaned.contains(h));
        }
        self.latest_votes.retain(|_, vote| !orphaned.contains(vote));
        orphaned.len()
    }

    // -- internals -----------------------------------------------------------

    fn heaviest_child(&self, hash: &Hash) -> Option<Hash> {
        self.children
            .get(hash)?
            .iter()
            .filter_map(|h| self.nodes.get(h))
            .filter(|n| n.status != BlockStatus::Orphaned)
            .max_by(|a, b| {
                a.subtree_weight
                    .cmp(&b.subtree_weight)
                    .then_with(|| b.hash.cmp(&a.hash))
            })
            .map(|n| n.hash)
    }

    /// `hash` and its ancestors, newest first.
    fn ancestry(&self, hash: &Hash) -> Vec<Hash> {
        let mut path = Vec::new();
        let mut cursor = self.nodes.get(hash);
        while let Some(node) = cursor {
            path.push(node.hash);
            cursor = self.nodes.get(&node.parent_hash).filter(|p| p.hash != node.hash);
        }
        path
    }

    fn is_descendant(&self, hash: &Hash, ancestor: &Hash) -> bool {
        let Some(target) = self.nodes.get(ancestor) else {
            return false;
        };
        let mut cursor = self.nodes.get(hash);
        while let Some(node) = cursor {
            if node.hash == target.hash {
                return true;
            }
            if node.height <= target.height {
                return false;
            }
            cursor = self.nodes.get(&node.parent_hash);
        }
        false
    }

    fn descends_from_finalized(&self, hash: &Hash) -> bool {
        self.nodes
            .get(hash)
            .is_some_and(|n| n.status != BlockStatus::Orphaned)
            && self.is_descendant(hash, &self.finalized)
    }

    fn finalize(&mut self, target: Hash) {
        let previous_height = self.finalized_height();
        let path: Vec<Hash> = self
            .ancestry(&target)
            .into_iter()
            .take_while(|h| self.nodes.get(h).is_some_and(|n| n.height > previous_height))
            .collect();
        let on_path: HashSet<Hash> = path.iter().copied().collect();

        // Every branch leaving the path below the new checkpoint loses.
        let mut losers = Vec::new();
        for hash in path.iter().skip(1).chain(std::iter::once(&self.finalized)) {
            if let Some(kids) = self.children.get(hash) {
                losers.extend(kids.iter().filter(|k| !on_path.contains(*k)).copied());
            }
        }
        let mut orphaned = 0usize;
        while let Some(hash) = losers.pop() {
            if let Some(node) = self.nodes.get_mut(&hash) {
                node.status = BlockStatus::Orphaned;
                orphaned += 1;
            }
            if let Some(kids) = self.children.get(&hash) {
                losers.extend(kids.iter().copied());
            }
        }

        for hash in &path {
            if let Some(node) = self.nodes.get_mut(hash) {
                node.status = BlockStatus::Finalized;
            }
        }
        self.finalized = target;
        self.refresh_canonical();

        let height = self.finalized_height();
        info!(block = %target, height, "checkpoint finalized");
        if orphaned > 0 {
            warn!(orphaned, height, "branches orphaned by finality");
        }
    }

    /// Re-mark non-finalized blocks as Canonical or Proposed after the head moved.
    fn refresh_canonical(&mut self) {
        let mut on_chain = HashSet::new();
        let mut cursor = self.finalized;
        while let Some(next) = self.heaviest_child(&cursor) {
            on_chain.insert(next);
            cursor = next;
        }
        for node in self.nodes.values_mut() {
            match node.status {
                BlockStatus::Proposed if on_chain.contains(&node.hash) => {
                    node.status = BlockStatus::Canonical;
                }
                BlockStatus::Canonical if !on_chain.contains(&node.hash) => {
                    node.status = BlockStatus::Proposed;
                }
                _ => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, BlockBody};
    use crate::config::RegistryConfig;

    fn addr(byte: u8) -> Address {
        Address::from_bytes([byte; 32])
    }

    fn registry(stakes: &[(u8, u64)]) -> ValidatorRegistry {
        ValidatorRegistry::with_validators(
            RegistryConfig::default(),
            stakes.iter().map(|(b, s)| (addr(*b), *s)),
        )
        .unwrap()
    }

    fn child(parent: &BlockHeader, proposer: u8, slot: u64) -> BlockHeader {
        Block::new(
            parent.hash(),
            parent.height + 1,
            0,
            slot,
            1_700_000_000_000 + slot,
            addr(proposer),
            BlockBody::empty(),
            Hash::zero(),
        )
        .header
    }

    fn setup() -> (ForkChoiceTracker, BlockHeader) {
        let genesis = Block::genesis(addr(0), 1_700_000_000_000).header;
        let config = ForkChoiceConfig {
            checkpoint_interval: 2,
            finality_threshold: 2.0 / 3.0,
        };
        (ForkChoiceTracker::new(config, &genesis), genesis)
    }

    #[test]
    fn test_genesis_is_finalized_head() {
        let (tracker, genesis) = setup();
        assert_eq!(tracker.canonical_head(), genesis.hash());
        assert_eq!(tracker.status(&genesis.hash()), Some(BlockStatus::Finalized));
        assert_eq!(tracker.finalized_hash(), genesis.hash());
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let (mut tracker, genesis) = setup();
        let reg = registry(&[(1, 10)]);
        let orphan = child(&child(&genesis, 1, 1), 1, 2);
        assert!(matches!(
            tracker.add_block(&orphan, &reg),
            Err(ChainError::UnknownParent(_))
        ));
    }

    #[test]
    fn test_duplicate_block_rejected() {
        let (mut tracker, genesis) = setup();
        let reg = registry(&[(1, 10)]);
        let b1 = child(&genesis, 1, 1);
        tracker.add_block(&b1, &reg).unwrap();
        assert!(matches!(
            tracker.add_block(&b1, &reg),
            Err(ChainError::DuplicateBlock(_))
        ));
    }

    #[test]
    fn test_weight_propagates_to_ancestors() {
        let (mut tracker, genesis) = setup();
        let reg = registry(&[(1, 10), (2, 30)]);
        let b1 = child(&genesis, 1, 1);
        let b2 = child(&b1, 2, 2);
        tracker.add_block(&b1, &reg).unwrap();
        tracker.add_block(&b2, &reg).unwrap();

        assert_eq!(tracker.get(&genesis.hash()).unwrap().subtree_weight, 40);
        assert_eq!(tracker.get(&b1.hash()).unwrap().subtree_weight, 40);
        assert_eq!(tracker.get(&b2.hash()).unwrap().subtree_weight, 30);
    }

    #[test]
    fn test_heaviest_branch_wins() {
        let (mut tracker, genesis) = setup();
        let reg = registry(&[(1, 10), (2, 30), (3, 15)]);
        let light = child(&genesis, 1, 1);
        let heavy = child(&genesis, 2, 2);
        tracker.add_block(&light, &reg).unwrap();
        tracker.add_block(&heavy, &reg).unwrap();
        assert_eq!(tracker.canonical_head(), heavy.hash());
        assert_eq!(tracker.status(&light.hash()), Some(BlockStatus::Proposed));

        // Two light proposals outweigh one heavy one.
        let light2 = child(&light, 3, 3);
        let light3 = child(&light2, 3, 4);
        tracker.add_block(&light2, &reg).unwrap();
        tracker.add_block(&light3, &reg).unwrap();
        // 10 + 15 + 15 = 40 > 30
        assert_eq!(tracker.canonical_head(), light3.hash());
        assert!(tracker.is_canonical(&light.hash()));
        assert!(!tracker.is_canonical(&heavy.hash()));
    }

    #[test]
    fn test_tie_broken_by_lowest_hash() {
        let (mut tracker, genesis) = setup();
        let reg = registry(&[(1, 10), (2, 10)]);
        let a = child(&genesis, 1, 1);
        let b = child(&genesis, 2, 1);
        tracker.add_block(&a, &reg).unwrap();
        tracker.add_block(&b, &reg).unwrap();
        let expected = std::cmp::min(a.hash(), b.hash());
        assert_eq!(tracker.canonical_head(), expected);
    }

    #[test]
    fn test_finalize_orphans_conflicting_branch() {
        let (mut tracker, genesis) = setup();
        let reg = registry(&[(1, 40), (2, 40), (3, 20)]);

        let b1 = child(&genesis, 1, 1);
        let b2 = child(&b1, 2, 2);
        let fork = child(&b1, 3, 3);
        let b3 = child(&b2, 1, 4);
        for header in [&b1, &b2, &fork, &b3] {
            tracker.add_block(header, &reg).unwrap();
        }

        // Votes for b2's subtree: 1 (b3) and 2 (b2) = 80 > 66.6
        let finalized = tracker.try_finalize(&reg).expect("checkpoint at height 2");
        assert_eq!(finalized, b2.hash());
        assert_eq!(tracker.status(&b1.hash()), Some(BlockStatus::Finalized));
        assert_eq!(tracker.status(&fork.hash()), Some(BlockStatus::Orphaned));
        assert_eq!(tracker.status(&b3.hash()), Some(BlockStatus::Canonical));

        // Building on the orphaned fork conflicts with finality.
        let late = child(&fork, 3, 5);
        assert!(matches!(
            tracker.add_block(&late, &reg),
            Err(ChainError::ConflictsWithFinalized(_))
        ));
        // So does a new sibling of the finalized checkpoint.
        let sibling = child(&b1, 3, 6);
        assert!(matches!(
            tracker.add_block(&sibling, &reg),
            Err(ChainError::ConflictsWithFinalized(_))
        ));
    }

    #[test]
    fn test_insufficient_support_does_not_finalize() {
        let (mut tracker, genesis) = setup();
        let reg = registry(&[(1, 50), (2, 50)]);
        let b1 = child(&genesis, 1, 1);
        let b2 = child(&b1, 1, 2);
        tracker.add_block(&b1, &reg).unwrap();
        tracker.add_block(&b2, &reg).unwrap();
        assert!(tracker.try_finalize(&reg).is_none());

        // An attestation from the other half tips it over.
        tracker.attest(&addr(2), &b2.hash()).unwrap();
        assert_eq!(tracker.try_finalize(&reg), Some(b2.hash()));
    }

    #[test]
    fn test_head_never_leaves_finalized_subtree() {
        let (mut tracker, genesis) = setup();
        let reg = registry(&[(1, 70), (2, 30)]);
        let b1 = child(&genesis, 1, 1);
        let b2 = child(&b1, 1, 2);
        tracker.add_block(&b1, &reg).unwrap();
        tracker.add_block(&b2, &reg).unwrap();
        tracker.attest(&addr(2), &b2.hash()).unwrap();
        assert_eq!(tracker.try_finalize(&reg), Some(b2.hash()));

        for slot in 3..8 {
            let head = tracker.get(&tracker.canonical_head()).unwrap().clone();
            let next = Block::new(head.hash, head.height + 1, 0, slot, slot, addr(2), BlockBody::empty(), Hash::zero()).header;
            tracker.add_block(&next, &reg).unwrap();
            assert!(tracker.is_descendant(&tracker.canonical_head(), &b2.hash()));
        }
    }

    #[test]
    fn test_prune_orphaned() {
        let (mut tracker, genesis) = setup();
        let reg = registry(&[(1, 80), (2, 20)]);
        let b1 = child(&genesis, 1, 1);
        let fork = child(&genesis, 2, 1);
        let b2 = child(&b1, 1, 2);
        for header in [&b1, &fork, &b2] {
            tracker.add_block(header, &reg).unwrap();
        }
        tracker.try_finalize(&reg).unwrap();
        assert_eq!(tracker.prune_orphaned(), 1);
        assert!(tracker.get(&fork.hash()).is_none());
        assert!(tracker.latest_vote(&addr(2)).is_none());
    }

    #[test]
    fn test_attest_unknown_block() {
        let (mut tracker, _) = setup();
        assert!(matches!(
            tracker.attest(&addr(1), &Hash::compute(b"nope")),
            Err(ChainError::BlockNotFound(_))
        ));
    }
}
