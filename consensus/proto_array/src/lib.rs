mod error;
mod proto_array;
mod ssz_container;

use parking_lot::RwLock;
use proto_array::ProtoArray;
use serde_derive::{Deserialize, Serialize};
use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};
use ssz_container::SszContainer;
use std::ops::{Index, IndexMut};
use types::{Epoch, Hash256, Slot};

pub use error::Error as ProtoArrayError;
pub use proto_array::ProtoNode;

/// The minimum number of nodes `finalize` must see below a finalized index
/// before it is worth shifting the whole array.
pub const DEFAULT_PRUNE_THRESHOLD: usize = 256;

/// Tunables for `ProtoArrayForkChoice`. The only externally-meaningful
/// knob is how aggressively the array is pruned after finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtoArrayForkChoiceConfig {
    pub prune_threshold: usize,
}

impl Default for ProtoArrayForkChoiceConfig {
    fn default() -> Self {
        Self {
            prune_threshold: DEFAULT_PRUNE_THRESHOLD,
        }
    }
}

/// A block as presented to `process_block`. Carries exactly the fields
/// fork choice needs; block verification and state transition are the
/// caller's job.
#[derive(Clone, Copy, PartialEq, Debug, Encode, Decode)]
pub struct Block {
    pub slot: Slot,
    pub root: Hash256,
    pub parent_root: Option<Hash256>,
    pub state_root: Hash256,
    pub justified_epoch: Epoch,
    pub finalized_epoch: Epoch,
}

/// The `(root, epoch)` a validator is currently credited with, and the
/// `(root, epoch)` of its most recent attestation that has not yet been
/// folded into node weights.
#[derive(Clone, Copy, PartialEq, Debug, Encode, Decode, Serialize, Deserialize)]
pub struct VoteTracker {
    pub current_root: Hash256,
    pub current_epoch: Epoch,
    pub next_root: Hash256,
    pub next_epoch: Epoch,
}

impl Default for VoteTracker {
    fn default() -> Self {
        Self {
            current_root: Hash256::zero(),
            current_epoch: Epoch::new(0),
            next_root: Hash256::zero(),
            next_epoch: Epoch::new(0),
        }
    }
}

/// A `Vec` that grows on out-of-bounds writes instead of panicking.
/// Validator indices are only ever introduced, never removed, so this
/// lets the vote table stay a dense array without the caller having to
/// pre-size it.
#[derive(Clone, PartialEq, Debug, Encode, Decode, Serialize, Deserialize)]
pub struct ElasticList<T>(pub Vec<T>);

impl<T> Default for ElasticList<T> {
    fn default() -> Self {
        Self(vec![])
    }
}

impl<T> ElasticList<T>
where
    T: Default + Clone,
{
    fn ensure(&mut self, i: usize) {
        if self.0.len() <= i {
            self.0.resize(i + 1, T::default());
        }
    }

    pub fn get_mut(&mut self, i: usize) -> &mut T {
        self.ensure(i);
        &mut self.0[i]
    }

    pub fn get(&self, i: usize) -> Option<&T> {
        self.0.get(i)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T> Index<usize> for ElasticList<T> {
    type Output = T;

    fn index(&self, i: usize) -> &T {
        &self.0[i]
    }
}

impl<T> IndexMut<usize> for ElasticList<T>
where
    T: Default + Clone,
{
    fn index_mut(&mut self, i: usize) -> &mut T {
        self.get_mut(i)
    }
}

/// The vote accountant: owns the arena (`ProtoArray`) and the per-validator
/// vote table, and turns accumulated vote/balance changes into the delta
/// vector the arena needs to re-settle its best-child/best-descendant
/// pointers.
///
/// Safe for one writer and any number of concurrent readers: the arena and
/// the vote table are each behind their own `parking_lot::RwLock`.
pub struct ProtoArrayForkChoice {
    pub(crate) proto_array: RwLock<ProtoArray>,
    pub(crate) votes: RwLock<ElasticList<VoteTracker>>,
    pub(crate) balances: RwLock<Vec<u64>>,
}

impl PartialEq for ProtoArrayForkChoice {
    fn eq(&self, other: &Self) -> bool {
        *self.proto_array.read() == *other.proto_array.read()
            && *self.votes.read() == *other.votes.read()
            && *self.balances.read() == *other.balances.read()
    }
}

impl ProtoArrayForkChoice {
    pub fn new(
        finalized_block_slot: Slot,
        finalized_block_state_root: Hash256,
        justified_epoch: Epoch,
        finalized_epoch: Epoch,
        finalized_root: Hash256,
        prune_threshold: usize,
    ) -> Result<Self, String> {
        let mut proto_array = ProtoArray {
            prune_threshold,
            justified_epoch,
            finalized_epoch,
            nodes: Vec::with_capacity(1),
            indices: std::collections::HashMap::with_capacity(1),
        };

        proto_array
            .on_new_block(
                finalized_block_slot,
                finalized_root,
                None,
                finalized_block_state_root,
                justified_epoch,
                finalized_epoch,
            )
            .map_err(|e| format!("Failed to add finalized block to proto_array: {:?}", e))?;

        Ok(Self {
            proto_array: RwLock::new(proto_array),
            votes: RwLock::new(ElasticList::default()),
            balances: RwLock::new(vec![]),
        })
    }

    /// Register `block` with the fork choice DAG.
    ///
    /// A duplicate `block.root` is silently absorbed: this mirrors a block
    /// arriving twice over gossip and direct-import races, which is
    /// expected rather than exceptional.
    pub fn process_block(&self, block: Block) -> Result<(), String> {
        if self.contains_block(&block.root) {
            return Ok(());
        }

        self.proto_array
            .write()
            .on_new_block(
                block.slot,
                block.root,
                block.parent_root,
                block.state_root,
                block.justified_epoch,
                block.finalized_epoch,
            )
            .map_err(|e| format!("process_block_error: {:?}", e))
    }

    /// Record that `validator_index` has attested to `target_root` at
    /// `target_epoch`. Older or equal epochs are discarded as stale.
    pub fn process_attestation(
        &self,
        validator_index: usize,
        target_root: Hash256,
        target_epoch: Epoch,
    ) -> Result<(), String> {
        let mut votes = self.votes.write();
        let vote = votes.get_mut(validator_index);

        if target_epoch > vote.next_epoch || *vote == VoteTracker::default() {
            vote.next_root = target_root;
            vote.next_epoch = target_epoch;
        }

        Ok(())
    }

    /// Compute the head block root.
    ///
    /// Diffs every validator's `(current, next)` vote and its last-applied
    /// balance against `justified_state_balances`, folds the result into a
    /// delta vector, applies it to the arena, and returns the resulting
    /// best descendant of `justified_root`.
    pub fn find_head(
        &self,
        justified_epoch: Epoch,
        justified_root: Hash256,
        finalized_epoch: Epoch,
        justified_state_balances: &[u64],
    ) -> Result<Hash256, String> {
        let mut proto_array = self.proto_array.write();
        let mut votes = self.votes.write();
        let mut old_balances = self.balances.write();

        let deltas = compute_deltas(
            &proto_array.indices,
            &mut votes,
            &old_balances,
            justified_state_balances,
        )
        .map_err(|e| format!("find_head compute_deltas failed: {:?}", e))?;

        proto_array
            .apply_score_changes(deltas, justified_epoch, finalized_epoch)
            .map_err(|e| format!("find_head apply_score_changes failed: {:?}", e))?;

        *old_balances = justified_state_balances.to_vec();

        proto_array
            .find_head(&justified_root)
            .map_err(|e| format!("find_head failed: {:?}", e))
    }

    /// Prune the arena so that only `finalized_root` and its descendants
    /// remain, provided the arena's own pruning threshold is met.
    pub fn maybe_prune(&self, finalized_root: Hash256) -> Result<(), String> {
        let mut proto_array = self.proto_array.write();
        let finalized_epoch = proto_array.finalized_epoch;
        proto_array
            .maybe_prune(finalized_epoch, finalized_root)
            .map_err(|e| format!("find_head maybe_prune failed: {:?}", e))
    }

    pub fn len(&self) -> usize {
        self.proto_array.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_block(&self, block_root: &Hash256) -> bool {
        self.proto_array.read().indices.contains_key(block_root)
    }

    pub fn get_block(&self, block_root: &Hash256) -> Option<Block> {
        let proto_array = self.proto_array.read();
        let index = proto_array.indices.get(block_root)?;
        let node = proto_array.nodes.get(*index)?;

        let parent_root = node
            .parent
            .and_then(|index| proto_array.nodes.get(index))
            .map(|parent| parent.root);

        Some(Block {
            slot: node.slot,
            root: node.root,
            parent_root,
            state_root: node.state_root,
            justified_epoch: node.justified_epoch,
            finalized_epoch: node.finalized_epoch,
        })
    }

    pub fn get_weight(&self, block_root: &Hash256) -> Option<u64> {
        let proto_array = self.proto_array.read();
        let index = proto_array.indices.get(block_root)?;
        proto_array.nodes.get(*index).map(|node| node.weight)
    }

    /// Returns the root of the ancestor of `block_root` at `ancestor_slot`,
    /// if both `block_root` and a node at that slot are still held by the
    /// arena (pruning may have dropped the latter).
    pub fn ancestor_at_slot(&self, block_root: &Hash256, ancestor_slot: Slot) -> Option<Hash256> {
        self.proto_array
            .read()
            .ancestor_at_slot(block_root, ancestor_slot)
    }

    /// Returns the latest attested `(root, epoch)` for `validator_index`,
    /// if any vote has ever been recorded for it.
    pub fn latest_message(&self, validator_index: usize) -> Option<(Hash256, Epoch)> {
        let votes = self.votes.read();
        let vote = votes.get(validator_index)?;
        if *vote == VoteTracker::default() {
            None
        } else {
            Some((vote.next_root, vote.next_epoch))
        }
    }

    /// Encode a point-in-time snapshot, suitable for a caller to persist
    /// at its own checkpoints and later restore with `from_bytes`. This
    /// crate performs no file I/O and defines no recovery protocol; it
    /// only guarantees that `from_bytes(self.as_bytes())` round-trips.
    pub fn as_bytes(&self) -> Vec<u8> {
        SszContainer::from(self).as_ssz_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        SszContainer::from_ssz_bytes(bytes)
            .map_err(|e| format!("SszContainer decode error: {:?}", e))
            .map(Self::from)
    }
}

/// Computes the per-node weight delta vector for one `find_head` call.
///
/// For each validator spanned by either the vote table or the incoming
/// balances: if the vote is dirty (its `next` target differs from its
/// `current` target) or its credited balance has moved since the last
/// call, debit the old balance from the old target and credit the new
/// balance to the new target, then commit `current = next` and record the
/// new balance. A validator whose target is unchanged but whose balance
/// changed still needs this correction, or the array silently drifts out
/// of sync with the justified state.
fn compute_deltas(
    indices: &std::collections::HashMap<Hash256, usize>,
    votes: &mut ElasticList<VoteTracker>,
    old_balances: &[u64],
    new_balances: &[u64],
) -> Result<Vec<i64>, String> {
    let mut deltas = vec![0_i64; indices.len()];

    let num_validators = std::cmp::max(votes.len(), new_balances.len());

    for validator_index in 0..num_validators {
        let vote = votes.get_mut(validator_index);

        let old_balance = old_balances.get(validator_index).copied().unwrap_or(0);
        let new_balance = new_balances.get(validator_index).copied().unwrap_or(0);

        if vote.current_root == vote.next_root && old_balance == new_balance {
            continue;
        }

        if let Some(current_delta_index) = indices.get(&vote.current_root).copied() {
            let delta = deltas
                .get_mut(current_delta_index)
                .ok_or(format!("Delta index out of bounds: {}", current_delta_index))?;
            *delta -= old_balance as i64;
        }

        if let Some(next_delta_index) = indices.get(&vote.next_root).copied() {
            let delta = deltas
                .get_mut(next_delta_index)
                .ok_or(format!("Delta index out of bounds: {}", next_delta_index))?;
            *delta += new_balance as i64;
        }

        vote.current_root = vote.next_root;
        vote.current_epoch = vote.next_epoch;
    }

    Ok(deltas)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Offset so that `hash(0)` never collides with `Hash256::zero()`, the
    // sentinel `VoteTracker::default()` uses for "no vote yet".
    fn hash(n: u8) -> Hash256 {
        Hash256::from_low_u64_be(u64::from(n) + 1)
    }

    fn new_fork_choice() -> ProtoArrayForkChoice {
        ProtoArrayForkChoice::new(
            Slot::new(0),
            Hash256::zero(),
            Epoch::new(1),
            Epoch::new(1),
            hash(0),
            DEFAULT_PRUNE_THRESHOLD,
        )
        .unwrap()
    }

    fn add_block(fc: &ProtoArrayForkChoice, root: u8, parent: u8) {
        fc.process_block(Block {
            slot: Slot::new(u64::from(root)),
            root: hash(root),
            parent_root: Some(hash(parent)),
            state_root: Hash256::zero(),
            justified_epoch: Epoch::new(1),
            finalized_epoch: Epoch::new(1),
        })
        .unwrap();
    }

    #[test]
    fn duplicate_block_is_a_no_op() {
        let fc = new_fork_choice();
        add_block(&fc, 1, 0);
        add_block(&fc, 1, 0);
        assert_eq!(fc.len(), 2);
    }

    #[test]
    fn attestation_moves_head() {
        let fc = new_fork_choice();
        add_block(&fc, 1, 0);
        add_block(&fc, 2, 1);
        add_block(&fc, 3, 1);

        fc.process_attestation(0, hash(2), Epoch::new(2)).unwrap();
        fc.process_attestation(1, hash(3), Epoch::new(2)).unwrap();

        let balances = vec![10, 20];
        let head = fc
            .find_head(Epoch::new(1), hash(0), Epoch::new(1), &balances)
            .unwrap();
        assert_eq!(head, hash(3));
    }

    #[test]
    fn stale_attestation_epoch_is_ignored() {
        let fc = new_fork_choice();
        add_block(&fc, 1, 0);

        fc.process_attestation(0, hash(1), Epoch::new(5)).unwrap();
        fc.process_attestation(0, hash(1), Epoch::new(2)).unwrap();

        assert_eq!(fc.latest_message(0), Some((hash(1), Epoch::new(5))));
    }

    #[test]
    fn balance_change_alone_corrects_weight_without_a_new_vote() {
        let fc = new_fork_choice();
        add_block(&fc, 1, 0);
        add_block(&fc, 2, 1);

        fc.process_attestation(0, hash(2), Epoch::new(2)).unwrap();
        fc.find_head(Epoch::new(1), hash(0), Epoch::new(1), &[10])
            .unwrap();
        assert_eq!(fc.get_weight(&hash(2)), Some(10));

        // No new attestation, but the validator's effective balance grew.
        fc.find_head(Epoch::new(1), hash(0), Epoch::new(1), &[30])
            .unwrap();
        assert_eq!(fc.get_weight(&hash(2)), Some(30));
    }

    #[test]
    fn unknown_vote_target_contributes_no_weight_until_the_block_arrives() {
        let fc = new_fork_choice();
        add_block(&fc, 1, 0);

        // Attest to a block fork choice has not seen yet.
        fc.process_attestation(0, hash(99), Epoch::new(2)).unwrap();
        let head = fc
            .find_head(Epoch::new(1), hash(0), Epoch::new(1), &[10])
            .unwrap();
        assert_eq!(head, hash(1));
        assert_eq!(fc.get_weight(&hash(1)), Some(0));

        add_block(&fc, 99, 1);
        let head = fc
            .find_head(Epoch::new(1), hash(0), Epoch::new(1), &[10])
            .unwrap();
        assert_eq!(head, hash(99));
    }

    #[test]
    fn prune_forwards_the_stored_finalized_epoch() {
        let fc = ProtoArrayForkChoice::new(
            Slot::new(0),
            Hash256::zero(),
            Epoch::new(1),
            Epoch::new(1),
            hash(0),
            1,
        )
        .unwrap();
        add_block(&fc, 1, 0);
        add_block(&fc, 2, 1);

        fc.maybe_prune(hash(1)).unwrap();

        assert_eq!(fc.len(), 2);
        assert!(!fc.contains_block(&hash(0)));
        assert!(fc.contains_block(&hash(1)));
    }

    #[test]
    fn ancestor_at_slot_is_reachable_from_the_fork_choice_handle() {
        let fc = new_fork_choice();
        add_block(&fc, 1, 0);
        add_block(&fc, 2, 1);

        assert_eq!(
            fc.ancestor_at_slot(&hash(2), Slot::new(1)),
            Some(hash(1))
        );
        assert_eq!(fc.ancestor_at_slot(&hash(2), Slot::new(99)), None);
    }

    #[test]
    fn snapshot_round_trips() {
        let fc = new_fork_choice();
        add_block(&fc, 1, 0);
        fc.process_attestation(0, hash(1), Epoch::new(2)).unwrap();
        fc.find_head(Epoch::new(1), hash(0), Epoch::new(1), &[10])
            .unwrap();

        let bytes = fc.as_bytes();
        let restored = ProtoArrayForkChoice::from_bytes(&bytes).unwrap();

        assert_eq!(fc, restored);
    }
}
