use types::{Epoch, Hash256};

/// Failures produced by `ProtoArray` and `ProtoArrayForkChoice`.
///
/// None of these are retryable in place: the `InvalidNodeIndex`,
/// `InvalidBestDescendant` and `IndexOverflow` variants indicate the arena
/// itself is no longer internally consistent (a programming error in this
/// crate, not in the caller), while the rest indicate the caller supplied
/// an input that does not match what the array currently holds.
#[derive(Debug, PartialEq)]
pub enum Error {
    /// `apply_score_changes` was given a `deltas` vector whose length does
    /// not match the number of nodes currently in the array.
    InvalidDeltaLen { deltas: usize, indices: usize },
    /// A delta would have taken a node's weight below zero.
    DeltaOverflow(usize),
    /// An internal index pointed outside `self.nodes`. Indicates arena
    /// corruption.
    InvalidNodeIndex(usize),
    /// `deltas[node_index]` was read but the vector did not cover that
    /// index.
    InvalidNodeDelta(usize),
    /// `deltas[parent_index]` was written but the vector did not cover
    /// that index.
    InvalidParentDelta(usize),
    /// A node's `best_descendant` pointed outside `self.nodes`.
    InvalidBestDescendant(usize),
    /// `find_head` resolved to a node that fails the viability check.
    InvalidBestNode {
        justified_epoch: Epoch,
        finalized_epoch: Epoch,
        node_justified_epoch: Epoch,
        node_finalized_epoch: Epoch,
    },
    /// `find_head` was given a root that is not present in the array.
    JustifiedNodeUnknown(Hash256),
    /// `maybe_prune` was given a root that is not present in the array.
    FinalizedNodeUnknown(Hash256),
    /// `maybe_prune` was asked to move finalization backwards.
    RevertedFinalizedEpoch {
        current_finalized_epoch: Epoch,
        new_finalized_epoch: Epoch,
    },
    /// An index shift during pruning underflowed. Indicates arena
    /// corruption.
    IndexOverflow(&'static str),
}
