use crate::error::Error;
use serde_derive::{Deserialize, Serialize};
use ssz_derive::{Decode, Encode};
use std::collections::HashMap;
use types::{Epoch, Hash256, Slot};

#[derive(Clone, PartialEq, Debug, Encode, Decode, Serialize, Deserialize)]
pub struct ProtoNode {
    /// Not read by `ProtoArray` itself; carried so callers can query the
    /// slot of a block without a second lookup.
    pub slot: Slot,
    pub root: Hash256,
    /// Carried for consumers, not used by fork choice.
    pub state_root: Hash256,
    pub parent: Option<usize>,
    pub justified_epoch: Epoch,
    pub finalized_epoch: Epoch,
    pub weight: u64,
    pub best_child: Option<usize>,
    pub best_descendant: Option<usize>,
}

#[derive(PartialEq, Serialize, Deserialize)]
pub struct ProtoArray {
    /// Do not attempt to prune the tree unless it has at least this many
    /// nodes. Small prunes simply waste time.
    pub prune_threshold: usize,
    pub justified_epoch: Epoch,
    pub finalized_epoch: Epoch,
    pub nodes: Vec<ProtoNode>,
    pub indices: HashMap<Hash256, usize>,
}

impl ProtoArray {
    /// Iterate backwards through the array, touching all nodes and their
    /// parents and potentially the best-child of each parent.
    ///
    /// The structure of `self.nodes` ensures that the child of each node is
    /// always touched before its parent, so by the time a parent is
    /// visited every one of its descendants already has its final weight
    /// and a settled `best_descendant`.
    ///
    /// For each node, the following is done:
    ///
    /// - Update the node's weight with the corresponding delta.
    /// - Back-propagate the node's delta to its parent's delta.
    /// - Compare the current node with the parent's best-child, updating
    ///   it if the current node should become the best child.
    /// - Update the parent's best-descendant with the current node or its
    ///   best-descendant, if required.
    pub fn apply_score_changes(
        &mut self,
        mut deltas: Vec<i64>,
        justified_epoch: Epoch,
        finalized_epoch: Epoch,
    ) -> Result<(), Error> {
        if deltas.len() != self.indices.len() {
            return Err(Error::InvalidDeltaLen {
                deltas: deltas.len(),
                indices: self.indices.len(),
            });
        }

        if justified_epoch != self.justified_epoch || finalized_epoch != self.finalized_epoch {
            self.justified_epoch = justified_epoch;
            self.finalized_epoch = finalized_epoch;
        }

        // Iterate backwards through all indices in `self.nodes`.
        for node_index in (0..self.nodes.len()).rev() {
            let node_delta = deltas
                .get(node_index)
                .copied()
                .ok_or(Error::InvalidNodeDelta(node_index))?;

            let node = self
                .nodes
                .get_mut(node_index)
                .ok_or(Error::InvalidNodeIndex(node_index))?;

            // Apply the delta to the node.
            if node_delta < 0 {
                node.weight = node
                    .weight
                    .checked_sub(node_delta.unsigned_abs())
                    .ok_or(Error::DeltaOverflow(node_index))?;
            } else {
                node.weight = node
                    .weight
                    .checked_add(node_delta as u64)
                    .ok_or(Error::DeltaOverflow(node_index))?;
            }

            // If the node has a parent, propagate the delta and try to
            // update its best-child and best-descendant.
            if let Some(parent_index) = node.parent {
                let parent_delta = deltas
                    .get_mut(parent_index)
                    .ok_or(Error::InvalidParentDelta(parent_index))?;

                // Back-propagate the node's raw delta to its parent.
                *parent_delta += node_delta;

                self.maybe_update_best_child_and_descendant(parent_index, node_index)?;
            }
        }

        Ok(())
    }

    /// Register a new block with the fork choice.
    ///
    /// It is only sane to supply a `None` parent for the genesis/finalized
    /// root node.
    pub fn on_new_block(
        &mut self,
        slot: Slot,
        root: Hash256,
        parent_opt: Option<Hash256>,
        state_root: Hash256,
        justified_epoch: Epoch,
        finalized_epoch: Epoch,
    ) -> Result<(), Error> {
        let node_index = self.nodes.len();

        let node = ProtoNode {
            slot,
            root,
            state_root,
            parent: parent_opt.and_then(|parent| self.indices.get(&parent).copied()),
            justified_epoch,
            finalized_epoch,
            weight: 0,
            best_child: None,
            best_descendant: None,
        };

        self.indices.insert(node.root, node_index);
        let parent = node.parent;
        self.nodes.push(node);

        if let Some(parent_index) = parent {
            self.maybe_update_best_child_and_descendant(parent_index, node_index)?;
        }

        Ok(())
    }

    /// Follows the best-descendant links to find the best block (i.e. the
    /// head block).
    ///
    /// The result of this function is not guaranteed to be accurate unless
    /// `Self::apply_score_changes` has been called since the last
    /// `Self::on_new_block`: `on_new_block` does not walk back up the tree
    /// to update ancestors' best-descendant links on its own.
    pub fn find_head(&self, justified_root: &Hash256) -> Result<Hash256, Error> {
        let justified_index = self
            .indices
            .get(justified_root)
            .copied()
            .ok_or(Error::JustifiedNodeUnknown(*justified_root))?;

        let justified_node = self
            .nodes
            .get(justified_index)
            .ok_or(Error::InvalidNodeIndex(justified_index))?;

        let best_descendant_index = justified_node.best_descendant.unwrap_or(justified_index);

        let best_node = self
            .nodes
            .get(best_descendant_index)
            .ok_or(Error::InvalidBestDescendant(best_descendant_index))?;

        // It is a logic error to return a head that does not match the
        // current justified/finalized filter.
        if !self.node_is_viable_for_head(best_node) {
            return Err(Error::InvalidBestNode {
                justified_epoch: self.justified_epoch,
                finalized_epoch: self.finalized_epoch,
                node_justified_epoch: justified_node.justified_epoch,
                node_finalized_epoch: justified_node.finalized_epoch,
            });
        }

        Ok(best_node.root)
    }

    /// Update the tree with new finalization information.
    ///
    /// The tree is only actually pruned if both of the following hold:
    ///
    /// - `finalized_root` resolves to an index at or beyond
    ///   `self.prune_threshold`.
    /// - That index is greater than zero (there is something to drop).
    ///
    /// # Errors
    ///
    /// Returns an error if `finalized_epoch` is older than the epoch
    /// currently stored, if `finalized_root` is unknown, or if an internal
    /// index would underflow during renumbering.
    pub fn maybe_prune(
        &mut self,
        finalized_epoch: Epoch,
        finalized_root: Hash256,
    ) -> Result<(), Error> {
        if finalized_epoch < self.finalized_epoch {
            // It's illegal to swap to an earlier finalized root; this
            // would imply reverting a finalized block.
            return Err(Error::RevertedFinalizedEpoch {
                current_finalized_epoch: self.finalized_epoch,
                new_finalized_epoch: finalized_epoch,
            });
        } else if finalized_epoch != self.finalized_epoch {
            self.finalized_epoch = finalized_epoch;
        }

        let finalized_index = *self
            .indices
            .get(&finalized_root)
            .ok_or(Error::FinalizedNodeUnknown(finalized_root))?;

        if finalized_index < self.prune_threshold {
            // Pruning at small numbers incurs more cost than benefit.
            return Ok(());
        }

        // Remove the `self.indices` entries for all the to-be-deleted
        // nodes.
        for node_index in 0..finalized_index {
            let root = &self
                .nodes
                .get(node_index)
                .ok_or(Error::InvalidNodeIndex(node_index))?
                .root;
            self.indices.remove(root);
        }

        // Drop all the nodes prior to finalization.
        self.nodes = self.nodes.split_off(finalized_index);

        // Adjust the indices map to match the new layout of `self.nodes`.
        for index in self.indices.values_mut() {
            *index = index
                .checked_sub(finalized_index)
                .ok_or(Error::IndexOverflow("indices"))?;
        }

        // Adjust every surviving node's cross-references to match.
        for node in self.nodes.iter_mut() {
            // If `node.parent` is less than `finalized_index`, the parent
            // was pruned away; the survivor becomes a root.
            node.parent = node.parent.and_then(|parent| parent.checked_sub(finalized_index));

            if let Some(best_child) = node.best_child {
                node.best_child = Some(
                    best_child
                        .checked_sub(finalized_index)
                        .ok_or(Error::IndexOverflow("best_child"))?,
                );
            }
            if let Some(best_descendant) = node.best_descendant {
                node.best_descendant = Some(
                    best_descendant
                        .checked_sub(finalized_index)
                        .ok_or(Error::IndexOverflow("best_descendant"))?,
                );
            }
        }

        Ok(())
    }

    /// Observe the parent at `parent_index` with respect to the child at
    /// `child_index` and potentially modify `parent.best_child` and
    /// `parent.best_descendant`.
    ///
    /// ## Detail
    ///
    /// There are four outcomes:
    ///
    /// - The child is already the best child but it's no longer viable due
    ///   to an epoch-filter change, and should be removed.
    /// - The child is already the best child and the parent is refreshed
    ///   with the new best-descendant.
    /// - The child is not the best child but becomes the best child (by
    ///   viability, then by weight, then by root as a tie-break).
    /// - The child is not the best child and does not become one.
    fn maybe_update_best_child_and_descendant(
        &mut self,
        parent_index: usize,
        child_index: usize,
    ) -> Result<(), Error> {
        let child = self
            .nodes
            .get(child_index)
            .ok_or(Error::InvalidNodeIndex(child_index))?;
        let parent = self
            .nodes
            .get(parent_index)
            .ok_or(Error::InvalidNodeIndex(parent_index))?;

        let child_leads_to_viable_head = self.node_leads_to_viable_head(child)?;

        // Aliases for the three outcomes we may set `parent.best_child`
        // and `parent.best_descendant` to.
        let change_to_none = (None, None);
        let change_to_child = (
            Some(child_index),
            child.best_descendant.or(Some(child_index)),
        );
        let no_change = (parent.best_child, parent.best_descendant);

        let (new_best_child, new_best_descendant) = if let Some(best_child_index) =
            parent.best_child
        {
            if best_child_index == child_index && !child_leads_to_viable_head {
                // The current best-child is no longer viable; drop it.
                change_to_none
            } else if best_child_index == child_index {
                // Re-affirm the best child so the parent's
                // best-descendant is refreshed.
                change_to_child
            } else {
                let best_child = self
                    .nodes
                    .get(best_child_index)
                    .ok_or(Error::InvalidBestDescendant(best_child_index))?;
                let best_child_leads_to_viable_head =
                    self.node_leads_to_viable_head(best_child)?;

                if child_leads_to_viable_head && !best_child_leads_to_viable_head {
                    // The child leads to a viable head but the current
                    // best-child doesn't.
                    change_to_child
                } else if !child_leads_to_viable_head && best_child_leads_to_viable_head {
                    // The reverse: keep the existing best-child.
                    no_change
                } else if child.weight == best_child.weight {
                    // Tie-break by root, largest wins.
                    if child.root >= best_child.root {
                        change_to_child
                    } else {
                        no_change
                    }
                } else if child.weight > best_child.weight {
                    change_to_child
                } else {
                    no_change
                }
            }
        } else if child_leads_to_viable_head {
            // There is no current best-child and the child is viable.
            change_to_child
        } else {
            // There is no current best-child and the child isn't viable
            // either.
            no_change
        };

        let parent = self
            .nodes
            .get_mut(parent_index)
            .ok_or(Error::InvalidNodeIndex(parent_index))?;
        parent.best_child = new_best_child;
        parent.best_descendant = new_best_descendant;

        Ok(())
    }

    /// Indicates if the node itself is viable for the head, or if its best
    /// descendant is viable for the head.
    fn node_leads_to_viable_head(&self, node: &ProtoNode) -> Result<bool, Error> {
        let best_descendant_is_viable = if let Some(best_descendant_index) = node.best_descendant
        {
            let best_descendant = self
                .nodes
                .get(best_descendant_index)
                .ok_or(Error::InvalidBestDescendant(best_descendant_index))?;
            self.node_is_viable_for_head(best_descendant)
        } else {
            false
        };

        Ok(best_descendant_is_viable || self.node_is_viable_for_head(node))
    }

    /// Walk `parent` links from `root` until a node at `ancestor_slot` is
    /// found. Returns `None` if `root` is unknown, or if the walk runs off
    /// the end of the chain (`ancestor_slot` predates every retained
    /// ancestor, e.g. because of pruning) before reaching it.
    ///
    /// Unlike the wider fork-choice specification's `get_ancestor`, this
    /// only ever consults nodes already held by the arena: there is no
    /// `BeaconState` here to fall back on for historical skip slots, so a
    /// slot gap across a single `parent` link is assumed to mean the
    /// requested slot was itself skipped, and the walk continues toward the
    /// next older node rather than fabricating an intermediate one.
    pub fn ancestor_at_slot(&self, root: &Hash256, ancestor_slot: Slot) -> Option<Hash256> {
        let mut index = *self.indices.get(root)?;

        loop {
            let node = self.nodes.get(index)?;

            if node.slot == ancestor_slot {
                return Some(node.root);
            }
            if node.slot < ancestor_slot {
                return None;
            }

            index = node.parent?;
        }
    }

    /// Mirrors `filter_block_tree` from the phase-0 fork-choice
    /// specification: a node whose justified/finalized epoch disagrees
    /// with the array's is not viable for the head, unless the array's
    /// own view is still at genesis (epoch 0), in which case any epoch is
    /// accepted — the array hasn't seen enough of the chain yet to filter
    /// meaningfully.
    fn node_is_viable_for_head(&self, node: &ProtoNode) -> bool {
        (node.justified_epoch == self.justified_epoch || self.justified_epoch == Epoch::new(0))
            && (node.finalized_epoch == self.finalized_epoch
                || self.finalized_epoch == Epoch::new(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> Hash256 {
        Hash256::from_low_u64_be(u64::from(n))
    }

    fn new_array(prune_threshold: usize) -> ProtoArray {
        let mut array = ProtoArray {
            prune_threshold,
            justified_epoch: Epoch::new(1),
            finalized_epoch: Epoch::new(1),
            nodes: vec![],
            indices: HashMap::new(),
        };
        array
            .on_new_block(
                Slot::new(0),
                hash(0),
                None,
                Hash256::zero(),
                Epoch::new(1),
                Epoch::new(1),
            )
            .unwrap();
        array
    }

    fn add_block(array: &mut ProtoArray, root: u8, parent: u8, justified_epoch: u64) {
        array
            .on_new_block(
                Slot::new(u64::from(root)),
                hash(root),
                Some(hash(parent)),
                Hash256::zero(),
                Epoch::new(justified_epoch),
                Epoch::new(1),
            )
            .unwrap();
    }

    #[test]
    fn linear_chain_head() {
        let mut array = new_array(256);
        add_block(&mut array, 1, 0, 1);
        add_block(&mut array, 2, 1, 1);

        array
            .apply_score_changes(vec![0, 0, 10], Epoch::new(1), Epoch::new(1))
            .unwrap();

        assert_eq!(array.find_head(&hash(0)).unwrap(), hash(2));
        for root in [0, 1, 2] {
            assert_eq!(array.indices[&hash(root)], usize::from(root));
            assert_eq!(array.nodes[usize::from(root)].weight, 10);
        }
    }

    #[test]
    fn fork_tie_break_prefers_larger_root() {
        let mut array = new_array(256);
        add_block(&mut array, 1, 0, 1);
        add_block(&mut array, 2, 1, 1);
        add_block(&mut array, 3, 1, 1);

        array
            .apply_score_changes(vec![0, 0, 10, 10], Epoch::new(1), Epoch::new(1))
            .unwrap();

        // hash(3) > hash(2) lexicographically.
        assert_eq!(array.find_head(&hash(0)).unwrap(), hash(3));
    }

    #[test]
    fn vote_swing_changes_head() {
        let mut array = new_array(256);
        add_block(&mut array, 1, 0, 1);
        add_block(&mut array, 2, 1, 1);
        add_block(&mut array, 3, 1, 1);
        array
            .apply_score_changes(vec![0, 0, 10, 10], Epoch::new(1), Epoch::new(1))
            .unwrap();
        assert_eq!(array.find_head(&hash(0)).unwrap(), hash(3));

        array
            .apply_score_changes(vec![0, 0, 5, 0], Epoch::new(1), Epoch::new(1))
            .unwrap();

        assert_eq!(array.nodes[2].weight, 15);
        assert_eq!(array.nodes[3].weight, 10);
        assert_eq!(array.find_head(&hash(0)).unwrap(), hash(2));
    }

    #[test]
    fn non_viable_child_is_skipped() {
        let mut array = new_array(256);
        add_block(&mut array, 1, 0, 1);
        add_block(&mut array, 2, 1, 1);
        // B4 has a justified epoch the array hasn't adopted yet.
        add_block(&mut array, 4, 1, 2);

        array
            .apply_score_changes(vec![0, 0, 10, 1_000_000], Epoch::new(1), Epoch::new(1))
            .unwrap();

        assert_eq!(array.find_head(&hash(0)).unwrap(), hash(2));
    }

    #[test]
    fn prune_renumbers_surviving_indices() {
        let mut array = new_array(1);
        add_block(&mut array, 1, 0, 1);
        add_block(&mut array, 2, 1, 1);
        add_block(&mut array, 3, 1, 1);
        array
            .apply_score_changes(vec![0, 0, 15, 10], Epoch::new(1), Epoch::new(1))
            .unwrap();

        array.maybe_prune(Epoch::new(1), hash(1)).unwrap();

        assert_eq!(array.nodes.len(), 3);
        assert_eq!(array.indices[&hash(1)], 0);
        assert!(array.nodes[0].parent.is_none());
        assert_eq!(array.find_head(&hash(1)).unwrap(), hash(2));
    }

    #[test]
    fn prune_below_threshold_is_a_no_op() {
        let mut array = new_array(256);
        add_block(&mut array, 1, 0, 1);

        array.maybe_prune(Epoch::new(1), hash(1)).unwrap();

        assert_eq!(array.nodes.len(), 2);
    }

    #[test]
    fn delta_overflow_leaves_weights_unchanged() {
        let mut array = new_array(256);
        add_block(&mut array, 1, 0, 1);
        add_block(&mut array, 2, 1, 1);
        array
            .apply_score_changes(vec![0, 0, 10], Epoch::new(1), Epoch::new(1))
            .unwrap();

        let err = array
            .apply_score_changes(vec![0, 0, -11], Epoch::new(1), Epoch::new(1))
            .unwrap_err();

        assert_eq!(err, Error::DeltaOverflow(2));
        assert_eq!(array.nodes[2].weight, 10);
    }

    #[test]
    fn invalid_delta_len_is_rejected() {
        let mut array = new_array(256);
        let err = array
            .apply_score_changes(vec![0, 0], Epoch::new(1), Epoch::new(1))
            .unwrap_err();
        assert_eq!(
            err,
            Error::InvalidDeltaLen {
                deltas: 2,
                indices: 1
            }
        );
    }

    #[test]
    fn find_head_rejects_stale_justified_epoch() {
        let mut array = new_array(256);
        add_block(&mut array, 1, 0, 1);
        // Force the stored justified epoch forward without a matching
        // node, so the justified root itself is now non-viable.
        array.justified_epoch = Epoch::new(2);

        let err = array.find_head(&hash(1)).unwrap_err();
        assert!(matches!(err, Error::InvalidBestNode { .. }));
    }

    #[test]
    fn ancestor_at_slot_walks_parent_links() {
        let mut array = new_array(256);
        add_block(&mut array, 1, 0, 1);
        add_block(&mut array, 2, 1, 1);

        assert_eq!(
            array.ancestor_at_slot(&hash(2), Slot::new(1)),
            Some(hash(1))
        );
        assert_eq!(
            array.ancestor_at_slot(&hash(2), Slot::new(2)),
            Some(hash(2))
        );
        assert_eq!(array.ancestor_at_slot(&hash(2), Slot::new(0)), Some(hash(0)));
        // Predates the chain's root.
        assert_eq!(array.ancestor_at_slot(&hash(2), Slot::new(99)), None);
        assert_eq!(array.ancestor_at_slot(&hash(99), Slot::new(0)), None);
    }

    #[test]
    fn unknown_justified_root_is_rejected() {
        let array = new_array(256);
        assert_eq!(
            array.find_head(&hash(99)).unwrap_err(),
            Error::JustifiedNodeUnknown(hash(99))
        );
    }
}
