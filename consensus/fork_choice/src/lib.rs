//! A thin façade over `proto_array::ProtoArrayForkChoice`.
//!
//! A host (a beacon chain, a test harness, whatever is driving this) is
//! expected to have already verified a block or attestation and computed
//! whatever epochs and balances fork choice needs before calling in here.
//! This crate does no verification of its own; it only logs what it did
//! and forwards to the arena.

use parking_lot::RwLock;
use proto_array::{Block as ProtoBlock, ProtoArrayForkChoice, ProtoArrayForkChoiceConfig};
use slog::{debug, info, trace, Logger};
use types::{Epoch, Hash256, Slot};

#[derive(Debug)]
pub enum Error {
    ProtoArrayError(String),
    InvalidProtoArrayBytes(String),
    /// `on_tick` was called with a slot that skips more than one slot ahead
    /// of the last recorded tick.
    InconsistentOnTick { previous_slot: Slot, time: Slot },
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::ProtoArrayError(e)
    }
}

/// Drives a `ProtoArrayForkChoice`, logging at the boundary so a host gets
/// visibility into fork choice decisions without the arena itself needing
/// to know anything about logging.
pub struct ForkChoice {
    proto_array: ProtoArrayForkChoice,
    /// The last slot seen by `on_tick`. Tracked only so `on_tick` can reject
    /// calls that skip a slot; this crate otherwise does nothing with time.
    current_slot: RwLock<Slot>,
    log: Logger,
}

impl ForkChoice {
    /// Construct fresh fork choice rooted at `finalized_root`, tuned by
    /// `config` (currently just the pruning threshold).
    pub fn new(
        log: Logger,
        config: ProtoArrayForkChoiceConfig,
        finalized_block_slot: Slot,
        finalized_block_state_root: Hash256,
        justified_epoch: Epoch,
        finalized_epoch: Epoch,
        finalized_root: Hash256,
    ) -> Result<Self, Error> {
        let proto_array = ProtoArrayForkChoice::new(
            finalized_block_slot,
            finalized_block_state_root,
            justified_epoch,
            finalized_epoch,
            finalized_root,
            config.prune_threshold,
        )?;

        Ok(Self {
            proto_array,
            current_slot: RwLock::new(finalized_block_slot),
            log,
        })
    }

    /// Called whenever the current time increases. This crate tracks no
    /// time-dependent state of its own (the bouncing-attack mitigation and
    /// best-justified-checkpoint promotion that the wider fork-choice
    /// specification drives from `on_tick` live in the caller's
    /// `BeaconState`/`ForkChoiceStore`, out of scope here); this method only
    /// enforces that ticks arrive in order, one slot at a time, and gives
    /// the caller a place to hang that invariant.
    pub fn on_tick(&self, time: Slot) -> Result<(), Error> {
        let mut current_slot = self.current_slot.write();

        if time > *current_slot + 1 {
            return Err(Error::InconsistentOnTick {
                previous_slot: *current_slot,
                time,
            });
        }

        *current_slot = time;

        trace!(
            self.log,
            "Fork choice tick";
            "slot" => time.as_u64(),
        );

        Ok(())
    }

    /// Register a new block.
    pub fn on_block(&self, block: ProtoBlock) -> Result<(), Error> {
        trace!(
            self.log,
            "Processing block for fork choice";
            "root" => ?block.root,
            "slot" => block.slot.as_u64(),
        );

        self.proto_array.process_block(block)?;

        Ok(())
    }

    /// Register that `validator_index` has attested to `target_root` at
    /// `target_epoch`.
    pub fn on_attestation(
        &self,
        validator_index: usize,
        target_root: Hash256,
        target_epoch: Epoch,
    ) -> Result<(), Error> {
        trace!(
            self.log,
            "Processing attestation for fork choice";
            "validator_index" => validator_index,
            "target_root" => ?target_root,
            "target_epoch" => target_epoch.as_u64(),
        );

        self.proto_array
            .process_attestation(validator_index, target_root, target_epoch)?;

        Ok(())
    }

    /// Compute and return the current head block root.
    pub fn get_head(
        &self,
        justified_epoch: Epoch,
        justified_root: Hash256,
        finalized_epoch: Epoch,
        justified_state_balances: &[u64],
    ) -> Result<Hash256, Error> {
        let head = self.proto_array.find_head(
            justified_epoch,
            justified_root,
            finalized_epoch,
            justified_state_balances,
        )?;

        debug!(
            self.log,
            "Computed fork choice head";
            "head_root" => ?head,
            "justified_root" => ?justified_root,
        );

        Ok(head)
    }

    /// Prune the backing arena down to `finalized_root`, if the arena's
    /// own pruning threshold has been crossed.
    pub fn prune(&self, finalized_root: Hash256) -> Result<(), Error> {
        let count_before = self.proto_array.len();

        self.proto_array.maybe_prune(finalized_root)?;

        let count_after = self.proto_array.len();
        if count_after < count_before {
            info!(
                self.log,
                "Pruned fork choice arena";
                "finalized_root" => ?finalized_root,
                "nodes_removed" => count_before - count_after,
                "nodes_remaining" => count_after,
            );
        }

        Ok(())
    }

    pub fn contains_block(&self, block_root: &Hash256) -> bool {
        self.proto_array.contains_block(block_root)
    }

    pub fn get_block(&self, block_root: &Hash256) -> Option<ProtoBlock> {
        self.proto_array.get_block(block_root)
    }

    pub fn get_block_weight(&self, block_root: &Hash256) -> Option<u64> {
        self.proto_array.get_weight(block_root)
    }

    /// Returns the root of the ancestor of `block_root` at `ancestor_slot`.
    pub fn get_ancestor(&self, block_root: &Hash256, ancestor_slot: Slot) -> Option<Hash256> {
        self.proto_array.ancestor_at_slot(block_root, ancestor_slot)
    }

    pub fn block_count(&self) -> usize {
        self.proto_array.len()
    }

    /// Encode a point-in-time snapshot of the underlying arena.
    pub fn as_bytes(&self) -> Vec<u8> {
        self.proto_array.as_bytes()
    }

    /// Restore fork choice from a snapshot produced by `as_bytes`, wiring
    /// up a fresh logger since loggers are never serialized. `on_tick`
    /// state is not part of the snapshot either (see the Non-goals on
    /// persistence); the restored instance starts as though freshly ticked
    /// at slot zero, and the caller is expected to drive `on_tick` forward
    /// from wherever it actually is.
    pub fn from_bytes(bytes: &[u8], log: Logger) -> Result<Self, Error> {
        let proto_array = ProtoArrayForkChoice::from_bytes(bytes)
            .map_err(Error::InvalidProtoArrayBytes)?;

        Ok(Self {
            proto_array,
            current_slot: RwLock::new(Slot::new(0)),
            log,
        })
    }
}
