mod slot_epoch;

pub use ethereum_types::H256 as Hash256;
pub use slot_epoch::{Epoch, Slot};
