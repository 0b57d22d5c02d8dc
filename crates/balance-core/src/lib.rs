//! Block placement planning for keep-balance: rendezvous ordering, the
//! per-block keep/pull/trash decision and run statistics. Nothing here
//! does I/O.

pub mod balance;
pub mod block_state;
pub mod change_set;
pub mod compute;
pub mod index;
pub mod rendezvous;
pub mod stats;

pub use balance::{Action, Assignment, MountSlot, Replica, balance_block};
pub use block_state::{BlockState, BlockStateMap};
pub use change_set::{ChangeSet, Changes, Pull, Trash};
pub use compute::{ComputeOutput, ServiceSlot, compute_change_sets};
pub use index::{IndexEntry, IndexError, parse_index};
pub use stats::{BalanceStats, Category, Tally};
