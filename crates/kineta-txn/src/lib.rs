//! Multi-shard transaction scheduling: TxId assignment, the per-shard
//! priority queue with out-of-order admission, and the lifecycle each
//! transaction moves through from creation to conclusion.

mod coordinator;
mod queue;
mod transaction;

pub use coordinator::Coordinator;
pub use queue::{QueuedTx, ShardQueue};
pub use transaction::{is_inline_eligible, Transaction, TxMode, TxState};
