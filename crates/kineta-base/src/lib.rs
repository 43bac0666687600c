//! Ambient types shared by every crate in the engine: the error taxonomy,
//! shard/slot addressing, and the monotonic id kinds (TxId, Lsn).

mod error;
mod ids;
mod shard;

pub use error::{CommandError, CommandErrorKind, Error, Result};
pub use ids::{Lsn, TxId, TxIdSource};
pub use shard::{shard_of, ShardId, SlotId, NUM_SLOTS};
