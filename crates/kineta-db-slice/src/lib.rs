//! Per-shard storage: the `PrimeValue` tagged union, the `DbTable` each
//! logical database is built from, and the `DbSlice` that owns all of a
//! shard's databases, expiration, and change-notification plumbing.

mod payload;
mod slice;
mod table;

pub use payload::{DocumentValue, Encoding, ExternalRef, Payload, PrimeValue, ZSet};
pub use slice::{ChangeEvent, ChangeKind, DbSlice, FlushScope, MutGuard};
pub use table::{DbStats, DbTable, KeyFlags};
