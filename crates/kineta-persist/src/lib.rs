//! Snapshot producer/loader and the replication journal.

mod journal;
mod snapshot;

pub use journal::{decode_records, encode_record, Journal, JournalError, JournalOpcode, JournalRecord};
pub use snapshot::{
    apply_record, decode_entries, encode_entry, from_snapshot_value, to_snapshot_value, SnapshotEntry, SnapshotProducer,
    SnapshotRecord, SnapshotValue, SNAPSHOT_FORMAT_VERSION,
};
