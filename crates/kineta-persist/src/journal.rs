//! The journal ring buffer and replica resync protocol. Framing mirrors
//! `SnapshotEntry`'s length-prefixed `serde_json` encoding: the LSN and
//! ordering guarantees are what consumers rely on, not the byte layout,
//! so both streams share one framing convention.

use std::collections::VecDeque;

use kineta_base::Lsn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum JournalOpcode {
    /// Keep-alive filler; carries no state change.
    Noop,
    /// The producing connection switched logical databases.
    Select,
    /// A key was evicted by the expiration sweep rather than by a command.
    Expired,
    /// A single write command, with its full argument vector as payload.
    Command,
    /// One command out of a MULTI/EXEC block; the block is terminated by
    /// an `Exec` record.
    MultiCommand,
    /// Terminates a run of `MultiCommand` records.
    Exec,
    Ping,
    /// Final record of a stream; nothing follows.
    Fin,
}

/// One journal record. `payload` holds the command name and its arguments
/// for `Command`/`MultiCommand` records, the expired key for `Expired`,
/// and is empty for the administrative marker opcodes.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct JournalRecord {
    pub lsn: Lsn,
    pub opcode: JournalOpcode,
    pub db_index: u32,
    pub shard_cnt: u32,
    pub slot: Option<u16>,
    pub payload: Vec<Vec<u8>>,
}

pub fn encode_record(record: &JournalRecord, out: &mut Vec<u8>) -> Result<(), serde_json::Error> {
    let body = serde_json::to_vec(record)?;
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(())
}

pub fn decode_records(buf: &[u8]) -> Result<Vec<JournalRecord>, serde_json::Error> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos + 4 <= buf.len() {
        let len = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + len > buf.len() {
            break;
        }
        out.push(serde_json::from_slice(&buf[pos..pos + len])?);
        pos += len;
    }
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("replica requested lsn {requested:?}, oldest retained is {oldest:?}; full resync required")]
    RequiresFullResync { requested: Lsn, oldest: Lsn },
}

/// A bounded, append-only ring of the most recent journal records for one
/// shard. Producing a record bumps the shard's LSN counter; once `capacity`
/// is exceeded the oldest record is evicted, and a replica that still
/// needs it must fall back to a full sync.
pub struct Journal {
    capacity: usize,
    next_lsn: Lsn,
    records: VecDeque<JournalRecord>,
}

impl Journal {
    pub fn new(capacity: usize) -> Self {
        Journal { capacity: capacity.max(1), next_lsn: Lsn::ZERO, records: VecDeque::new() }
    }

    /// Appends a record produced with `build`, which receives the lsn this
    /// record will carry.
    pub fn append(&mut self, build: impl FnOnce(Lsn) -> JournalRecord) -> Lsn {
        let lsn = self.next_lsn;
        self.next_lsn = self.next_lsn.next();
        let record = build(lsn);
        debug_assert_eq!(record.lsn, lsn);
        self.records.push_back(record);
        if self.records.len() > self.capacity {
            self.records.pop_front();
        }
        lsn
    }

    pub fn oldest_retained_lsn(&self) -> Lsn {
        self.records.front().map(|r| r.lsn).unwrap_or(self.next_lsn)
    }

    pub fn latest_lsn(&self) -> Lsn {
        self.records.back().map(|r| r.lsn).unwrap_or(Lsn::ZERO)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every retained record in LSN order, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &JournalRecord> {
        self.records.iter()
    }

    /// Returns every record strictly after `from`, for a replica resuming
    /// incremental resync at that LSN. Fails if `from` has already been
    /// evicted from the ring.
    pub fn records_since(&self, from: Lsn) -> Result<Vec<JournalRecord>, JournalError> {
        let oldest = self.oldest_retained_lsn();
        if from < oldest && !self.records.is_empty() {
            return Err(JournalError::RequiresFullResync { requested: from, oldest });
        }
        Ok(self.records.iter().filter(|r| r.lsn > from).cloned().collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn command(name: &str) -> impl FnOnce(Lsn) -> JournalRecord + '_ {
        move |lsn| JournalRecord { lsn, opcode: JournalOpcode::Command, db_index: 0, shard_cnt: 1, slot: None, payload: vec![name.as_bytes().to_vec()] }
    }

    #[test]
    fn lsns_are_strictly_increasing() {
        let mut journal = Journal::new(10);
        let a = journal.append(command("SET"));
        let b = journal.append(command("DEL"));
        assert!(a < b);
    }

    #[test]
    fn capacity_overflow_evicts_the_oldest_record() {
        let mut journal = Journal::new(2);
        journal.append(command("a"));
        journal.append(command("b"));
        journal.append(command("c"));
        assert_eq!(journal.oldest_retained_lsn(), Lsn(1));
        assert_eq!(journal.latest_lsn(), Lsn(2));
    }

    #[test]
    fn records_since_an_evicted_lsn_requires_full_resync() {
        let mut journal = Journal::new(2);
        journal.append(command("a"));
        journal.append(command("b"));
        journal.append(command("c"));
        assert!(matches!(journal.records_since(Lsn(0)), Err(JournalError::RequiresFullResync { .. })));
    }

    #[test]
    fn records_since_a_retained_lsn_returns_the_suffix() {
        let mut journal = Journal::new(10);
        journal.append(command("a"));
        let b = journal.append(command("b"));
        journal.append(command("c"));

        let suffix = journal.records_since(b).unwrap();
        assert_eq!(suffix.len(), 1);
        assert_eq!(suffix[0].lsn, Lsn(2));
    }

    #[test]
    fn encode_then_decode_round_trips_a_record() {
        let record = JournalRecord { lsn: Lsn(5), opcode: JournalOpcode::Command, db_index: 0, shard_cnt: 4, slot: Some(12), payload: vec![b"SET".to_vec(), b"k".to_vec()] };
        let mut buf = Vec::new();
        encode_record(&record, &mut buf).unwrap();
        let decoded = decode_records(&buf).unwrap();
        assert_eq!(decoded, vec![record]);
    }
}
