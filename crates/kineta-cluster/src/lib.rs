//! Cluster slot ownership: maps the 16384-slot space onto owning nodes and
//! resolves a key to either a local shard or a `MOVED` redirect. When
//! cluster mode is enabled, a key's shard comes from its slot; otherwise it
//! falls back to a plain hash of the key.

use kineta_base::{CommandError, NUM_SLOTS};
use kineta_base::{ShardId, SlotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterMode {
    Disabled,
    /// Slots are mapped but every slot resolves locally; used for testing
    /// cluster-aware clients against a single node.
    Emulated,
    Enabled,
}

/// One cluster node's address, as rendered in a `MOVED` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One contiguous run of slots owned by a single node.
struct SlotRange {
    start: u16,
    end_inclusive: u16,
    owner: NodeAddr,
}

/// Maps the full 16384-slot space to owning nodes. Slots this node owns
/// also carry the local shard they land on; slots owned elsewhere only
/// carry the remote node's address for a `MOVED` reply.
pub struct SlotTable {
    mode: ClusterMode,
    local: NodeAddr,
    ranges: Vec<SlotRange>,
    num_shards: u32,
}

pub enum Resolution {
    /// The key's slot is owned by this node; route to the given shard.
    Local(ShardId),
    /// The key's slot is owned by a different node.
    Moved(CommandError),
}

impl SlotTable {
    /// Builds a table where `local` owns every slot, split evenly across
    /// `num_shards` shards. This is both the `Emulated` default and the
    /// starting point for `Enabled` mode before slots are reassigned.
    pub fn single_node(mode: ClusterMode, local: NodeAddr, num_shards: u32) -> Self {
        SlotTable { mode, local: local.clone(), ranges: vec![SlotRange { start: 0, end_inclusive: NUM_SLOTS - 1, owner: local }], num_shards }
    }

    /// Assigns `[start, end_inclusive]` to `owner`, splitting or replacing
    /// whatever ranges currently cover it. Ranges are kept sorted and
    /// non-overlapping; used to build the topology CLUSTER ADDSLOTS-style
    /// commands would describe.
    pub fn assign(&mut self, start: u16, end_inclusive: u16, owner: NodeAddr) {
        let mut next = Vec::with_capacity(self.ranges.len() + 1);
        for range in self.ranges.drain(..) {
            if range.end_inclusive < start || range.start > end_inclusive {
                next.push(range);
                continue;
            }
            if range.start < start {
                next.push(SlotRange { start: range.start, end_inclusive: start - 1, owner: range.owner.clone() });
            }
            if range.end_inclusive > end_inclusive {
                next.push(SlotRange { start: end_inclusive + 1, end_inclusive: range.end_inclusive, owner: range.owner });
            }
        }
        next.push(SlotRange { start, end_inclusive, owner });
        next.sort_by_key(|r| r.start);
        self.ranges = next;
    }

    pub fn mode(&self) -> ClusterMode {
        self.mode
    }

    /// The table's `(start, end_inclusive, owner)` assignments in slot
    /// order, as rendered by `CLUSTER SLOTS`.
    pub fn ranges(&self) -> impl Iterator<Item = (u16, u16, &NodeAddr)> {
        self.ranges.iter().map(|r| (r.start, r.end_inclusive, &r.owner))
    }

    fn owner_of(&self, slot: SlotId) -> &NodeAddr {
        self.ranges
            .iter()
            .find(|r| r.start <= slot.0 && slot.0 <= r.end_inclusive)
            .map(|r| &r.owner)
            .expect("every slot in 0..NUM_SLOTS is covered by some range")
    }

    /// Resolves `key` to either a local shard or a `MOVED` error.
    pub fn resolve(&self, key: &[u8]) -> Resolution {
        if self.mode == ClusterMode::Disabled {
            return Resolution::Local(kineta_base::shard_of(key, self.num_shards));
        }
        let slot = SlotId::of_key(key);
        let owner = self.owner_of(slot);
        if self.mode == ClusterMode::Emulated || *owner == self.local {
            Resolution::Local(ShardId((slot.0 as u32) % self.num_shards))
        } else {
            Resolution::Moved(CommandError::moved(slot, owner.to_string()))
        }
    }
}
