//! Shared scalar types and configuration for the storage engine.

mod page_id;

pub use page_id::PageId;

use serde::{Deserialize, Serialize};

/// Default page size in bytes. Must match the backing block device's block size.
pub const PAGE_SIZE: usize = 4096;

/// Sentinel meaning "no page" wherever a `u32` page reference is stored on disk.
pub const INVALID_PID: u32 = u32::MAX;

/// Size, in bytes, of the common page header that prefixes every page.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Page-kind tags. Every subsystem that owns pages picks disjoint values from this set
/// so a fetched page's kind alone identifies which subsystem owns it.
pub mod page_kind {
    pub const FREE: u16 = 0x00;
    pub const BPT_LEAF: u16 = 0x01;
    pub const BPT_INODE: u16 = 0x02;
    pub const LONG_STORE_HEAD: u16 = 0x03;
    pub const LONG_STORE_CHUNK: u16 = 0x04;
    pub const RADIX_LEVEL: u16 = 0x05;
    pub const SLAB_STORE: u16 = 0x06;
    pub const SUPERBLOCK: u16 = 0x07;
}

/// How a full leaf/inode reacts to an insert it cannot directly absorb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebalancePolicy {
    /// Split the node unconditionally.
    ForceSplit,
    /// Try to push one element onto a sibling before splitting.
    NeighborShare,
    /// Cascade shifts through full neighbors in one direction before splitting.
    LocalRebalance,
}

impl Default for RebalancePolicy {
    fn default() -> Self {
        RebalancePolicy::NeighborShare
    }
}

/// Whether `put` on an existing key overwrites it or is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsertPolicy {
    /// Fail if the key already exists.
    Insert,
    /// Overwrite the value if the key already exists.
    Upsert,
}

impl Default for InsertPolicy {
    fn default() -> Self {
        InsertPolicy::Upsert
    }
}

/// B-tree tuning: per-subsystem slot-size bounds, page-kind tags, and operational policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BTreeConfig {
    /// Smallest payload (key+value encoding) a leaf slot must be able to hold.
    pub leaf_min_slot_size: usize,
    /// Largest payload a leaf slot may occupy before it is rejected outright.
    pub leaf_max_slot_size: usize,
    /// Smallest payload an internal-node slot must be able to hold.
    pub inode_min_slot_size: usize,
    /// Largest payload an internal-node slot may occupy before it is rejected outright.
    pub inode_max_slot_size: usize,
    /// Page-kind tag used for leaf pages.
    pub leaf_page_kind: u16,
    /// Page-kind tag used for internal-node pages.
    pub inode_page_kind: u16,
    /// Rebalance policy applied when a node cannot directly absorb an insert.
    pub rebalance_policy: RebalancePolicy,
    /// Insert policy applied to `put` on an existing key.
    pub insert_policy: InsertPolicy,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self {
            leaf_min_slot_size: 16,
            leaf_max_slot_size: PAGE_SIZE / 4,
            inode_min_slot_size: 8,
            inode_max_slot_size: PAGE_SIZE / 4,
            leaf_page_kind: page_kind::BPT_LEAF,
            inode_page_kind: page_kind::BPT_INODE,
            rebalance_policy: RebalancePolicy::default(),
            insert_policy: InsertPolicy::default(),
        }
    }
}

impl BTreeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A configuration favoring fewer, fatter nodes (fewer page fetches per op).
    pub fn high_capacity() -> Self {
        Self {
            leaf_max_slot_size: PAGE_SIZE / 2,
            inode_max_slot_size: PAGE_SIZE / 2,
            ..Self::default()
        }
    }

    pub fn with_rebalance_policy(mut self, policy: RebalancePolicy) -> Self {
        self.rebalance_policy = policy;
        self
    }

    pub fn with_insert_policy(mut self, policy: InsertPolicy) -> Self {
        self.insert_policy = policy;
        self
    }

    pub fn max_key_size(&self) -> usize {
        self.leaf_max_slot_size / 2
    }

    pub fn max_value_size(&self) -> usize {
        self.leaf_max_slot_size
    }
}

/// Radix trie tuning: fan-out and page-kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadixConfig {
    /// Number of slots per level. Default 256 (one byte of key per level).
    pub fan_out: u32,
    /// Page-kind tag used for radix-level pages.
    pub page_kind: u16,
}

impl Default for RadixConfig {
    fn default() -> Self {
        Self {
            fan_out: 256,
            page_kind: page_kind::RADIX_LEVEL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn btree_config_defaults_are_sane() {
        let cfg = BTreeConfig::default();
        assert!(cfg.leaf_min_slot_size < cfg.leaf_max_slot_size);
        assert!(cfg.inode_min_slot_size < cfg.inode_max_slot_size);
        assert_ne!(cfg.leaf_page_kind, cfg.inode_page_kind);
    }

    #[test]
    fn radix_config_defaults_to_256() {
        assert_eq!(RadixConfig::default().fan_out, 256);
    }
}
