//! Fixed-fan-out radix trie keyed on an unsigned integer.
//!
//! Unlike the B+ tree, a radix trie never rebalances: a key's path is fully
//! determined by its digits in base [`RadixConfig::fan_out`], most
//! significant first. Growing the trie to hold a larger key wraps the
//! current root one level deeper; shrinking on delete unwinds the same way,
//! one level at a time, as levels empty out.

mod level;
pub mod memory;
pub mod paged;

pub use level::RadixSlot;
pub use memory::MemoryModel;
pub use paged::PagedModel;

use crate::error::Result;
use std::marker::PhantomData;
use tracing::debug;

/// Storage backend for trie levels: one implementation over paged storage
/// (the real thing) and one in plain memory (for tests and scratch tries).
pub trait Model {
    type NodeRef: Copy + Eq;

    fn fan_out(&self) -> usize;

    /// Allocate a fresh, all-empty level at `level`, linked to `parent`.
    fn alloc_level(&mut self, level: u16, parent: Option<Self::NodeRef>) -> Result<Self::NodeRef>;

    /// Release a level that has become fully empty.
    fn free_level(&mut self, node: Self::NodeRef) -> Result<()>;

    fn get_slot(&mut self, node: Self::NodeRef, idx: usize) -> Result<RadixSlot<Self::NodeRef>>;

    fn set_slot(&mut self, node: Self::NodeRef, idx: usize, slot: RadixSlot<Self::NodeRef>) -> Result<()>;

    fn set_parent(&mut self, node: Self::NodeRef, parent: Option<Self::NodeRef>) -> Result<()>;

    fn populated_count(&mut self, node: Self::NodeRef) -> Result<usize>;
}

/// A key type the trie can split into digits. Implemented for the unsigned
/// integer types likely to be used as trie keys.
pub trait RadixKey: Copy {
    fn to_u64(self) -> u64;
    fn from_u64(v: u64) -> Self;
}

macro_rules! impl_radix_key {
    ($($t:ty),*) => {
        $(impl RadixKey for $t {
            fn to_u64(self) -> u64 { self as u64 }
            fn from_u64(v: u64) -> Self { v as $t }
        })*
    };
}

impl_radix_key!(u8, u16, u32, u64);

/// Number of digit levels needed to address `key` in base `fan_out`,
/// dropping leading zero digits but keeping at least one.
fn required_height(key: u64, fan_out: u64) -> u32 {
    let mut height = 1u32;
    let mut cap = fan_out;
    while key >= cap {
        height += 1;
        cap = cap.saturating_mul(fan_out);
    }
    height
}

/// The digit of `key` at `level` (0 = least significant) in base `fan_out`.
fn digit_at(key: u64, level: u32, fan_out: u64) -> usize {
    (key / fan_out.pow(level) % fan_out) as usize
}

/// Render `key`'s digits in base `fan_out`, most-significant first, trimmed
/// of leading zero digits (a zero key still yields a single `0` digit).
///
/// Sized for headroom: a `u64` key needs at most 8 base-256 digits, but the
/// buffer holds double that so smaller fan-outs still fit on the stack.
pub fn split_key<K: RadixKey>(key: K, fan_out: u32) -> ([u16; 16], usize) {
    let key = key.to_u64();
    let fan_out = fan_out as u64;
    let height = required_height(key, fan_out) as usize;
    let mut digits = [0u16; 16];
    for (i, slot) in digits.iter_mut().enumerate().take(height) {
        let level = (height - 1 - i) as u32;
        *slot = digit_at(key, level, fan_out) as u16;
    }
    (digits, height)
}

/// The digit at `level` (0 = least significant) from a `split_key` result,
/// implicitly zero for any level at or above the key's own required height
/// (i.e. above the trie's actual digits but below its current, possibly
/// taller, root).
fn digit_from_split(digits: &[u16; 16], len: usize, level: u32) -> usize {
    let level = level as usize;
    if level >= len {
        0
    } else {
        digits[len - 1 - level] as usize
    }
}

/// A radix trie over keys of type `K`, backed by storage model `M`.
pub struct Trie<K, M: Model> {
    model: M,
    root: Option<M::NodeRef>,
    height: u32,
    _marker: PhantomData<K>,
}

impl<K: RadixKey, M: Model> Trie<K, M> {
    pub fn new(model: M) -> Self {
        Self { model, root: None, height: 0, _marker: PhantomData }
    }

    pub fn with_root(model: M, root: Option<M::NodeRef>, height: u32) -> Self {
        Self { model, root, height, _marker: PhantomData }
    }

    pub fn root(&self) -> Option<M::NodeRef> {
        self.root
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    fn fan_out(&self) -> u64 {
        self.model.fan_out() as u64
    }

    /// Associate `key` with `value`, overwriting any existing value.
    pub fn set(&mut self, key: K, value: u32) -> Result<()> {
        let fan_out_u32 = self.fan_out() as u32;
        let (digits, len) = split_key(key, fan_out_u32);
        let need = len as u32;

        while self.height < need {
            let new_root = self.model.alloc_level(self.height as u16, None)?;
            if let Some(old_root) = self.root {
                self.model.set_slot(new_root, 0, RadixSlot::Level(old_root))?;
                self.model.set_parent(old_root, Some(new_root))?;
            }
            self.root = Some(new_root);
            self.height += 1;
            debug!(new_height = self.height, "grew radix root by one level");
        }

        let mut node = self.root.expect("height > 0 implies a root");
        for level in (1..self.height).rev() {
            let digit = digit_from_split(&digits, len, level);
            node = match self.model.get_slot(node, digit)? {
                RadixSlot::Level(child) => child,
                RadixSlot::Empty => {
                    let child = self.model.alloc_level((level - 1) as u16, Some(node))?;
                    self.model.set_slot(node, digit, RadixSlot::Level(child))?;
                    child
                }
                RadixSlot::Value(_) => {
                    return Err(crate::error::StorageError::corruption(
                        "radix level slot held a value where a child level was expected",
                    ))
                }
            };
        }
        let digit0 = digit_from_split(&digits, len, 0);
        self.model.set_slot(node, digit0, RadixSlot::Value(value))
    }

    /// Look up `key`.
    pub fn get(&mut self, key: K) -> Result<Option<u32>> {
        let fan_out_u32 = self.fan_out() as u32;
        let (digits, len) = split_key(key, fan_out_u32);
        let Some(mut node) = self.root else { return Ok(None) };
        if len as u32 > self.height {
            return Ok(None);
        }
        for level in (1..self.height).rev() {
            let digit = digit_from_split(&digits, len, level);
            match self.model.get_slot(node, digit)? {
                RadixSlot::Level(child) => node = child,
                _ => return Ok(None),
            }
        }
        let digit0 = digit_from_split(&digits, len, 0);
        match self.model.get_slot(node, digit0)? {
            RadixSlot::Value(v) => Ok(Some(v)),
            _ => Ok(None),
        }
    }

    pub fn has(&mut self, key: K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Remove `key`, freeing any level left fully empty by the removal,
    /// cascading up to (and possibly collapsing) the root.
    pub fn remove(&mut self, key: K) -> Result<bool> {
        let fan_out_u32 = self.fan_out() as u32;
        let (split_digits, len) = split_key(key, fan_out_u32);
        let Some(root) = self.root else { return Ok(false) };
        if len as u32 > self.height {
            return Ok(false);
        }

        let mut nodes = vec![root];
        let mut digits = Vec::new();
        let mut node = root;
        for level in (1..self.height).rev() {
            let digit = digit_from_split(&split_digits, len, level);
            match self.model.get_slot(node, digit)? {
                RadixSlot::Level(child) => {
                    digits.push(digit);
                    nodes.push(child);
                    node = child;
                }
                _ => return Ok(false),
            }
        }
        let leaf_digit = digit_from_split(&split_digits, len, 0);
        match self.model.get_slot(node, leaf_digit)? {
            RadixSlot::Value(_) => {}
            _ => return Ok(false),
        }
        self.model.set_slot(node, leaf_digit, RadixSlot::Empty)?;

        let mut i = nodes.len() - 1;
        loop {
            if self.model.populated_count(nodes[i])? > 0 {
                break;
            }
            if i == 0 {
                self.model.free_level(nodes[i])?;
                self.root = None;
                self.height = 0;
                debug!("freed last radix level, trie is now empty");
                break;
            }
            self.model.free_level(nodes[i])?;
            self.model.set_slot(nodes[i - 1], digits[i - 1], RadixSlot::Empty)?;
            debug!(level = i, "freed emptied radix level");
            i -= 1;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radix::memory::MemoryModel;

    fn trie() -> Trie<u32, MemoryModel> {
        Trie::new(MemoryModel::new(256))
    }

    #[test]
    fn set_then_get_roundtrips() {
        let mut t = trie();
        t.set(42, 100).unwrap();
        assert_eq!(t.get(42).unwrap(), Some(100));
        assert_eq!(t.get(43).unwrap(), None);
    }

    #[test]
    fn zero_key_works() {
        let mut t = trie();
        t.set(0, 7).unwrap();
        assert_eq!(t.get(0).unwrap(), Some(7));
    }

    #[test]
    fn grows_root_for_larger_keys() {
        let mut t = trie();
        t.set(1, 1).unwrap();
        assert_eq!(t.height(), 1);
        t.set(100_000, 2).unwrap();
        assert!(t.height() > 1);
        assert_eq!(t.get(1).unwrap(), Some(1));
        assert_eq!(t.get(100_000).unwrap(), Some(2));
    }

    #[test]
    fn overwrite_replaces_value() {
        let mut t = trie();
        t.set(5, 1).unwrap();
        t.set(5, 2).unwrap();
        assert_eq!(t.get(5).unwrap(), Some(2));
    }

    #[test]
    fn remove_missing_key_is_false() {
        let mut t = trie();
        t.set(5, 1).unwrap();
        assert!(!t.remove(6).unwrap());
    }

    #[test]
    fn remove_collapses_trie_to_empty() {
        let mut t = trie();
        t.set(1, 1).unwrap();
        assert!(t.remove(1).unwrap());
        assert!(t.is_empty());
        assert_eq!(t.get(1).unwrap(), None);
    }

    #[test]
    fn remove_one_key_preserves_others() {
        let mut t = trie();
        for k in 0..300u32 {
            t.set(k, k * 10).unwrap();
        }
        assert!(t.remove(150).unwrap());
        assert_eq!(t.get(150).unwrap(), None);
        for k in 0..300u32 {
            if k != 150 {
                assert_eq!(t.get(k).unwrap(), Some(k * 10));
            }
        }
    }

    /// Scenario: dense `0..=65535` coverage over the real paged model,
    /// checking reads, then removing everything and verifying the
    /// allocator's free-page count returns to its pre-insert baseline.
    #[test]
    fn paged_model_covers_dense_u16_range_with_balanced_allocator_counts() {
        use crate::buffer::BufferManager;
        use crate::device::MemoryBlockDevice;
        use crate::types::{RadixConfig, PAGE_SIZE};
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let bm = BufferManager::new(MemoryBlockDevice::new(PAGE_SIZE), 64).unwrap();
        let model = PagedModel::new(bm.clone(), RadixConfig::default());
        let mut t: Trie<u32, PagedModel<MemoryBlockDevice>> = Trie::new(model);
        let mut rng = StdRng::seed_from_u64(0xFACE);

        let mut values = Vec::with_capacity(65_536);
        for k in 0u32..=65_535 {
            let v = rng.gen_range(5..20);
            t.set(k, v).unwrap();
            values.push(v);
        }
        for k in 0u32..=65_535 {
            assert_eq!(t.get(k).unwrap(), Some(values[k as usize]));
        }
        for k in 0u32..=65_535 {
            assert!(t.remove(k).unwrap());
        }
        for k in 0u32..=65_545 {
            assert!(!t.has(k).unwrap());
        }

        assert!(t.is_empty());
        assert_eq!(bm.free_count(), bm.page_count());
    }

    #[test]
    fn split_key_trims_leading_zero_digits() {
        let (digits, len) = split_key(1u32, 256);
        assert_eq!(len, 1);
        assert_eq!(digits[0], 1);

        let (digits, len) = split_key(0u32, 256);
        assert_eq!(len, 1);
        assert_eq!(digits[0], 0);

        let (digits, len) = split_key(256u32, 256);
        assert_eq!(len, 2);
        assert_eq!(&digits[..2], &[1, 0]);
    }
}
