//! In-memory radix trie backing, for tests and scratch tries that never
//! need to survive past the process.

use super::{Model, RadixSlot};
use crate::error::Result;

struct Node {
    slots: Vec<RadixSlot<usize>>,
    #[allow(dead_code)]
    parent: Option<usize>,
}

/// Arena-backed [`Model`]. Node references are arena indices.
pub struct MemoryModel {
    fan_out: usize,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
}

impl MemoryModel {
    pub fn new(fan_out: usize) -> Self {
        Self { fan_out, nodes: Vec::new(), free: Vec::new() }
    }
}

impl Model for MemoryModel {
    type NodeRef = usize;

    fn fan_out(&self) -> usize {
        self.fan_out
    }

    fn alloc_level(&mut self, _level: u16, parent: Option<usize>) -> Result<usize> {
        let node = Node { slots: vec![RadixSlot::Empty; self.fan_out], parent };
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(node);
            Ok(idx)
        } else {
            self.nodes.push(Some(node));
            Ok(self.nodes.len() - 1)
        }
    }

    fn free_level(&mut self, node: usize) -> Result<()> {
        self.nodes[node] = None;
        self.free.push(node);
        Ok(())
    }

    fn get_slot(&mut self, node: usize, idx: usize) -> Result<RadixSlot<usize>> {
        Ok(self.nodes[node].as_ref().expect("freed node referenced").slots[idx])
    }

    fn set_slot(&mut self, node: usize, idx: usize, slot: RadixSlot<usize>) -> Result<()> {
        self.nodes[node].as_mut().expect("freed node referenced").slots[idx] = slot;
        Ok(())
    }

    fn set_parent(&mut self, node: usize, parent: Option<usize>) -> Result<()> {
        self.nodes[node].as_mut().expect("freed node referenced").parent = parent;
        Ok(())
    }

    fn populated_count(&mut self, node: usize) -> Result<usize> {
        Ok(self.nodes[node]
            .as_ref()
            .expect("freed node referenced")
            .slots
            .iter()
            .filter(|s| !matches!(s, RadixSlot::Empty))
            .count())
    }
}
