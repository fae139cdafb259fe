//! # Region tree
//!
//! An AVL tree of [`MemoryRegion`] records keyed by start address. Nodes live
//! in an arena and link by index; removed slots go to a free list and are
//! reused by later inserts.
//!
//! Records never overlap, so the in-order walk together with the gaps between
//! records partitions the address space ([`RegionTree::traverse_all`]).

use crate::region::{MemoryRegion, Region};
use alloc::vec::Vec;
use core::cmp::Ordering;

type Link = Option<usize>;

struct Node {
    record: MemoryRegion,
    left: Link,
    right: Link,
    height: u8,
}

/// One tile of an address space walk.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Span {
    /// A record of the tree.
    Used(MemoryRegion),
    /// A synthetic record for a hole between records.
    Free(Region),
}

impl Span {
    #[must_use]
    pub const fn region(&self) -> Region {
        match self {
            Self::Used(record) => record.region,
            Self::Free(region) => *region,
        }
    }
}

#[derive(Default)]
pub struct RegionTree {
    nodes: Vec<Option<Node>>,
    free_slots: Vec<usize>,
    root: Link,
    len: usize,
}

impl RegionTree {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free_slots: Vec::new(),
            root: None,
            len: 0,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn node(&self, index: usize) -> &Node {
        match &self.nodes[index] {
            Some(node) => node,
            None => panic!("region tree link to vacant slot {index}"),
        }
    }

    fn node_mut(&mut self, index: usize) -> &mut Node {
        match &mut self.nodes[index] {
            Some(node) => node,
            None => panic!("region tree link to vacant slot {index}"),
        }
    }

    fn height(&self, link: Link) -> u8 {
        link.map_or(0, |i| self.node(i).height)
    }

    fn update(&mut self, index: usize) {
        let node = self.node(index);
        let height = 1 + self.height(node.left).max(self.height(node.right));
        self.node_mut(index).height = height;
    }

    fn balance_factor(&self, index: usize) -> i16 {
        let node = self.node(index);
        i16::from(self.height(node.left)) - i16::from(self.height(node.right))
    }

    fn rotate_right(&mut self, index: usize) -> usize {
        let Some(pivot) = self.node(index).left else {
            return index;
        };
        self.node_mut(index).left = self.node(pivot).right;
        self.node_mut(pivot).right = Some(index);
        self.update(index);
        self.update(pivot);
        pivot
    }

    fn rotate_left(&mut self, index: usize) -> usize {
        let Some(pivot) = self.node(index).right else {
            return index;
        };
        self.node_mut(index).right = self.node(pivot).left;
        self.node_mut(pivot).left = Some(index);
        self.update(index);
        self.update(pivot);
        pivot
    }

    fn rebalance(&mut self, index: usize) -> usize {
        self.update(index);
        let balance = self.balance_factor(index);
        if balance > 1 {
            if let Some(left) = self.node(index).left
                && self.balance_factor(left) < 0
            {
                let rotated = self.rotate_left(left);
                self.node_mut(index).left = Some(rotated);
            }
            return self.rotate_right(index);
        }
        if balance < -1 {
            if let Some(right) = self.node(index).right
                && self.balance_factor(right) > 0
            {
                let rotated = self.rotate_right(right);
                self.node_mut(index).right = Some(rotated);
            }
            return self.rotate_left(index);
        }
        index
    }

    fn allocate(&mut self, record: MemoryRegion) -> usize {
        let node = Node {
            record,
            left: None,
            right: None,
            height: 1,
        };
        if let Some(slot) = self.free_slots.pop() {
            self.nodes[slot] = Some(node);
            slot
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    /// The record overlapping `region`, if any.
    #[must_use]
    pub fn find_overlapping(&self, region: &Region) -> Option<&MemoryRegion> {
        let mut link = self.root;
        while let Some(index) = link {
            let node = self.node(index);
            let existing = &node.record.region;
            if region.end() <= u64::from(existing.address) {
                link = node.left;
            } else if u64::from(region.address) >= existing.end() {
                link = node.right;
            } else {
                return Some(&node.record);
            }
        }
        None
    }

    /// The record whose range contains `address`.
    #[must_use]
    pub fn find_containing(&self, address: u32) -> Option<&MemoryRegion> {
        self.find_overlapping(&Region::new(address, 1))
    }

    /// Add a record.
    ///
    /// # Errors
    /// Returns the existing record that overlaps `record`; the tree is left
    /// unchanged.
    pub fn insert(&mut self, record: MemoryRegion) -> Result<(), MemoryRegion> {
        if let Some(existing) = self.find_overlapping(&record.region) {
            return Err(*existing);
        }
        let index = self.allocate(record);
        self.root = Some(self.insert_at(self.root, index));
        self.len += 1;
        Ok(())
    }

    fn insert_at(&mut self, link: Link, new: usize) -> usize {
        let Some(index) = link else {
            return new;
        };
        let key = self.node(new).record.region.address;
        if key < self.node(index).record.region.address {
            let left = self.node(index).left;
            let child = self.insert_at(left, new);
            self.node_mut(index).left = Some(child);
        } else {
            let right = self.node(index).right;
            let child = self.insert_at(right, new);
            self.node_mut(index).right = Some(child);
        }
        self.rebalance(index)
    }

    /// Remove the record starting at `address`.
    pub fn remove(&mut self, address: u32) -> Option<MemoryRegion> {
        let mut removed = None;
        self.root = self.remove_at(self.root, address, &mut removed);
        let index = removed?;
        self.len -= 1;
        self.free_slots.push(index);
        self.nodes[index].take().map(|node| node.record)
    }

    fn remove_at(&mut self, link: Link, address: u32, removed: &mut Option<usize>) -> Link {
        let index = link?;
        let node = self.node(index);
        match address.cmp(&node.record.region.address) {
            Ordering::Less => {
                let left = node.left;
                let child = self.remove_at(left, address, removed);
                self.node_mut(index).left = child;
            }
            Ordering::Greater => {
                let right = node.right;
                let child = self.remove_at(right, address, removed);
                self.node_mut(index).right = child;
            }
            Ordering::Equal => {
                *removed = Some(index);
                let (left, right) = (node.left, node.right);
                let Some(right) = right else {
                    return left;
                };
                if left.is_none() {
                    return Some(right);
                }
                // Replace by the in-order successor.
                let (rest, successor) = self.take_min(right);
                let succ = self.node_mut(successor);
                succ.left = left;
                succ.right = rest;
                return Some(self.rebalance(successor));
            }
        }
        Some(self.rebalance(index))
    }

    /// Detach the minimum of the subtree at `index`; returns the new subtree
    /// root and the detached node.
    fn take_min(&mut self, index: usize) -> (Link, usize) {
        let node = self.node(index);
        let Some(left) = node.left else {
            return (node.right, index);
        };
        let (rest, min) = self.take_min(left);
        self.node_mut(index).left = rest;
        (Some(self.rebalance(index)), min)
    }

    /// Records in address order.
    pub fn iter(&self) -> Iter<'_> {
        let mut iter = Iter {
            tree: self,
            stack: Vec::new(),
        };
        iter.push_left(self.root);
        iter
    }

    /// Tile `[0, bound)` with the records and the holes between them.
    ///
    /// Records starting at or past `bound` are left out; one reaching past it
    /// is cut short at `bound`.
    #[must_use]
    pub fn traverse_all(&self, bound: u64) -> Vec<Span> {
        let mut spans = Vec::with_capacity(self.len * 2 + 1);
        let mut cursor = 0u64;
        for record in self.iter() {
            let start = u64::from(record.region.address);
            if start >= bound {
                break;
            }
            if start > cursor {
                spans.push(Span::Free(Region::new(cursor as u32, start - cursor)));
            }
            let mut record = *record;
            if record.region.end() > bound {
                record.region.size = bound - start;
            }
            cursor = record.region.end();
            spans.push(Span::Used(record));
        }
        if cursor < bound {
            spans.push(Span::Free(Region::new(cursor as u32, bound - cursor)));
        }
        spans
    }

    /// First hole of at least `size` bytes inside `[lower, upper)`.
    #[must_use]
    pub fn find_free(&self, size: u64, lower: u32, upper: u64) -> Option<u32> {
        let mut cursor = u64::from(lower);
        for record in self.iter() {
            let start = u64::from(record.region.address);
            let end = record.region.end();
            if end <= cursor {
                continue;
            }
            if start >= upper {
                break;
            }
            if start >= cursor + size {
                return Some(cursor as u32);
            }
            cursor = end;
        }
        (cursor + size <= upper).then_some(cursor as u32)
    }

    /// Check the AVL and ordering invariants.
    #[cfg(test)]
    fn validate(&self) {
        fn walk(tree: &RegionTree, link: Link, lo: u64, hi: u64) -> (u8, usize) {
            let Some(index) = link else {
                return (0, 0);
            };
            let node = tree.node(index);
            let region = node.record.region;
            assert!(u64::from(region.address) >= lo && region.end() <= hi);
            let (lh, lc) = walk(tree, node.left, lo, u64::from(region.address));
            let (rh, rc) = walk(tree, node.right, region.end(), hi);
            assert!(lh.abs_diff(rh) <= 1, "unbalanced at {region:?}");
            assert_eq!(node.height, 1 + lh.max(rh));
            (node.height, lc + rc + 1)
        }
        let (_, count) = walk(self, self.root, 0, 1 << 32);
        assert_eq!(count, self.len);
    }
}

pub struct Iter<'a> {
    tree: &'a RegionTree,
    stack: Vec<usize>,
}

impl Iter<'_> {
    fn push_left(&mut self, mut link: Link) {
        while let Some(index) = link {
            self.stack.push(index);
            link = self.tree.node(index).left;
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a MemoryRegion;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.stack.pop()?;
        let tree = self.tree;
        let node = tree.node(index);
        self.push_left(node.right);
        Some(&node.record)
    }
}
