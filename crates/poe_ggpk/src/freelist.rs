use std::collections::BTreeMap;

use crate::types::FREE_RECORD_MIN;

/// Index of the recycled byte ranges of a container.
///
/// Every entry mirrors one `FREE` record on disk: the map key is the record
/// offset and the value its total length. Blocks are discovered by the
/// opening scan, never by following the on-disk chain, so a stale or broken
/// chain cannot poison the index.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FreeSpaceIndex {
    blocks: BTreeMap<u64, u64>,
}

impl FreeSpaceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog a block found by the opening scan.
    ///
    /// Adjacent blocks are kept separate here because each one is a distinct
    /// record on disk. Merging only happens in [`FreeSpaceIndex::release`],
    /// where the caller rewrites the affected records to match.
    pub(crate) fn insert_scanned(&mut self, offset: u64, size: u64) {
        self.blocks.insert(offset, size);
    }

    /// First-fit allocation of exactly `len` bytes.
    ///
    /// Returns the lowest-offset block that either matches `len` exactly or
    /// leaves a remainder large enough to stay a valid free record. The
    /// remainder, if any, stays indexed at `offset + len`.
    pub fn allocate(&mut self, len: u64) -> Option<u64> {
        let offset = self
            .blocks
            .iter()
            .find(|(_, &size)| size == len || size >= len + FREE_RECORD_MIN)
            .map(|(&offset, _)| offset)?;

        let size = self.blocks.remove(&offset)?;
        if size > len {
            self.blocks.insert(offset + len, size - len);
        }
        Some(offset)
    }

    /// Return a byte range to the index, coalescing with any adjacent block.
    ///
    /// Returns the merged extent so the caller can rewrite the covering
    /// free record on disk. Each block mirrors one free record, whose
    /// length field is u32, so a merge that would grow past [`u32::MAX`]
    /// is skipped and the neighbours stay separate blocks.
    pub fn release(&mut self, offset: u64, size: u64) -> (u64, u64) {
        let mut start = offset;
        let mut len = size;

        if let Some((&left_start, &left_len)) = self.blocks.range(..offset).next_back() {
            if left_start + left_len == offset && left_len + len <= u64::from(u32::MAX) {
                self.blocks.remove(&left_start);
                start = left_start;
                len += left_len;
            }
        }
        if let Some(&right_len) = self.blocks.get(&(offset + size)) {
            if len + right_len <= u64::from(u32::MAX) {
                self.blocks.remove(&(offset + size));
                len += right_len;
            }
        }

        self.blocks.insert(start, len);
        (start, len)
    }

    /// Number of free blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Sum of all free block lengths
    pub fn total_bytes(&self) -> u64 {
        self.blocks.values().sum()
    }

    /// Length of the largest free block
    pub fn largest(&self) -> Option<u64> {
        self.blocks.values().copied().max()
    }

    /// Length of the block starting exactly at `offset`
    pub fn get(&self, offset: u64) -> Option<u64> {
        self.blocks.get(&offset).copied()
    }

    /// Blocks in offset order
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.blocks.iter().map(|(&offset, &size)| (offset, size))
    }
}
