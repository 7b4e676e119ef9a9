//! Dynamic fragment allocation over pooled block allocators.

use super::block_allocator::BlockAllocator;
use super::fragment::{Fragment, FragmentDescriptor};
use core_types::BufferId;
use std::collections::HashMap;

struct PoolEntry {
    buffer_id: BufferId,
    /// Base of the containing buffer, for computing descriptor offsets.
    buffer_base: *mut u8,
    allocator: BlockAllocator,
}

unsafe impl Send for PoolEntry {}

/// Groups block allocators by block size and routes fragment allocation to
/// them. Sizes are rounded up to powers of two; when every buffer of the
/// requested size is saturated, allocation fails and the caller is expected
/// to request more capacity asynchronously.
#[derive(Default)]
pub struct FragmentAllocator {
    pools: HashMap<u32, Vec<PoolEntry>>,
}

impl FragmentAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a block allocator covering part of buffer `buffer_id`.
    pub fn add_block_allocator(
        &mut self,
        block_size: u32,
        buffer_id: BufferId,
        buffer_base: *mut u8,
        allocator: BlockAllocator,
    ) {
        self.pools.entry(block_size).or_default().push(PoolEntry {
            buffer_id,
            buffer_base,
            allocator,
        });
    }

    /// Allocates a fragment of at least `num_bytes`, preferring the
    /// smallest sufficient block size with free capacity.
    pub fn allocate(&mut self, num_bytes: u32) -> Option<Fragment> {
        let wanted = num_bytes.next_power_of_two();
        let mut sizes: Vec<u32> = self
            .pools
            .keys()
            .copied()
            .filter(|&size| size >= wanted)
            .collect();
        sizes.sort_unstable();
        for size in sizes {
            if let Some(fragment) = self.allocate_from_pool(size) {
                return Some(fragment);
            }
        }
        None
    }

    /// Allocates from the pool of exactly `block_size`-byte blocks.
    pub fn allocate_block(&mut self, block_size: u32) -> Option<Fragment> {
        self.allocate_from_pool(block_size.next_power_of_two())
    }

    /// Returns a fragment to its originating buffer.
    pub fn free(&mut self, fragment: &Fragment) -> bool {
        if !fragment.is_addressable() {
            return false;
        }
        let Some(entries) = self.pools.get_mut(&fragment.size()) else {
            return false;
        };
        for entry in entries {
            if entry.buffer_id == fragment.descriptor().buffer
                && entry.allocator.contains(fragment.ptr())
            {
                return entry.allocator.free(fragment.ptr());
            }
        }
        false
    }

    fn allocate_from_pool(&mut self, block_size: u32) -> Option<Fragment> {
        let entries = self.pools.get_mut(&block_size)?;
        for entry in entries {
            if let Some(ptr) = entry.allocator.alloc() {
                let offset = ptr as usize - entry.buffer_base as usize;
                let descriptor =
                    FragmentDescriptor::new(entry.buffer_id, offset as u32, block_size);
                return Some(Fragment::mapped(descriptor, ptr));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Region {
        bytes: Vec<u64>,
    }

    impl Region {
        fn new(len: usize) -> Self {
            Self {
                bytes: vec![0; len / 8],
            }
        }

        fn base(&mut self) -> *mut u8 {
            self.bytes.as_mut_ptr() as *mut u8
        }

        fn len(&self) -> usize {
            self.bytes.len() * 8
        }
    }

    fn add_region(
        allocator: &mut FragmentAllocator,
        region: &mut Region,
        buffer_id: BufferId,
        block_size: u32,
    ) {
        let base = region.base();
        let blocks = unsafe { BlockAllocator::new(base, region.len(), block_size as usize) };
        blocks.initialize_region();
        allocator.add_block_allocator(block_size, buffer_id, base, blocks);
    }

    #[test]
    fn test_allocate_rounds_up_to_pool_size() {
        let mut region = Region::new(4096);
        let mut allocator = FragmentAllocator::new();
        add_region(&mut allocator, &mut region, BufferId::from_u64(1), 64);

        let fragment = allocator.allocate(33).unwrap();
        assert_eq!(fragment.size(), 64);
        assert_eq!(fragment.descriptor().buffer, BufferId::from_u64(1));
        assert!(allocator.free(&fragment));
    }

    #[test]
    fn test_allocation_fails_when_saturated() {
        let mut region = Region::new(256);
        let mut allocator = FragmentAllocator::new();
        add_region(&mut allocator, &mut region, BufferId::from_u64(1), 64);

        let mut live = Vec::new();
        while let Some(fragment) = allocator.allocate(64) {
            live.push(fragment);
        }
        assert!(!live.is_empty());
        assert!(allocator.allocate(64).is_none());
        assert!(allocator.free(&live.pop().unwrap()));
        assert!(allocator.allocate(64).is_some());
    }

    #[test]
    fn test_falls_back_to_larger_pool() {
        let mut small = Region::new(144);
        let mut large = Region::new(4096);
        let mut allocator = FragmentAllocator::new();
        add_region(&mut allocator, &mut small, BufferId::from_u64(1), 64);
        add_region(&mut allocator, &mut large, BufferId::from_u64(3), 256);

        // The 64-byte pool has a single usable block (block 0 is reserved).
        let first = allocator.allocate(64).unwrap();
        assert_eq!(first.size(), 64);
        let second = allocator.allocate(64).unwrap();
        assert_eq!(second.size(), 256);
    }

    #[test]
    fn test_descriptor_offsets_are_buffer_relative() {
        let mut region = Region::new(1024);
        let mut allocator = FragmentAllocator::new();
        let base = region.base();
        add_region(&mut allocator, &mut region, BufferId::from_u64(1), 64);

        let fragment = allocator.allocate(64).unwrap();
        let offset = fragment.descriptor().offset as usize;
        assert_eq!(unsafe { base.add(offset) }, fragment.ptr());
    }
}
