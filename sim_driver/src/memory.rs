//! Heap-backed shared memory regions.

use driver_api::{DriverError, Mapping, SharedMemoryRegion};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::Arc;

/// Coordination cells placed in shared memory (e.g. `RouterLinkState`) are
/// 64-byte aligned; the backing allocation must honor that.
const BACKING_ALIGN: usize = 64;

/// The backing store shared by all duplicates of a region. Access goes
/// through raw pointers obtained from mappings, never through references to
/// the cells themselves.
struct Backing {
    ptr: *mut u8,
    layout: Layout,
}

unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

impl Drop for Backing {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// A "shared memory" region backed by process heap. Mappings created from
/// this region and any of its duplicates alias the same bytes, exactly as
/// OS shared memory would between two processes.
pub struct SimSharedMemory {
    backing: Arc<Backing>,
    size: usize,
}

impl SimSharedMemory {
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size.max(1), BACKING_ALIGN)
            .expect("shared memory size overflows layout limits");
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "shared memory allocation failed");
        Self {
            backing: Arc::new(Backing { ptr, layout }),
            size,
        }
    }
}

impl SharedMemoryRegion for SimSharedMemory {
    fn size(&self) -> usize {
        self.size
    }

    fn duplicate(&self) -> Result<Arc<dyn SharedMemoryRegion>, DriverError> {
        Ok(Arc::new(SimSharedMemory {
            backing: self.backing.clone(),
            size: self.size,
        }))
    }

    fn map(&self) -> Result<Mapping, DriverError> {
        let base = self.backing.ptr;
        // The backing keeps the bytes alive for as long as the mapping.
        Ok(unsafe { Mapping::new(base, self.size, self.backing.clone()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_survives_region_drop() {
        let region = SimSharedMemory::new(16);
        let mapping = region.map().unwrap();
        drop(region);
        unsafe {
            mapping.base().write(7);
            assert_eq!(mapping.base().read(), 7);
        }
    }

    #[test]
    fn test_duplicates_share_bytes() {
        let region = SimSharedMemory::new(8);
        let dup = region.duplicate().unwrap();
        let a = region.map().unwrap();
        let b = dup.map().unwrap();
        unsafe {
            a.base().add(3).write(0xaa);
            assert_eq!(b.base().add(3).read(), 0xaa);
        }
    }
}
