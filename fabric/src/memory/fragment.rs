//! Fragments of shared memory.

use core_types::BufferId;
use std::fmt;

/// Names a span of bytes within one buffer of a node-link's memory pool.
/// Descriptors are meaningful to both ends of the link and travel on the
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentDescriptor {
    pub buffer: BufferId,
    pub offset: u32,
    pub size: u32,
}

impl FragmentDescriptor {
    pub fn new(buffer: BufferId, offset: u32, size: u32) -> Self {
        Self {
            buffer,
            offset,
            size,
        }
    }

    /// Exclusive end offset of the span within its buffer.
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }
}

impl fmt::Display for FragmentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}..{}", self.buffer, self.offset, self.end())
    }
}

/// A descriptor optionally resolved to a mapped address.
///
/// A fragment is *pending* when its descriptor refers to a buffer this node
/// has not yet mapped; it becomes addressable once the buffer arrives.
#[derive(Clone, Copy)]
pub struct Fragment {
    descriptor: FragmentDescriptor,
    ptr: *mut u8,
}

// Fragments point into driver shared memory, which is valid for the life of
// the owning NodeLinkMemory and accessed only via atomics or raw copies.
unsafe impl Send for Fragment {}
unsafe impl Sync for Fragment {}

impl Fragment {
    /// A fragment whose buffer is mapped locally.
    ///
    /// # Safety is the caller's: `ptr` must address `descriptor.size` valid
    /// bytes that outlive the owning memory pool.
    pub fn mapped(descriptor: FragmentDescriptor, ptr: *mut u8) -> Self {
        Self { descriptor, ptr }
    }

    /// A fragment whose buffer is not mapped here yet.
    pub fn pending(descriptor: FragmentDescriptor) -> Self {
        Self {
            descriptor,
            ptr: std::ptr::null_mut(),
        }
    }

    pub fn descriptor(&self) -> FragmentDescriptor {
        self.descriptor
    }

    pub fn size(&self) -> u32 {
        self.descriptor.size
    }

    pub fn is_pending(&self) -> bool {
        self.ptr.is_null()
    }

    pub fn is_addressable(&self) -> bool {
        !self.ptr.is_null()
    }

    /// Base address of the mapped span. Null while pending.
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }
}

impl fmt::Debug for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fragment")
            .field("descriptor", &self.descriptor)
            .field("pending", &self.is_pending())
            .finish()
    }
}
