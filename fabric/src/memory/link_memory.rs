//! Per-link shared memory pools.

use super::block_allocator::BlockAllocator;
use super::fragment::{Fragment, FragmentDescriptor};
use super::fragment_allocator::FragmentAllocator;
use super::link_state::RouterLinkState;
use crate::node::Node;
use crate::node_link::NodeLink;
use core_types::{BufferId, LinkSide, SublinkId};
use driver_api::{Mapping, SharedMemoryRegion};
use log::warn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The front of the primary buffer is reserved for state that must be
/// addressable for the whole life of the link.
const RESERVED_HEADER_SIZE: usize = 256;

/// Fixed `RouterLinkState` slots for the link's initial portals. Bounds the
/// number of initial portals a connection may carry.
pub const MAX_INITIAL_PORTALS: usize = 12;

const INITIAL_LINK_STATES_OFFSET: usize = RESERVED_HEADER_SIZE;
const INITIAL_LINK_STATES_SIZE: usize = MAX_INITIAL_PORTALS * 64;

/// Block regions embedded in the primary buffer, by block size. Capacity
/// beyond this is added dynamically through capacity requests.
const PRIMARY_BLOCK_REGIONS: [(u32, usize); 4] =
    [(256, 16384), (512, 16384), (1024, 16384), (2048, 16384)];

const fn primary_regions_size() -> usize {
    let mut total = 0;
    let mut i = 0;
    while i < PRIMARY_BLOCK_REGIONS.len() {
        total += PRIMARY_BLOCK_REGIONS[i].1;
        i += 1;
    }
    total
}

/// Total size of a link's primary buffer.
pub const PRIMARY_BUFFER_SIZE: usize =
    RESERVED_HEADER_SIZE + INITIAL_LINK_STATES_SIZE + primary_regions_size();

/// Size of the buffers requested for dynamic `RouterLinkState` capacity.
pub const LINK_STATE_BUFFER_SIZE: u32 = 16384;

/// Lives at offset 0 of the primary buffer. Shared by both ends.
#[repr(C, align(8))]
struct PrimaryBufferHeader {
    /// Counter from which both ends mint sublink ids.
    next_sublink: AtomicU64,
}

static_assertions::const_assert!(std::mem::size_of::<PrimaryBufferHeader>() <= RESERVED_HEADER_SIZE);

type HostCallback = Box<dyn FnOnce() + Send>;

struct MemoryState {
    node_link: Option<Arc<NodeLink>>,
    /// Mapped auxiliary buffers. Mappings are append-only and never removed
    /// while the pool lives.
    buffers: Vec<Mapping>,
    /// Buffer id to (base address, length) of its local mapping.
    buffer_index: HashMap<BufferId, (usize, usize)>,
    fragment_allocator: FragmentAllocator,
    /// Callbacks awaiting new capacity, keyed by fragment size. A non-empty
    /// list means a request for that size is already in flight.
    capacity_callbacks: HashMap<u32, Vec<HostCallback>>,
    /// Callbacks awaiting the arrival of a specific buffer.
    buffer_callbacks: HashMap<BufferId, Vec<HostCallback>>,
    next_buffer_id: u64,
}

/// One end's view of the memory pool shared across a node-link.
///
/// Both ends allocate fragments from any attached buffer; coordination goes
/// through the lock-free block allocators inside the buffers themselves.
/// New buffers are granted by whichever side fulfills a capacity request and
/// announced with `AddFragmentAllocatorBuffer`.
pub struct NodeLinkMemory {
    node: Arc<Node>,
    link_side: LinkSide,
    primary: Mapping,
    state: Mutex<MemoryState>,
}

impl NodeLinkMemory {
    /// Allocates and formats a fresh primary buffer. Returns the pool and
    /// the region handle to transmit to the other side. The caller adopts
    /// link side A.
    pub fn allocate(
        node: Arc<Node>,
        num_initial_portals: usize,
    ) -> Option<(Arc<NodeLinkMemory>, Arc<dyn SharedMemoryRegion>)> {
        debug_assert!(num_initial_portals <= MAX_INITIAL_PORTALS);
        let region = node.driver().allocate_shared_memory(PRIMARY_BUFFER_SIZE).ok()?;
        let mapping = region.map().ok()?;

        let memory = Self::with_primary(node, LinkSide::A, mapping);
        memory.header().next_sublink.store(
            num_initial_portals as u64,
            Ordering::Relaxed,
        );
        for i in 0..MAX_INITIAL_PORTALS {
            let fragment = memory.initial_router_link_state(i);
            unsafe { RouterLinkState::from_ptr(fragment.ptr()) }.reset();
        }
        {
            let mut state = memory.state.lock();
            let mut offset = INITIAL_LINK_STATES_OFFSET + INITIAL_LINK_STATES_SIZE;
            for (block_size, region_len) in PRIMARY_BLOCK_REGIONS {
                let base = unsafe { memory.primary.base().add(offset) };
                let allocator =
                    unsafe { BlockAllocator::new(base, region_len, block_size as usize) };
                allocator.initialize_region();
                state.fragment_allocator.add_block_allocator(
                    block_size,
                    BufferId::PRIMARY,
                    memory.primary.base(),
                    allocator,
                );
                offset += region_len;
            }
        }
        Some((memory, region))
    }

    /// Adopts a primary buffer formatted by the other side.
    pub fn adopt(
        node: Arc<Node>,
        link_side: LinkSide,
        region: &Arc<dyn SharedMemoryRegion>,
    ) -> Option<Arc<NodeLinkMemory>> {
        if region.size() < PRIMARY_BUFFER_SIZE {
            return None;
        }
        let mapping = region.map().ok()?;
        let memory = Self::with_primary(node, link_side, mapping);
        {
            let mut state = memory.state.lock();
            let mut offset = INITIAL_LINK_STATES_OFFSET + INITIAL_LINK_STATES_SIZE;
            for (block_size, region_len) in PRIMARY_BLOCK_REGIONS {
                let base = unsafe { memory.primary.base().add(offset) };
                let allocator =
                    unsafe { BlockAllocator::new(base, region_len, block_size as usize) };
                state.fragment_allocator.add_block_allocator(
                    block_size,
                    BufferId::PRIMARY,
                    memory.primary.base(),
                    allocator,
                );
                offset += region_len;
            }
        }
        Some(memory)
    }

    fn with_primary(node: Arc<Node>, link_side: LinkSide, primary: Mapping) -> Arc<Self> {
        let primary_base = primary.base() as usize;
        let primary_len = primary.len();
        let memory = Arc::new(NodeLinkMemory {
            node,
            link_side,
            primary,
            state: Mutex::new(MemoryState {
                node_link: None,
                buffers: Vec::new(),
                buffer_index: HashMap::new(),
                fragment_allocator: FragmentAllocator::new(),
                capacity_callbacks: HashMap::new(),
                buffer_callbacks: HashMap::new(),
                // Disjoint halves of the id space: A mints even ids from 2,
                // B mints odd ids from 1. Id 0 is the primary buffer.
                next_buffer_id: match link_side {
                    LinkSide::A => 2,
                    LinkSide::B => 1,
                },
            }),
        });
        memory
            .state
            .lock()
            .buffer_index
            .insert(BufferId::PRIMARY, (primary_base, primary_len));
        memory
    }

    pub fn link_side(&self) -> LinkSide {
        self.link_side
    }

    /// Binds this pool to its owning link; reset to `None` on deactivation.
    pub fn set_node_link(&self, link: Option<Arc<NodeLink>>) {
        self.state.lock().node_link = link;
    }

    fn header(&self) -> &PrimaryBufferHeader {
        unsafe { &*(self.primary.base() as *const PrimaryBufferHeader) }
    }

    /// Mints `count` contiguous sublink ids, unique across both ends.
    pub fn allocate_sublinks(&self, count: u64) -> SublinkId {
        let first = self.header().next_sublink.fetch_add(count, Ordering::Relaxed);
        SublinkId::from_u64(first)
    }

    /// The fixed link-state cell for initial portal `i`.
    pub fn initial_router_link_state(&self, i: usize) -> Fragment {
        debug_assert!(i < MAX_INITIAL_PORTALS);
        let offset = INITIAL_LINK_STATES_OFFSET + i * 64;
        let descriptor = FragmentDescriptor::new(BufferId::PRIMARY, offset as u32, 64);
        Fragment::mapped(descriptor, unsafe { self.primary.base().add(offset) })
    }

    /// Allocates and initializes a new central-link state cell. Returns
    /// `None` when dynamic capacity for link states is exhausted; callers
    /// then request capacity and retry.
    pub fn allocate_router_link_state(&self) -> Option<Fragment> {
        static_assertions::const_assert_eq!(std::mem::size_of::<RouterLinkState>(), 64);
        let fragment = self.allocate_block(64)?;
        unsafe { RouterLinkState::from_ptr(fragment.ptr()) }.reset();
        Some(fragment)
    }

    /// Allocates a fragment of at least `num_bytes` from any attached
    /// buffer.
    pub fn allocate_fragment(&self, num_bytes: u32) -> Option<Fragment> {
        self.state.lock().fragment_allocator.allocate(num_bytes)
    }

    fn allocate_block(&self, block_size: u32) -> Option<Fragment> {
        self.state.lock().fragment_allocator.allocate_block(block_size)
    }

    /// Returns a fragment to its originating buffer.
    pub fn free_fragment(&self, fragment: &Fragment) -> bool {
        self.state.lock().fragment_allocator.free(fragment)
    }

    /// Resolves a descriptor received from the other side. The result is
    /// pending if the named buffer has not arrived here yet.
    pub fn get_fragment(&self, descriptor: FragmentDescriptor) -> Fragment {
        let state = self.state.lock();
        match state.buffer_index.get(&descriptor.buffer) {
            Some(&(base, len)) if descriptor.end() <= len as u64 => {
                Fragment::mapped(descriptor, unsafe { (base as *mut u8).add(descriptor.offset as usize) })
            }
            Some(_) => Fragment::pending(descriptor),
            None => Fragment::pending(descriptor),
        }
    }

    /// Asks for one more buffer of `buffer_size` bytes carved into
    /// `fragment_size`-byte blocks. `callback` runs once capacity arrives.
    /// Requests for the same fragment size are coalesced.
    pub fn request_fragment_capacity(
        self: Arc<Self>,
        buffer_size: u32,
        fragment_size: u32,
        callback: HostCallback,
    ) {
        let fragment_size = fragment_size.next_power_of_two();
        {
            let mut state = self.state.lock();
            let callbacks = state.capacity_callbacks.entry(fragment_size).or_default();
            let request_in_flight = !callbacks.is_empty();
            callbacks.push(callback);
            if request_in_flight {
                return;
            }
        }

        let memory = self.clone();
        self.node.allocate_shared_memory(
            buffer_size as usize,
            Box::new(move |region| match region {
                Some(region) => memory.on_capacity_granted(fragment_size, region),
                None => {
                    warn!("dropping fragment capacity request: allocation failed");
                    memory.state.lock().capacity_callbacks.remove(&fragment_size);
                }
            }),
        );
    }

    fn on_capacity_granted(&self, fragment_size: u32, region: Arc<dyn SharedMemoryRegion>) {
        let Ok(mapping) = region.map() else {
            warn!("dropping fragment capacity grant: mapping failed");
            return;
        };

        let (buffer_id, callbacks, link) = {
            let mut state = self.state.lock();
            let buffer_id = BufferId::from_u64(state.next_buffer_id);
            state.next_buffer_id += 2;

            let allocator = unsafe {
                BlockAllocator::new(mapping.base(), mapping.len(), fragment_size as usize)
            };
            allocator.initialize_region();
            state.fragment_allocator.add_block_allocator(
                fragment_size,
                buffer_id,
                mapping.base(),
                allocator,
            );
            state
                .buffer_index
                .insert(buffer_id, (mapping.base() as usize, mapping.len()));
            state.buffers.push(mapping);

            let callbacks = state
                .capacity_callbacks
                .remove(&fragment_size)
                .unwrap_or_default();
            (buffer_id, callbacks, state.node_link.clone())
        };

        if let Some(link) = link {
            link.add_fragment_allocator_buffer(buffer_id, fragment_size, region);
        }

        for callback in callbacks {
            callback();
        }
    }

    /// Attaches a buffer granted by the other side. Fails if the id is
    /// already present.
    pub fn add_fragment_allocator_buffer(
        &self,
        buffer_id: BufferId,
        fragment_size: u32,
        region: &Arc<dyn SharedMemoryRegion>,
    ) -> bool {
        let fragment_size = fragment_size.next_power_of_two();
        let Ok(mapping) = region.map() else {
            return false;
        };

        let callbacks = {
            let mut state = self.state.lock();
            if state.buffer_index.contains_key(&buffer_id) {
                return false;
            }
            let allocator = unsafe {
                BlockAllocator::new(mapping.base(), mapping.len(), fragment_size as usize)
            };
            state.fragment_allocator.add_block_allocator(
                fragment_size,
                buffer_id,
                mapping.base(),
                allocator,
            );
            state
                .buffer_index
                .insert(buffer_id, (mapping.base() as usize, mapping.len()));
            state.buffers.push(mapping);
            state
                .buffer_callbacks
                .remove(&buffer_id)
                .unwrap_or_default()
        };

        for callback in callbacks {
            callback();
        }
        true
    }

    /// Runs `callback` once the identified buffer is attached; immediately
    /// if it already is.
    pub fn on_buffer_available(&self, buffer_id: BufferId, callback: HostCallback) {
        {
            let mut state = self.state.lock();
            if !state.buffer_index.contains_key(&buffer_id) {
                state.buffer_callbacks.entry(buffer_id).or_default().push(callback);
                return;
            }
        }
        callback();
    }
}
