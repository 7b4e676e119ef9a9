//! The shared memory plane cooperatively managed by the two ends of a
//! node-link.

mod block_allocator;
mod fragment;
mod fragment_allocator;
mod link_memory;
mod link_state;

pub use block_allocator::BlockAllocator;
pub use fragment::{Fragment, FragmentDescriptor};
pub use fragment_allocator::FragmentAllocator;
pub use link_memory::{
    NodeLinkMemory, LINK_STATE_BUFFER_SIZE, MAX_INITIAL_PORTALS, PRIMARY_BUFFER_SIZE,
};
pub use link_state::RouterLinkState;
