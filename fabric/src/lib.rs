//! # Fabric
//!
//! The routing fabric behind portal-based messaging: pairs of portals
//! exchange ordered parcels of bytes, transferable portals, and boxed driver
//! objects. A portal may itself be sent inside a parcel over another portal;
//! the fabric then reconfigures itself in place so the moved endpoint's peer
//! eventually talks directly to its new host node, with no permanent proxy
//! left behind.
//!
//! The major pieces, leaves to roots:
//!
//! - [`sequenced_queue`]: sparse, bounded-gap queues with O(1) reporting of
//!   the contiguous available prefix
//! - [`parcel`]: the unit of transmission
//! - [`memory`]: the shared memory plane cooperatively managed by the two
//!   ends of a node-link, including the lock-free block allocator and the
//!   `RouterLinkState` coordination cells
//! - [`wire`]: the framed little-endian node-to-node protocol
//! - [`node_link`]: the per-peer multiplexer carrying many sublinks
//! - [`router_link`] and [`route_edge`]: the links between routers and the
//!   decay machinery that eliminates proxies
//! - [`router`]: the routing state machine itself
//! - [`trap`]: armed one-shot observers of portal status
//! - [`node`] and [`portal`]: the top-level containers and the application
//!   surface
//!
//! All blocking is confined to `Trap::destroy(blocking)`; every other
//! operation completes without waiting. User callbacks are never invoked
//! with fabric locks held.

pub mod memory;
pub mod node;
pub mod node_link;
pub mod parcel;
pub mod portal;
pub mod route_edge;
pub mod router;
pub mod router_link;
pub mod sequenced_queue;
pub mod trap;
pub mod wire;

pub use core_types::{
    ApiError, NodeName, PortalStatus, PortalStatusFlags, SequenceNumber, Side, TrapConditionFlags,
    TrapConditions, TrapEvent,
};
pub use node::{ConnectError, ConnectMode, Node, NodeType};
pub use parcel::PutLimits;
pub use portal::{Portal, PortalObject};
pub use trap::{ArmError, Trap};
