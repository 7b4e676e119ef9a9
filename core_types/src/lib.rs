//! # Core Types
//!
//! This crate defines the shared vocabulary of the portal messaging fabric.
//!
//! ## Philosophy
//!
//! - **Strongly typed identifiers**: sequence numbers, sublinks, buffers and
//!   node names are distinct types that cannot be confused
//! - **Plain data**: everything here is passive; behavior lives in `fabric`
//! - **Serializable**: embedders can log or persist any of these types
//!
//! The types in this crate are used on both sides of every boundary in the
//! system: the public portal surface, the node-to-node wire protocol, and
//! the shared memory plane.

pub mod error;
pub mod ids;
pub mod name;
pub mod sequence;
pub mod side;
pub mod status;

pub use error::ApiError;
pub use ids::{BufferId, SublinkId};
pub use name::NodeName;
pub use sequence::SequenceNumber;
pub use side::{LinkSide, LinkType, Side};
pub use status::{
    PortalStatus, PortalStatusFlags, TrapConditionFlags, TrapConditions, TrapEvent,
};
