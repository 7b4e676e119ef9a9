//! Identifiers for node-link resources

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one multiplexed router-link within a node-link.
///
/// Sublink ids are allocated from a counter shared by both ends of the link
/// (it lives in the primary shared memory buffer), so an id minted by either
/// side never collides with one minted by the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SublinkId(u64);

impl SublinkId {
    /// Creates a sublink id from its numeric value.
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Returns the numeric value.
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the id `offset` past this one.
    pub const fn offset_by(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::Display for SublinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sublink:{}", self.0)
    }
}

/// Identifies one shared memory buffer within a node-link's memory pool.
///
/// Id 0 always names the primary buffer. The remaining id space is split in
/// disjoint halves so either side can mint new ids without coordination:
/// side A uses even ids starting at 2, side B odd ids starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(u64);

impl BufferId {
    /// The id of a link's primary buffer.
    pub const PRIMARY: BufferId = BufferId(0);

    /// Creates a buffer id from its numeric value.
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Returns the numeric value.
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Whether this id names the primary buffer.
    pub fn is_primary(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sublink_offset() {
        let base = SublinkId::from_u64(7);
        assert_eq!(base.offset_by(1).value(), 8);
        assert_eq!(base.offset_by(0), base);
    }

    #[test]
    fn test_primary_buffer_id() {
        assert!(BufferId::PRIMARY.is_primary());
        assert!(!BufferId::from_u64(3).is_primary());
    }
}
