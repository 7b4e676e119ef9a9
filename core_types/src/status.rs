//! Portal status snapshots and trap conditions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Bit set describing the terminal state of a portal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalStatusFlags(u32);

impl PortalStatusFlags {
    pub const NONE: PortalStatusFlags = PortalStatusFlags(0);
    /// The other side of the route has been closed.
    pub const PEER_CLOSED: PortalStatusFlags = PortalStatusFlags(1 << 0);
    /// The peer is closed AND every parcel it sent has been retrieved; the
    /// portal can never yield anything again.
    pub const DEAD: PortalStatusFlags = PortalStatusFlags(1 << 1);

    pub fn contains(&self, other: PortalStatusFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PortalStatusFlags) {
        self.0 |= other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for PortalStatusFlags {
    type Output = PortalStatusFlags;

    fn bitor(self, rhs: PortalStatusFlags) -> PortalStatusFlags {
        PortalStatusFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PortalStatusFlags {
    fn bitor_assign(&mut self, rhs: PortalStatusFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for PortalStatusFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status:{:#x}", self.0)
    }
}

/// Snapshot of a portal's observable state.
///
/// The local counters describe parcels available for retrieval on this side.
/// The remote counters are the local view of the unsent outbound queue; see
/// the put-limits notes in DESIGN.md.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalStatus {
    pub flags: PortalStatusFlags,
    pub num_local_parcels: u64,
    pub num_local_bytes: u64,
    pub num_remote_parcels: u64,
    pub num_remote_bytes: u64,
}

impl PortalStatus {
    pub fn peer_closed(&self) -> bool {
        self.flags.contains(PortalStatusFlags::PEER_CLOSED)
    }

    pub fn is_dead(&self) -> bool {
        self.flags.contains(PortalStatusFlags::DEAD)
    }
}

/// Bit set selecting which portal conditions a trap observes, and reported
/// back when a trap fires or fails to arm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrapConditionFlags(u32);

impl TrapConditionFlags {
    pub const NONE: TrapConditionFlags = TrapConditionFlags(0);
    /// The peer has closed its end of the route.
    pub const PEER_CLOSED: TrapConditionFlags = TrapConditionFlags(1 << 0);
    /// The route is dead: peer closed and nothing left to retrieve.
    pub const DEAD: TrapConditionFlags = TrapConditionFlags(1 << 1);
    /// At least `min_local_parcels` parcels are retrievable.
    pub const ABOVE_MIN_LOCAL_PARCELS: TrapConditionFlags = TrapConditionFlags(1 << 2);
    /// At least `min_local_bytes` bytes are retrievable.
    pub const ABOVE_MIN_LOCAL_BYTES: TrapConditionFlags = TrapConditionFlags(1 << 3);
    /// Fewer than `max_remote_parcels` parcels are queued outbound.
    pub const BELOW_MAX_REMOTE_PARCELS: TrapConditionFlags = TrapConditionFlags(1 << 4);
    /// Fewer than `max_remote_bytes` bytes are queued outbound.
    pub const BELOW_MAX_REMOTE_BYTES: TrapConditionFlags = TrapConditionFlags(1 << 5);
    /// A new parcel arrived locally. Edge-triggered; never blocks arming.
    pub const NEW_LOCAL_PARCEL: TrapConditionFlags = TrapConditionFlags(1 << 6);

    pub fn contains(&self, other: TrapConditionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: TrapConditionFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: TrapConditionFlags) {
        self.0 |= other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for TrapConditionFlags {
    type Output = TrapConditionFlags;

    fn bitor(self, rhs: TrapConditionFlags) -> TrapConditionFlags {
        TrapConditionFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for TrapConditionFlags {
    fn bitor_assign(&mut self, rhs: TrapConditionFlags) {
        self.0 |= rhs.0;
    }
}

/// Condition descriptor a trap is created with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrapConditions {
    pub flags: TrapConditionFlags,
    pub min_local_parcels: u64,
    pub min_local_bytes: u64,
    pub max_remote_parcels: u64,
    pub max_remote_bytes: u64,
}

/// Event delivered to a trap handler when armed conditions become met.
#[derive(Debug, Clone)]
pub struct TrapEvent {
    /// Opaque value supplied when the trap was created.
    pub context: u64,
    /// The subset of observed conditions that triggered this event.
    pub condition_flags: TrapConditionFlags,
    /// Portal status at the time the event was queued.
    pub status: PortalStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_flag_queries() {
        let mut flags = PortalStatusFlags::NONE;
        assert!(flags.is_empty());
        flags.insert(PortalStatusFlags::PEER_CLOSED);
        assert!(flags.contains(PortalStatusFlags::PEER_CLOSED));
        assert!(!flags.contains(PortalStatusFlags::DEAD));
    }

    #[test]
    fn test_condition_flag_intersection() {
        let set = TrapConditionFlags::PEER_CLOSED | TrapConditionFlags::DEAD;
        assert!(set.intersects(TrapConditionFlags::DEAD));
        assert!(!set.intersects(TrapConditionFlags::NEW_LOCAL_PARCEL));
    }

    #[test]
    fn test_portal_status_helpers() {
        let mut status = PortalStatus::default();
        assert!(!status.peer_closed());
        status.flags.insert(PortalStatusFlags::PEER_CLOSED);
        status.flags.insert(PortalStatusFlags::DEAD);
        assert!(status.peer_closed());
        assert!(status.is_dead());
    }
}
