//! Route sides and link endpoints

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the two sides of a route. Every route has exactly two sides; a
/// router carries the side of the portal it backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    A,
    B,
}

impl Side {
    /// Returns the other side of the route.
    pub fn opposite(&self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::A => write!(f, "side A"),
            Side::B => write!(f, "side B"),
        }
    }
}

/// Identifies which party holds a given end of a link, independent of route
/// side. By convention the initiator of a new link takes side A.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkSide {
    A,
    B,
}

impl LinkSide {
    /// Returns the opposite end of the link.
    pub fn opposite(&self) -> LinkSide {
        match self {
            LinkSide::A => LinkSide::B,
            LinkSide::B => LinkSide::A,
        }
    }

    pub fn is_side_a(&self) -> bool {
        matches!(self, LinkSide::A)
    }

    pub fn is_side_b(&self) -> bool {
        matches!(self, LinkSide::B)
    }

    /// Stable wire encoding of this end.
    pub fn to_wire(&self) -> u8 {
        match self {
            LinkSide::A => 0,
            LinkSide::B => 1,
        }
    }

    pub fn from_wire(value: u8) -> Option<LinkSide> {
        match value {
            0 => Some(LinkSide::A),
            1 => Some(LinkSide::B),
            _ => None,
        }
    }
}

impl fmt::Display for LinkSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkSide::A => write!(f, "A"),
            LinkSide::B => write!(f, "B"),
        }
    }
}

/// Classifies a router-link from the perspective of one of its routers.
///
/// Every live route has at most one central link, connecting one half of the
/// route to the other. All other links are peripheral: they connect a router
/// to a proxying predecessor (inward) or successor (outward) on the same
/// half of the route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkType {
    /// Connects the two halves of a route. Only central links carry a shared
    /// `RouterLinkState` and participate in bypass coordination.
    Central,
    /// Connects a router to a proxy closer to its own portal.
    PeripheralInward,
    /// Connects a router to a proxy closer to the opposite portal.
    PeripheralOutward,
}

impl LinkType {
    pub fn is_central(&self) -> bool {
        matches!(self, LinkType::Central)
    }

    pub fn is_peripheral_inward(&self) -> bool {
        matches!(self, LinkType::PeripheralInward)
    }

    pub fn is_peripheral_outward(&self) -> bool {
        matches!(self, LinkType::PeripheralOutward)
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkType::Central => write!(f, "central"),
            LinkType::PeripheralInward => write!(f, "peripheral-inward"),
            LinkType::PeripheralOutward => write!(f, "peripheral-outward"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::A.opposite(), Side::B);
        assert_eq!(Side::B.opposite(), Side::A);
    }

    #[test]
    fn test_link_side_wire_round_trip() {
        for side in [LinkSide::A, LinkSide::B] {
            assert_eq!(LinkSide::from_wire(side.to_wire()), Some(side));
        }
        assert_eq!(LinkSide::from_wire(7), None);
    }

    #[test]
    fn test_link_type_predicates() {
        assert!(LinkType::Central.is_central());
        assert!(LinkType::PeripheralInward.is_peripheral_inward());
        assert!(!LinkType::PeripheralOutward.is_peripheral_inward());
    }
}
