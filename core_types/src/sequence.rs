//! Sequence numbers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Monotonic 64-bit counter ordering parcels within one direction of one
/// route segment. Independent counters are used per direction.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    /// Creates a sequence number from its numeric value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the numeric value.
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the next sequence number, or `None` on overflow.
    pub fn checked_next(&self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl Add<u64> for SequenceNumber {
    type Output = SequenceNumber;

    fn add(self, rhs: u64) -> SequenceNumber {
        SequenceNumber(self.0 + rhs)
    }
}

impl AddAssign<u64> for SequenceNumber {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

/// Distance between two sequence numbers.
impl Sub<SequenceNumber> for SequenceNumber {
    type Output = u64;

    fn sub(self, rhs: SequenceNumber) -> u64 {
        self.0 - rhs.0
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic() {
        let n = SequenceNumber::new(41);
        assert_eq!((n + 1).value(), 42);
        assert_eq!(n + 1 - n, 1);
    }

    #[test]
    fn test_checked_next_overflow() {
        assert_eq!(SequenceNumber::new(u64::MAX).checked_next(), None);
        assert_eq!(
            SequenceNumber::new(5).checked_next(),
            Some(SequenceNumber::new(6))
        );
    }
}
