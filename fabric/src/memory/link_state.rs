//! Shared coordination cells for central router-links.

use core_types::{LinkSide, NodeName};
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

/// Cross-process coordination state for one central router-link.
///
/// One cell is shared between at most two routers on two nodes. The cell has
/// a fixed 64-byte layout (one cache line) and is only ever accessed through
/// atomics: the status word carries the stability, waiting and lock bits;
/// the bypass-source name is written only by the side holding the lock and
/// read only after observing the lock from the other side.
#[repr(C, align(64))]
pub struct RouterLinkState {
    status: AtomicU32,
    _reserved0: u32,
    allowed_bypass_request_source: [AtomicU64; 2],
    _reserved1: [u32; 10],
}

static_assertions::const_assert_eq!(std::mem::size_of::<RouterLinkState>(), 64);
static_assertions::const_assert_eq!(std::mem::align_of::<RouterLinkState>(), 64);

/// A fresh bypass link: neither side is ready to support a further bypass.
const UNSTABLE: u32 = 0;
const SIDE_A_STABLE: u32 = 1 << 0;
const SIDE_B_STABLE: u32 = 1 << 1;
const STABLE: u32 = SIDE_A_STABLE | SIDE_B_STABLE;
/// Set in place of a lock when the other side is not yet stable; tells that
/// side to send a flush notification once it stabilizes.
const SIDE_A_WAITING: u32 = 1 << 2;
const SIDE_B_WAITING: u32 = 1 << 3;
/// Mutually exclusive lock bits; only valid once both stable bits are set.
const LOCKED_BY_A: u32 = 1 << 4;
const LOCKED_BY_B: u32 = 1 << 5;
const LOCKED_BY_EITHER: u32 = LOCKED_BY_A | LOCKED_BY_B;

fn stable_bit(side: LinkSide) -> u32 {
    match side {
        LinkSide::A => SIDE_A_STABLE,
        LinkSide::B => SIDE_B_STABLE,
    }
}

fn waiting_bit(side: LinkSide) -> u32 {
    match side {
        LinkSide::A => SIDE_A_WAITING,
        LinkSide::B => SIDE_B_WAITING,
    }
}

fn lock_bit(side: LinkSide) -> u32 {
    match side {
        LinkSide::A => LOCKED_BY_A,
        LinkSide::B => LOCKED_BY_B,
    }
}

impl Default for RouterLinkState {
    fn default() -> Self {
        Self {
            status: AtomicU32::new(UNSTABLE),
            _reserved0: 0,
            allowed_bypass_request_source: [AtomicU64::new(0), AtomicU64::new(0)],
            _reserved1: [0; 10],
        }
    }
}

impl RouterLinkState {
    /// Reinterprets a 64-byte shared memory slot as a link state cell.
    ///
    /// # Safety
    ///
    /// `ptr` must be 64-aligned, address at least 64 valid shared bytes, and
    /// outlive `'a`. The slot must have been initialized by [`Self::reset`]
    /// (or zeroed) on exactly one side.
    pub unsafe fn from_ptr<'a>(ptr: *mut u8) -> &'a RouterLinkState {
        debug_assert_eq!(ptr as usize % 64, 0);
        &*(ptr as *const RouterLinkState)
    }

    /// In-place initialization of a freshly allocated cell.
    pub fn reset(&self) {
        self.allowed_bypass_request_source[0].store(0, Ordering::Relaxed);
        self.allowed_bypass_request_source[1].store(0, Ordering::Relaxed);
        self.status.store(UNSTABLE, Ordering::Release);
    }

    /// Marks the cell stable immediately; used for the initial central link
    /// of a brand-new route, which has nothing to decay on either side.
    pub fn mark_fully_stable(&self) {
        self.status.store(STABLE, Ordering::Release);
    }

    pub fn is_locked_by(&self, side: LinkSide) -> bool {
        self.status.load(Ordering::Relaxed) & lock_bit(side) != 0
    }

    /// Records that `side`'s links will no longer change, making the link
    /// lockable once both sides report stability.
    pub fn set_side_stable(&self, side: LinkSide) {
        let bit = stable_bit(side);
        let mut expected = UNSTABLE;
        loop {
            match self.status.compare_exchange_weak(
                expected,
                expected | bit,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    if actual & bit != 0 {
                        return;
                    }
                    expected = actual;
                }
            }
        }
    }

    /// Attempts to lock the link from `side`, which requires both stable
    /// bits set and no existing lock. If the other side is not yet stable,
    /// the waiting bit for `side` is set instead and the lock fails.
    pub fn try_lock(&self, side: LinkSide) -> bool {
        let this_stable = stable_bit(side);
        let other_stable = stable_bit(side.opposite());
        let this_lock = lock_bit(side);
        let this_waiting = waiting_bit(side);

        let mut expected = STABLE;
        let mut desired_bit = this_lock;
        loop {
            match self.status.compare_exchange_weak(
                expected,
                expected | desired_bit,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return desired_bit == this_lock,
                Err(actual) => {
                    if actual & LOCKED_BY_EITHER != 0 || actual & this_stable == 0 {
                        return false;
                    }
                    if desired_bit == this_lock && actual & other_stable == 0 {
                        desired_bit = this_waiting;
                    } else if desired_bit == this_waiting && actual & STABLE == STABLE {
                        desired_bit = this_lock;
                    }
                    expected = actual;
                }
            }
        }
    }

    /// Releases a lock taken by [`Self::try_lock`] from the same side.
    pub fn unlock(&self, side: LinkSide) {
        let this_lock = lock_bit(side);
        let mut expected = STABLE | this_lock;
        loop {
            match self.status.compare_exchange_weak(
                expected,
                expected & !this_lock,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    if actual & this_lock == 0 {
                        return;
                    }
                    expected = actual;
                }
            }
        }
    }

    /// If both sides are stable and `side` had set its waiting bit, clears
    /// the bit and returns true; the caller then pokes `side` to flush.
    pub fn reset_waiting_bit(&self, side: LinkSide) -> bool {
        let this_waiting = waiting_bit(side);
        let mut expected = STABLE | this_waiting;
        loop {
            match self.status.compare_exchange_weak(
                expected,
                expected & !this_waiting,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => {
                    if actual & STABLE != STABLE
                        || actual & this_waiting == 0
                        || actual & LOCKED_BY_EITHER != 0
                    {
                        return false;
                    }
                    expected = actual;
                }
            }
        }
    }

    /// Stores the node allowed to request bypass of this link. Only the
    /// current lock holder may call this.
    pub fn set_allowed_bypass_request_source(&self, name: NodeName) {
        let bytes = name.to_bytes();
        let lo = u64::from_le_bytes(bytes[..8].try_into().unwrap());
        let hi = u64::from_le_bytes(bytes[8..].try_into().unwrap());
        self.allowed_bypass_request_source[0].store(lo, Ordering::Relaxed);
        self.allowed_bypass_request_source[1].store(hi, Ordering::Relaxed);
        fence(Ordering::Release);
    }

    pub fn allowed_bypass_request_source(&self) -> NodeName {
        fence(Ordering::Acquire);
        let lo = self.allowed_bypass_request_source[0].load(Ordering::Relaxed);
        let hi = self.allowed_bypass_request_source[1].load(Ordering::Relaxed);
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&lo.to_le_bytes());
        bytes[8..].copy_from_slice(&hi.to_le_bytes());
        NodeName::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_requires_both_sides_stable() {
        let state = RouterLinkState::default();
        assert!(!state.try_lock(LinkSide::A));
        state.set_side_stable(LinkSide::A);
        // Other side still unstable: the attempt parks a waiting bit.
        assert!(!state.try_lock(LinkSide::A));
        state.set_side_stable(LinkSide::B);
        assert!(state.reset_waiting_bit(LinkSide::A));
        assert!(state.try_lock(LinkSide::A));
    }

    #[test]
    fn test_lock_is_exclusive() {
        let state = RouterLinkState::default();
        state.mark_fully_stable();
        assert!(state.try_lock(LinkSide::A));
        assert!(state.is_locked_by(LinkSide::A));
        assert!(!state.try_lock(LinkSide::B));
        state.unlock(LinkSide::A);
        assert!(state.try_lock(LinkSide::B));
    }

    #[test]
    fn test_unlock_wrong_side_is_harmless() {
        let state = RouterLinkState::default();
        state.mark_fully_stable();
        assert!(state.try_lock(LinkSide::A));
        state.unlock(LinkSide::B);
        assert!(state.is_locked_by(LinkSide::A));
    }

    #[test]
    fn test_waiting_bit_reset_requires_stability() {
        let state = RouterLinkState::default();
        state.set_side_stable(LinkSide::A);
        assert!(!state.try_lock(LinkSide::A));
        // B is not stable yet, so nothing to reset.
        assert!(!state.reset_waiting_bit(LinkSide::A));
        state.set_side_stable(LinkSide::B);
        assert!(state.reset_waiting_bit(LinkSide::A));
        assert!(!state.reset_waiting_bit(LinkSide::A));
    }

    #[test]
    fn test_bypass_source_round_trip() {
        let state = RouterLinkState::default();
        let name = NodeName::generate();
        state.set_allowed_bypass_request_source(name);
        assert_eq!(state.allowed_bypass_request_source(), name);
    }
}
