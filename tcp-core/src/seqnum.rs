//! TCP sequence numbers and the modular arithmetic defined over them.
//!
//! (RFC 793 3.3)
//!
//! ```text
//!    This space ranges from 0 to 2**32 - 1. Since the space is finite, all
//!    arithmetic dealing with sequence numbers must be performed modulo
//!    2**32. This unsigned arithmetic preserves the relationship of sequence
//!    numbers as they cycle from 2**32 - 1 to 0 again.
//! ```

use std::fmt;
use std::ops;

/// Sequence number of a transferred TCP segment.
///
/// For any sequence number, there are 2^31 numbers after it and 2^31 - 1
/// numbers before it; `before`/`after` are only meaningful while the values
/// compared stay within that half-range of each other, which the window-size
/// bounds guarantee.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Hash)]
pub struct SeqNum(u32);

impl SeqNum {
    /// Wraps a raw wire value.
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns `true` if `self` precedes `other` in sequence space.
    pub fn before(self, other: SeqNum) -> bool {
        self - other < 0
    }

    /// Returns `true` if `self` follows `other` in sequence space.
    pub fn after(self, other: SeqNum) -> bool {
        self - other > 0
    }

    /// Returns `true` if `self` lies in the window `[first, first + size)`,
    /// evaluated modulo 2^32.
    pub fn in_window(self, first: SeqNum, size: u32) -> bool {
        !self.before(first) && self.before(first + size)
    }
}

impl ops::Add<u32> for SeqNum {
    type Output = SeqNum;

    fn add(self, rhs: u32) -> Self::Output {
        let Self(lhs) = self;
        Self(lhs.wrapping_add(rhs))
    }
}

impl ops::Add<usize> for SeqNum {
    type Output = SeqNum;

    fn add(self, rhs: usize) -> Self::Output {
        // Truncation is exactly the modulo-2^32 semantics: any multiple of
        // 2^32 in `rhs` is a no-op on the sequence circle.
        self + (rhs as u32)
    }
}

impl ops::Sub<u32> for SeqNum {
    type Output = SeqNum;

    fn sub(self, rhs: u32) -> Self::Output {
        let Self(lhs) = self;
        Self(lhs.wrapping_sub(rhs))
    }
}

impl ops::Sub for SeqNum {
    // Subtraction of two points on the circle yields a signed distance.
    type Output = i32;

    fn sub(self, rhs: Self) -> Self::Output {
        let Self(lhs) = self;
        let Self(rhs) = rhs;
        lhs.wrapping_sub(rhs) as i32
    }
}

impl From<u32> for SeqNum {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl From<SeqNum> for u32 {
    fn from(SeqNum(value): SeqNum) -> Self {
        value
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self(value) = self;
        fmt::Display::fmt(value, f)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    /// Payload plus SYN and FIN can never span more than a window, which is
    /// itself bounded below the half-range (RFC 7323 2.3).
    const MAX_SPAN: u32 = (1 << 30) - 1;

    fn arb_seqnum() -> impl Strategy<Value = SeqNum> {
        any::<u32>().prop_map(SeqNum::new)
    }

    #[test]
    fn window_membership() {
        let first = SeqNum::new(u32::MAX - 2);

        // The window [0xFFFF_FFFD, 0xFFFF_FFFD + 6) wraps through zero.
        assert!(first.in_window(first, 6));
        assert!(SeqNum::new(0).in_window(first, 6));
        assert!(SeqNum::new(2).in_window(first, 6));
        assert!(!SeqNum::new(3).in_window(first, 6));
        assert!(!(first - 1).in_window(first, 6));

        // Empty window contains nothing.
        assert!(!first.in_window(first, 0));
    }

    proptest! {
        #[test]
        fn ordering_is_total(a in arb_seqnum(), b in arb_seqnum()) {
            if a == b {
                prop_assert!(!a.before(b) && !b.before(a));
            } else {
                prop_assert!(a.before(b) ^ b.before(a));
            }
        }

        #[test]
        fn before_after_are_inverse(a in arb_seqnum(), b in arb_seqnum()) {
            prop_assert_eq!(a.after(b), b.before(a));
        }

        #[test]
        fn addition_moves_forward(a in arb_seqnum(), n in 1..=MAX_SPAN) {
            prop_assert!(a.before(a + n));
            prop_assert!((a + n).after(a));
        }

        #[test]
        fn subtraction_moves_backward(a in arb_seqnum(), n in 1..=MAX_SPAN) {
            prop_assert!((a - n).before(a));
        }

        #[test]
        fn difference_recovers_distance(a in arb_seqnum(), n in 0..=MAX_SPAN) {
            prop_assert_eq!((a + n) - a, n as i32);
        }

        #[test]
        fn wraps_at_the_half_range(a in arb_seqnum()) {
            prop_assert!(a.before(a + MAX_SPAN));
            prop_assert!(a.after(a + (1u32 << 31) + 1u32));
        }
    }
}
