use std::fmt::{Display, Formatter};

/// A 32 bit packet sequence number. Sequence numbers wrap around, so they are compared by the
///  (unsigned) distance between them rather than by their raw values - there is deliberately no
///  `Ord` implementation.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Seq(u32);

impl Display for Seq {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Seq {
    pub const ZERO: Seq = Seq(0);

    pub fn from_raw(value: u32) -> Seq {
        Seq(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> Seq {
        Seq(self.0.wrapping_add(1))
    }

    pub fn prev(&self) -> Seq {
        Seq(self.0.wrapping_sub(1))
    }

    /// number of increments needed to get from `other` to `self`
    pub fn distance_from(&self, other: Seq) -> u32 {
        self.0.wrapping_sub(other.0)
    }

    /// `true` if `self` was generated after `other`, i.e. if it is less than half the sequence
    ///  space ahead of it
    pub fn is_newer_than(&self, other: Seq) -> bool {
        let delta = self.distance_from(other);
        delta != 0 && delta < 0x8000_0000
    }

    /// `true` if a cumulative acknowledgement up to (and including) `una` covers this sequence
    ///  number
    pub fn is_covered_by(&self, una: Seq) -> bool {
        *self == una || una.distance_from(*self) < self.distance_from(una)
    }

    /// the newer of the two
    pub fn newest(self, other: Seq) -> Seq {
        if other.is_newer_than(self) { other } else { self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::simple(5, 4, true)]
    #[case::simple_reverse(4, 5, false)]
    #[case::equal(7, 7, false)]
    #[case::wrap(0x0000_0005, 0xffff_fff0, true)]
    #[case::wrap_reverse(0xffff_fff0, 0x0000_0005, false)]
    #[case::wrap_zero(0, u32::MAX, true)]
    #[case::half_minus_one(0x7fff_ffff, 0, true)]
    #[case::half(0x8000_0000, 0, false)]
    fn test_is_newer_than(#[case] a: u32, #[case] b: u32, #[case] expected: bool) {
        assert_eq!(Seq::from_raw(a).is_newer_than(Seq::from_raw(b)), expected);
    }

    #[rstest]
    #[case::older(99, 101, true)]
    #[case::same(101, 101, true)]
    #[case::newer(102, 101, false)]
    #[case::much_newer(103, 101, false)]
    #[case::wrapped_older(0xffff_fffe, 2, true)]
    #[case::wrapped_newer(2, 0xffff_fffe, false)]
    fn test_is_covered_by(#[case] seq: u32, #[case] una: u32, #[case] expected: bool) {
        assert_eq!(Seq::from_raw(seq).is_covered_by(Seq::from_raw(una)), expected);
    }

    #[rstest]
    #[case::simple(3, 4)]
    #[case::wrap(u32::MAX, 0)]
    fn test_next_prev(#[case] raw: u32, #[case] expected_next: u32) {
        let seq = Seq::from_raw(raw);
        assert_eq!(seq.next(), Seq::from_raw(expected_next));
        assert_eq!(seq.next().prev(), seq);
        assert_eq!(seq.next().distance_from(seq), 1);
    }

    #[rstest]
    #[case::plain(3, 4, 4)]
    #[case::plain_reverse(4, 3, 4)]
    #[case::wrap(0xffff_fff0, 5, 5)]
    fn test_newest(#[case] a: u32, #[case] b: u32, #[case] expected: u32) {
        assert_eq!(Seq::from_raw(a).newest(Seq::from_raw(b)), Seq::from_raw(expected));
    }
}
