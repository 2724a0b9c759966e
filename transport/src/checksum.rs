use crate::config::ArqConfig;
use crate::seq::Seq;
use crc::{Crc, CRC_8_SMBUS};
use std::time::Duration;
use tokio::time::Instant;

static CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// Lightweight per-session checksum of a datagram's sequence number. This is no cryptographic
///  protection, it filters out stray or blindly spoofed datagrams.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ArqChecksum {
    first_seq: Seq,
    factor: u8,
}

impl ArqChecksum {
    pub fn new(first_seq: Seq, factor: u8) -> ArqChecksum {
        ArqChecksum { first_seq, factor }
    }

    pub fn first_seq(&self) -> Seq {
        self.first_seq
    }

    pub fn factor(&self) -> u8 {
        self.factor
    }

    /// Protocol version 1 derives the checksum from the factor and the sequence number only,
    ///  later versions include the session's first sequence number
    pub fn gen_checksum(&self, seq: Seq, protocol_version: u8) -> u8 {
        let mut digest = CRC8.digest();
        if protocol_version > ArqConfig::PROTOCOL_VERSION_1 {
            digest.update(&self.first_seq.to_raw().to_be_bytes());
        }
        digest.update(&[self.factor]);
        digest.update(&seq.to_raw().to_be_bytes());
        digest.finalize()
    }

    pub fn check(&self, seq: Seq, checksum: u8, protocol_version: u8) -> bool {
        self.gen_checksum(seq, protocol_version) == checksum
    }

    pub fn is_same(&self, first_seq: Seq, factor: u8) -> bool {
        self.first_seq == first_seq && self.factor == factor
    }
}

/// Tracks whether a session is still alive: a session is invalid if it did not receive a valid
///  datagram for too long (with a longer grace period before the first one), or if it received
///  too many invalid datagrams.
pub struct SessionInvalidChecker {
    last_valid: Instant,
    threshold: Duration,
    valid_threshold: Duration,
    invalid_count: u32,
    max_invalid_count: u32,
}

impl SessionInvalidChecker {
    pub fn new(config: &ArqConfig, now: Instant) -> SessionInvalidChecker {
        SessionInvalidChecker {
            last_valid: now,
            threshold: config.max_tolerated_before_first_package,
            valid_threshold: config.max_tolerated_before_valid_package,
            invalid_count: 0,
            max_invalid_count: config.max_invalid_packages,
        }
    }

    pub fn first_package_received(&mut self) {
        self.threshold = self.valid_threshold;
    }

    pub fn update_valid_status(&mut self, now: Instant) {
        self.last_valid = now;
    }

    pub fn update_invalid_count(&mut self) {
        self.invalid_count = self.invalid_count.saturating_add(1);
    }

    pub fn invalid_count(&self) -> u32 {
        self.invalid_count
    }

    pub fn is_invalid(&self, now: Instant) -> bool {
        self.invalid_count > self.max_invalid_count
            || now.saturating_duration_since(self.last_valid) > self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::v1(1)]
    #[case::v2(2)]
    fn test_checksum_roundtrip(#[case] version: u8) {
        let checksum = ArqChecksum::new(Seq::from_raw(1000), 77);
        for raw in [1000u32, 1001, 5000, u32::MAX, 0] {
            let seq = Seq::from_raw(raw);
            let cs = checksum.gen_checksum(seq, version);
            assert!(checksum.check(seq, cs, version));
            assert!(!checksum.check(seq, cs.wrapping_add(1), version));
        }
    }

    #[test]
    fn test_checksum_depends_on_session() {
        let a = ArqChecksum::new(Seq::from_raw(1000), 77);
        let b = ArqChecksum::new(Seq::from_raw(1000), 78);
        let c = ArqChecksum::new(Seq::from_raw(1001), 77);

        let differing_factor = (0..64u32)
            .filter(|&i| a.gen_checksum(Seq::from_raw(i), 2) != b.gen_checksum(Seq::from_raw(i), 2))
            .count();
        let differing_first_seq = (0..64u32)
            .filter(|&i| a.gen_checksum(Seq::from_raw(i), 2) != c.gen_checksum(Seq::from_raw(i), 2))
            .count();
        let differing_first_seq_v1 = (0..64u32)
            .filter(|&i| a.gen_checksum(Seq::from_raw(i), 1) != c.gen_checksum(Seq::from_raw(i), 1))
            .count();

        assert!(differing_factor > 32);
        assert!(differing_first_seq > 32);
        assert_eq!(differing_first_seq_v1, 0);
    }

    #[rstest]
    #[case::same(1000, 77, true)]
    #[case::other_factor(1000, 78, false)]
    #[case::other_seq(1001, 77, false)]
    fn test_is_same(#[case] first_seq: u32, #[case] factor: u8, #[case] expected: bool) {
        let checksum = ArqChecksum::new(Seq::from_raw(1000), 77);
        assert_eq!(checksum.is_same(Seq::from_raw(first_seq), factor), expected);
    }

    #[rstest]
    #[case::fresh(false, 0, 0, false)]
    #[case::before_first_within_grace(false, 29_000, 0, false)]
    #[case::before_first_expired(false, 31_000, 0, true)]
    #[case::after_first_within(true, 19_000, 0, false)]
    #[case::after_first_expired(true, 21_000, 0, true)]
    #[case::invalid_count_at_limit(true, 0, 16, false)]
    #[case::invalid_count_exceeded(true, 0, 17, true)]
    fn test_session_invalid_checker(#[case] first_received: bool, #[case] elapsed_millis: u64, #[case] num_invalid: u32, #[case] expected: bool) {
        let config = ArqConfig::default_lan();
        let start = Instant::now();
        let mut checker = SessionInvalidChecker::new(&config, start);
        if first_received {
            checker.first_package_received();
        }
        for _ in 0..num_invalid {
            checker.update_invalid_count();
        }
        assert_eq!(checker.is_invalid(start + Duration::from_millis(elapsed_millis)), expected);
    }

    #[test]
    fn test_session_valid_status_refreshes() {
        let config = ArqConfig::default_lan();
        let start = Instant::now();
        let mut checker = SessionInvalidChecker::new(&config, start);
        checker.first_package_received();
        checker.update_valid_status(start + Duration::from_secs(15));
        assert!(!checker.is_invalid(start + Duration::from_secs(30)));
        assert!(checker.is_invalid(start + Duration::from_secs(36)));
    }
}
