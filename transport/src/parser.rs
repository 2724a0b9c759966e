use bytes::Bytes;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::checksum::ArqChecksum;
use crate::config::ArqConfig;
use crate::control_messages::{ControlMessageAcks, ControlMessageUna, SegmentHeader};
use crate::encryption::{envelope_version, DataEncryption, PackageEncryption};
use crate::key_exchange::{respond, EcdhHandshake, Role};
use crate::message::{Answer, Message, MessageCodec, Quest};
use crate::packet_header::{ArqFlags, ArqType, Datagram, DatagramHeader, Section};
use crate::reassembly::{SegmentOutcome, SegmentReassembler};
use crate::safe_converter::SafeCast;
use crate::seq::Seq;

/// encryption established by the peer's ECDH handshake, to be used for sending as well
pub struct EstablishedEncryption {
    pub package: Arc<PackageEncryption>,
    pub data: Option<Arc<DataEncryption>>,
}

/// Everything the parser learned from one or more received datagrams. The owner consumes it
///  and resets it before the next round.
#[derive(Default)]
pub struct ParseResult {
    pub quests: Vec<Quest>,
    pub answers: Vec<Answer>,

    /// seqs of our own datagrams that the peer acknowledged individually
    pub received_acks: Vec<Seq>,
    /// newest cumulative acknowledgement of our own datagrams
    pub received_una: Option<Seq>,

    /// tracked seqs of the peer that were received for the first time
    pub new_received_seqs: Vec<Seq>,
    /// at least one tracked seq was received again, i.e. our feedback for it was lost
    pub received_prior_seqs: bool,
    /// the peer's contiguously received seq advanced
    pub una_advanced: bool,

    pub first_package_received: bool,
    pub require_close: bool,
    pub require_keep_link: bool,
    pub require_force_sync: bool,

    pub valid_datagrams: u32,
    pub invalid_datagrams: u32,
    pub peer_protocol_version: Option<u8>,

    pub established_encryption: Option<EstablishedEncryption>,
}

impl ParseResult {
    pub fn reset(&mut self) {
        *self = ParseResult::default();
    }

    /// the peer sent ACKS or UNA, so it established our checksum
    pub fn received_feedback(&self) -> bool {
        self.received_una.is_some() || !self.received_acks.is_empty()
    }

    fn receive_una(&mut self, una: Seq) {
        self.received_una = Some(match self.received_una {
            Some(prev) => prev.newest(una),
            None => una,
        });
    }
}

/// plaintext of a datagram that arrived before the peer's checksum was known
struct PreFirstDatagram {
    received: Instant,
    version: u8,
    encrypted: bool,
    plaintext: Bytes,
}

/// The receiving half of a session: verifies and decodes datagrams, keeps track of the peer's
///  sequence numbers, and reassembles segmented data into messages.
pub struct ArqParser {
    config: Arc<ArqConfig>,
    codec: Arc<dyn MessageCodec>,

    checksum: Option<ArqChecksum>,
    pre_first_cache: VecDeque<PreFirstDatagram>,

    /// the peer's last contiguously received tracked seq, meaningful once the checksum is
    ///  established
    last_seq: Seq,
    /// tracked seqs received beyond `last_seq`
    ahead: FxHashSet<Seq>,
    /// when the current gap before the seqs in `ahead` started
    gap_since: Option<Instant>,

    reassembler: SegmentReassembler,

    package_decryptor: Option<Arc<PackageEncryption>>,
    data_decryptor: Option<Arc<DataEncryption>>,
}

impl ArqParser {
    pub fn new(config: Arc<ArqConfig>, codec: Arc<dyn MessageCodec>) -> ArqParser {
        let reassembler = SegmentReassembler::new(&config);
        ArqParser {
            config,
            codec,
            checksum: None,
            pre_first_cache: VecDeque::new(),
            last_seq: Seq::ZERO,
            ahead: FxHashSet::default(),
            gap_since: None,
            reassembler,
            package_decryptor: None,
            data_decryptor: None,
        }
    }

    /// for the initiator of a key exchange: decrypt everything from now on
    pub fn install_decryptors(&mut self, package: Arc<PackageEncryption>, data: Option<Arc<DataEncryption>>) {
        self.package_decryptor = Some(package);
        self.data_decryptor = data;
    }

    pub fn is_encrypted(&self) -> bool {
        self.package_decryptor.is_some()
    }

    pub fn is_first_package_received(&self) -> bool {
        self.checksum.is_some()
    }

    /// the peer's last contiguously received seq, i.e. the UNA to send as feedback
    pub fn last_contiguous_seq(&self) -> Option<Seq> {
        self.checksum.map(|_| self.last_seq)
    }

    /// tracked seqs received beyond the last contiguous one, in no particular order
    pub fn seqs_ahead(&self) -> Vec<Seq> {
        self.ahead.iter().copied().collect()
    }

    pub fn parse(&mut self, raw: &[u8], now: Instant, result: &mut ParseResult) {
        let Some((version, encrypted)) = envelope_version(raw) else {
            trace!("received empty datagram");
            result.invalid_datagrams += 1;
            return;
        };
        if version != ArqConfig::PROTOCOL_VERSION_1 && version != ArqConfig::PROTOCOL_VERSION_2 {
            debug!("received datagram with unsupported protocol version {}", version);
            result.invalid_datagrams += 1;
            return;
        }

        let plaintext = if encrypted {
            let Some(decryptor) = &self.package_decryptor else {
                debug!("received encrypted datagram without established encryption");
                result.invalid_datagrams += 1;
                return;
            };
            match decryptor.open(raw) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    debug!("error decrypting datagram: {}", e);
                    result.invalid_datagrams += 1;
                    return;
                }
            }
        }
        else {
            Bytes::copy_from_slice(&raw[1..])
        };

        self.process_plaintext(version, encrypted, plaintext, now, result);
    }

    fn process_plaintext(&mut self, version: u8, encrypted: bool, plaintext: Bytes, now: Instant, result: &mut ParseResult) {
        let header = match DatagramHeader::deser(&mut plaintext.clone()) {
            Ok(header) => header,
            Err(e) => {
                debug!("received datagram with invalid header: {}", e);
                result.invalid_datagrams += 1;
                return;
            }
        };

        // the ECDH handshake itself is never encrypted
        if !encrypted && self.package_decryptor.is_some() && header.kind != ArqType::Ecdh {
            debug!("received unencrypted {:?} datagram on an encrypted session", header.kind);
            result.invalid_datagrams += 1;
            return;
        }

        let checksum = match (self.checksum, header.first_package) {
            (Some(checksum), Some(first)) if !checksum.is_same(first.first_seq, first.factor) => {
                debug!("FIRST_PACKAGE datagram with first seq {} conflicts with established first seq {}", first.first_seq, checksum.first_seq());
                result.invalid_datagrams += 1;
                return;
            }
            (Some(checksum), _) => checksum,
            (None, Some(first)) => ArqChecksum::new(first.first_seq, first.factor),
            (None, None) => {
                self.cache_before_first_package(version, encrypted, plaintext, now);
                return;
            }
        };

        if !checksum.check(header.seq, header.checksum, version) {
            debug!("checksum mismatch for datagram with seq {}", header.seq);
            result.invalid_datagrams += 1;
            return;
        }

        let establishing = self.checksum.is_none();
        if establishing {
            debug!("established peer checksum, first seq is {}", checksum.first_seq());
            self.checksum = Some(checksum);
            self.last_seq = checksum.first_seq().prev();
            result.first_package_received = true;
        }

        match Datagram::deser(plaintext) {
            Ok(datagram) => {
                result.valid_datagrams += 1;
                result.peer_protocol_version = Some(version);
                for section in datagram.sections {
                    self.process_section(section, now, result);
                }
            }
            Err(e) => {
                warn!("invalid framing in datagram with valid checksum, closing session: {}", e);
                result.require_close = true;
            }
        }

        if establishing {
            let cached = std::mem::take(&mut self.pre_first_cache);
            if !cached.is_empty() {
                debug!("replaying {} datagrams received before the first package", cached.len());
            }
            for datagram in cached {
                self.process_plaintext(datagram.version, datagram.encrypted, datagram.plaintext, now, result);
            }
        }
    }

    fn cache_before_first_package(&mut self, version: u8, encrypted: bool, plaintext: Bytes, now: Instant) {
        if self.pre_first_cache.len() >= self.config.max_cached_before_first_package {
            debug!("too many datagrams before the first package - dropping");
            return;
        }
        trace!("caching datagram until the first package arrives");
        self.pre_first_cache.push_back(PreFirstDatagram {
            received: now,
            version,
            encrypted,
            plaintext,
        });
    }

    fn process_section(&mut self, section: Section, now: Instant, result: &mut ParseResult) {
        trace!("received section {:?}", section);

        if section.is_tracked() && !self.track_seq(section.seq, now, result) {
            return;
        }

        match section.kind {
            ArqType::Data => self.process_data(section.flags, section.payload, now, result),
            ArqType::Acks => {
                match ControlMessageAcks::deser(&mut section.payload.clone()) {
                    Ok(msg) => result.received_acks.extend(msg.acks),
                    Err(e) => debug!("invalid ACKS section: {}", e),
                }
            }
            ArqType::Una => {
                match ControlMessageUna::deser(&mut section.payload.clone()) {
                    Ok(msg) => result.receive_una(msg.una),
                    Err(e) => debug!("invalid UNA section: {}", e),
                }
            }
            ArqType::Ecdh => self.process_ecdh(section.payload, result),
            ArqType::Heartbeat => result.require_keep_link = true,
            ArqType::ForceSync => result.require_force_sync = true,
            ArqType::Close => {
                debug!("peer closed the session");
                result.require_close = true;
            }
            ArqType::Combined => warn!("unexpected nested combined section"),
        }
    }

    /// returns `true` if the seq was not received before
    fn track_seq(&mut self, seq: Seq, now: Instant, result: &mut ParseResult) -> bool {
        if seq.is_covered_by(self.last_seq) || self.ahead.contains(&seq) {
            trace!("duplicate seq {}", seq);
            result.received_prior_seqs = true;
            return false;
        }
        if seq.distance_from(self.last_seq) > self.config.disordered_seq_window {
            debug!("seq {} is too far ahead of last contiguous seq {} - dropping", seq, self.last_seq);
            return false;
        }

        result.new_received_seqs.push(seq);
        if seq == self.last_seq.next() {
            self.last_seq = seq;
            self.advance_contiguous(now);
            result.una_advanced = true;
        }
        else {
            if self.ahead.is_empty() {
                self.gap_since = Some(now);
            }
            self.ahead.insert(seq);
        }
        true
    }

    fn advance_contiguous(&mut self, now: Instant) {
        while self.ahead.remove(&self.last_seq.next()) {
            self.last_seq = self.last_seq.next();
        }
        self.gap_since = if self.ahead.is_empty() { None } else { Some(now) };
    }

    fn process_data(&mut self, flags: ArqFlags, mut payload: Bytes, now: Instant, result: &mut ParseResult) {
        let data = if flags.is_segmented() {
            let header = match SegmentHeader::deser(flags, &mut payload) {
                Ok(header) => header,
                Err(e) => {
                    debug!("invalid segment header: {}", e);
                    return;
                }
            };
            // every segment carries at least one byte
            let segment_index: usize = header.segment_index.safe_cast();
            if segment_index >= self.config.max_recv_package_length {
                warn!("segment index {} exceeds the maximum package length, closing session", header.segment_index);
                result.require_close = true;
                return;
            }

            let outcome = self.reassembler.add_segment(
                header.package_id,
                header.segment_index,
                flags.contains(ArqFlags::LAST_SEGMENT),
                flags.contains(ArqFlags::DISCARDABLE),
                payload,
                now,
            );
            match outcome {
                Ok(SegmentOutcome::Completed(data)) => data,
                Ok(SegmentOutcome::Pending) | Ok(SegmentOutcome::Ignored) => return,
                Err(e) => {
                    warn!("{}, closing session", e);
                    result.require_close = true;
                    return;
                }
            }
        }
        else {
            payload
        };

        let data = match &self.data_decryptor {
            Some(decryptor) => match decryptor.open(data) {
                Ok(data) => data,
                Err(e) => {
                    debug!("error decrypting data package: {}", e);
                    return;
                }
            },
            None => data,
        };

        match self.codec.decode_all(data) {
            Ok(messages) => {
                for message in messages {
                    match message {
                        Message::Quest(quest) => result.quests.push(quest),
                        Message::Answer(answer) => result.answers.push(answer),
                    }
                }
            }
            Err(e) => debug!("error decoding received data package, dropping it: {}", e),
        }
    }

    /// the responder's side of the key exchange
    fn process_ecdh(&mut self, payload: Bytes, result: &mut ParseResult) {
        let Some(private_key) = &self.config.ecdh_private_key else {
            debug!("received ECDH handshake, but no private key is configured");
            return;
        };
        if self.package_decryptor.is_some() {
            trace!("encryption is already established");
            return;
        }

        let handshake = match EcdhHandshake::deser(payload) {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!("invalid ECDH handshake, closing session: {}", e);
                result.require_close = true;
                return;
            }
        };

        let established = respond(private_key, &handshake.package)
            .and_then(|keys| PackageEncryption::new(&keys, Role::Responder))
            .and_then(|package| {
                let data = match &handshake.data {
                    Some(spec) => {
                        let keys = respond(private_key, spec)?;
                        Some(Arc::new(DataEncryption::new(&keys, Role::Responder)?))
                    }
                    None => None,
                };
                Ok(EstablishedEncryption { package: Arc::new(package), data })
            });

        match established {
            Ok(established) => {
                debug!("established encryption as responder (data encryption: {})", established.data.is_some());
                self.package_decryptor = Some(established.package.clone());
                self.data_decryptor = established.data.clone();
                result.established_encryption = Some(established);
            }
            Err(e) => {
                warn!("key exchange failed, closing session: {}", e);
                result.require_close = true;
            }
        }
    }

    /// Periodic housekeeping: drops stale cached data, and gives up on missing seqs that were
    ///  not received in time. Returns `true` if the last contiguous seq advanced.
    pub fn check_timeouts(&mut self, now: Instant) -> bool {
        self.reassembler.drop_expired(now);

        let max_age = self.config.max_tolerated_before_first_package;
        while let Some(oldest) = self.pre_first_cache.front() {
            if now.saturating_duration_since(oldest.received) <= max_age {
                break;
            }
            self.pre_first_cache.pop_front();
        }

        self.skip_stale_gap(now)
    }

    fn skip_stale_gap(&mut self, now: Instant) -> bool {
        let Some(gap_since) = self.gap_since else {
            return false;
        };
        if now.saturating_duration_since(gap_since) < self.config.max_seq_gap_wait {
            return false;
        }

        let last = self.last_seq;
        let Some(oldest_ahead) = self.ahead.iter()
            .copied()
            .min_by_key(|s| s.distance_from(last))
        else {
            self.gap_since = None;
            return false;
        };

        debug!("giving up on missing seqs {} to {}", last.next(), oldest_ahead.prev());
        self.ahead.remove(&oldest_ahead);
        self.last_seq = oldest_ahead;
        self.advance_contiguous(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::{ArqEncryption, NoEncryption};
    use crate::key_exchange::{initiate, public_key_for, CURVE_X25519};
    use crate::message::{FpnnCodec, MockMessageCodec};
    use anyhow::anyhow;
    use mockall::Sequence;
    use crate::packet_header::FirstPackageInfo;
    use bytes::BytesMut;
    use rstest::rstest;
    use std::time::Duration;

    const FIRST_SEQ: u32 = 1000;
    const FACTOR: u8 = 42;

    fn checksum() -> ArqChecksum {
        ArqChecksum::new(Seq::from_raw(FIRST_SEQ), FACTOR)
    }

    fn parser_with(config: ArqConfig) -> ArqParser {
        ArqParser::new(Arc::new(config), Arc::new(FpnnCodec::new(1024*1024)))
    }

    fn parser() -> ArqParser {
        parser_with(ArqConfig::default_lan())
    }

    fn section(kind: ArqType, flags: ArqFlags, seq: u32, payload: Bytes) -> Section {
        Section::new(kind, flags, Seq::from_raw(seq), payload)
    }

    fn quest_payload(method: &str) -> Bytes {
        FpnnCodec::new(1024).encode(&Message::Quest(Quest {
            method: method.to_string(),
            seq: Some(1),
            payload: Bytes::from_static(b"abc"),
        })).unwrap()
    }

    fn data(seq: u32, method: &str) -> Section {
        section(ArqType::Data, ArqFlags::empty(), seq, quest_payload(method))
    }

    fn datagram_plaintext(sections: Vec<Section>, first: bool, version: u8) -> BytesMut {
        let first_package = first.then_some(FirstPackageInfo { factor: FACTOR, first_seq: Seq::from_raw(FIRST_SEQ) });
        let mut datagram = Datagram::new(sections, Seq::from_raw(FIRST_SEQ - 1), first_package);
        datagram.header.checksum = checksum().gen_checksum(datagram.header.seq, version);
        let mut buf = BytesMut::new();
        datagram.ser(&mut buf);
        buf
    }

    fn datagram(sections: Vec<Section>, first: bool) -> Bytes {
        let buf = datagram_plaintext(sections, first, ArqConfig::PROTOCOL_VERSION_2);
        NoEncryption.seal(ArqConfig::PROTOCOL_VERSION_2, &buf).unwrap()
    }

    fn methods(result: &ParseResult) -> Vec<String> {
        result.quests.iter().map(|q| q.method.clone()).collect()
    }

    fn raw_seqs(seqs: &[Seq]) -> Vec<u32> {
        let mut result = seqs.iter().map(|s| s.to_raw()).collect::<Vec<_>>();
        result.sort();
        result
    }

    #[test]
    fn test_first_package_establishes_checksum() {
        let mut parser = parser();
        let mut result = ParseResult::default();
        assert_eq!(parser.last_contiguous_seq(), None);

        parser.parse(&datagram(vec![data(FIRST_SEQ, "a")], true), Instant::now(), &mut result);

        assert!(result.first_package_received);
        assert!(result.una_advanced);
        assert_eq!(result.valid_datagrams, 1);
        assert_eq!(result.peer_protocol_version, Some(2));
        assert_eq!(methods(&result), vec!["a"]);
        assert_eq!(parser.last_contiguous_seq(), Some(Seq::from_raw(FIRST_SEQ)));
    }

    #[test]
    fn test_cached_until_first_package() {
        let mut parser = parser();
        let mut result = ParseResult::default();
        let now = Instant::now();

        parser.parse(&datagram(vec![data(FIRST_SEQ + 1, "b")], false), now, &mut result);
        parser.parse(&datagram(vec![data(FIRST_SEQ + 2, "c")], false), now, &mut result);
        assert!(result.quests.is_empty());
        assert_eq!(result.valid_datagrams, 0);
        assert_eq!(result.invalid_datagrams, 0);

        parser.parse(&datagram(vec![data(FIRST_SEQ, "a")], true), now, &mut result);
        assert_eq!(methods(&result), vec!["a", "b", "c"]);
        assert_eq!(result.valid_datagrams, 3);
        assert_eq!(parser.last_contiguous_seq(), Some(Seq::from_raw(FIRST_SEQ + 2)));
    }

    #[test]
    fn test_pre_first_cache_is_bounded() {
        let mut parser = parser_with(ArqConfig { max_cached_before_first_package: 1, ..ArqConfig::default_lan() });
        let mut result = ParseResult::default();
        let now = Instant::now();

        parser.parse(&datagram(vec![data(FIRST_SEQ + 1, "b")], false), now, &mut result);
        parser.parse(&datagram(vec![data(FIRST_SEQ + 2, "c")], false), now, &mut result);
        parser.parse(&datagram(vec![data(FIRST_SEQ, "a")], true), now, &mut result);
        assert_eq!(methods(&result), vec!["a", "b"]);
    }

    #[test]
    fn test_pre_first_cache_expires() {
        let mut parser = parser();
        let mut result = ParseResult::default();
        let now = Instant::now();

        parser.parse(&datagram(vec![data(FIRST_SEQ + 1, "b")], false), now, &mut result);
        parser.check_timeouts(now + Duration::from_secs(31));
        parser.parse(&datagram(vec![data(FIRST_SEQ, "a")], true), now + Duration::from_secs(31), &mut result);
        assert_eq!(methods(&result), vec!["a"]);
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut parser = parser();
        let mut result = ParseResult::default();
        let now = Instant::now();

        let mut raw = datagram(vec![data(FIRST_SEQ, "a")], true).to_vec();
        raw[3] ^= 0x55; // checksum byte (after version, type and flags)
        parser.parse(&raw, now, &mut result);
        assert_eq!(result.invalid_datagrams, 1);
        assert!(!parser.is_first_package_received());

        parser.parse(&datagram(vec![data(FIRST_SEQ, "a")], true), now, &mut result);
        let mut raw = datagram(vec![data(FIRST_SEQ + 1, "b")], false).to_vec();
        raw[3] ^= 0x55;
        parser.parse(&raw, now, &mut result);
        assert_eq!(result.invalid_datagrams, 2);
        assert_eq!(methods(&result), vec!["a"]);
    }

    #[test]
    fn test_conflicting_first_package() {
        let mut parser = parser();
        let mut result = ParseResult::default();
        let now = Instant::now();
        parser.parse(&datagram(vec![data(FIRST_SEQ, "a")], true), now, &mut result);

        let other = ArqChecksum::new(Seq::from_raw(5), 1);
        let mut datagram = Datagram::new(vec![data(5, "x")], Seq::from_raw(4), Some(FirstPackageInfo { factor: 1, first_seq: Seq::from_raw(5) }));
        datagram.header.checksum = other.gen_checksum(Seq::from_raw(5), 2);
        let mut buf = BytesMut::new();
        datagram.ser(&mut buf);
        parser.parse(&NoEncryption.seal(2, &buf).unwrap(), now, &mut result);

        assert_eq!(result.invalid_datagrams, 1);
        assert_eq!(methods(&result), vec!["a"]);
    }

    #[test]
    fn test_codec_error_keeps_session() {
        let mut seq = Sequence::new();
        let mut codec = MockMessageCodec::new();
        codec.expect_decode_all()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(anyhow!("corrupt message")));
        codec.expect_decode_all()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|buf| FpnnCodec::new(1024).decode_all(buf));

        let mut parser = ArqParser::new(Arc::new(ArqConfig::default_lan()), Arc::new(codec));
        let mut result = ParseResult::default();
        let now = Instant::now();

        parser.parse(&datagram(vec![data(FIRST_SEQ, "a")], true), now, &mut result);
        assert!(result.quests.is_empty());
        assert_eq!(result.valid_datagrams, 1);
        assert!(!result.require_close);
        assert_eq!(parser.last_contiguous_seq(), Some(Seq::from_raw(FIRST_SEQ)));

        parser.parse(&datagram(vec![data(FIRST_SEQ + 1, "b")], false), now, &mut result);
        assert_eq!(methods(&result), vec!["b"]);
        assert_eq!(result.valid_datagrams, 2);
        assert_eq!(result.invalid_datagrams, 0);
        assert!(!result.require_close);
        assert_eq!(parser.last_contiguous_seq(), Some(Seq::from_raw(FIRST_SEQ + 1)));
    }

    #[rstest]
    #[case::v1(ArqConfig::PROTOCOL_VERSION_1)]
    #[case::v2(ArqConfig::PROTOCOL_VERSION_2)]
    fn test_protocol_versions(#[case] version: u8) {
        let mut parser = parser();
        let mut result = ParseResult::default();

        let buf = datagram_plaintext(vec![data(FIRST_SEQ, "a")], true, version);
        parser.parse(&NoEncryption.seal(version, &buf).unwrap(), Instant::now(), &mut result);
        assert_eq!(result.peer_protocol_version, Some(version));
        assert_eq!(methods(&result), vec!["a"]);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::version_0(vec![0, 1, 0, 0, 0, 0, 0, 0, 1])]
    #[case::version_9(vec![9, 1, 0, 0, 0, 0, 0, 0, 1])]
    #[case::encrypted_without_key(vec![0x82; 40])]
    #[case::short_header(vec![2, 1, 0, 0])]
    fn test_invalid_datagrams(#[case] raw: Vec<u8>) {
        let mut parser = parser();
        let mut result = ParseResult::default();
        parser.parse(&raw, Instant::now(), &mut result);
        assert_eq!(result.invalid_datagrams, 1);
        assert_eq!(result.valid_datagrams, 0);
    }

    #[test]
    fn test_out_of_order_and_duplicates() {
        let mut parser = parser();
        let mut result = ParseResult::default();
        let now = Instant::now();

        parser.parse(&datagram(vec![data(FIRST_SEQ, "a")], true), now, &mut result);
        result.reset();

        parser.parse(&datagram(vec![data(FIRST_SEQ + 2, "c")], false), now, &mut result);
        assert!(!result.una_advanced);
        assert_eq!(raw_seqs(&result.new_received_seqs), vec![FIRST_SEQ + 2]);
        assert_eq!(parser.last_contiguous_seq(), Some(Seq::from_raw(FIRST_SEQ)));
        assert_eq!(raw_seqs(&parser.seqs_ahead()), vec![FIRST_SEQ + 2]);

        parser.parse(&datagram(vec![data(FIRST_SEQ + 1, "b")], false), now, &mut result);
        assert!(result.una_advanced);
        assert!(!result.received_prior_seqs);
        assert_eq!(parser.last_contiguous_seq(), Some(Seq::from_raw(FIRST_SEQ + 2)));
        assert!(parser.seqs_ahead().is_empty());
        assert_eq!(methods(&result), vec!["c", "b"]);

        result.reset();
        parser.parse(&datagram(vec![data(FIRST_SEQ + 1, "b")], false), now, &mut result);
        assert!(result.received_prior_seqs);
        assert!(result.quests.is_empty());
        assert!(result.new_received_seqs.is_empty());
        assert_eq!(result.valid_datagrams, 1);
    }

    #[test]
    fn test_duplicate_ahead() {
        let mut parser = parser();
        let mut result = ParseResult::default();
        let now = Instant::now();
        parser.parse(&datagram(vec![data(FIRST_SEQ, "a")], true), now, &mut result);
        parser.parse(&datagram(vec![data(FIRST_SEQ + 5, "f")], false), now, &mut result);
        result.reset();

        parser.parse(&datagram(vec![data(FIRST_SEQ + 5, "f")], false), now, &mut result);
        assert!(result.received_prior_seqs);
        assert!(result.quests.is_empty());
    }

    #[test]
    fn test_outside_window() {
        let mut parser = parser_with(ArqConfig { disordered_seq_window: 400, ..ArqConfig::default_lan() });
        let mut result = ParseResult::default();
        let now = Instant::now();
        parser.parse(&datagram(vec![data(FIRST_SEQ, "a")], true), now, &mut result);
        result.reset();

        parser.parse(&datagram(vec![data(FIRST_SEQ + 401, "x")], false), now, &mut result);
        assert!(result.quests.is_empty());
        assert!(result.new_received_seqs.is_empty());
        assert!(!result.received_prior_seqs);

        parser.parse(&datagram(vec![data(FIRST_SEQ + 400, "y")], false), now, &mut result);
        assert_eq!(methods(&result), vec!["y"]);
    }

    #[test]
    fn test_skip_stale_gap() {
        let mut parser = parser();
        let mut result = ParseResult::default();
        let now = Instant::now();
        parser.parse(&datagram(vec![data(FIRST_SEQ, "a")], true), now, &mut result);
        parser.parse(&datagram(vec![data(FIRST_SEQ + 3, "d")], false), now, &mut result);
        parser.parse(&datagram(vec![data(FIRST_SEQ + 4, "e")], false), now, &mut result);
        parser.parse(&datagram(vec![data(FIRST_SEQ + 7, "h")], false), now, &mut result);

        assert!(!parser.check_timeouts(now + Duration::from_secs(14)));
        assert_eq!(parser.last_contiguous_seq(), Some(Seq::from_raw(FIRST_SEQ)));

        assert!(parser.check_timeouts(now + Duration::from_secs(15)));
        assert_eq!(parser.last_contiguous_seq(), Some(Seq::from_raw(FIRST_SEQ + 4)));
        assert_eq!(raw_seqs(&parser.seqs_ahead()), vec![FIRST_SEQ + 7]);

        // the next gap waits from the time the previous one was skipped
        assert!(!parser.check_timeouts(now + Duration::from_secs(29)));
        assert!(parser.check_timeouts(now + Duration::from_secs(30)));
        assert_eq!(parser.last_contiguous_seq(), Some(Seq::from_raw(FIRST_SEQ + 7)));
        assert!(!parser.check_timeouts(now + Duration::from_secs(100)));

        // skipped seqs count as received
        result.reset();
        parser.parse(&datagram(vec![data(FIRST_SEQ + 1, "b")], false), now, &mut result);
        assert!(result.received_prior_seqs);
        assert!(result.quests.is_empty());
    }

    #[test]
    fn test_control_sections() {
        let mut parser = parser();
        let mut result = ParseResult::default();
        let now = Instant::now();

        let acks = ControlMessageAcks { acks: vec![Seq::from_raw(7), Seq::from_raw(9)] };
        let sections = vec![
            section(ArqType::Una, ArqFlags::DISCARDABLE, FIRST_SEQ - 1, ControlMessageUna { una: Seq::from_raw(5) }.ser()),
            section(ArqType::Acks, ArqFlags::DISCARDABLE, FIRST_SEQ - 1, acks.ser()),
            section(ArqType::Una, ArqFlags::DISCARDABLE, FIRST_SEQ - 1, ControlMessageUna { una: Seq::from_raw(4) }.ser()),
            section(ArqType::Heartbeat, ArqFlags::DISCARDABLE, FIRST_SEQ - 1, Bytes::new()),
            section(ArqType::ForceSync, ArqFlags::DISCARDABLE, FIRST_SEQ - 1, Bytes::new()),
        ];
        parser.parse(&datagram(sections, true), now, &mut result);

        assert!(result.received_feedback());
        assert_eq!(result.received_una, Some(Seq::from_raw(5)));
        assert_eq!(result.received_acks, vec![Seq::from_raw(7), Seq::from_raw(9)]);
        assert!(result.require_keep_link);
        assert!(result.require_force_sync);
        assert!(!result.require_close);
        assert!(!result.una_advanced);
        assert!(result.new_received_seqs.is_empty());

        result.reset();
        parser.parse(&datagram(vec![section(ArqType::Close, ArqFlags::empty(), FIRST_SEQ, Bytes::new())], false), now, &mut result);
        assert!(result.require_close);
        assert!(result.una_advanced);
    }

    #[test]
    fn test_framing_error_requires_close() {
        let mut parser = parser();
        let mut result = ParseResult::default();

        let mut buf = datagram_plaintext(vec![data(FIRST_SEQ, "a"), data(FIRST_SEQ + 1, "b")], true, 2);
        buf.truncate(buf.len() - 3);
        parser.parse(&NoEncryption.seal(2, &buf).unwrap(), Instant::now(), &mut result);

        assert!(result.require_close);
        assert!(result.quests.is_empty());
    }

    #[test]
    fn test_undecodable_data_is_dropped() {
        let mut parser = parser();
        let mut result = ParseResult::default();

        let garbage = section(ArqType::Data, ArqFlags::empty(), FIRST_SEQ, Bytes::from_static(b"garbage"));
        parser.parse(&datagram(vec![garbage, data(FIRST_SEQ + 1, "b")], true), Instant::now(), &mut result);

        assert!(!result.require_close);
        assert_eq!(methods(&result), vec!["b"]);
        assert_eq!(parser.last_contiguous_seq(), Some(Seq::from_raw(FIRST_SEQ + 1)));
    }

    fn segment(seq: u32, package_id: u16, index: u32, last: bool, data: &[u8]) -> Section {
        let mut flags = ArqFlags::SEGMENTED_1;
        if last {
            flags |= ArqFlags::LAST_SEGMENT;
        }
        let mut buf = BytesMut::new();
        SegmentHeader { package_id, segment_index: index }.ser(flags, &mut buf);
        buf.extend_from_slice(data);
        section(ArqType::Data, flags, seq, buf.freeze())
    }

    #[test]
    fn test_segmented_data() {
        let mut parser = parser();
        let mut result = ParseResult::default();
        let now = Instant::now();

        let payload = quest_payload("segmented");
        let (a, rest) = payload.split_at(5);
        let (b, c) = rest.split_at(5);

        parser.parse(&datagram(vec![segment(FIRST_SEQ, 3, 0, false, a)], true), now, &mut result);
        parser.parse(&datagram(vec![segment(FIRST_SEQ + 2, 3, 2, true, c)], false), now, &mut result);
        assert!(result.quests.is_empty());

        // a resent segment must not confuse reassembly
        parser.parse(&datagram(vec![segment(FIRST_SEQ, 3, 0, false, a)], false), now, &mut result);
        parser.parse(&datagram(vec![segment(FIRST_SEQ + 1, 3, 1, false, b)], false), now, &mut result);
        assert_eq!(methods(&result), vec!["segmented"]);
    }

    #[test]
    fn test_oversized_segmented_package() {
        let mut parser = parser_with(ArqConfig { max_recv_package_length: 1500, ..ArqConfig::default_lan() });
        let mut result = ParseResult::default();
        let now = Instant::now();

        parser.parse(&datagram(vec![segment(FIRST_SEQ, 3, 0, false, &[1; 1000])], true), now, &mut result);
        assert!(!result.require_close);
        parser.parse(&datagram(vec![segment(FIRST_SEQ + 1, 3, 1, false, &[1; 1000])], false), now, &mut result);
        assert!(result.require_close);
    }

    #[test]
    fn test_package_encryption() {
        let keys = crate::key_exchange::KeyMaterial { key: vec![9; 16], iv: [3; 12] };
        let initiator = PackageEncryption::new(&keys, Role::Initiator).unwrap();
        let responder = Arc::new(PackageEncryption::new(&keys, Role::Responder).unwrap());

        let mut parser = parser();
        parser.install_decryptors(responder, None);
        assert!(parser.is_encrypted());
        let mut result = ParseResult::default();
        let now = Instant::now();

        parser.parse(&datagram(vec![data(FIRST_SEQ, "plain")], true), now, &mut result);
        assert_eq!(result.invalid_datagrams, 1);

        let buf = datagram_plaintext(vec![data(FIRST_SEQ, "a")], true, 2);
        parser.parse(&initiator.seal(2, &buf).unwrap(), now, &mut result);
        assert_eq!(methods(&result), vec!["a"]);
    }

    #[rstest]
    #[case::package_only(false)]
    #[case::with_data(true)]
    fn test_ecdh_as_responder(#[case] with_data: bool) {
        let server_private = [11u8; 32];
        let server_public = public_key_for(&server_private);
        let (package_spec, package_keys) = initiate(CURVE_X25519, &server_public, true).unwrap();
        let data_exchange = with_data.then(|| initiate(CURVE_X25519, &server_public, false).unwrap());

        let handshake = EcdhHandshake {
            package: package_spec,
            data: data_exchange.as_ref().map(|(spec, _)| spec.clone()),
        };

        let mut parser = parser_with(ArqConfig { ecdh_private_key: Some(server_private), ..ArqConfig::default_lan() });
        let mut result = ParseResult::default();
        let now = Instant::now();
        parser.parse(&datagram(vec![section(ArqType::Ecdh, ArqFlags::empty(), FIRST_SEQ, handshake.ser())], true), now, &mut result);

        let established = result.established_encryption.take().unwrap();
        assert!(established.package.is_encrypting());
        assert_eq!(established.data.is_some(), with_data);
        assert!(parser.is_encrypted());
        assert_eq!(parser.last_contiguous_seq(), Some(Seq::from_raw(FIRST_SEQ)));

        // the initiator's encrypted traffic can be read now
        let initiator = PackageEncryption::new(&package_keys, Role::Initiator).unwrap();
        let mut payload = quest_payload("secret");
        if let Some((_, data_keys)) = &data_exchange {
            payload = DataEncryption::new(data_keys, Role::Initiator).unwrap().seal(&payload).unwrap();
        }
        let buf = datagram_plaintext(vec![section(ArqType::Data, ArqFlags::empty(), FIRST_SEQ + 1, payload)], false, 2);
        parser.parse(&initiator.seal(2, &buf).unwrap(), now, &mut result);
        assert_eq!(methods(&result), vec!["secret"]);

        // a resent handshake is accepted unencrypted, but does not re-key
        result.reset();
        parser.parse(&datagram(vec![section(ArqType::Ecdh, ArqFlags::empty(), FIRST_SEQ, handshake.ser())], false), now, &mut result);
        assert!(result.received_prior_seqs);
        assert!(result.established_encryption.is_none());
        assert_eq!(result.invalid_datagrams, 0);
    }

    #[test]
    fn test_ecdh_without_private_key() {
        let (spec, _) = initiate(CURVE_X25519, &public_key_for(&[11u8; 32]), false).unwrap();
        let handshake = EcdhHandshake { package: spec, data: None };

        let mut parser = parser();
        let mut result = ParseResult::default();
        parser.parse(&datagram(vec![section(ArqType::Ecdh, ArqFlags::empty(), FIRST_SEQ, handshake.ser())], true), Instant::now(), &mut result);

        assert!(result.established_encryption.is_none());
        assert!(!parser.is_encrypted());
        assert!(!result.require_close);
    }
}
