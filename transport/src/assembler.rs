use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::checksum::ArqChecksum;
use crate::config::ArqConfig;
use crate::control_messages::{ControlMessageAcks, ControlMessageUna, SegmentHeader};
use crate::encryption::DataEncryption;
use crate::key_exchange::EcdhHandshake;
use crate::packet_header::{ArqFlags, ArqType, Datagram, DatagramHeader, FirstPackageInfo, Section};
use crate::safe_converter::PrecheckedCast;
use crate::seq::Seq;
use crate::seq_manager::SeqManager;

/// IPv4 header plus UDP header
pub const IP_UDP_OVERHEAD: usize = 20 + 8;

struct PendingData {
    data: Bytes,
    discardable: bool,
    expires: Option<Instant>,
}

/// a data section (possibly a segment) that is ready to go out, but has no seq yet
struct ReadySection {
    flags: ArqFlags,
    payload: Bytes,
    expires: Option<Instant>,
}

impl ReadySection {
    fn is_discardable(&self) -> bool {
        self.flags.contains(ArqFlags::DISCARDABLE)
    }
}

/// Collects the sections of one outgoing datagram within the datagram's byte budget. All
///  sections are accounted for with their combined length.
pub struct DatagramBuilder {
    sections: Vec<Section>,
    new_tracked: Vec<(Section, Option<Instant>)>,
    remaining: usize,
}

impl DatagramBuilder {
    pub fn new(budget: usize) -> DatagramBuilder {
        DatagramBuilder {
            sections: Vec::new(),
            new_tracked: Vec::new(),
            remaining: budget,
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn num_sections(&self) -> usize {
        self.sections.len()
    }

    #[cfg(test)]
    pub fn has_new_tracked(&self) -> bool {
        !self.new_tracked.is_empty()
    }

    pub fn fits(&self, section: &Section) -> bool {
        section.combined_len() <= self.remaining
    }

    /// adds a section that was sent before, or that is not tracked
    pub fn push(&mut self, section: Section) -> bool {
        if !self.fits(&section) {
            return false;
        }
        self.remaining -= section.combined_len();
        self.sections.push(section);
        true
    }

    fn push_new(&mut self, section: Section, expires: Option<Instant>) {
        if section.is_tracked() {
            self.new_tracked.push((section.clone(), expires));
        }
        self.remaining -= section.combined_len();
        self.sections.push(section);
    }
}

/// a serialized datagram (without the version byte / encryption envelope)
pub struct PreparedDatagram {
    pub seq: Seq,
    pub plain: Bytes,
    /// tracked sections sent for the first time, to be recorded as unconfirmed
    pub new_tracked: Vec<(Section, Option<Instant>)>,
}

/// Turns outgoing data and control information into datagrams: queues pending data, applies
///  data-level encryption, splits packages that exceed a datagram into segments, assigns
///  sequence numbers and checksums.
pub struct PackageAssembler {
    config: Arc<ArqConfig>,
    protocol_version: u8,
    envelope_overhead: usize,

    checksum: ArqChecksum,
    /// flag FIRST_PACKAGE until the peer has sent any feedback
    first_package_mode: bool,
    last_seq: Seq,
    next_package_id: u16,

    pending: VecDeque<PendingData>,
    ready: VecDeque<ReadySection>,

    data_encryptor: Option<Arc<DataEncryption>>,
}

impl PackageAssembler {
    pub fn new(config: Arc<ArqConfig>) -> PackageAssembler {
        let first_seq = Seq::from_raw(rand::random());
        let protocol_version = config.protocol_version;
        PackageAssembler {
            config,
            protocol_version,
            envelope_overhead: 1,
            checksum: ArqChecksum::new(first_seq, rand::random()),
            first_package_mode: true,
            last_seq: first_seq.prev(),
            next_package_id: rand::random(),
            pending: VecDeque::new(),
            ready: VecDeque::new(),
            data_encryptor: None,
        }
    }

    pub fn first_seq(&self) -> Seq {
        self.checksum.first_seq()
    }

    /// the most recently assigned seq
    pub fn last_seq(&self) -> Seq {
        self.last_seq
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    pub fn set_protocol_version(&mut self, protocol_version: u8) {
        self.protocol_version = protocol_version;
    }

    pub fn set_envelope_overhead(&mut self, envelope_overhead: usize) {
        self.envelope_overhead = envelope_overhead;
    }

    pub fn install_data_encryptor(&mut self, encryptor: Arc<DataEncryption>) {
        self.data_encryptor = Some(encryptor);
    }

    /// the peer established our checksum, so FIRST_PACKAGE is not needed any more
    pub fn feedback_received(&mut self) {
        if self.first_package_mode {
            trace!("peer sent feedback, leaving first package mode");
            self.first_package_mode = false;
        }
    }

    #[cfg(test)]
    pub fn is_first_package_mode(&self) -> bool {
        self.first_package_mode
    }

    /// bytes available for sections in a single datagram
    pub fn datagram_budget(&self) -> usize {
        self.config.mtu
            .saturating_sub(IP_UDP_OVERHEAD)
            .saturating_sub(self.envelope_overhead)
            .saturating_sub(DatagramHeader::MAX_SERIALIZED_LEN)
    }

    pub fn builder(&self) -> DatagramBuilder {
        DatagramBuilder::new(self.datagram_budget())
    }

    pub fn push_data(&mut self, data: Bytes, discardable: bool, expires: Option<Instant>) {
        self.pending.push_back(PendingData { data, discardable, expires });
    }

    pub fn has_pending_data(&self) -> bool {
        !self.pending.is_empty() || !self.ready.is_empty()
    }

    fn assign_seq(&mut self) -> Seq {
        self.last_seq = self.last_seq.next();
        self.last_seq
    }

    /// Moves pending data into the datagram while it fits, adding at most `max_tracked` tracked
    ///  sections. Returns the number of sections added.
    pub fn fill_data(&mut self, builder: &mut DatagramBuilder, max_tracked: usize, now: Instant) -> usize {
        let mut added = 0;
        let mut tracked = 0;
        loop {
            if self.ready.is_empty() && !self.prepare_next_pending(now) {
                break;
            }
            let Some(front) = self.ready.front() else {
                break;
            };
            if front.expires.is_some_and(|e| e <= now) {
                debug!("dropping expired data section");
                self.ready.pop_front();
                continue;
            }
            if Section::COMBINED_HEADER_LEN + front.payload.len() > builder.remaining() {
                break;
            }
            if !front.is_discardable() && tracked >= max_tracked {
                break;
            }

            let Some(ready) = self.ready.pop_front() else {
                break;
            };
            let seq = if ready.is_discardable() {
                self.last_seq
            }
            else {
                tracked += 1;
                self.assign_seq()
            };
            builder.push_new(Section::new(ArqType::Data, ready.flags, seq, ready.payload), ready.expires);
            added += 1;
        }
        added
    }

    /// turns the next pending item into one or more ready sections, returns `false` if there was
    ///  nothing to prepare
    fn prepare_next_pending(&mut self, now: Instant) -> bool {
        while let Some(pending) = self.pending.pop_front() {
            if pending.expires.is_some_and(|e| e <= now) {
                debug!("dropping expired pending data");
                continue;
            }

            let payload = match &self.data_encryptor {
                Some(encryptor) => match encryptor.seal(&pending.data) {
                    Ok(sealed) => sealed,
                    Err(e) => {
                        warn!("error encrypting data package, dropping it: {}", e);
                        continue;
                    }
                },
                None => pending.data,
            };

            let base_flags = if pending.discardable { ArqFlags::DISCARDABLE } else { ArqFlags::empty() };
            if Section::COMBINED_HEADER_LEN + payload.len() <= self.datagram_budget() {
                self.ready.push_back(ReadySection { flags: base_flags, payload, expires: pending.expires });
            }
            else {
                self.segment(payload, base_flags, pending.expires);
            }
            return true;
        }
        false
    }

    fn segment(&mut self, payload: Bytes, base_flags: ArqFlags, expires: Option<Instant>) {
        let budget = self.datagram_budget() - Section::COMBINED_HEADER_LEN;

        let mut size_class = ArqFlags::SEGMENTED_1;
        let (chunk_len, count) = loop {
            let chunk_len = budget - SegmentHeader::serialized_len(size_class);
            let count = payload.len().div_ceil(chunk_len);
            let needed = ArqFlags::segment_size_class((count - 1).prechecked_cast());
            if needed.segment_index_len() <= size_class.segment_index_len() {
                break (chunk_len, count);
            }
            size_class = needed;
        };

        let package_id = self.next_package_id;
        self.next_package_id = self.next_package_id.wrapping_add(1);
        trace!("splitting package {} of {} bytes into {} segments", package_id, payload.len(), count);

        for (index, chunk) in payload.chunks(chunk_len).enumerate() {
            let mut flags = base_flags | size_class;
            if index == count - 1 {
                flags |= ArqFlags::LAST_SEGMENT;
            }
            let mut buf = BytesMut::with_capacity(SegmentHeader::serialized_len(size_class) + chunk.len());
            SegmentHeader { package_id, segment_index: index.prechecked_cast() }.ser(flags, &mut buf);
            buf.extend_from_slice(chunk);
            self.ready.push_back(ReadySection { flags, payload: buf.freeze(), expires });
        }
    }

    /// Adds UNA and as many ACKs as fit. Returns `false` if there was nothing to add.
    pub fn add_feedback(&mut self, builder: &mut DatagramBuilder, seq_manager: &mut SeqManager, full_sync: bool) -> bool {
        let una_len = Section::COMBINED_HEADER_LEN + ControlMessageUna::SERIALIZED_LEN;
        if builder.remaining() < una_len {
            return false;
        }
        let acks_budget = builder.remaining()
            .saturating_sub(una_len)
            .saturating_sub(Section::COMBINED_HEADER_LEN);

        let feedback = seq_manager.take_feedback(acks_budget, full_sync);
        let Some(una) = feedback.una else {
            return false;
        };

        builder.push(self.control_section(ArqType::Una, ControlMessageUna { una }.ser()));
        if !feedback.acks.is_empty() {
            builder.push(self.control_section(ArqType::Acks, ControlMessageAcks { acks: feedback.acks }.ser()));
        }
        true
    }

    /// an untracked section without payload: HEARTBEAT, FORCESYNC or CLOSE
    pub fn add_signal(&mut self, builder: &mut DatagramBuilder, kind: ArqType) -> bool {
        let section = self.control_section(kind, Bytes::new());
        builder.push(section)
    }

    fn control_section(&self, kind: ArqType, payload: Bytes) -> Section {
        Section::new(kind, ArqFlags::DISCARDABLE, self.last_seq, payload)
    }

    /// a datagram with only the (tracked) key exchange section
    pub fn prepare_ecdh(&mut self, handshake: &EcdhHandshake) -> PreparedDatagram {
        let seq = self.assign_seq();
        let mut builder = DatagramBuilder::new(usize::MAX);
        builder.push_new(Section::new(ArqType::Ecdh, ArqFlags::empty(), seq, handshake.ser()), None);
        let mut prepared = self.finish(builder);
        // kept outside the unconfirmed ledger
        prepared.new_tracked.clear();
        prepared
    }

    /// serializes the datagram with checksum (and FIRST_PACKAGE information while needed)
    pub fn finish(&self, builder: DatagramBuilder) -> PreparedDatagram {
        let first_package = self.first_package_mode.then_some(FirstPackageInfo {
            factor: self.checksum.factor(),
            first_seq: self.checksum.first_seq(),
        });

        let mut datagram = Datagram::new(builder.sections, self.last_seq, first_package);
        datagram.header.checksum = self.checksum.gen_checksum(datagram.header.seq, self.protocol_version);

        let mut buf = BytesMut::with_capacity(Datagram::serialized_len(&datagram.sections, first_package.is_some()));
        datagram.ser(&mut buf);
        trace!("prepared datagram {} with sections {:?}", datagram.header.seq, datagram.sections);

        PreparedDatagram {
            seq: datagram.header.seq,
            plain: buf.freeze(),
            new_tracked: builder.new_tracked,
        }
    }
}
