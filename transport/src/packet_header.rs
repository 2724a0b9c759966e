use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::seq::Seq;
use anyhow::{anyhow, bail};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Debug, Formatter};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ArqType {
    Combined = 0x80,
    Data = 0x01,
    Acks = 0x02,
    Una = 0x03,
    Ecdh = 0x04,
    Heartbeat = 0x05,
    ForceSync = 0x06,
    Close = 0x0F,
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
    pub struct ArqFlags: u8 {
        const DISCARDABLE = 0x01;
        const MONITORED = 0x02;

        const MASK_SEGMENTED = 0x0c;
        const SEGMENTED_1 = 0x04;
        const SEGMENTED_2 = 0x08;
        const SEGMENTED_4 = 0x0c;

        const LAST_SEGMENT = 0x10;
        const FIRST_PACKAGE = 0x20;
    }
}

impl ArqFlags {
    pub fn is_segmented(&self) -> bool {
        self.intersects(ArqFlags::MASK_SEGMENTED)
    }

    /// number of bytes used for encoding the segment index, 0 for unsegmented packages
    pub fn segment_index_len(&self) -> usize {
        match (*self & ArqFlags::MASK_SEGMENTED).bits() {
            0x04 => 1,
            0x08 => 2,
            0x0c => 4,
            _ => 0,
        }
    }

    /// the smallest segment size class that can hold all indexes up to `max_index`
    pub fn segment_size_class(max_index: u32) -> ArqFlags {
        if max_index <= u8::MAX as u32 {
            ArqFlags::SEGMENTED_1
        }
        else if max_index <= u16::MAX as u32 {
            ArqFlags::SEGMENTED_2
        }
        else {
            ArqFlags::SEGMENTED_4
        }
    }
}

/// A logical packet. A datagram carries either a single section (with the section's type, flags
///  and seq in the datagram header) or several of them in a COMBINED datagram.
///
/// Sections without the DISCARDABLE flag are *tracked*: they have their own sequence number and
///  are resent until the peer acknowledges them. Discardable sections are sent once and carry the
///  sender's most recently assigned sequence number, which the receiver ignores.
#[derive(Clone, Eq, PartialEq)]
pub struct Section {
    pub kind: ArqType,
    pub flags: ArqFlags,
    pub seq: Seq,
    pub payload: Bytes,
}
impl Debug for Section {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}@{}[{:02x}]({} bytes)", self.kind, self.seq, self.flags.bits(), self.payload.len())
    }
}

impl Section {
    /// type + flags + seq + payload length
    pub const COMBINED_HEADER_LEN: usize = 1 + 1 + size_of::<u32>() + size_of::<u16>();

    pub fn new(kind: ArqType, flags: ArqFlags, seq: Seq, payload: Bytes) -> Section {
        Section { kind, flags, seq, payload }
    }

    pub fn is_tracked(&self) -> bool {
        !self.flags.contains(ArqFlags::DISCARDABLE)
    }

    pub fn combined_len(&self) -> usize {
        Self::COMBINED_HEADER_LEN + self.payload.len()
    }

    pub fn ser_combined(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind.into());
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.seq.to_raw());
        buf.put_u16(self.payload.len().prechecked_cast());
        buf.put_slice(&self.payload);
    }

    pub fn deser_combined(buf: &mut Bytes) -> anyhow::Result<Section> {
        let raw_kind = buf.try_get_u8()?;
        let kind = ArqType::try_from(raw_kind)
            .map_err(|_| anyhow!("unknown section type {:x}", raw_kind))?;
        if kind == ArqType::Combined {
            bail!("nested combined section");
        }
        let flags = ArqFlags::from_bits_truncate(buf.try_get_u8()?);
        let seq = Seq::from_raw(buf.try_get_u32()?);
        let len: usize = buf.try_get_u16()?.safe_cast();
        if len > buf.remaining() {
            bail!("section length {} exceeds remaining datagram length {}", len, buf.remaining());
        }
        let payload = buf.split_to(len);

        Ok(Section { kind, flags, seq, payload })
    }
}

/// sent by a side until it knows that its peer established the checksum
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FirstPackageInfo {
    pub factor: u8,
    pub first_seq: Seq,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DatagramHeader {
    pub kind: ArqType,
    pub flags: ArqFlags,
    pub checksum: u8,
    pub seq: Seq,
    pub first_package: Option<FirstPackageInfo>,
}

impl DatagramHeader {
    pub const SERIALIZED_LEN: usize = 1 + 1 + 1 + 1 + size_of::<u32>();
    pub const FIRST_PACKAGE_EXTENSION_LEN: usize = 1 + size_of::<u32>();
    pub const MAX_SERIALIZED_LEN: usize = Self::SERIALIZED_LEN + Self::FIRST_PACKAGE_EXTENSION_LEN;

    pub fn serialized_len(&self) -> usize {
        match self.first_package {
            Some(_) => Self::MAX_SERIALIZED_LEN,
            None => Self::SERIALIZED_LEN,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let flags = match self.first_package {
            Some(_) => self.flags | ArqFlags::FIRST_PACKAGE,
            None => self.flags - ArqFlags::FIRST_PACKAGE,
        };
        buf.put_u8(self.kind.into());
        buf.put_u8(flags.bits());
        buf.put_u8(self.checksum);
        buf.put_u8(0);
        buf.put_u32(self.seq.to_raw());
        if let Some(first) = &self.first_package {
            buf.put_u8(first.factor);
            buf.put_u32(first.first_seq.to_raw());
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DatagramHeader> {
        let raw_kind = buf.try_get_u8()?;
        let kind = ArqType::try_from(raw_kind)
            .map_err(|_| anyhow!("unknown packet type {:x}", raw_kind))?;
        let flags = ArqFlags::from_bits_truncate(buf.try_get_u8()?);
        let checksum = buf.try_get_u8()?;
        let _reserved = buf.try_get_u8()?;
        let seq = Seq::from_raw(buf.try_get_u32()?);
        let first_package = if flags.contains(ArqFlags::FIRST_PACKAGE) {
            Some(FirstPackageInfo {
                factor: buf.try_get_u8()?,
                first_seq: Seq::from_raw(buf.try_get_u32()?),
            })
        }
        else {
            None
        };

        Ok(DatagramHeader {
            kind,
            flags: flags - ArqFlags::FIRST_PACKAGE,
            checksum,
            seq,
            first_package,
        })
    }
}

/// A datagram's plaintext, i.e. everything after the version byte (and after decryption)
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Datagram {
    pub header: DatagramHeader,
    pub sections: Vec<Section>,
}

impl Datagram {
    /// Combines sections into a datagram. The header's seq is the first tracked section's seq,
    ///  or `fallback_seq` if there is no tracked section. The checksum is filled in by the caller.
    pub fn new(sections: Vec<Section>, fallback_seq: Seq, first_package: Option<FirstPackageInfo>) -> Datagram {
        assert!(!sections.is_empty());

        let header = if sections.len() == 1 {
            DatagramHeader {
                kind: sections[0].kind,
                flags: sections[0].flags,
                checksum: 0,
                seq: sections[0].seq,
                first_package,
            }
        }
        else {
            let seq = sections.iter()
                .find(|s| s.is_tracked())
                .map(|s| s.seq)
                .unwrap_or(fallback_seq);
            DatagramHeader {
                kind: ArqType::Combined,
                flags: ArqFlags::empty(),
                checksum: 0,
                seq,
                first_package,
            }
        };

        Datagram { header, sections }
    }

    /// serialized length of a datagram with these sections
    pub fn serialized_len(sections: &[Section], first_package: bool) -> usize {
        let header_len = if first_package { DatagramHeader::MAX_SERIALIZED_LEN } else { DatagramHeader::SERIALIZED_LEN };
        match sections {
            [single] => header_len + single.payload.len(),
            _ => header_len + sections.iter().map(|s| s.combined_len()).sum::<usize>(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.header.ser(buf);
        if self.header.kind == ArqType::Combined {
            for section in &self.sections {
                section.ser_combined(buf);
            }
        }
        else {
            buf.put_slice(&self.sections[0].payload);
        }
    }

    pub fn deser(mut buf: Bytes) -> anyhow::Result<Datagram> {
        let header = DatagramHeader::deser(&mut buf)?;

        let sections = if header.kind == ArqType::Combined {
            let mut sections = Vec::new();
            while buf.has_remaining() {
                sections.push(Section::deser_combined(&mut buf)?);
            }
            if sections.is_empty() {
                bail!("combined datagram without sections");
            }
            sections
        }
        else {
            vec![Section {
                kind: header.kind,
                flags: header.flags,
                seq: header.seq,
                payload: buf,
            }]
        };

        Ok(Datagram { header, sections })
    }
}
