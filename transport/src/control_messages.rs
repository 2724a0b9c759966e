use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crate::packet_header::ArqFlags;
use crate::safe_converter::PrecheckedCast;
use crate::seq::Seq;

/// Individually acknowledged sequence numbers, typically those received beyond the UNA
///  boundary
///
/// ```ascii
/// 0: number of acknowledged seqs (varint)
/// *: (repeated) acknowledged seq (u32)
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ControlMessageAcks {
    pub acks: Vec<Seq>,
}

impl ControlMessageAcks {
    pub fn serialized_len(num_acks: usize) -> usize {
        Self::varint_len(num_acks) + num_acks * size_of::<u32>()
    }

    /// the maximum number of acks that fit into `available` bytes
    pub fn max_acks_for(available: usize) -> usize {
        let mut n = available / size_of::<u32>();
        while n > 0 && Self::serialized_len(n) > available {
            n -= 1;
        }
        n
    }

    fn varint_len(value: usize) -> usize {
        let mut len = 1;
        let mut v = value >> 7;
        while v > 0 {
            len += 1;
            v >>= 7;
        }
        len
    }

    pub fn ser(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::serialized_len(self.acks.len()));
        buf.put_usize_varint(self.acks.len());
        for seq in &self.acks {
            buf.put_u32(seq.to_raw());
        }
        buf.freeze()
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ControlMessageAcks> {
        let num_acks = buf.try_get_usize_varint()?;
        if num_acks > buf.remaining() / size_of::<u32>() {
            bail!("ack count {} exceeds the section length", num_acks);
        }
        let mut acks = Vec::with_capacity(num_acks);
        for _ in 0..num_acks {
            acks.push(Seq::from_raw(buf.try_get_u32()?));
        }
        Ok(ControlMessageAcks { acks })
    }
}

/// cumulative acknowledgement: all tracked seqs up to and including `una` were received
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ControlMessageUna {
    pub una: Seq,
}

impl ControlMessageUna {
    pub const SERIALIZED_LEN: usize = size_of::<u32>();

    pub fn ser(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN);
        buf.put_u32(self.una.to_raw());
        buf.freeze()
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ControlMessageUna> {
        Ok(ControlMessageUna {
            una: Seq::from_raw(buf.try_get_u32()?),
        })
    }
}

/// prefix of a segmented DATA section
///
/// ```ascii
/// 0: package id (u16)
/// 2: segment index (u8, u16 or u32 depending on the section's segment size class)
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SegmentHeader {
    pub package_id: u16,
    pub segment_index: u32,
}

impl SegmentHeader {
    pub const MAX_SERIALIZED_LEN: usize = size_of::<u16>() + size_of::<u32>();

    pub fn serialized_len(flags: ArqFlags) -> usize {
        size_of::<u16>() + flags.segment_index_len()
    }

    pub fn ser(&self, flags: ArqFlags, buf: &mut BytesMut) {
        buf.put_u16(self.package_id);
        match flags.segment_index_len() {
            1 => buf.put_u8(self.segment_index.prechecked_cast()),
            2 => buf.put_u16(self.segment_index.prechecked_cast()),
            _ => buf.put_u32(self.segment_index),
        }
    }

    pub fn deser(flags: ArqFlags, buf: &mut impl Buf) -> anyhow::Result<SegmentHeader> {
        let package_id = buf.try_get_u16()?;
        let segment_index = match flags.segment_index_len() {
            1 => buf.try_get_u8()? as u32,
            2 => buf.try_get_u16()? as u32,
            4 => buf.try_get_u32()?,
            _ => bail!("section is not segmented"),
        };
        Ok(SegmentHeader { package_id, segment_index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(vec![], vec![0])]
    #[case::one(vec![5], vec![1, 0,0,0,5])]
    #[case::two(vec![5, 0xffff_ffff], vec![2, 0,0,0,5, 255,255,255,255])]
    fn test_acks_ser(#[case] acks: Vec<u32>, #[case] expected: Vec<u8>) {
        let msg = ControlMessageAcks { acks: acks.into_iter().map(Seq::from_raw).collect() };
        let buf = msg.ser();
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(ControlMessageAcks::serialized_len(msg.acks.len()), expected.len());

        let mut b: &[u8] = &buf;
        assert_eq!(ControlMessageAcks::deser(&mut b).unwrap(), msg);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::count_too_big(vec![3, 0,0,0,5])]
    #[case::truncated(vec![1, 0,0])]
    fn test_acks_deser_invalid(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        assert!(ControlMessageAcks::deser(&mut b).is_err());
    }

    #[rstest]
    #[case::nothing(0, 0)]
    #[case::too_small(4, 0)]
    #[case::one(5, 1)]
    #[case::one_and_a_bit(8, 1)]
    #[case::small(509, 127)]
    #[case::varint_boundary(513, 127)]
    #[case::two_byte_varint(514, 128)]
    fn test_max_acks_for(#[case] available: usize, #[case] expected: usize) {
        assert_eq!(ControlMessageAcks::max_acks_for(available), expected);
    }

    #[test]
    fn test_una_ser() {
        let msg = ControlMessageUna { una: Seq::from_raw(0x01020304) };
        let buf = msg.ser();
        assert_eq!(buf.as_ref(), &[1, 2, 3, 4]);
        let mut b: &[u8] = &buf;
        assert_eq!(ControlMessageUna::deser(&mut b).unwrap(), msg);
    }

    #[rstest]
    #[case::one_byte(ArqFlags::SEGMENTED_1, 9, 200, vec![0,9, 200])]
    #[case::two_bytes(ArqFlags::SEGMENTED_2, 9, 300, vec![0,9, 1,44])]
    #[case::four_bytes(ArqFlags::SEGMENTED_4 | ArqFlags::LAST_SEGMENT, 0xffff, 70000, vec![255,255, 0,1,17,112])]
    fn test_segment_header_ser(#[case] flags: ArqFlags, #[case] package_id: u16, #[case] segment_index: u32, #[case] expected: Vec<u8>) {
        let header = SegmentHeader { package_id, segment_index };
        let mut buf = BytesMut::new();
        header.ser(flags, &mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(SegmentHeader::serialized_len(flags), expected.len());

        let mut b: &[u8] = &buf;
        assert_eq!(SegmentHeader::deser(flags, &mut b).unwrap(), header);
    }

    #[test]
    fn test_segment_header_unsegmented() {
        let mut b: &[u8] = &[0, 1, 2];
        assert!(SegmentHeader::deser(ArqFlags::empty(), &mut b).is_err());
    }
}
