use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::safe_converter::{PrecheckedCast, SafeCast};

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageType {
    OneWayQuest = 0,
    TwoWayQuest = 1,
    Answer = 2,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Quest {
    pub method: String,
    /// `None` for one-way quests that expect no answer
    pub seq: Option<u32>,
    pub payload: Bytes,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Answer {
    pub seq: u32,
    pub status: u8,
    pub payload: Bytes,
}

impl Answer {
    pub const STATUS_OK: u8 = 0;
    pub const STATUS_ERROR: u8 = 1;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    Quest(Quest),
    Answer(Answer),
}

/// The application level message encoding. The ARQ engine only transports opaque byte buffers,
///  and it relies on this to split a received buffer into messages.
#[cfg_attr(test, automock)]
pub trait MessageCodec: Send + Sync + 'static {
    fn encode(&self, message: &Message) -> anyhow::Result<Bytes>;

    /// A reassembled package can contain several messages back to back
    fn decode_all(&self, buf: Bytes) -> anyhow::Result<Vec<Message>>;
}

/// Message header, all numbers in network byte order:
/// ```ascii
///  0: magic "FPNN"
///  4: version (u8)
///  5: flags (u8), currently unused
///  6: message type (u8): 0 one-way quest, 1 two-way quest, 2 answer
///  7: 'ss' (u8): length of the method name for quests, status for answers
///  8: payload length (u32)
/// 12: seq (u32) for two-way quests and answers
///  *: method name (quests only)
///  *: payload
/// ```
pub struct FpnnCodec {
    max_message_len: usize,
}

impl FpnnCodec {
    pub const MAGIC: &'static [u8; 4] = b"FPNN";
    pub const VERSION: u8 = 1;
    pub const HEADER_LEN: usize = 4 + 1 + 1 + 1 + 1 + size_of::<u32>();

    pub fn new(max_message_len: usize) -> FpnnCodec {
        FpnnCodec { max_message_len }
    }

    fn decode_one(&self, buf: &mut Bytes) -> anyhow::Result<Message> {
        if buf.remaining() < Self::HEADER_LEN {
            bail!("incomplete message header");
        }
        let magic = buf.split_to(4);
        if magic.as_ref() != Self::MAGIC {
            bail!("not an FPNN message: {:?}", magic);
        }
        let version = buf.get_u8();
        if version != Self::VERSION {
            bail!("unsupported message version {}", version);
        }
        let _flags = buf.get_u8();
        let raw_type = buf.get_u8();
        let message_type = MessageType::try_from(raw_type)
            .map_err(|_| anyhow!("unknown message type {}", raw_type))?;
        let ss = buf.get_u8();
        let payload_len: usize = buf.get_u32().safe_cast();
        if payload_len > self.max_message_len {
            bail!("declared message length {} exceeds maximum of {}", payload_len, self.max_message_len);
        }

        let seq = match message_type {
            MessageType::OneWayQuest => None,
            MessageType::TwoWayQuest | MessageType::Answer => Some(buf.try_get_u32()?),
        };

        let message = match message_type {
            MessageType::OneWayQuest | MessageType::TwoWayQuest => {
                let method_len: usize = ss.into();
                if buf.remaining() < method_len + payload_len {
                    bail!("incomplete quest");
                }
                let method = String::from_utf8(buf.split_to(method_len).to_vec())?;
                Message::Quest(Quest {
                    method,
                    seq,
                    payload: buf.split_to(payload_len),
                })
            }
            MessageType::Answer => {
                if buf.remaining() < payload_len {
                    bail!("incomplete answer");
                }
                Message::Answer(Answer {
                    seq: seq.unwrap_or_default(),
                    status: ss,
                    payload: buf.split_to(payload_len),
                })
            }
        };
        Ok(message)
    }
}

impl MessageCodec for FpnnCodec {
    fn encode(&self, message: &Message) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_slice(Self::MAGIC);
        buf.put_u8(Self::VERSION);
        buf.put_u8(0);

        match message {
            Message::Quest(quest) => {
                if quest.method.len() > u8::MAX as usize {
                    bail!("method name '{}' is too long", quest.method);
                }
                if quest.payload.len() > self.max_message_len {
                    bail!("quest payload of {} bytes exceeds maximum of {}", quest.payload.len(), self.max_message_len);
                }
                let message_type = if quest.seq.is_some() { MessageType::TwoWayQuest } else { MessageType::OneWayQuest };
                buf.put_u8(message_type.into());
                buf.put_u8(quest.method.len().prechecked_cast());
                buf.put_u32(quest.payload.len().prechecked_cast());
                if let Some(seq) = quest.seq {
                    buf.put_u32(seq);
                }
                buf.put_slice(quest.method.as_bytes());
                buf.put_slice(&quest.payload);
            }
            Message::Answer(answer) => {
                if answer.payload.len() > self.max_message_len {
                    bail!("answer payload of {} bytes exceeds maximum of {}", answer.payload.len(), self.max_message_len);
                }
                buf.put_u8(MessageType::Answer.into());
                buf.put_u8(answer.status);
                buf.put_u32(answer.payload.len().prechecked_cast());
                buf.put_u32(answer.seq);
                buf.put_slice(&answer.payload);
            }
        }
        Ok(buf.freeze())
    }

    fn decode_all(&self, mut buf: Bytes) -> anyhow::Result<Vec<Message>> {
        let mut result = Vec::new();
        while buf.has_remaining() {
            result.push(self.decode_one(&mut buf)?);
        }
        Ok(result)
    }
}
