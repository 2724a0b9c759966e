//! This is a client side ARQ ('automatic repeat request') engine for FPNN style quest / answer
//!  RPC over UDP. It adds acknowledgement, retransmission, ordering, segmentation and optional
//!  encryption on top of plain datagrams, trading strict in-order delivery for latency where the
//!  application asks for it.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (quests and answers), not streams of bytes
//! * There is no connection handshake: both peers sync on each other's sequence numbers 'on the
//!   go', based on a FIRST_PACKAGE marker that a sender attaches to its datagrams until the peer
//!   acknowledged anything
//! * Reliable data is acknowledged and resent until acknowledged; 'discardable' data is fire and
//!   forget
//! * Big packages are sent without IP-level fragmentation - this protocol takes care of
//!   segmenting, buffering and re-assembling
//!   * configured MTU since discovery does not work reliably
//! * Small packages and control information are combined into a single datagram
//! * A gap in received sequence numbers is skipped after a timeout rather than waited for forever
//! * There is a checksum per datagram that depends on the session, so stray datagrams from a
//!   previous session are rejected
//! * (Optional) strong encryption, either of whole datagrams or additionally of the application
//!   data, with keys agreed on in an ECDH handshake
//! * Flow control by a limit on unacknowledged packages, with an adaptive resend interval
//!
//! Explicitly *not* part of this: congestion control beyond pacing, NAT traversal, multi-path,
//!  and server side connection management.
//!
//! ## Datagram structure
//!
//! All numbers are in network byte order (BE).
//!
//! ```ascii
//!  0: protocol version (u8), bit 7 set if the rest of the datagram is encrypted
//!  *: header and payload
//! ```
//!
//! Header:
//!
//! ```ascii
//!  0: type (u8): DATA(0x01), ACKS(0x02), UNA(0x03), ECDH(0x04), HEARTBEAT(0x05),
//!      FORCESYNC(0x06), CLOSE(0x0F), COMBINED(0x80)
//!  1: flags (u8): DISCARDABLE(0x01), MONITORED(0x02), segment size class (0x04 / 0x08 / 0x0c),
//!      LAST_SEGMENT(0x10), FIRST_PACKAGE(0x20)
//!  2: checksum (u8)
//!  3: reserved (u8), 0
//!  4: seq (u32)
//!  8: (FIRST_PACKAGE only) checksum factor (u8), first seq (u32)
//!  *: payload, or for COMBINED a sequence of sections:
//!       type (u8), flags (u8), seq (u32), payload length (u16), payload
//! ```
//!
//! Every section that is not DISCARDABLE is *tracked*: it consumes a fresh sequence number and is
//!  resent until the peer acknowledges it. Untracked sections reuse the last assigned sequence
//!  number.
//!
//! The receiver acknowledges with UNA (the last contiguously received seq, acknowledging it and
//!  everything before it) and ACKS (individual seqs received beyond the UNA).
//!
//! ## Encryption
//!
//! With package level encryption, everything after the version byte is sealed with AES-GCM:
//!
//! ```ascii
//!  0: protocol version | 0x80 (u8) - authenticated, but not encrypted
//!  1: nonce counter (u64)
//!  9: encrypted datagram (including the ARQ header), plus 16 bytes AES-GCM tag
//! ```
//!
//! This adds a total of 1 + 8 + 16 = 25 bytes to each datagram.
//!
//! Data level encryption seals each application package before segmentation, so a resent
//!  segment is byte-identical to the original.
//!
//! ## Sequence numbers
//!
//! Sequence numbers are 32 bit and wrap around. They are compared by their distance, never
//!  directly: `a` is newer than `b` if `a - b` (wrapping) is less than half the number space.

pub mod config;
pub mod safe_converter;
pub mod seq;
pub mod packet_header;
pub mod checksum;
mod control_messages;
pub mod message;
pub mod encryption;
pub mod key_exchange;
mod reassembly;
pub mod parser;
mod unconfirmed;
mod seq_manager;
mod flow_control;
mod assembler;
pub mod io_buffer;
pub mod send_pipeline;
pub mod message_dispatcher;
pub mod udp_client;
