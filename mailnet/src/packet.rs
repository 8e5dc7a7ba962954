//! Wire framing between raw link [`Packet`]s and structured [`Message`]s.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! Multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Dst Port    |   Src Port    |  Reserved (0) |0 0 0 0|F|S|A|S|
//! |               |               |               |       |I|T|C|Y|
//! |               |               |               |       |N|P|K|N|
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload ...                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 8 bytes.

use std::fmt;

use bitflags::bitflags;
use thiserror::Error;

use crate::link::{LinkAddr, Packet};

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 8;

/// Upper bound on port numbers; valid ports are `0..PORT_LIMIT`.
pub const PORT_LIMIT: usize = 128;

// Byte offsets of each field within the serialised header.
const OFF_DST_PORT: usize = 0;
const OFF_SRC_PORT: usize = 1;
const OFF_RESERVED: usize = 2;
const OFF_FLAGS: usize = 3;
const OFF_SEQ: usize = 4;

/// A logical endpoint within one link address.
pub type Port = u8;

bitflags! {
    /// Control bits carried in the low nibble of the flags byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u8 {
        /// Open request.
        const SYN = 0b0000_0001;
        /// Acknowledgement; `seq` echoes the acknowledged segment.
        const ACK = 0b0000_0010;
        /// Stop: the sender will transmit no further data.
        const STP = 0b0000_0100;
        /// Finish: acknowledges an STP and completes teardown.
        const FIN = 0b0000_1000;
    }
}

impl Flags {
    /// `true` when any of SYN, STP or FIN is set.  Such messages never carry
    /// a payload.
    pub fn is_control(self) -> bool {
        self.intersects(Flags::SYN | Flags::STP | Flags::FIN)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("DATA");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}

/// Payload bytes available in one message on a link carrying at most
/// `max_packet_payload` bytes per packet.
pub const fn max_contents_len(max_packet_payload: usize) -> usize {
    max_packet_payload.saturating_sub(HEADER_LEN)
}

/// `(link address, port)`: one side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub link: LinkAddr,
    pub port: Port,
}

impl Endpoint {
    pub fn new(link: LinkAddr, port: Port) -> Self {
        Self { link, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.link, self.port)
    }
}

/// A decoded transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub dst: Endpoint,
    pub src: Endpoint,
    pub flags: Flags,
    /// Data sequence number, or the id echoed by an ACK.
    pub seq: u32,
    pub payload: Vec<u8>,
}

/// Reasons a message cannot be framed or a packet cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("packet of {0} bytes is shorter than the {HEADER_LEN}-byte header")]
    Truncated(usize),
    #[error("port {0} is outside 0..{PORT_LIMIT}")]
    PortOutOfRange(u8),
    #[error("reserved header byte is {0:#04x}, expected zero")]
    ReservedNonZero(u8),
    #[error("flags byte {0:#04x} has undefined bits set")]
    UndefinedFlags(u8),
    #[error("payload of {len} bytes exceeds the {max}-byte message limit")]
    PayloadTooLong { len: usize, max: usize },
    #[error("{0} message must not carry a payload")]
    ControlPayload(Flags),
}

fn check_port(port: u8) -> Result<(), FramingError> {
    if usize::from(port) < PORT_LIMIT {
        Ok(())
    } else {
        Err(FramingError::PortOutOfRange(port))
    }
}

impl Message {
    pub fn new(src: Endpoint, dst: Endpoint, flags: Flags, seq: u32, payload: Vec<u8>) -> Self {
        Self {
            dst,
            src,
            flags,
            seq,
            payload,
        }
    }

    /// Build an empty-payload reply travelling back to this message's sender.
    pub fn reply(&self, flags: Flags, seq: u32) -> Self {
        Self::new(self.dst, self.src, flags, seq, Vec::new())
    }

    /// `true` for a plain data segment (no flags).
    pub fn is_data(&self) -> bool {
        self.flags.is_empty()
    }

    /// Serialise into a link packet that fits in `max_packet_payload` bytes.
    pub fn encode(&self, max_packet_payload: usize) -> Result<Packet, FramingError> {
        check_port(self.dst.port)?;
        check_port(self.src.port)?;

        let max = max_contents_len(max_packet_payload);
        if self.payload.len() > max {
            return Err(FramingError::PayloadTooLong {
                len: self.payload.len(),
                max,
            });
        }
        if self.flags.is_control() && !self.payload.is_empty() {
            return Err(FramingError::ControlPayload(self.flags));
        }

        let mut bytes = vec![0u8; HEADER_LEN + self.payload.len()];
        bytes[OFF_DST_PORT] = self.dst.port;
        bytes[OFF_SRC_PORT] = self.src.port;
        bytes[OFF_RESERVED] = 0;
        bytes[OFF_FLAGS] = self.flags.bits();
        bytes[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq.to_be_bytes());
        bytes[HEADER_LEN..].copy_from_slice(&self.payload);

        Ok(Packet {
            src_link: self.src.link,
            dst_link: self.dst.link,
            bytes,
        })
    }

    /// Parse a link packet.
    ///
    /// Fails on a truncated header, an out-of-range port, a nonzero reserved
    /// byte, undefined flag bits, or a control message carrying payload.
    pub fn decode(packet: &Packet) -> Result<Self, FramingError> {
        let buf = &packet.bytes;
        if buf.len() < HEADER_LEN {
            return Err(FramingError::Truncated(buf.len()));
        }

        let dst_port = buf[OFF_DST_PORT];
        let src_port = buf[OFF_SRC_PORT];
        check_port(dst_port)?;
        check_port(src_port)?;

        if buf[OFF_RESERVED] != 0 {
            return Err(FramingError::ReservedNonZero(buf[OFF_RESERVED]));
        }
        let flags = Flags::from_bits(buf[OFF_FLAGS])
            .ok_or(FramingError::UndefinedFlags(buf[OFF_FLAGS]))?;

        let mut seq = [0u8; 4];
        seq.copy_from_slice(&buf[OFF_SEQ..OFF_SEQ + 4]);
        let payload = buf[HEADER_LEN..].to_vec();

        if flags.is_control() && !payload.is_empty() {
            return Err(FramingError::ControlPayload(flags));
        }

        Ok(Self {
            dst: Endpoint::new(packet.dst_link, dst_port),
            src: Endpoint::new(packet.src_link, src_port),
            flags,
            seq: u32::from_be_bytes(seq),
            payload,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "from ({}) to ({}), {} seq={}, {} byte{}",
            self.src,
            self.dst,
            self.flags,
            self.seq,
            self.payload.len(),
            if self.payload.len() == 1 { "" } else { "s" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::DEFAULT_MAX_PACKET_PAYLOAD;

    const MAX: usize = DEFAULT_MAX_PACKET_PAYLOAD;

    fn message(flags: Flags, seq: u32, payload: &[u8]) -> Message {
        Message::new(
            Endpoint::new(5, 17),
            Endpoint::new(9, 40),
            flags,
            seq,
            payload.to_vec(),
        )
    }

    fn raw(bytes: &[u8]) -> Packet {
        Packet {
            src_link: 5,
            dst_link: 9,
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let msg = message(Flags::empty(), 7, b"hello");
        let decoded = Message::decode(&msg.encode(MAX).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn ack_roundtrip_keeps_echoed_seq() {
        let msg = message(Flags::ACK, 0xdead_beef, b"");
        assert_eq!(Message::decode(&msg.encode(MAX).unwrap()).unwrap(), msg);
    }

    #[test]
    fn header_layout_on_wire() {
        let packet = message(Flags::SYN | Flags::ACK, 0x0102_0304, b"").encode(MAX).unwrap();
        assert_eq!(packet.bytes, vec![40, 17, 0, 0b0011, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(packet.src_link, 5);
        assert_eq!(packet.dst_link, 9);
    }

    #[test]
    fn flag_bits_occupy_low_nibble() {
        assert_eq!(Flags::SYN.bits(), 0b0001);
        assert_eq!(Flags::ACK.bits(), 0b0010);
        assert_eq!(Flags::STP.bits(), 0b0100);
        assert_eq!(Flags::FIN.bits(), 0b1000);
        assert_eq!(Flags::all().bits(), 0x0f);
    }

    #[test]
    fn payload_at_limit_is_accepted() {
        let payload = vec![1u8; max_contents_len(MAX)];
        let packet = message(Flags::empty(), 0, &payload).encode(MAX).unwrap();
        assert_eq!(packet.bytes.len(), MAX);
    }

    #[test]
    fn payload_over_limit_is_rejected() {
        let payload = vec![1u8; max_contents_len(MAX) + 1];
        assert_eq!(
            message(Flags::empty(), 0, &payload).encode(MAX),
            Err(FramingError::PayloadTooLong { len: 24, max: 23 })
        );
    }

    #[test]
    fn out_of_range_port_is_rejected_on_encode() {
        let mut msg = message(Flags::empty(), 0, b"x");
        msg.dst.port = 128;
        assert_eq!(msg.encode(MAX), Err(FramingError::PortOutOfRange(128)));
        msg.dst.port = 1;
        msg.src.port = 200;
        assert_eq!(msg.encode(MAX), Err(FramingError::PortOutOfRange(200)));
    }

    #[test]
    fn control_message_with_payload_is_rejected() {
        assert_eq!(
            message(Flags::STP, 0, b"x").encode(MAX),
            Err(FramingError::ControlPayload(Flags::STP))
        );
    }

    #[test]
    fn decode_short_header_returns_error() {
        assert_eq!(Message::decode(&raw(&[0; 7])), Err(FramingError::Truncated(7)));
        assert_eq!(Message::decode(&raw(&[])), Err(FramingError::Truncated(0)));
    }

    #[test]
    fn decode_nonzero_reserved_byte_returns_error() {
        assert_eq!(
            Message::decode(&raw(&[1, 2, 0x80, 0, 0, 0, 0, 0])),
            Err(FramingError::ReservedNonZero(0x80))
        );
    }

    #[test]
    fn decode_undefined_flag_bits_returns_error() {
        assert_eq!(
            Message::decode(&raw(&[1, 2, 0, 0x10, 0, 0, 0, 0])),
            Err(FramingError::UndefinedFlags(0x10))
        );
    }

    #[test]
    fn decode_bad_port_returns_error() {
        assert_eq!(
            Message::decode(&raw(&[0x80, 2, 0, 0, 0, 0, 0, 0])),
            Err(FramingError::PortOutOfRange(0x80))
        );
    }

    #[test]
    fn decode_syn_with_payload_returns_error() {
        assert_eq!(
            Message::decode(&raw(&[1, 2, 0, 0b0001, 0, 0, 0, 0, 0xff])),
            Err(FramingError::ControlPayload(Flags::SYN))
        );
    }

    #[test]
    fn reply_swaps_endpoints() {
        let msg = message(Flags::empty(), 3, b"abc");
        let ack = msg.reply(Flags::ACK, msg.seq);
        assert_eq!(ack.src, msg.dst);
        assert_eq!(ack.dst, msg.src);
        assert_eq!(ack.seq, 3);
        assert!(ack.payload.is_empty());
    }

    #[test]
    fn display_names_flags() {
        let text = message(Flags::SYN | Flags::ACK, 0, b"").to_string();
        assert_eq!(text, "from (5:17) to (9:40), SYN|ACK seq=0, 0 bytes");
    }
}
