//! Inbound TCP segments as consumed by the protocol driver.

use std::fmt;

use crate::seqnum::SeqNum;

use super::wire::TcpHeader;

/// The TCP control bits, in their wire positions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    /// No control bits set.
    pub const NONE: Flags = Flags(0);
    /// No more data from sender.
    pub const FIN: Flags = Flags(1 << 0);
    /// Synchronize sequence numbers.
    pub const SYN: Flags = Flags(1 << 1);
    /// Reset the connection.
    pub const RST: Flags = Flags(1 << 2);
    /// Push function.
    pub const PSH: Flags = Flags(1 << 3);
    /// Acknowledgment field significant.
    pub const ACK: Flags = Flags(1 << 4);
    /// Urgent pointer field significant.
    pub const URG: Flags = Flags(1 << 5);

    /// Builds a flag set from the low 6 bits of a control field.
    pub fn from_bits(bits: u8) -> Self {
        Flags(bits & 0b0011_1111)
    }

    /// Returns the raw control bits.
    pub fn bits(self) -> u8 {
        let Flags(bits) = self;
        bits
    }

    /// Returns `true` if every flag in `other` is set in `self`.
    pub fn contains(self, other: Flags) -> bool {
        let (Flags(lhs), Flags(rhs)) = (self, other);
        lhs & rhs == rhs
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, Flags(rhs): Flags) -> Flags {
        let Flags(lhs) = self;
        Flags(lhs | rhs)
    }
}

impl std::ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        *self = *self | rhs;
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 6] = [
            (Flags::SYN, "SYN"),
            (Flags::FIN, "FIN"),
            (Flags::RST, "RST"),
            (Flags::ACK, "ACK"),
            (Flags::PSH, "PSH"),
            (Flags::URG, "URG"),
        ];

        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }

        if first {
            write!(f, "-")?;
        }

        Ok(())
    }
}

/// One inbound TCP segment, parsed off the wire and queued for the
/// connection's worker.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Control bits of the segment.
    pub flags: Flags,
    /// Sequence number of the first payload octet (or the ISN when SYN is
    /// set).
    pub seq_number: SeqNum,
    /// Acknowledgment number; meaningful only when ACK is set.
    pub ack_number: SeqNum,
    /// The advertised window exactly as carried in the 16-bit header field,
    /// widened so the driver can shift it by the negotiated send window
    /// scale in place.
    pub window: u32,
    /// Raw option bytes, bounded by the data offset.
    options: Vec<u8>,
    /// Payload octets.
    pub payload: Vec<u8>,
}

impl Segment {
    /// Builds a payload-less segment. Demultiplexing code and tests attach
    /// payloads and options through [`Segment::with_payload`] and
    /// [`Segment::with_options`].
    pub fn new(flags: Flags, seq_number: SeqNum, ack_number: SeqNum, window: u16) -> Self {
        Self {
            flags,
            seq_number,
            ack_number,
            window: window as u32,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Attaches a payload.
    pub fn with_payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    /// Attaches raw option bytes.
    pub fn with_options(mut self, options: &[u8]) -> Self {
        self.options = options.to_vec();
        self
    }

    /// Parses a segment from the raw bytes of a TCP header plus payload.
    /// Returns `None` when the header does not survive validation; such
    /// segments are dropped before they reach a connection.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let header = TcpHeader::try_from(raw).ok()?;

        Some(Self {
            flags: header.flags(),
            seq_number: SeqNum::new(header.seq_number()),
            ack_number: SeqNum::new(header.ack_number()),
            window: header.window() as u32,
            options: header.options().as_slice().to_vec(),
            payload: raw[header.header_len()..].to_vec(),
        })
    }

    /// Returns `true` if every flag in `flags` is set on this segment.
    pub fn flag_is_set(&self, flags: Flags) -> bool {
        self.flags.contains(flags)
    }

    /// Returns the raw option bytes.
    pub fn options(&self) -> &[u8] {
        &self.options
    }

    /// Returns the logical length of the segment: the payload length plus
    /// one for each of SYN and FIN, which occupy sequence space.
    pub fn logical_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.flag_is_set(Flags::SYN) {
            len += 1;
        }
        if self.flag_is_set(Flags::FIN) {
            len += 1;
        }
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_len_counts_syn_and_fin() {
        let seg = Segment::new(Flags::ACK, SeqNum::new(1), SeqNum::new(2), 512);
        assert_eq!(seg.logical_len(), 0);

        let seg = Segment::new(Flags::SYN, SeqNum::new(1), SeqNum::new(0), 512);
        assert_eq!(seg.logical_len(), 1);

        let seg = Segment::new(
            Flags::FIN | Flags::ACK,
            SeqNum::new(1),
            SeqNum::new(2),
            512,
        )
        .with_payload(b"abc");
        assert_eq!(seg.logical_len(), 4);
    }

    #[test]
    fn parse_splits_header_and_payload() {
        let mut header = super::super::wire::TcpHeader::new(80, 1234, 1000, 4096);
        header.set_flags(Flags::ACK | Flags::PSH);
        header.set_ack_number(2000);

        let (raw, nbytes) = header.to_be_bytes();
        let mut wire = raw[..nbytes].to_vec();
        wire.extend_from_slice(b"hello");

        let seg = Segment::parse(&wire).unwrap();
        assert_eq!(seg.flags, Flags::ACK | Flags::PSH);
        assert_eq!(seg.seq_number, SeqNum::new(1000));
        assert_eq!(seg.ack_number, SeqNum::new(2000));
        assert_eq!(seg.window, 4096);
        assert_eq!(seg.payload, b"hello");
    }

    #[test]
    fn parse_rejects_truncated_header() {
        assert!(Segment::parse(&[0u8; 12]).is_none());
    }

    #[test]
    fn flags_display_for_logging() {
        assert_eq!((Flags::SYN | Flags::ACK).to_string(), "SYN|ACK");
        assert_eq!(Flags::NONE.to_string(), "-");
    }
}
