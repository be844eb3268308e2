//! TCP header definition, serialization, and checksumming.

use crate::{Error, Result};

use super::segment::Flags;

/// TCP Segment Header.
///
/// RFC 793 (3.1)
///
/// ```text
///   0                   1                   2                   3
///     0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |          Source Port          |       Destination Port        |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                        Sequence Number                        |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                    Acknowledgment Number                      |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |  Data |           |U|A|P|R|S|F|                               |
///    | Offset| Reserved  |R|C|S|S|Y|I|            Window             |
///    |       |           |G|K|H|T|N|N|                               |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |           Checksum            |         Urgent Pointer        |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                    Options                    |    Padding    |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                             data                              |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    /// The source port number.
    src_port: u16,
    /// The destination port number.
    dst_port: u16,
    /// The sequence number of the first data octet in this segment (except
    /// when SYN is present, in which case it is the ISN and the first data
    /// octet is ISN+1).
    seq_number: u32,
    /// If the ACK control bit is set, the next sequence number the sender of
    /// the segment expects to receive.
    ack_number: u32,
    /// Data offset (4 bits, number of 32-bit words in the header), reserved
    /// bits, and the URG/ACK/PSH/RST/SYN/FIN control bits.
    offset_and_control_bits: u16,
    /// The number of data octets, beginning with the one indicated in the
    /// acknowledgment field, which the sender is willing to accept.
    window: u16,
    /// 16-bit one's complement of the one's complement sum of all 16-bit
    /// words in the pseudo header, TCP header, and text.
    checksum: u16,
    /// Current value of the urgent pointer as a positive offset from the
    /// sequence number of this segment.
    urgent_pointer: u16,
    /// Options occupying space at the end of the header, padded to a
    /// multiple of 32 bits.
    options: TcpOptions,
}

impl TcpHeader {
    /// Minimum length of a TCP header in bytes.
    pub const MIN_HEADER_LEN: u16 = 20;

    /// Maximum length of a TCP header in bytes (data offset of 15).
    pub const MAX_HEADER_LEN: u16 = 60;

    /// Minimum data offset of a TCP header.
    pub const MIN_DATA_OFFSET: u16 = 5;

    /// Maximum data offset of a TCP header.
    pub const MAX_DATA_OFFSET: u16 = 15;

    /// Creates a new TCP header with the given ports, sequence number, and
    /// window, defaulting every other field.
    pub fn new(src_port: u16, dst_port: u16, seq_number: u32, window: u16) -> Self {
        Self {
            src_port,
            dst_port,
            seq_number,
            window,
            ..Default::default()
        }
    }

    /// Returns the `source port` field of the TCP header.
    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    /// Returns the `destination port` field of the TCP header.
    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    /// Returns the `sequence number` field of the TCP header.
    pub fn seq_number(&self) -> u32 {
        self.seq_number
    }

    /// Returns the `acknowledgment number` field of the TCP header.
    pub fn ack_number(&self) -> u32 {
        self.ack_number
    }

    /// Sets the `acknowledgment number` field of the TCP header.
    pub fn set_ack_number(&mut self, ack: u32) {
        self.ack_number = ack;
    }

    /// Returns the `data offset` field of the TCP header.
    ///
    /// To get the header length (including options) in bytes, use
    /// [TcpHeader::header_len].
    pub fn data_offset(&self) -> u8 {
        // Stored in the higher 4 bits.
        (self.offset_and_control_bits >> 12) as u8
    }

    /// Returns the control bits as a [`Flags`] value.
    pub fn flags(&self) -> Flags {
        Flags::from_bits((self.offset_and_control_bits & 0b0011_1111) as u8)
    }

    /// Sets the control bits from a [`Flags`] value, preserving the data
    /// offset and reserved bits.
    pub fn set_flags(&mut self, flags: Flags) {
        self.offset_and_control_bits =
            (self.offset_and_control_bits & !0b0011_1111) | flags.bits() as u16;
    }

    /// Returns the `window` field of the TCP header.
    pub fn window(&self) -> u16 {
        self.window
    }

    /// Returns the `checksum` field of the TCP header.
    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// Returns the `urgent pointer` field of the TCP header.
    pub fn urgent_pointer(&self) -> u16 {
        self.urgent_pointer
    }

    /// Returns the `options` field of the TCP header.
    pub fn options(&self) -> &TcpOptions {
        &self.options
    }

    /// Appends the Maximum Segment Size option (kind 2, length 4) to the
    /// header options.
    ///
    /// # Errors
    ///
    /// Returns an error if the MSS value is zero or the options buffer is
    /// out of space.
    pub fn set_option_mss(&mut self, mss: u16) -> Result<()> {
        if mss == 0 {
            return Err(Error::MalformedSegment);
        }
        self.append_option(&[OptionKind::MSS as u8, 4, (mss >> 8) as u8, mss as u8])
    }

    /// Appends the Window Scale option (kind 3, length 3) to the header
    /// options, padded with a trailing NOP to keep the options region
    /// 32-bit aligned.
    ///
    /// # Errors
    ///
    /// Returns an error if the shift exceeds 14 or the options buffer is out
    /// of space.
    pub fn set_option_window_scale(&mut self, shift: u8) -> Result<()> {
        if shift > super::MAX_WND_SCALE {
            return Err(Error::MalformedSegment);
        }
        self.append_option(&[
            OptionKind::WindowScale as u8,
            3,
            shift,
            OptionKind::NOP as u8,
        ])
    }

    /// Appends a pre-padded option block and widens the data offset to
    /// match.
    fn append_option(&mut self, block: &[u8]) -> Result<()> {
        debug_assert!(block.len() % 4 == 0);

        self.options.append(block)?;

        let new_data_offset = (block.len() >> 2) as u16 + self.data_offset() as u16;

        // Clear the previous data offset, keeping the reserved and control
        // bits, then shift the widened offset back into the top 4 bits.
        self.offset_and_control_bits &= 0x0FFF;
        self.offset_and_control_bits |= new_data_offset << 12;

        Ok(())
    }

    /// Returns the length of the TCP header in bytes, including options.
    pub fn header_len(&self) -> usize {
        Self::MIN_HEADER_LEN as usize + self.options.len()
    }

    /// Computes and updates the `checksum` field for the TCP header, using
    /// the connection's address pair for the pseudo header.
    pub fn set_checksum(&mut self, src: [u8; 4], dst: [u8; 4], payload: &[u8]) {
        self.checksum = self.compute_checksum(src, dst, payload);
    }

    /// Returns `true` if the TCP header checksum is valid for the given
    /// address pair and payload.
    pub fn is_valid_checksum(&self, src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> bool {
        self.checksum == self.compute_checksum(src, dst, payload)
    }

    /// Returns the computed checksum of the TCP header: the 16-bit one's
    /// complement of the one's complement sum of all 16-bit words in the
    /// pseudo header, the header itself, and the payload, with the checksum
    /// field taken as zero.
    ///
    /// ```text
    ///        +--------+--------+--------+--------+
    ///        |           Source Address          |
    ///        +--------+--------+--------+--------+
    ///        |         Destination Address       |
    ///        +--------+--------+--------+--------+
    ///        |  zero  |  PTCL  |    TCP Length   |
    ///        +--------+--------+--------+--------+
    /// ```
    pub fn compute_checksum(&self, src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> u16 {
        /// Upper-layer protocol number for TCP (RFC 1700).
        const PROTO_TCP: u8 = 6;

        let mut pseudo_header = [0u8; 12];
        pseudo_header[0..4].copy_from_slice(&src);
        pseudo_header[4..8].copy_from_slice(&dst);
        pseudo_header[9] = PROTO_TCP;

        let tcp_len = (self.header_len() + payload.len()) as u16;
        pseudo_header[10..12].copy_from_slice(&tcp_len.to_be_bytes());

        let (mut raw_header, nbytes) = self.to_be_bytes();

        // The checksum field itself must be zero for the computation.
        raw_header[16] = 0x00;
        raw_header[17] = 0x00;

        let mut checksum_iter = pseudo_header
            .iter()
            .chain(raw_header[..nbytes].iter())
            .chain(payload.iter());

        let mut sum = 0u32;

        loop {
            let word = match (checksum_iter.next(), checksum_iter.next()) {
                (Some(h), Some(l)) => u16::from_be_bytes([*h, *l]),
                // An odd trailing octet is padded on the right with zeros to
                // form a 16-bit word.
                (Some(h), None) => u16::from_be_bytes([*h, 0x00]),
                _ => break,
            };

            sum += word as u32;

            // Fold the carry back into the lower 16 bits.
            if sum > 0xFFFF {
                sum = (sum & 0xFFFF) + (sum >> 16);
            }
        }

        while sum > 0xFFFF {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }

        !(sum as u16)
    }

    /// Returns the memory representation of the TCP header as a byte array
    /// in big-endian (network) byte order, together with the number of bytes
    /// written.
    #[allow(clippy::wrong_self_convention)]
    pub fn to_be_bytes(&self) -> ([u8; Self::MAX_HEADER_LEN as usize], usize) {
        let mut raw_header = [0u8; Self::MAX_HEADER_LEN as usize];
        let size = self.header_len();

        raw_header[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        raw_header[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        raw_header[4..8].copy_from_slice(&self.seq_number.to_be_bytes());
        raw_header[8..12].copy_from_slice(&self.ack_number.to_be_bytes());
        raw_header[12..14].copy_from_slice(&self.offset_and_control_bits.to_be_bytes());
        raw_header[14..16].copy_from_slice(&self.window.to_be_bytes());
        raw_header[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        raw_header[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());

        raw_header[20..size].copy_from_slice(self.options.as_slice());

        (raw_header, size)
    }
}

impl TryFrom<&[u8]> for TcpHeader {
    type Error = Error;

    fn try_from(raw: &[u8]) -> Result<Self> {
        if raw.len() < Self::MIN_HEADER_LEN as usize {
            return Err(Error::MalformedSegment);
        }

        let offset_and_control_bits = u16::from_be_bytes([raw[12], raw[13]]);
        let data_offset = offset_and_control_bits >> 12;

        if !(Self::MIN_DATA_OFFSET..=Self::MAX_DATA_OFFSET).contains(&data_offset) {
            return Err(Error::MalformedSegment);
        }

        // Fewer bytes in the buffer than advertised by the data offset.
        if (data_offset << 2) as usize > raw.len() {
            return Err(Error::MalformedSegment);
        }

        Ok(Self {
            src_port: u16::from_be_bytes([raw[0], raw[1]]),
            dst_port: u16::from_be_bytes([raw[2], raw[3]]),
            seq_number: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
            ack_number: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
            offset_and_control_bits,
            window: u16::from_be_bytes([raw[14], raw[15]]),
            checksum: u16::from_be_bytes([raw[16], raw[17]]),
            urgent_pointer: u16::from_be_bytes([raw[18], raw[19]]),
            // Range-limited to the data offset so payload bytes are never
            // read as options.
            options: TcpOptions::copy_from(&raw[20..(data_offset << 2) as usize]),
        })
    }
}

impl Default for TcpHeader {
    fn default() -> Self {
        Self {
            src_port: 0,
            dst_port: 0,
            seq_number: 0,
            ack_number: 0,
            // Data offset = 5, reserved and control bits all clear.
            offset_and_control_bits: 0b0101_000000_000000,
            window: 0,
            checksum: 0,
            urgent_pointer: 0,
            options: TcpOptions::new(),
        }
    }
}

/// Options region of a TCP header.
#[derive(Debug, Clone, Copy)]
pub struct TcpOptions {
    /// The total number of bytes occupying the buffer.
    len: usize,
    /// Fixed-size array of raw option bytes.
    buf: [u8; Self::MAX_OPTIONS_LEN],
}

impl TcpOptions {
    /// Maximum length of TCP options in bytes.
    pub const MAX_OPTIONS_LEN: usize = 40;

    /// Creates an empty options region.
    pub fn new() -> Self {
        Self {
            len: 0,
            buf: [0u8; Self::MAX_OPTIONS_LEN],
        }
    }

    /// Copies raw option bytes out of a received header. `raw` is already
    /// bounded by the data offset, so anything longer than the buffer has
    /// been rejected by header validation.
    fn copy_from(raw: &[u8]) -> Self {
        let mut options = Self::new();
        options.buf[..raw.len()].copy_from_slice(raw);
        options.len = raw.len();
        options
    }

    /// Appends a block of raw option bytes.
    fn append(&mut self, block: &[u8]) -> Result<()> {
        if self.len + block.len() > Self::MAX_OPTIONS_LEN {
            return Err(Error::MalformedSegment);
        }
        self.buf[self.len..self.len + block.len()].copy_from_slice(block);
        self.len += block.len();
        Ok(())
    }

    /// Returns the length of the options in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no options are present.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the raw option bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Kinds of TCP options understood by the endpoint (RFC 793 3.1, RFC 1323
/// 2.2). Unrecognized kinds are skipped over by their length byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum OptionKind {
    /// End of Option List (kind 0).
    EOL = 0,
    /// No-Operation (kind 1), used to align subsequent options.
    NOP = 1,
    /// Maximum Segment Size (kind 2, length 4). Only meaningful on segments
    /// with the SYN control bit set.
    MSS = 2,
    /// Window Scale (kind 3, length 3). Carries the shift count applied to
    /// the sender's window field for the rest of the connection.
    WindowScale = 3,
}
