use byteorder::{ByteOrder, NetworkEndian};
use core::{cmp, fmt, ops};

/// A TCP sequence number.
///
/// A sequence number is a monotonically advancing integer modulo
/// 2<sup>32</sup>. Sequence numbers do not have a discontinuity when
/// compared across the wrapping boundary.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct SeqNumber(pub i32);

impl SeqNumber {
    pub fn max(self, rhs: Self) -> Self {
        if self > rhs { self } else { rhs }
    }

    pub fn min(self, rhs: Self) -> Self {
        if self < rhs { self } else { rhs }
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0 as u32)
    }
}

impl ops::Add<usize> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: usize) -> SeqNumber {
        if rhs > i32::MAX as usize {
            panic!("attempt to add to sequence number with unsigned overflow")
        }
        SeqNumber(self.0.wrapping_add(rhs as i32))
    }
}

impl ops::Sub<usize> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: usize) -> SeqNumber {
        if rhs > i32::MAX as usize {
            panic!("attempt to subtract from sequence number with unsigned overflow")
        }
        SeqNumber(self.0.wrapping_sub(rhs as i32))
    }
}

impl ops::AddAssign<usize> for SeqNumber {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

/// The distance between two sequence numbers, as a signed count of
/// octets. Positive when `self` is ahead of `rhs` in serial number
/// order. Never panics, which matters when the operands come from an
/// adversarial segment.
impl ops::Sub for SeqNumber {
    type Output = i32;

    fn sub(self, rhs: SeqNumber) -> i32 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        self.0.wrapping_sub(other.0).partial_cmp(&0)
    }
}

bitflags::bitflags! {
    /// The flags octet of a TCP header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
        const ECE = 0x40;
        const CWR = 0x80;
    }
}

/// TCP option kinds and lengths, per the IANA registry.
pub mod opt {
    pub const END: u8 = 0;
    pub const NOP: u8 = 1;
    pub const MSS: u8 = 2;
    pub const WS: u8 = 3;
    pub const SACK_PERMITTED: u8 = 4;
    pub const SACK_RANGE: u8 = 5;
    pub const TIMESTAMP: u8 = 8;

    pub const LEN_MSS: usize = 4;
    pub const LEN_TIMESTAMP: usize = 10;
}

/// An iterator over the options region of a TCP header.
///
/// Yields `(offset, kind, data)` for each well-formed option, where
/// `offset` is the byte position of the option's kind octet inside
/// the region. Iteration stops at the end-of-options kind, or at the
/// first option whose length octet is inconsistent with the region:
/// everything from a malformed option onward is treated as absent.
#[derive(Debug, Clone)]
pub struct TcpOptionsIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> TcpOptionsIter<'a> {
    pub fn new(data: &'a [u8]) -> TcpOptionsIter<'a> {
        TcpOptionsIter { data, offset: 0 }
    }
}

impl<'a> Iterator for TcpOptionsIter<'a> {
    type Item = (usize, u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.offset >= self.data.len() {
                return None;
            }
            let start = self.offset;
            let kind = self.data[start];
            match kind {
                opt::END => return None,
                opt::NOP => {
                    self.offset += 1;
                    continue;
                }
                _ => {
                    if start + 2 > self.data.len() {
                        return None;
                    }
                    let len = self.data[start + 1] as usize;
                    if len < 2 || start + len > self.data.len() {
                        return None;
                    }
                    self.offset = start + len;
                    return Some((start, kind, &self.data[start + 2..start + len]));
                }
            }
        }
    }
}

/// A timestamp option located inside an options region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampOption {
    /// Byte offset of the option's kind octet in the region.
    pub offset: usize,
    pub tsval: u32,
    pub tsecr: u32,
}

/// A maximum segment size option located inside an options region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MssOption {
    pub offset: usize,
    pub mss: u16,
}

/// Locate the first well-formed timestamp option in `data`.
pub fn find_timestamp(data: &[u8]) -> Option<TimestampOption> {
    for (offset, kind, value) in TcpOptionsIter::new(data) {
        if kind == opt::TIMESTAMP && value.len() == opt::LEN_TIMESTAMP - 2 {
            return Some(TimestampOption {
                offset,
                tsval: NetworkEndian::read_u32(&value[0..4]),
                tsecr: NetworkEndian::read_u32(&value[4..8]),
            });
        }
    }
    None
}

/// Locate the first well-formed MSS option in `data`.
pub fn find_mss(data: &[u8]) -> Option<MssOption> {
    for (offset, kind, value) in TcpOptionsIter::new(data) {
        if kind == opt::MSS && value.len() == opt::LEN_MSS - 2 {
            return Some(MssOption {
                offset,
                mss: NetworkEndian::read_u16(value),
            });
        }
    }
    None
}
