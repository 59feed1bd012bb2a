use core::fmt;

use crate::wire::{TcpFlags, TcpSeqNumber, opt};

bitflags::bitflags! {
    /// Markers recording what normalization did to a segment.
    ///
    /// The capture layer consults these after [Session::process]
    /// to decide whether the packet must be re-emitted.
    ///
    /// [Session::process]: ../struct.Session.html#method.process
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SegFlags: u8 {
        /// Some byte of the segment was rewritten in place.
        const MODIFIED = 0x01;
        /// The payload length changed.
        const RESIZED = 0x02;
    }
}

/// A view of one inbound TCP segment.
///
/// Header fields are immutable after construction except through the
/// normalization entry points, which may shrink the payload, rewrite
/// option bytes in place, or clear the ECN flags. The options region
/// is a mutable borrow of the caller's packet buffer, scoped to the
/// processing call; rewrites never change its length.
///
/// `end_seq` is derived state: it is recomputed inside every payload
/// length mutation, so a stale value is never observable.
#[derive(Debug)]
pub struct SegmentDescriptor<'p> {
    seq: TcpSeqNumber,
    end_seq: TcpSeqNumber,
    ack: TcpSeqNumber,
    window: u16,
    flags: TcpFlags,
    urg_ptr: u16,
    options: &'p mut [u8],
    payload_len: usize,
    ts: Option<u32>,
    markers: SegFlags,
}

impl<'p> SegmentDescriptor<'p> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flags: TcpFlags,
        seq: TcpSeqNumber,
        ack: TcpSeqNumber,
        window: u16,
        urg_ptr: u16,
        options: &'p mut [u8],
        payload_len: usize,
    ) -> SegmentDescriptor<'p> {
        // SYN and FIN each occupy one unit of sequence space.
        let control_len =
            (flags.contains(TcpFlags::SYN) as usize) + (flags.contains(TcpFlags::FIN) as usize);
        SegmentDescriptor {
            seq,
            end_seq: seq + payload_len + control_len,
            ack,
            window,
            flags,
            urg_ptr,
            options,
            payload_len,
            ts: None,
            markers: SegFlags::empty(),
        }
    }

    pub fn seq(&self) -> TcpSeqNumber {
        self.seq
    }

    pub fn end_seq(&self) -> TcpSeqNumber {
        self.end_seq
    }

    pub fn ack(&self) -> TcpSeqNumber {
        self.ack
    }

    pub fn window(&self) -> u16 {
        self.window
    }

    pub fn flags(&self) -> TcpFlags {
        self.flags
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn options(&self) -> &[u8] {
        self.options
    }

    pub fn markers(&self) -> SegFlags {
        self.markers
    }

    /// The timestamp value most recently extracted from the options
    /// region, if any.
    pub fn ts(&self) -> Option<u32> {
        self.ts
    }

    pub(crate) fn set_ts(&mut self, ts: Option<u32>) {
        self.ts = ts;
    }

    pub fn is_syn(&self) -> bool {
        self.flags.contains(TcpFlags::SYN)
    }

    pub fn is_syn_only(&self) -> bool {
        self.flags.contains(TcpFlags::SYN) && !self.flags.contains(TcpFlags::ACK)
    }

    pub fn is_syn_ack(&self) -> bool {
        self.flags.contains(TcpFlags::SYN | TcpFlags::ACK)
    }

    pub fn is_ack(&self) -> bool {
        self.flags.contains(TcpFlags::ACK)
    }

    pub fn is_fin(&self) -> bool {
        self.flags.contains(TcpFlags::FIN)
    }

    pub fn is_rst(&self) -> bool {
        self.flags.contains(TcpFlags::RST)
    }

    pub fn has_payload(&self) -> bool {
        self.payload_len != 0
    }

    /// The urgent offset actually honored for this segment.
    ///
    /// An urgent pointer past the end of the payload is treated as
    /// absent rather than propagated out of bounds.
    pub fn urg_offset(&self) -> u16 {
        if !self.flags.contains(TcpFlags::URG) {
            return 0;
        }
        if self.urg_ptr as usize > self.payload_len {
            return 0;
        }
        self.urg_ptr
    }

    /// Shrink the payload to `max` octets, pulling `end_seq` back by
    /// the trimmed amount. Marks the segment modified and resized.
    ///
    /// Callers guard on `payload_len() > max`; shrinking to the
    /// current length or more is a no-op.
    pub(crate) fn shrink_payload(&mut self, max: usize) {
        if self.payload_len <= max {
            return;
        }
        let fat = self.payload_len - max;
        self.payload_len = max;
        self.end_seq = self.end_seq - fat;
        self.markers |= SegFlags::MODIFIED | SegFlags::RESIZED;
    }

    /// Overwrite `len` option bytes starting at `offset` with no-op
    /// option bytes, preserving the region's length. Out-of-bounds
    /// requests are ignored; offsets come from our own option scan,
    /// so a miss here indicates the region changed underneath us.
    pub(crate) fn nop_options(&mut self, offset: usize, len: usize) {
        let Some(bytes) = self
            .options
            .get_mut(offset..offset + len)
        else {
            net_debug!("option rewrite out of bounds ({}+{}), ignored", offset, len);
            return;
        };
        bytes.fill(opt::NOP);
        self.markers |= SegFlags::MODIFIED;
    }

    /// Clear the ECN-Echo and CWR flags, marking the segment
    /// modified.
    pub(crate) fn clear_ecn_flags(&mut self) {
        self.flags.remove(TcpFlags::ECE | TcpFlags::CWR);
        self.markers |= SegFlags::MODIFIED;
    }
}

impl<'p> fmt::Display for SegmentDescriptor<'p> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "seq={} end={} ack={} win={} len={} flags={:?}",
            self.seq, self.end_seq, self.ack, self.window, self.payload_len, self.flags
        )
    }
}
