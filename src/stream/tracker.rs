use core::fmt;

use crate::stream::OsPolicy;
use crate::stream::seg::SegmentDescriptor;
use crate::stream::state::State;
use crate::time::Instant;
use crate::wire::{TcpFlags, TcpSeqNumber};

bitflags::bitflags! {
    /// Negotiated capabilities and handshake sub-state of one
    /// endpoint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TrackerFlags: u8 {
        /// The endpoint emitted a TCP timestamp option.
        const TSTAMP = 0x01;
        /// The first timestamp seen from the endpoint was zero.
        const TSTAMP_ZERO = 0x02;
        /// Observed the endpoint's SYN.
        const SAW_SYN = 0x04;
        /// Observed the SYN|ACK answering it.
        const SAW_SYN_ACK = 0x08;
        /// Observed the handshake-completing ACK.
        const SAW_ACK = 0x10;
    }
}

impl TrackerFlags {
    const SETUP_OK: TrackerFlags = TrackerFlags::SAW_SYN
        .union(TrackerFlags::SAW_SYN_ACK)
        .union(TrackerFlags::SAW_ACK);
}

/// Per-direction connection state for one TCP endpoint.
///
/// A [Session] owns exactly two trackers in a fixed two-slot array;
/// the peer is always passed explicitly rather than stored, so a
/// tracker can never outlive or dangle into its pair.
///
/// All sequence validation is defined relative to two anchors:
/// `r_win_base` (the highest sequence this endpoint has acknowledged)
/// and `r_nxt_ack` (the next sequence expected from the peer).
///
/// [Session]: ../struct.Session.html
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracker {
    /// Lifecycle state of this endpoint.
    pub state: State,
    /// Next sequence number this endpoint will send.
    pub snd_nxt: TcpSeqNumber,
    /// Window this endpoint advertised in its last segment.
    pub snd_wnd: u16,
    /// Next sequence number expected from the peer.
    pub r_nxt_ack: TcpSeqNumber,
    /// Left edge of the receive window: highest sequence this
    /// endpoint has acknowledged.
    pub r_win_base: TcpSeqNumber,
    /// MSS this endpoint announced in its SYN, if any.
    pub mss: Option<u16>,
    /// Last timestamp value this endpoint sent.
    pub ts_last: u32,
    /// Wall-clock instant of the last timestamped segment from this
    /// endpoint.
    pub ts_last_packet: Instant,
    pub flags: TrackerFlags,
    pub os_policy: OsPolicy,
}

impl Tracker {
    pub fn new(state: State, os_policy: OsPolicy) -> Tracker {
        Tracker {
            state,
            snd_nxt: TcpSeqNumber(0),
            snd_wnd: 0,
            r_nxt_ack: TcpSeqNumber(0),
            r_win_base: TcpSeqNumber(0),
            mss: None,
            ts_last: 0,
            ts_last_packet: Instant::ZERO,
            flags: TrackerFlags::empty(),
            os_policy,
        }
    }

    /// Whether this endpoint completed a valid 3-way handshake under
    /// observation.
    pub fn setup_ok(&self) -> bool {
        self.flags.contains(TrackerFlags::SETUP_OK)
    }

    /// Bookkeeping for a segment this endpoint sent: advance the
    /// send-side anchor, remember the advertised window, and fold an
    /// ACK into the receive-window base.
    pub(crate) fn note_segment_sent(&mut self, seg: &SegmentDescriptor) {
        self.snd_wnd = seg.window();
        self.snd_nxt = self.snd_nxt.max(seg.end_seq());
        if seg.flags().contains(TcpFlags::ACK) {
            self.r_win_base = self.r_win_base.max(seg.ack());
        }
    }

    /// Bookkeeping for in-order data arriving from the peer.
    pub(crate) fn note_data_received(&mut self, seg: &SegmentDescriptor) {
        self.r_nxt_ack = self.r_nxt_ack.max(seg.end_seq());
    }

    /// Record a validated timestamp the peer just used. Regressions
    /// from reordered but otherwise acceptable segments are not
    /// folded in, so `ts_last` stays monotonic.
    pub(crate) fn note_timestamp(&mut self, ts: u32, now: Instant) {
        if self.ts_last == 0 || ts.wrapping_sub(self.ts_last) as i32 >= 0 {
            self.ts_last = ts;
        }
        self.ts_last_packet = now;
    }
}

impl fmt::Display for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} snd_nxt={} snd_wnd={} r_nxt_ack={} r_win_base={}",
            self.state, self.snd_nxt, self.snd_wnd, self.r_nxt_ack, self.r_win_base
        )
    }
}
