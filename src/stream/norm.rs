// Heads up! Before working on this file you should read RFC 793 and RFC 1323
// (PAWS), plus the segment-acceptability discussion in RFC 9293. The rules here
// deliberately model how deployed stacks behave, not just what the RFCs permit.

use core::fmt;

use crate::stream::seg::SegmentDescriptor;
use crate::stream::session::SessionFlags;
use crate::stream::tracker::{Tracker, TrackerFlags};
use crate::stream::{Context, DropReason, OsPolicy, ProtocolEvent};
use crate::time::Duration;
use crate::wire::{find_timestamp, opt};

/// PAWS wraparound guard: a timestamped endpoint silent for longer
/// than this cannot be validated against its last timestamp, because
/// the timestamp clock may have wrapped.
const PAWS_24DAYS: Duration = Duration::from_secs(24 * 24 * 60 * 60);

/// The mode a normalization rule runs in, resolved once per session.
///
/// `Off` still counts would-have-fired hits so operators can see what
/// a rule would do before enabling it inline.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum NormMode {
    Off = 0,
    On = 1,
}

/// One normalization rule, in the fixed order of the counter table.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum NormRule {
    TrimSyn = 0,
    TrimRst = 1,
    TrimWin = 2,
    TrimMss = 3,
    EcnSession = 4,
    TsNop = 5,
    IpsData = 6,
    Block = 7,
}

impl NormRule {
    pub const COUNT: usize = 8;

    /// Stable counter name, as exposed to external telemetry.
    pub fn name(&self) -> &'static str {
        match self {
            NormRule::TrimSyn => "tcp trim syn",
            NormRule::TrimRst => "tcp trim rst",
            NormRule::TrimWin => "tcp trim win",
            NormRule::TrimMss => "tcp trim mss",
            NormRule::EcnSession => "tcp ecn session",
            NormRule::TsNop => "tcp ts nop",
            NormRule::IpsData => "tcp ips data",
            NormRule::Block => "tcp block",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            NormRule::TrimSyn => "tcp segments trimmed on SYN",
            NormRule::TrimRst => "RST packets with data trimmed",
            NormRule::TrimWin => "data trimmed to window",
            NormRule::TrimMss => "data trimmed to MSS",
            NormRule::EcnSession => "ECN bits cleared",
            NormRule::TsNop => "timestamp options cleared",
            NormRule::IpsData => "normalized segments",
            NormRule::Block => "blocked segments",
        }
    }

    pub const ALL: [NormRule; NormRule::COUNT] = [
        NormRule::TrimSyn,
        NormRule::TrimRst,
        NormRule::TrimWin,
        NormRule::TrimMss,
        NormRule::EcnSession,
        NormRule::TsNop,
        NormRule::IpsData,
        NormRule::Block,
    ];
}

impl fmt::Display for NormRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Per-worker hit counters: one `[would-fire, fired]` pair per rule.
///
/// Workers never share a `NormStats`; the reporting collaborator
/// aggregates with [`merge`](#method.merge) at its own cadence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormStats {
    pegs: [[u64; 2]; NormRule::COUNT],
}

impl NormStats {
    pub fn new() -> NormStats {
        NormStats::default()
    }

    pub(crate) fn hit(&mut self, rule: NormRule, mode: NormMode) {
        self.pegs[rule as usize][mode as usize] += 1;
    }

    pub fn get(&self, rule: NormRule, mode: NormMode) -> u64 {
        self.pegs[rule as usize][mode as usize]
    }

    /// Fold another worker's counters into this one.
    pub fn merge(&mut self, other: &NormStats) {
        for (ours, theirs) in self.pegs.iter_mut().zip(other.pegs.iter()) {
            ours[0] += theirs[0];
            ours[1] += theirs[1];
        }
    }
}

/// Global normalization policy, as parsed by the configuration
/// layer: one enable per rule plus the inline-vs-detection switch.
/// Resolved into a [NormConfig] once per session.
///
/// [NormConfig]: struct.NormConfig.html
#[derive(Debug, Clone, Copy, Default)]
pub struct NormPolicy {
    /// Inline (IPS) vs detection-only (IDS) operation. In detection
    /// mode every rule observes and counts but never rewrites.
    pub inline_mode: bool,
    /// Master switch for payload normalization in reassembly.
    pub tcp_ips: bool,
    /// Require a full 3-way handshake before trusting ECN
    /// negotiation state.
    pub require_3whs: bool,
    pub trim_syn: bool,
    pub trim_rst: bool,
    pub trim_win: bool,
    pub trim_mss: bool,
    pub strip_ecn: bool,
    pub ts_nop: bool,
    pub tcp_block: bool,
    pub opt_block: bool,
}

impl NormPolicy {
    /// Everything enabled, inline. Primarily for tests and bench
    /// rigs.
    pub fn inline_all() -> NormPolicy {
        NormPolicy {
            inline_mode: true,
            tcp_ips: true,
            require_3whs: false,
            trim_syn: true,
            trim_rst: true,
            trim_win: true,
            trim_mss: true,
            strip_ecn: true,
            ts_nop: true,
            tcp_block: true,
            opt_block: true,
        }
    }
}

/// Resolved per-rule modes, fixed for the lifetime of a session.
/// Never re-resolved on the packet path.
#[derive(Debug, Clone, Copy)]
pub struct NormConfig {
    pub trim_syn: NormMode,
    pub trim_rst: NormMode,
    pub trim_win: NormMode,
    pub trim_mss: NormMode,
    pub strip_ecn: NormMode,
    pub ts_nop: NormMode,
    pub tcp_block: NormMode,
    pub opt_block: NormMode,
    pub tcp_ips: bool,
}

impl NormConfig {
    pub fn resolve(policy: &NormPolicy) -> NormConfig {
        let mode = |enabled: bool| {
            if enabled && policy.inline_mode {
                NormMode::On
            } else {
                NormMode::Off
            }
        };
        NormConfig {
            trim_syn: mode(policy.trim_syn),
            trim_rst: mode(policy.trim_rst),
            trim_win: mode(policy.trim_win),
            trim_mss: mode(policy.trim_mss),
            strip_ecn: mode(policy.strip_ecn),
            ts_nop: mode(policy.ts_nop),
            tcp_block: mode(policy.tcp_block),
            opt_block: mode(policy.opt_block),
            tcp_ips: policy.tcp_ips && policy.inline_mode,
        }
    }
}

/// Which RST sequence validation a stack applies. Selected through
/// [OsPolicy::rst_policy] at session setup.
///
/// [OsPolicy::rst_policy]: ../enum.OsPolicy.html#method.rst_policy
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RstPolicy {
    /// Sequence must equal the next expected sequence exactly.
    SeqEq,
    /// Sequence at or past the next expected sequence.
    SeqGeq,
    /// End sequence inside the receive window; admits an RST into a
    /// closed window, per RFC 793.
    EndSeqGeq,
}

/// Which block-rule mode governs an inline drop.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BlockKind {
    /// The general inline-block rule.
    Tcp,
    /// The option-block rule, used for PAWS rejections.
    Opt,
}

/// Stateless policy application: rewrites and validations applied to
/// a segment before it reaches reassembly.
///
/// One normalizer per session; modes and thresholds are resolved at
/// construction and never consulted from global state afterwards.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    config: NormConfig,
    os_policy: OsPolicy,
    rst_policy: RstPolicy,
    paws_ts_fudge: i32,
    paws_drop_zero_ts: bool,
    require_3whs: bool,
}

impl Normalizer {
    pub fn new(os_policy: OsPolicy, policy: &NormPolicy) -> Normalizer {
        Normalizer {
            config: NormConfig::resolve(policy),
            os_policy,
            rst_policy: os_policy.rst_policy(),
            paws_ts_fudge: os_policy.paws_ts_fudge(),
            paws_drop_zero_ts: os_policy.paws_drop_zero_ts(),
            require_3whs: policy.require_3whs,
        }
    }

    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    pub fn os_policy(&self) -> OsPolicy {
        self.os_policy
    }

    pub fn rst_policy(&self) -> RstPolicy {
        self.rst_policy
    }

    fn trim_payload(
        &self,
        cx: &mut Context,
        seg: &mut SegmentDescriptor,
        max: usize,
        mode: NormMode,
        rule: NormRule,
    ) {
        if mode == NormMode::On {
            net_trace!("{}: trimming payload {} -> {}", rule, seg.payload_len(), max);
            seg.shrink_payload(max);
        }
        cx.stats.hit(rule, mode);
    }

    /// Trim payload riding on a SYN. `max` is MSS-derived; a bare
    /// handshake SYN gets zero.
    pub fn trim_syn_payload(&self, cx: &mut Context, seg: &mut SegmentDescriptor, max: usize) {
        if seg.payload_len() > max {
            self.trim_payload(cx, seg, max, self.config.trim_syn, NormRule::TrimSyn);
        }
    }

    /// Trim unexpected data carried by an RST.
    pub fn trim_rst_payload(&self, cx: &mut Context, seg: &mut SegmentDescriptor, max: usize) {
        if seg.payload_len() > max {
            self.trim_payload(cx, seg, max, self.config.trim_rst, NormRule::TrimRst);
        }
    }

    /// Trim payload extending past the advertised window.
    pub fn trim_win_payload(&self, cx: &mut Context, seg: &mut SegmentDescriptor, max: usize) {
        if seg.payload_len() > max {
            self.trim_payload(cx, seg, max, self.config.trim_win, NormRule::TrimWin);
        }
    }

    /// Trim payload exceeding the receiver's negotiated MSS.
    pub fn trim_mss_payload(&self, cx: &mut Context, seg: &mut SegmentDescriptor, max: usize) {
        if seg.payload_len() > max {
            self.trim_payload(cx, seg, max, self.config.trim_mss, NormRule::TrimMss);
        }
    }

    /// Overwrite the timestamp option at `offset` with no-op bytes,
    /// in place and length-preserving. Returns whether the rewrite
    /// happened; in `Off` mode only the counter moves.
    pub fn strip_timestamp(
        &self,
        cx: &mut Context,
        seg: &mut SegmentDescriptor,
        offset: usize,
    ) -> bool {
        cx.stats.hit(NormRule::TsNop, self.config.ts_nop);
        if self.config.ts_nop == NormMode::On {
            seg.nop_options(offset, opt::LEN_TIMESTAMP);
            return true;
        }
        false
    }

    /// Record ECN negotiation from handshake segments. A SYN offers
    /// ECN with ECE+CWR; the SYN|ACK accepts with ECE alone.
    pub fn track_ecn(&self, flags: &mut SessionFlags, seg: &SegmentDescriptor) {
        use crate::wire::TcpFlags;
        if seg.is_syn_ack() {
            if !self.require_3whs || flags.contains(SessionFlags::ECN) {
                let accepted =
                    seg.flags() & (TcpFlags::ECE | TcpFlags::CWR) == TcpFlags::ECE;
                flags.set(SessionFlags::ECN, accepted);
            }
        } else if seg.is_syn() {
            flags.set(
                SessionFlags::ECN,
                seg.flags().contains(TcpFlags::ECE | TcpFlags::CWR),
            );
        }
    }

    /// Clear ECN bits on a segment of a session that never
    /// negotiated ECN.
    pub fn strip_ecn(&self, cx: &mut Context, seg: &mut SegmentDescriptor, flags: SessionFlags) {
        use crate::wire::TcpFlags;
        if !flags.contains(SessionFlags::ECN)
            && seg.flags().intersects(TcpFlags::ECE | TcpFlags::CWR)
        {
            if self.config.strip_ecn == NormMode::On {
                seg.clear_ecn_flags();
            }
            cx.stats.hit(NormRule::EcnSession, self.config.strip_ecn);
        }
    }

    /// Ask the disposition collaborator to drop the segment from the
    /// wire. Returns true when the drop was actually requested; in
    /// detection-only mode this is the logging path and returns
    /// false.
    pub fn packet_dropper(
        &self,
        cx: &mut Context,
        seg: &SegmentDescriptor,
        kind: BlockKind,
    ) -> bool {
        let mode = match kind {
            BlockKind::Tcp => self.config.tcp_block,
            BlockKind::Opt => self.config.opt_block,
        };
        cx.stats.hit(NormRule::Block, mode);
        if mode == NormMode::On {
            cx.disposition.drop_packet(seg);
            return true;
        }
        false
    }

    /// Counter hook for the reassembly collaborator: one normalized
    /// segment whose payload bytes were rewritten.
    pub fn normalized_data(&self, cx: &mut Context) {
        let mode = if self.config.tcp_ips {
            NormMode::On
        } else {
            NormMode::Off
        };
        cx.stats.hit(NormRule::IpsData, mode);
    }

    /// The usable receive window of `tracker` for validating `seg`.
    ///
    /// A zero advertised window is ambiguous: one-way traffic means
    /// it is simply uninitialized, two-way traffic means it is
    /// genuinely closed. A midstream pickup may also have missed
    /// window scaling, so the advertised value cannot be trusted
    /// there either; both fall back to the distance between the
    /// segment end and the receive-window base, floored at zero.
    pub fn effective_window(
        &self,
        flags: SessionFlags,
        tracker: &Tracker,
        seg: &SegmentDescriptor,
    ) -> u32 {
        if tracker.snd_wnd != 0 {
            if !flags.contains(SessionFlags::MIDSTREAM) {
                return tracker.snd_wnd as u32;
            }
        } else if flags.contains(SessionFlags::SEEN_CLIENT | SessionFlags::SEEN_SERVER) {
            return tracker.snd_wnd as u32;
        }

        let window = seg.end_seq() - tracker.r_win_base;
        window.max(0) as u32
    }

    /// Scan the options region for a timestamp. With `strip`
    /// requested (and the strip actually performed), reports the
    /// option as absent so the caller never acts on bytes that were
    /// just erased. Otherwise records the value on the segment.
    pub fn timestamp_of(
        &self,
        cx: &mut Context,
        seg: &mut SegmentDescriptor,
        strip: bool,
    ) -> bool {
        match find_timestamp(seg.options()) {
            Some(ts) => {
                if strip && self.strip_timestamp(cx, seg, ts.offset) {
                    seg.set_ts(None);
                    return false;
                }
                net_trace!("found timestamp {}", ts.tsval);
                seg.set_ts(Some(ts.tsval));
                true
            }
            None => {
                seg.set_ts(None);
                false
            }
        }
    }

    /// RST legitimacy under the session's OS policy. `tracker` is
    /// the endpoint receiving the RST.
    pub fn validate_rst(
        &self,
        flags: SessionFlags,
        seg: &SegmentDescriptor,
        tracker: &Tracker,
    ) -> bool {
        match self.rst_policy {
            RstPolicy::SeqEq => seg.seq() == tracker.r_nxt_ack,
            RstPolicy::SeqGeq => seg.seq() >= tracker.r_nxt_ack,
            RstPolicy::EndSeqGeq => {
                // A reset must be admitted even when the window has
                // closed.
                seg.end_seq() >= tracker.r_win_base
                    && seg.seq()
                        <= tracker.r_win_base
                            + self.effective_window(flags, tracker, seg) as usize
            }
        }
    }

    /// PAWS over four cases; evaluated for every non-RST segment.
    /// `tracker` is the receiver of the segment, `peer` its sender.
    /// Returns whether a usable timestamp was obtained.
    pub fn handle_paws(
        &self,
        cx: &mut Context,
        seg: &mut SegmentDescriptor,
        tracker: &mut Tracker,
        peer: &mut Tracker,
    ) -> Result<bool, DropReason> {
        if seg.is_rst() {
            return Ok(false);
        }

        if peer.flags.contains(TrackerFlags::TSTAMP)
            && tracker.flags.contains(TrackerFlags::TSTAMP)
        {
            // Case 1/4: both sides negotiated timestamps.
            if self.timestamp_of(cx, seg, false) {
                self.validate_paws_timestamp(cx, seg, peer)?;
                Ok(true)
            } else {
                // No timestamp, but the handshake said the talker
                // does them. Real stacks sometimes ack such a
                // segment anyway; alert and keep tracking.
                net_debug!("packet without timestamp, talker negotiated them earlier");
                cx.raise(ProtocolEvent::NoTimestamp);
                if self.os_policy.paws_disable_on_missing_ts() {
                    tracker.flags.remove(TrackerFlags::TSTAMP);
                }
                // The wire never delivers an inline-dropped segment,
                // so nothing downstream may advance on it either.
                if self.packet_dropper(cx, seg, BlockKind::Opt) {
                    return Err(DropReason::Blocked);
                }
                Ok(false)
            }
        } else if seg.is_syn_only() {
            // Case 2: a bare SYN. Nothing to compare against yet,
            // just note that the talker uses timestamps.
            let got_ts = self.timestamp_of(cx, seg, false);
            if got_ts {
                peer.flags |= TrackerFlags::TSTAMP;
            }
            Ok(got_ts)
        } else {
            self.handle_paws_no_timestamps(cx, seg, tracker, peer)
        }
    }

    fn validate_paws_timestamp(
        &self,
        cx: &mut Context,
        seg: &SegmentDescriptor,
        peer: &Tracker,
    ) -> Result<(), DropReason> {
        let ts = seg.ts().unwrap_or(0);
        let delta = ts.wrapping_sub(peer.ts_last) as i32 as i64 + self.paws_ts_fudge as i64;
        if delta < 0 {
            net_debug!("segment outside PAWS window (ts={} last={})", ts, peer.ts_last);
            cx.raise(ProtocolEvent::BadTimestamp);
            self.packet_dropper(cx, seg, BlockKind::Opt);
            return Err(DropReason::BadPacket);
        }

        // A peer quiet past the wraparound guard cannot prove
        // freshness with its timestamp; apparent forward jumps are
        // indistinguishable from a wrapped clock.
        if peer.ts_last != 0 && cx.now > peer.ts_last_packet + PAWS_24DAYS {
            net_debug!(
                "PAWS timestamp too far past the last timestamped packet at {}",
                peer.ts_last_packet
            );
            cx.raise(ProtocolEvent::BadTimestamp);
            self.packet_dropper(cx, seg, BlockKind::Opt);
            return Err(DropReason::BadPacket);
        }

        net_trace!("packet PAWS ok");
        Ok(())
    }

    // Case 3: the handshake did not negotiate timestamps, yet one
    // may show up. After a fully observed setup the option is noise
    // and gets stripped; before that we may simply have missed the
    // talker's SYN, so latch the capability now.
    fn handle_paws_no_timestamps(
        &self,
        cx: &mut Context,
        seg: &mut SegmentDescriptor,
        tracker: &mut Tracker,
        peer: &mut Tracker,
    ) -> Result<bool, DropReason> {
        let strip = tracker.setup_ok() && peer.setup_ok();
        let got_ts = self.timestamp_of(cx, seg, strip);
        if got_ts {
            if !peer.flags.contains(TrackerFlags::TSTAMP) {
                peer.flags |= TrackerFlags::TSTAMP;
                if seg.ts() == Some(0) {
                    peer.flags |= TrackerFlags::TSTAMP_ZERO;
                }
            }

            // Only meaningful when the listener side does
            // timestamps; otherwise the value is unused regardless.
            if self.paws_drop_zero_ts
                && seg.ts() == Some(0)
                && tracker.flags.contains(TrackerFlags::TSTAMP)
            {
                net_debug!("segment with zero timestamp, rejecting");
                cx.raise(ProtocolEvent::BadTimestamp);
                return Err(DropReason::BadPacket);
            }
        }
        Ok(got_ts)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stream::state::State;
    use crate::stream::testutil::Recorder;
    use crate::time::Instant;
    use crate::wire::{TcpFlags, TcpSeqNumber};

    fn seg<'p>(
        flags: TcpFlags,
        seq: i32,
        len: usize,
        options: &'p mut [u8],
    ) -> SegmentDescriptor<'p> {
        SegmentDescriptor::new(
            flags,
            TcpSeqNumber(seq),
            TcpSeqNumber(0),
            8192,
            0,
            options,
            len,
        )
    }

    fn norm(policy: NormPolicy) -> Normalizer {
        Normalizer::new(OsPolicy::Bsd, &policy)
    }

    macro_rules! with_cx {
        ($cx:ident, $stats:ident, $body:block) => {
            let mut $stats = NormStats::new();
            let mut events = Recorder::default();
            let mut drops = Recorder::default();
            #[allow(unused_mut)]
            let mut $cx = Context {
                now: Instant::from_secs(1),
                stats: &mut $stats,
                events: &mut events,
                disposition: &mut drops,
            };
            $body
        };
    }

    #[test]
    fn test_trim_on_reduces_and_counts() {
        let n = norm(NormPolicy::inline_all());
        with_cx!(cx, stats, {
            let mut opts: [u8; 0] = [];
            let mut seg = seg(TcpFlags::ACK, 100, 200, &mut opts);
            let end_before = seg.end_seq();
            n.trim_win_payload(&mut cx, &mut seg, 50);
            assert_eq!(seg.payload_len(), 50);
            assert_eq!(seg.end_seq(), end_before - 150);
            use crate::stream::seg::SegFlags;
            assert!(seg.markers().contains(SegFlags::MODIFIED | SegFlags::RESIZED));
        });
        assert_eq!(stats.get(NormRule::TrimWin, NormMode::On), 1);
    }

    #[test]
    fn test_trim_idempotent_below_max() {
        let n = norm(NormPolicy::inline_all());
        with_cx!(cx, stats, {
            let mut opts: [u8; 0] = [];
            let mut seg = seg(TcpFlags::ACK, 100, 40, &mut opts);
            n.trim_win_payload(&mut cx, &mut seg, 50);
            assert_eq!(seg.payload_len(), 40);
        });
        assert_eq!(stats.get(NormRule::TrimWin, NormMode::On), 0);
        assert_eq!(stats.get(NormRule::TrimWin, NormMode::Off), 0);
    }

    #[test]
    fn test_trim_off_counts_would_fire() {
        let n = norm(NormPolicy::default());
        with_cx!(cx, stats, {
            let mut opts: [u8; 0] = [];
            let mut seg = seg(TcpFlags::ACK, 100, 200, &mut opts);
            n.trim_win_payload(&mut cx, &mut seg, 50);
            // Detection-only: untouched, but counted.
            assert_eq!(seg.payload_len(), 200);
        });
        assert_eq!(stats.get(NormRule::TrimWin, NormMode::Off), 1);
        assert_eq!(stats.get(NormRule::TrimWin, NormMode::On), 0);
    }

    #[test]
    fn test_trim_syn_scenario() {
        // SYN with 200 bytes of payload, mode ON, max 0: everything
        // goes, end_seq drops by 200, markers set, ON counter bumps.
        let n = norm(NormPolicy::inline_all());
        with_cx!(cx, stats, {
            let mut opts: [u8; 0] = [];
            let mut seg = seg(TcpFlags::SYN, 1000, 200, &mut opts);
            let end_before = seg.end_seq();
            n.trim_syn_payload(&mut cx, &mut seg, 0);
            assert_eq!(seg.payload_len(), 0);
            assert_eq!(seg.end_seq(), end_before - 200);
        });
        assert_eq!(stats.get(NormRule::TrimSyn, NormMode::On), 1);
    }

    const TS_OPTS: [u8; 12] = [
        opt::NOP,
        opt::NOP,
        opt::TIMESTAMP,
        10,
        0x00,
        0x00,
        0x00,
        0x64, // tsval 100
        0x00,
        0x00,
        0x00,
        0x00,
    ];

    #[test]
    fn test_strip_timestamp_preserves_length() {
        let n = norm(NormPolicy::inline_all());
        with_cx!(cx, stats, {
            let mut opts = TS_OPTS;
            let mut seg = seg(TcpFlags::ACK, 100, 0, &mut opts);
            let len_before = seg.options().len();
            assert!(!n.timestamp_of(&mut cx, &mut seg, true));
            assert_eq!(seg.options().len(), len_before);
            assert!(seg.options().iter().all(|&b| b == opt::NOP));
            assert_eq!(seg.ts(), None);
        });
        assert_eq!(stats.get(NormRule::TsNop, NormMode::On), 1);
    }

    #[test]
    fn test_timestamp_of_records_value() {
        let n = norm(NormPolicy::default());
        with_cx!(cx, _stats, {
            let mut opts = TS_OPTS;
            let mut seg = seg(TcpFlags::ACK, 100, 0, &mut opts);
            assert!(n.timestamp_of(&mut cx, &mut seg, false));
            assert_eq!(seg.ts(), Some(100));
        });
    }

    #[test]
    fn test_strip_requested_but_off_still_reports_value() {
        // In detection mode the strip does not happen, so the caller
        // may still act on the (intact) option.
        let n = norm(NormPolicy::default());
        with_cx!(cx, stats, {
            let mut opts = TS_OPTS;
            let mut seg = seg(TcpFlags::ACK, 100, 0, &mut opts);
            assert!(n.timestamp_of(&mut cx, &mut seg, true));
            assert_eq!(seg.ts(), Some(100));
        });
        assert_eq!(stats.get(NormRule::TsNop, NormMode::Off), 1);
    }

    fn tracker_with(snd_wnd: u16, r_win_base: i32, r_nxt_ack: i32) -> Tracker {
        let mut t = Tracker::new(State::Established, OsPolicy::Bsd);
        t.snd_wnd = snd_wnd;
        t.r_win_base = TcpSeqNumber(r_win_base);
        t.r_nxt_ack = TcpSeqNumber(r_nxt_ack);
        t
    }

    #[test]
    fn test_effective_window_two_way_nonzero() {
        let n = norm(NormPolicy::default());
        let t = tracker_with(4096, 100, 100);
        let mut opts: [u8; 0] = [];
        let s = seg(TcpFlags::ACK, 100, 10, &mut opts);
        let flags = SessionFlags::SEEN_CLIENT | SessionFlags::SEEN_SERVER;
        assert_eq!(n.effective_window(flags, &t, &s), 4096);
    }

    #[test]
    fn test_effective_window_zero_two_way_is_closed() {
        let n = norm(NormPolicy::default());
        let t = tracker_with(0, 100, 100);
        let mut opts: [u8; 0] = [];
        let s = seg(TcpFlags::ACK, 100, 10, &mut opts);
        let flags = SessionFlags::SEEN_CLIENT | SessionFlags::SEEN_SERVER;
        assert_eq!(n.effective_window(flags, &t, &s), 0);
    }

    #[test]
    fn test_effective_window_uninitialized_derives_from_segment() {
        let n = norm(NormPolicy::default());
        let t = tracker_with(0, 100, 100);
        let mut opts: [u8; 0] = [];
        let s = seg(TcpFlags::ACK, 100, 50, &mut opts);
        // One-way traffic so far: zero window is uninitialized.
        assert_eq!(n.effective_window(SessionFlags::SEEN_CLIENT, &t, &s), 50);

        // Never negative.
        let mut opts: [u8; 0] = [];
        let s = seg(TcpFlags::ACK, 20, 10, &mut opts);
        assert_eq!(n.effective_window(SessionFlags::SEEN_CLIENT, &t, &s), 0);
    }

    #[test]
    fn test_effective_window_midstream_distrusts_advertisement() {
        let n = norm(NormPolicy::default());
        let t = tracker_with(4096, 100, 100);
        let mut opts: [u8; 0] = [];
        let s = seg(TcpFlags::ACK, 100, 50, &mut opts);
        let flags = SessionFlags::MIDSTREAM | SessionFlags::SEEN_CLIENT;
        // Scaling may have been missed; fall back to the derived
        // window.
        assert_eq!(n.effective_window(flags, &t, &s), 50);
    }

    fn rst_norm(policy: RstPolicy) -> Normalizer {
        let os = match policy {
            RstPolicy::SeqEq => OsPolicy::Bsd,
            RstPolicy::SeqGeq => OsPolicy::OldLinux,
            RstPolicy::EndSeqGeq => OsPolicy::Linux,
        };
        Normalizer::new(os, &NormPolicy::default())
    }

    #[test]
    fn test_rst_at_next_expected_accepted_by_all() {
        let flags = SessionFlags::SEEN_CLIENT | SessionFlags::SEEN_SERVER;
        for policy in [RstPolicy::SeqEq, RstPolicy::SeqGeq, RstPolicy::EndSeqGeq] {
            let n = rst_norm(policy);
            let t = tracker_with(4096, 980, 1000);
            let mut opts: [u8; 0] = [];
            let s = seg(TcpFlags::RST, 1000, 0, &mut opts);
            assert!(n.validate_rst(flags, &s, &t), "{:?}", policy);
        }
    }

    #[test]
    fn test_rst_far_outside_window_rejected_by_all() {
        let flags = SessionFlags::SEEN_CLIENT | SessionFlags::SEEN_SERVER;
        for policy in [RstPolicy::SeqEq, RstPolicy::SeqGeq, RstPolicy::EndSeqGeq] {
            let n = rst_norm(policy);
            let t = tracker_with(4096, 980, 1000);
            let mut opts: [u8; 0] = [];
            let s = seg(TcpFlags::RST, 1000 - 70000, 0, &mut opts);
            assert!(!n.validate_rst(flags, &s, &t), "{:?}", policy);
        }
    }

    #[test]
    fn test_rst_before_next_expected_only_window_policy_accepts() {
        let flags = SessionFlags::SEEN_CLIENT | SessionFlags::SEEN_SERVER;
        let t = tracker_with(4096, 980, 1000);

        // seq < r_nxt_ack but end_seq >= r_win_base: retransmitted
        // RST overlapping already-acked data.
        let mut opts: [u8; 0] = [];
        let s = seg(TcpFlags::RST, 990, 0, &mut opts);

        assert!(!rst_norm(RstPolicy::SeqEq).validate_rst(flags, &s, &t));
        assert!(!rst_norm(RstPolicy::SeqGeq).validate_rst(flags, &s, &t));
        assert!(rst_norm(RstPolicy::EndSeqGeq).validate_rst(flags, &s, &t));
    }

    fn ts_pair() -> (Tracker, Tracker) {
        let mut tracker = Tracker::new(State::Established, OsPolicy::Bsd);
        let mut peer = Tracker::new(State::Established, OsPolicy::Bsd);
        tracker.flags |= TrackerFlags::TSTAMP;
        peer.flags |= TrackerFlags::TSTAMP;
        peer.ts_last = 100;
        peer.ts_last_packet = Instant::from_secs(1);
        (tracker, peer)
    }

    fn ts_opts(tsval: u32) -> [u8; 12] {
        let mut opts = TS_OPTS;
        opts[4..8].copy_from_slice(&tsval.to_be_bytes());
        opts
    }

    #[test]
    fn test_paws_regression_rejected() {
        let n = norm(NormPolicy::inline_all());
        let (mut tracker, mut peer) = ts_pair();
        with_cx!(cx, stats, {
            let mut opts = ts_opts(98);
            let mut s = seg(TcpFlags::ACK, 100, 10, &mut opts);
            assert_eq!(
                n.handle_paws(&mut cx, &mut s, &mut tracker, &mut peer),
                Err(DropReason::BadPacket)
            );
        });
        assert_eq!(stats.get(NormRule::Block, NormMode::On), 1);
    }

    #[test]
    fn test_paws_equal_or_newer_accepted() {
        let n = norm(NormPolicy::inline_all());
        for tsval in [100u32, 101, 5000] {
            let (mut tracker, mut peer) = ts_pair();
            with_cx!(cx, _stats, {
                let mut opts = ts_opts(tsval);
                let mut s = seg(TcpFlags::ACK, 100, 10, &mut opts);
                assert_eq!(
                    n.handle_paws(&mut cx, &mut s, &mut tracker, &mut peer),
                    Ok(true)
                );
            });
        }
    }

    #[test]
    fn test_paws_fudge_tolerates_slight_regression() {
        // HP-UX 11 allows a delta of -1.
        let n = Normalizer::new(OsPolicy::HpUx11, &NormPolicy::default());
        let (mut tracker, mut peer) = ts_pair();
        with_cx!(cx, _stats, {
            let mut opts = ts_opts(99);
            let mut s = seg(TcpFlags::ACK, 100, 10, &mut opts);
            assert_eq!(
                n.handle_paws(&mut cx, &mut s, &mut tracker, &mut peer),
                Ok(true)
            );
        });

        let (mut tracker, mut peer) = ts_pair();
        with_cx!(cx, _stats, {
            let mut opts = ts_opts(98);
            let mut s = seg(TcpFlags::ACK, 100, 10, &mut opts);
            assert_eq!(
                n.handle_paws(&mut cx, &mut s, &mut tracker, &mut peer),
                Err(DropReason::BadPacket)
            );
        });
    }

    #[test]
    fn test_paws_24day_ceiling() {
        let n = norm(NormPolicy::default());
        let (mut tracker, mut peer) = ts_pair();
        let mut stats = NormStats::new();
        let mut events = Recorder::default();
        let mut drops = Recorder::default();
        let mut cx = Context {
            now: Instant::from_secs(1 + 25 * 24 * 60 * 60),
            stats: &mut stats,
            events: &mut events,
            disposition: &mut drops,
        };
        let mut opts = ts_opts(200);
        let mut s = seg(TcpFlags::ACK, 100, 10, &mut opts);
        assert_eq!(
            n.handle_paws(&mut cx, &mut s, &mut tracker, &mut peer),
            Err(DropReason::BadPacket)
        );
        assert_eq!(events.events, [ProtocolEvent::BadTimestamp]);
    }

    #[test]
    fn test_paws_missing_timestamp_continues() {
        let n = norm(NormPolicy::default());
        let (mut tracker, mut peer) = ts_pair();
        let mut stats = NormStats::new();
        let mut events = Recorder::default();
        let mut drops = Recorder::default();
        let mut cx = Context {
            now: Instant::from_secs(2),
            stats: &mut stats,
            events: &mut events,
            disposition: &mut drops,
        };
        let mut opts: [u8; 0] = [];
        let mut s = seg(TcpFlags::ACK, 100, 10, &mut opts);
        assert_eq!(n.handle_paws(&mut cx, &mut s, &mut tracker, &mut peer), Ok(false));
        assert_eq!(events.events, [ProtocolEvent::NoTimestamp]);
        assert!(tracker.flags.contains(TrackerFlags::TSTAMP));
    }

    #[test]
    fn test_paws_missing_timestamp_blocked_inline() {
        // With the option-block rule inline, the missing-timestamp
        // anomaly drops the segment from the wire.
        let n = norm(NormPolicy::inline_all());
        let (mut tracker, mut peer) = ts_pair();
        with_cx!(cx, stats, {
            let mut opts: [u8; 0] = [];
            let mut s = seg(TcpFlags::ACK, 100, 10, &mut opts);
            assert_eq!(
                n.handle_paws(&mut cx, &mut s, &mut tracker, &mut peer),
                Err(DropReason::Blocked)
            );
        });
        assert_eq!(stats.get(NormRule::Block, NormMode::On), 1);
    }

    #[test]
    fn test_paws_solaris_disables_enforcement_on_missing_ts() {
        let n = Normalizer::new(OsPolicy::Solaris, &NormPolicy::default());
        let (mut tracker, mut peer) = ts_pair();
        with_cx!(cx, _stats, {
            let mut opts: [u8; 0] = [];
            let mut s = seg(TcpFlags::ACK, 100, 10, &mut opts);
            assert_eq!(n.handle_paws(&mut cx, &mut s, &mut tracker, &mut peer), Ok(false));
        });
        assert!(!tracker.flags.contains(TrackerFlags::TSTAMP));
    }

    #[test]
    fn test_paws_bare_syn_latches_capability() {
        let n = norm(NormPolicy::default());
        let mut tracker = Tracker::new(State::Listen, OsPolicy::Bsd);
        let mut peer = Tracker::new(State::Closed, OsPolicy::Bsd);
        with_cx!(cx, _stats, {
            let mut opts = ts_opts(1);
            let mut s = seg(TcpFlags::SYN, 100, 0, &mut opts);
            assert_eq!(n.handle_paws(&mut cx, &mut s, &mut tracker, &mut peer), Ok(true));
        });
        assert!(peer.flags.contains(TrackerFlags::TSTAMP));
    }

    #[test]
    fn test_paws_stray_option_stripped_after_setup() {
        let n = norm(NormPolicy::inline_all());
        let mut tracker = Tracker::new(State::Established, OsPolicy::Bsd);
        let mut peer = Tracker::new(State::Established, OsPolicy::Bsd);
        tracker.flags |= TrackerFlags::SAW_SYN | TrackerFlags::SAW_SYN_ACK | TrackerFlags::SAW_ACK;
        peer.flags |= TrackerFlags::SAW_SYN | TrackerFlags::SAW_SYN_ACK | TrackerFlags::SAW_ACK;
        with_cx!(cx, stats, {
            let mut opts = ts_opts(7);
            let mut s = seg(TcpFlags::ACK, 100, 10, &mut opts);
            // Stripped as noise, reported absent.
            assert_eq!(n.handle_paws(&mut cx, &mut s, &mut tracker, &mut peer), Ok(false));
            assert!(s.options().iter().all(|&b| b == opt::NOP));
        });
        assert_eq!(stats.get(NormRule::TsNop, NormMode::On), 1);
    }

    #[test]
    fn test_paws_zero_timestamp_after_negotiation_rejected() {
        let n = norm(NormPolicy::default());
        let mut tracker = Tracker::new(State::Established, OsPolicy::Bsd);
        let mut peer = Tracker::new(State::Established, OsPolicy::Bsd);
        // Listener does timestamps, talker's SYN was missed.
        tracker.flags |= TrackerFlags::TSTAMP;
        let mut stats = NormStats::new();
        let mut events = Recorder::default();
        let mut drops = Recorder::default();
        let mut cx = Context {
            now: Instant::from_secs(2),
            stats: &mut stats,
            events: &mut events,
            disposition: &mut drops,
        };
        let mut opts = ts_opts(0);
        let mut s = seg(TcpFlags::ACK, 100, 10, &mut opts);
        assert_eq!(
            n.handle_paws(&mut cx, &mut s, &mut tracker, &mut peer),
            Err(DropReason::BadPacket)
        );
        assert_eq!(events.events, [ProtocolEvent::BadTimestamp]);
        assert!(peer.flags.contains(TrackerFlags::TSTAMP | TrackerFlags::TSTAMP_ZERO));
    }

    #[test]
    fn test_paws_old_linux_tolerates_zero_timestamp() {
        let n = Normalizer::new(OsPolicy::OldLinux, &NormPolicy::default());
        let mut tracker = Tracker::new(State::Established, OsPolicy::OldLinux);
        let mut peer = Tracker::new(State::Established, OsPolicy::OldLinux);
        tracker.flags |= TrackerFlags::TSTAMP;
        with_cx!(cx, _stats, {
            let mut opts = ts_opts(0);
            let mut s = seg(TcpFlags::ACK, 100, 10, &mut opts);
            assert_eq!(n.handle_paws(&mut cx, &mut s, &mut tracker, &mut peer), Ok(true));
        });
    }

    #[test]
    fn test_ecn_negotiated_then_not_stripped() {
        use crate::wire::TcpFlags;
        let n = norm(NormPolicy::inline_all());
        let mut flags = SessionFlags::empty();

        let mut opts: [u8; 0] = [];
        let syn = seg(TcpFlags::SYN | TcpFlags::ECE | TcpFlags::CWR, 1, 0, &mut opts);
        n.track_ecn(&mut flags, &syn);
        assert!(flags.contains(SessionFlags::ECN));

        let mut opts: [u8; 0] = [];
        let syn_ack = seg(TcpFlags::SYN | TcpFlags::ACK | TcpFlags::ECE, 1, 0, &mut opts);
        n.track_ecn(&mut flags, &syn_ack);
        assert!(flags.contains(SessionFlags::ECN));

        with_cx!(cx, stats, {
            let mut opts: [u8; 0] = [];
            let mut data = seg(TcpFlags::ACK | TcpFlags::ECE, 10, 10, &mut opts);
            n.strip_ecn(&mut cx, &mut data, flags);
            assert!(data.flags().contains(TcpFlags::ECE));
        });
        assert_eq!(stats.get(NormRule::EcnSession, NormMode::On), 0);
    }

    #[test]
    fn test_ecn_not_negotiated_stripped() {
        use crate::wire::TcpFlags;
        let n = norm(NormPolicy::inline_all());
        let flags = SessionFlags::empty();
        with_cx!(cx, stats, {
            let mut opts: [u8; 0] = [];
            let mut data = seg(TcpFlags::ACK | TcpFlags::ECE | TcpFlags::CWR, 10, 10, &mut opts);
            n.strip_ecn(&mut cx, &mut data, flags);
            assert!(!data.flags().intersects(TcpFlags::ECE | TcpFlags::CWR));
            assert!(data.markers().contains(crate::stream::seg::SegFlags::MODIFIED));
        });
        assert_eq!(stats.get(NormRule::EcnSession, NormMode::On), 1);
    }

    #[test]
    fn test_block_inline_vs_detection() {
        let mut stats = NormStats::new();
        let mut events = Recorder::default();
        let mut drops = Recorder::default();

        let n = norm(NormPolicy::inline_all());
        {
            let mut cx = Context {
                now: Instant::ZERO,
                stats: &mut stats,
                events: &mut events,
                disposition: &mut drops,
            };
            let mut opts: [u8; 0] = [];
            let s = seg(TcpFlags::ACK, 1, 0, &mut opts);
            assert!(n.packet_dropper(&mut cx, &s, BlockKind::Tcp));
        }
        assert_eq!(drops.dropped, 1);
        assert_eq!(stats.get(NormRule::Block, NormMode::On), 1);

        let n = norm(NormPolicy::default());
        {
            let mut cx = Context {
                now: Instant::ZERO,
                stats: &mut stats,
                events: &mut events,
                disposition: &mut drops,
            };
            let mut opts: [u8; 0] = [];
            let s = seg(TcpFlags::ACK, 1, 0, &mut opts);
            assert!(!n.packet_dropper(&mut cx, &s, BlockKind::Tcp));
        }
        assert_eq!(drops.dropped, 1);
        assert_eq!(stats.get(NormRule::Block, NormMode::Off), 1);
    }

    #[test]
    fn test_counter_name_table_stable() {
        let names: std::vec::Vec<_> = NormRule::ALL.iter().map(|r| r.name()).collect();
        assert_eq!(
            names,
            [
                "tcp trim syn",
                "tcp trim rst",
                "tcp trim win",
                "tcp trim mss",
                "tcp ecn session",
                "tcp ts nop",
                "tcp ips data",
                "tcp block",
            ]
        );
    }

    #[test]
    fn test_ips_data_counter_follows_master_switch() {
        let n = norm(NormPolicy::inline_all());
        with_cx!(cx, stats, {
            n.normalized_data(&mut cx);
        });
        assert_eq!(stats.get(NormRule::IpsData, NormMode::On), 1);

        let n = norm(NormPolicy::default());
        with_cx!(cx, stats, {
            n.normalized_data(&mut cx);
        });
        assert_eq!(stats.get(NormRule::IpsData, NormMode::Off), 1);
    }

    #[test]
    fn test_stats_merge() {
        let mut a = NormStats::new();
        let mut b = NormStats::new();
        a.hit(NormRule::TrimSyn, NormMode::On);
        b.hit(NormRule::TrimSyn, NormMode::On);
        b.hit(NormRule::Block, NormMode::Off);
        a.merge(&b);
        assert_eq!(a.get(NormRule::TrimSyn, NormMode::On), 2);
        assert_eq!(a.get(NormRule::Block, NormMode::Off), 1);
    }
}
