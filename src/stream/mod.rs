/*! TCP stream normalization and connection-state tracking.

The `stream` module is the inline fast path of the engine. It
receives one already-parsed TCP segment at a time, rewrites or
rejects segments that would let an endpoint evade detection, and
advances a per-connection state machine that decides which protocol
events are currently legal.

 * [SegmentDescriptor] is the view of one inbound segment.
 * [Tracker] is the per-direction connection state; a [Session]
   owns exactly two of them.
 * [Normalizer] applies the policy-driven rewrite rules.
 * [Session::process] dispatches a segment through the state
   machine and returns a [Verdict].

A flow is processed by exactly one worker at a time: nothing here
locks, blocks, or allocates. Counters are plain per-worker values
([NormStats]) merged at reporting time.

[SegmentDescriptor]: struct.SegmentDescriptor.html
[Tracker]: struct.Tracker.html
[Normalizer]: struct.Normalizer.html
[Session::process]: struct.Session.html#method.process
[Verdict]: enum.Verdict.html
[NormStats]: struct.NormStats.html
*/

use core::fmt;

use crate::time::Instant;

pub mod norm;
pub mod seg;
pub mod session;
pub mod state;
pub mod tracker;

pub use self::norm::{
    BlockKind, NormConfig, NormMode, NormPolicy, NormRule, NormStats, Normalizer, RstPolicy,
};
pub use self::seg::{SegFlags, SegmentDescriptor};
pub use self::session::{Session, SessionFlags};
pub use self::state::{State, TcpEvent};
pub use self::tracker::{Tracker, TrackerFlags};

/// The direction a segment travels, relative to the flow.
///
/// The upstream flow table resolves every segment to a session and a
/// direction before handing it to [Session::process].
///
/// [Session::process]: struct.Session.html#method.process
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Direction {
    FromClient,
    FromServer,
}

impl Direction {
    pub fn flip(self) -> Direction {
        match self {
            Direction::FromClient => Direction::FromServer,
            Direction::FromServer => Direction::FromClient,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Direction::FromClient => write!(f, "client->server"),
            Direction::FromServer => write!(f, "server->client"),
        }
    }
}

/// Protocol events raised toward the alerting subsystem.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ProtocolEvent {
    /// A timestamp failed PAWS validation, or was zero after
    /// negotiation.
    BadTimestamp,
    /// A timestamp was expected but absent.
    NoTimestamp,
    /// Any other non-conformant but survivable behavior.
    ProtocolAnomaly,
}

impl fmt::Display for ProtocolEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ProtocolEvent::BadTimestamp => write!(f, "bad timestamp"),
            ProtocolEvent::NoTimestamp => write!(f, "missing timestamp"),
            ProtocolEvent::ProtocolAnomaly => write!(f, "protocol anomaly"),
        }
    }
}

/// Consumer of protocol events; implemented by the signature and
/// alerting subsystem.
pub trait EventSink {
    fn raise_protocol_event(&mut self, kind: ProtocolEvent);
}

/// The packet-disposition collaborator. `drop_packet` discards the
/// segment from the wire (inline blocking) rather than merely
/// flagging it.
pub trait PacketDisposition {
    fn drop_packet(&mut self, seg: &SegmentDescriptor);
}

/// Per-call processing context: the clock, the per-worker counters,
/// and the collaborators a segment's disposition is reported to.
///
/// Nothing in the context is retained across calls; the session
/// itself holds no references into it.
pub struct Context<'a> {
    pub now: Instant,
    pub stats: &'a mut NormStats,
    pub events: &'a mut dyn EventSink,
    pub disposition: &'a mut dyn PacketDisposition,
}

impl<'a> Context<'a> {
    pub(crate) fn raise(&mut self, kind: ProtocolEvent) {
        net_debug!("raising protocol event: {}", kind);
        self.events.raise_protocol_event(kind);
    }
}

/// Why a segment was rejected.
///
/// Both reasons route through [PacketDisposition::drop_packet] when
/// the relevant rule runs inline, but they are distinguished for
/// counters and alerts.
///
/// [PacketDisposition::drop_packet]: trait.PacketDisposition.html#tymethod.drop_packet
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DropReason {
    /// The segment failed a validation the policy requires to cause
    /// rejection, e.g. a PAWS timestamp regression.
    BadPacket,
    /// Configuration explicitly requested an inline drop for a
    /// normalization rule.
    Blocked,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            DropReason::BadPacket => write!(f, "bad packet"),
            DropReason::Blocked => write!(f, "blocked packet"),
        }
    }
}

impl core::error::Error for DropReason {}

/// The outcome of processing one segment.
///
/// `Accept` means the (possibly rewritten) segment may be forwarded
/// downstream to reassembly; whether it was mutated is recorded on
/// the segment's marker flags. A rejected segment must not advance
/// reassembly, but the flow itself continues to be tracked.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Verdict {
    Accept,
    Drop(DropReason),
}

/// Per-connection operating-system policy.
///
/// TCP stacks disagree about which RST sequence numbers to honor and
/// about several PAWS edge cases. The policy is chosen once, when the
/// session is created, and selects a behavior variant for the
/// lifetime of the connection. Thresholds encoded here reproduce
/// observed stack behavior and are deliberately named constants
/// rather than derived values.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum OsPolicy {
    #[default]
    Bsd,
    MacOs,
    Windows,
    Vista,
    Linux,
    OldLinux,
    Solaris,
    Irix,
    HpUx10,
    HpUx11,
}

/// PAWS tolerance applied by HP-UX 11 stacks, in timestamp units.
const PAWS_TS_FUDGE_HPUX11: i32 = 1;

impl OsPolicy {
    /// Which RST legitimacy check the stack applies.
    pub fn rst_policy(&self) -> RstPolicy {
        match self {
            // Modern stacks require an exact match against the next
            // expected sequence number.
            OsPolicy::Bsd | OsPolicy::MacOs | OsPolicy::Windows | OsPolicy::Vista => {
                RstPolicy::SeqEq
            }
            // Legacy liberal stacks accept anything at or past it.
            OsPolicy::OldLinux | OsPolicy::HpUx10 => RstPolicy::SeqGeq,
            // Window-based stacks admit an RST anywhere in the
            // receive window, including a closed one, per RFC 793.
            OsPolicy::Linux | OsPolicy::Solaris | OsPolicy::Irix | OsPolicy::HpUx11 => {
                RstPolicy::EndSeqGeq
            }
        }
    }

    /// Signed slack added to the PAWS delta before the sign test.
    pub fn paws_ts_fudge(&self) -> i32 {
        match self {
            OsPolicy::HpUx11 => PAWS_TS_FUDGE_HPUX11,
            _ => 0,
        }
    }

    /// Whether a zero timestamp after negotiation rejects the
    /// segment. Old Linux stacks emit them legitimately.
    pub fn paws_drop_zero_ts(&self) -> bool {
        !matches!(self, OsPolicy::OldLinux)
    }

    /// Whether a missing timestamp disables timestamp enforcement
    /// for the remainder of the connection.
    pub fn paws_disable_on_missing_ts(&self) -> bool {
        matches!(self, OsPolicy::Solaris)
    }
}
