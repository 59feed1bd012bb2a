use core::fmt;

use crate::stream::norm::{NormPolicy, Normalizer};
use crate::stream::seg::SegmentDescriptor;
use crate::stream::state::{Dispatch, Rel, State, TcpEvent, transition};
use crate::stream::tracker::Tracker;
use crate::stream::{Context, Direction, DropReason, OsPolicy, Verdict};

bitflags::bitflags! {
    /// Session-wide history, independent of either endpoint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SessionFlags: u8 {
        /// At least one segment seen from the client.
        const SEEN_CLIENT = 0x01;
        /// At least one segment seen from the server.
        const SEEN_SERVER = 0x02;
        /// Flow picked up after its handshake; advertised windows
        /// cannot be trusted (scaling may have been missed).
        const MIDSTREAM = 0x04;
        /// The handshake negotiated ECN.
        const ECN = 0x08;
    }
}

/// One tracked TCP connection: a fixed pair of endpoint trackers,
/// the session history flags, and the normalization policy resolved
/// for this flow.
///
/// The session holds no references to the outside world; clock,
/// counters, and collaborators arrive in the [Context] of each
/// `process` call, so sessions can be stored, pooled, and migrated
/// freely between workers.
///
/// [Context]: struct.Context.html
#[derive(Debug)]
pub struct Session {
    // Fixed slots: client in [0], server in [1].
    trackers: [Tracker; 2],
    flags: SessionFlags,
    normalizer: Normalizer,
}

impl Session {
    /// A session created on the flow's first packet, expecting to
    /// observe the handshake.
    pub fn new(os_policy: OsPolicy, policy: &NormPolicy) -> Session {
        Session {
            trackers: [
                Tracker::new(State::Closed, os_policy),
                Tracker::new(State::Listen, os_policy),
            ],
            flags: SessionFlags::empty(),
            normalizer: Normalizer::new(os_policy, policy),
        }
    }

    /// A session adopted mid-flow: both endpoints are assumed
    /// synchronized, and window advertisements are distrusted since
    /// the handshake (and any window scaling) went unobserved.
    pub fn new_midstream(os_policy: OsPolicy, policy: &NormPolicy) -> Session {
        Session {
            trackers: [
                Tracker::new(State::Established, os_policy),
                Tracker::new(State::Established, os_policy),
            ],
            flags: SessionFlags::MIDSTREAM,
            normalizer: Normalizer::new(os_policy, policy),
        }
    }

    pub fn client(&self) -> &Tracker {
        &self.trackers[0]
    }

    pub fn server(&self) -> &Tracker {
        &self.trackers[1]
    }

    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// Both endpoints fully closed; the session can be reaped.
    pub fn is_closed(&self) -> bool {
        self.trackers
            .iter()
            .all(|t| matches!(t.state, State::Closed | State::TimeWait))
    }

    /// Run one segment through normalization and both endpoint
    /// state machines.
    ///
    /// The listener (the segment's receiver) is dispatched first and
    /// carries every validation; a rejection short-circuits before
    /// any talker-side bookkeeping, so a rejected segment never
    /// advances `snd_nxt` or `ts_last`. The talker's dispatch only
    /// does bookkeeping and sender-side transitions.
    pub fn process(
        &mut self,
        cx: &mut Context,
        direction: Direction,
        seg: &mut SegmentDescriptor,
    ) -> Verdict {
        match self.process_inner(cx, direction, seg) {
            Ok(()) => Verdict::Accept,
            Err(reason) => {
                net_debug!("{}: dropping segment: {}", direction, reason);
                Verdict::Drop(reason)
            }
        }
    }

    fn process_inner(
        &mut self,
        cx: &mut Context,
        direction: Direction,
        seg: &mut SegmentDescriptor,
    ) -> Result<(), DropReason> {
        let event = TcpEvent::classify(seg);
        net_trace!("{}: {} {}", direction, event, seg);

        self.flags |= match direction {
            Direction::FromClient => SessionFlags::SEEN_CLIENT,
            Direction::FromServer => SessionFlags::SEEN_SERVER,
        };

        // ECN state is session-wide: handshake segments feed the
        // negotiation, everything else gets scrubbed against it.
        if matches!(event, TcpEvent::Syn | TcpEvent::SynAck) {
            self.normalizer.track_ecn(&mut self.flags, seg);
        } else {
            self.normalizer.strip_ecn(cx, seg, self.flags);
        }

        let [client, server] = &mut self.trackers;
        let (talker, listener) = match direction {
            Direction::FromClient => (client, server),
            Direction::FromServer => (server, client),
        };

        let mut d = Dispatch {
            norm: &self.normalizer,
            cx: &mut *cx,
            seg: &mut *seg,
            flags: &mut self.flags,
        };
        let listener_next = transition(&mut d, event, Rel::Received, listener, talker)?;
        let talker_next = transition(&mut d, event, Rel::Sent, talker, listener)?;

        talker.note_segment_sent(seg);
        if let Some(ts) = seg.ts() {
            talker.note_timestamp(ts, cx.now);
        }

        if let Some(next) = listener_next {
            net_debug!("{}: listener {} -> {}", direction, listener.state, next);
            listener.state = next;
        }
        if let Some(next) = talker_next {
            net_debug!("{}: talker {} -> {}", direction, talker.state, next);
            talker.state = next;
        }
        Ok(())
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "client [{}] server [{}]",
            self.trackers[0], self.trackers[1]
        )
    }
}
