//! Connection lifecycle tracking.
//!
//! One handler function per state, each an exhaustive match over the
//! event and its direction relative to the tracked endpoint. The
//! twelve (event, direction) entry points cover everything a segment
//! can mean to an endpoint; combinations with no defined behavior
//! reject or ignore explicitly, so nothing falls through.
//!
//! Handlers validate before they mutate. A rejected segment leaves
//! the tracker's anchors exactly as they were; the one exception is
//! timestamp capability latching, which records a real observation
//! about the peer even when the segment itself is thrown away.

use core::fmt;

use crate::stream::norm::{BlockKind, Normalizer};
use crate::stream::seg::SegmentDescriptor;
use crate::stream::session::SessionFlags;
use crate::stream::tracker::{Tracker, TrackerFlags};
use crate::stream::{Context, DropReason, ProtocolEvent};
use crate::wire::{TcpSeqNumber, find_mss};

/// The state of one TCP endpoint, per RFC 793 with the passive
/// observer's adjustments: a client whose SYN we saw answered moves
/// to ESTABLISHED on the SYN|ACK, since its own ACK may be lost to
/// the tap.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            State::Closed => write!(f, "CLOSED"),
            State::Listen => write!(f, "LISTEN"),
            State::SynSent => write!(f, "SYN-SENT"),
            State::SynReceived => write!(f, "SYN-RECEIVED"),
            State::Established => write!(f, "ESTABLISHED"),
            State::FinWait1 => write!(f, "FIN-WAIT-1"),
            State::FinWait2 => write!(f, "FIN-WAIT-2"),
            State::CloseWait => write!(f, "CLOSE-WAIT"),
            State::Closing => write!(f, "CLOSING"),
            State::LastAck => write!(f, "LAST-ACK"),
            State::TimeWait => write!(f, "TIME-WAIT"),
        }
    }
}

/// What a segment means, classified once per packet.
///
/// Precedence on combined flags: Rst beats everything, a bare SYN
/// beats SYN|ACK, FIN beats its piggybacked data, and data beats the
/// ACK it rides with.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TcpEvent {
    Syn,
    SynAck,
    Ack,
    Data,
    Fin,
    Rst,
}

impl TcpEvent {
    pub fn classify(seg: &SegmentDescriptor) -> TcpEvent {
        if seg.is_rst() {
            TcpEvent::Rst
        } else if seg.is_syn_only() {
            TcpEvent::Syn
        } else if seg.is_syn_ack() {
            TcpEvent::SynAck
        } else if seg.is_fin() {
            TcpEvent::Fin
        } else if seg.has_payload() {
            TcpEvent::Data
        } else {
            TcpEvent::Ack
        }
    }
}

impl fmt::Display for TcpEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TcpEvent::Syn => write!(f, "SYN"),
            TcpEvent::SynAck => write!(f, "SYN|ACK"),
            TcpEvent::Ack => write!(f, "ACK"),
            TcpEvent::Data => write!(f, "DATA"),
            TcpEvent::Fin => write!(f, "FIN"),
            TcpEvent::Rst => write!(f, "RST"),
        }
    }
}

/// A segment's direction relative to one tracker: did the tracked
/// endpoint originate it, or receive it?
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum Rel {
    Sent,
    Received,
}

/// Everything a handler needs besides the two trackers. The borrows
/// live for one dispatch call.
pub(crate) struct Dispatch<'a, 'c, 'p> {
    pub norm: &'a Normalizer,
    pub cx: &'a mut Context<'c>,
    pub seg: &'a mut SegmentDescriptor<'p>,
    pub flags: &'a mut SessionFlags,
}

type Outcome = Result<Option<State>, DropReason>;

/// Route the event to the handler for the tracker's current state.
/// Returns the state to move to, if any; the caller commits it.
pub(crate) fn transition(
    d: &mut Dispatch,
    event: TcpEvent,
    rel: Rel,
    tracker: &mut Tracker,
    peer: &mut Tracker,
) -> Outcome {
    match tracker.state {
        State::Closed => closed(d, event, rel, tracker, peer),
        State::Listen => listen(d, event, rel, tracker, peer),
        State::SynSent => syn_sent(d, event, rel, tracker, peer),
        State::SynReceived => syn_received(d, event, rel, tracker, peer),
        State::Established => established(d, event, rel, tracker, peer),
        State::FinWait1 => fin_wait_1(d, event, rel, tracker, peer),
        State::FinWait2 => fin_wait_2(d, event, rel, tracker, peer),
        State::CloseWait => close_wait(d, event, rel, tracker, peer),
        State::Closing => closing(d, event, rel, tracker, peer),
        State::LastAck => last_ack(d, event, rel, tracker, peer),
        State::TimeWait => time_wait(d, event, rel, tracker, peer),
    }
}

/// An inbound RST: legitimate under the OS policy resets the whole
/// connection, anything else is an anomaly to alert and drop on.
fn recv_rst(d: &mut Dispatch, tracker: &mut Tracker) -> Outcome {
    if d.norm.validate_rst(*d.flags, d.seg, tracker) {
        net_debug!("{}: accepting valid RST", tracker.state);
        d.norm.trim_rst_payload(d.cx, d.seg, 0);
        Ok(Some(State::Closed))
    } else {
        net_debug!(
            "{}: RST with seq {} outside policy, r_nxt_ack {}",
            tracker.state,
            d.seg.seq(),
            tracker.r_nxt_ack
        );
        d.cx.raise(ProtocolEvent::ProtocolAnomaly);
        d.norm.packet_dropper(d.cx, d.seg, BlockKind::Tcp);
        Err(DropReason::BadPacket)
    }
}

/// The receive path shared by every synchronized state: PAWS first,
/// then window and MSS trims, then anchor advancement. Nothing moves
/// before PAWS accepts.
fn recv_flow(
    d: &mut Dispatch,
    tracker: &mut Tracker,
    peer: &mut Tracker,
) -> Result<(), DropReason> {
    d.norm.handle_paws(d.cx, d.seg, tracker, peer)?;
    if d.seg.has_payload() {
        let win = d.norm.effective_window(*d.flags, tracker, d.seg);
        let max = ((tracker.r_win_base + win as usize) - d.seg.seq()).max(0) as usize;
        d.norm.trim_win_payload(d.cx, d.seg, max);
        if let Some(mss) = tracker.mss {
            d.norm.trim_mss_payload(d.cx, d.seg, usize::from(mss));
        }
    }
    tracker.note_data_received(d.seg);
    Ok(())
}

/// Does this segment acknowledge everything the tracker sent? A FIN
/// or SYN occupies its own unit of sequence space, so this covers
/// acks of either.
fn acks_all_sent(seg: &SegmentDescriptor, tracker: &Tracker) -> bool {
    seg.is_ack() && seg.ack() == tracker.snd_nxt
}

/// Initialize the receive anchors of a SYN's (or SYN|ACK's)
/// recipient from the segment's sequence space.
fn init_recv_anchors(tracker: &mut Tracker, seg: &SegmentDescriptor) {
    tracker.r_nxt_ack = seg.end_seq();
    tracker.r_win_base = seg.end_seq();
}

fn note_sent_mss(tracker: &mut Tracker, seg: &SegmentDescriptor) {
    if let Some(mss) = find_mss(seg.options()) {
        tracker.mss = Some(mss.mss);
    }
}

fn closed(
    d: &mut Dispatch,
    event: TcpEvent,
    rel: Rel,
    tracker: &mut Tracker,
    _peer: &mut Tracker,
) -> Outcome {
    match (event, rel) {
        (TcpEvent::Syn, Rel::Sent) => {
            note_sent_mss(tracker, d.seg);
            Ok(Some(State::SynSent))
        }
        // Our endpoint's SYN was missed but the answer was not: the
        // SYN|ACK proves this side is synchronized, so adopt
        // ESTABLISHED directly rather than a SYN-SENT it already
        // left.
        (TcpEvent::SynAck, Rel::Received) => {
            init_recv_anchors(tracker, d.seg);
            Ok(Some(State::Established))
        }
        (TcpEvent::Rst, Rel::Received) | (TcpEvent::Rst, Rel::Sent) => Ok(None),
        // A closed endpoint has no conversation to receive into.
        (TcpEvent::Syn, Rel::Received)
        | (TcpEvent::Ack, Rel::Received)
        | (TcpEvent::Data, Rel::Received)
        | (TcpEvent::Fin, Rel::Received) => {
            net_debug!("CLOSED: rejecting stray {}", event);
            d.cx.raise(ProtocolEvent::ProtocolAnomaly);
            Err(DropReason::BadPacket)
        }
        (TcpEvent::SynAck, Rel::Sent)
        | (TcpEvent::Ack, Rel::Sent)
        | (TcpEvent::Data, Rel::Sent)
        | (TcpEvent::Fin, Rel::Sent) => Ok(None),
    }
}

fn listen(
    d: &mut Dispatch,
    event: TcpEvent,
    rel: Rel,
    tracker: &mut Tracker,
    peer: &mut Tracker,
) -> Outcome {
    match (event, rel) {
        (TcpEvent::Syn, Rel::Received) => {
            // A handshake SYN carries no payload worth keeping.
            d.norm.trim_syn_payload(d.cx, d.seg, 0);
            d.norm.handle_paws(d.cx, d.seg, tracker, peer)?;
            init_recv_anchors(tracker, d.seg);
            tracker.flags |= TrackerFlags::SAW_SYN;
            peer.flags |= TrackerFlags::SAW_SYN;
            Ok(Some(State::SynReceived))
        }
        // The client's SYN slipped past the tap; our own SYN|ACK
        // proves it happened.
        (TcpEvent::SynAck, Rel::Sent) => {
            note_sent_mss(tracker, d.seg);
            Ok(Some(State::SynReceived))
        }
        (TcpEvent::Rst, Rel::Received) | (TcpEvent::Rst, Rel::Sent) => {
            // Nothing established to reset.
            Ok(None)
        }
        (TcpEvent::SynAck, Rel::Received)
        | (TcpEvent::Ack, Rel::Received)
        | (TcpEvent::Data, Rel::Received)
        | (TcpEvent::Fin, Rel::Received) => {
            net_debug!("LISTEN: rejecting {} before any handshake", event);
            d.cx.raise(ProtocolEvent::ProtocolAnomaly);
            Err(DropReason::BadPacket)
        }
        (TcpEvent::Syn, Rel::Sent)
        | (TcpEvent::Ack, Rel::Sent)
        | (TcpEvent::Data, Rel::Sent)
        | (TcpEvent::Fin, Rel::Sent) => Ok(None),
    }
}

fn syn_sent(
    d: &mut Dispatch,
    event: TcpEvent,
    rel: Rel,
    tracker: &mut Tracker,
    peer: &mut Tracker,
) -> Outcome {
    match (event, rel) {
        (TcpEvent::SynAck, Rel::Received) => {
            if tracker.snd_nxt != TcpSeqNumber(0) && d.seg.ack() != tracker.snd_nxt {
                net_debug!(
                    "SYN-SENT: SYN|ACK acks {} instead of our {}",
                    d.seg.ack(),
                    tracker.snd_nxt
                );
                d.cx.raise(ProtocolEvent::ProtocolAnomaly);
                return Err(DropReason::BadPacket);
            }
            d.norm.trim_syn_payload(d.cx, d.seg, 0);
            d.norm.handle_paws(d.cx, d.seg, tracker, peer)?;
            init_recv_anchors(tracker, d.seg);
            tracker.flags |= TrackerFlags::SAW_SYN_ACK;
            peer.flags |= TrackerFlags::SAW_SYN_ACK;
            Ok(Some(State::Established))
        }
        // Simultaneous open.
        (TcpEvent::Syn, Rel::Received) => {
            d.norm.trim_syn_payload(d.cx, d.seg, 0);
            d.norm.handle_paws(d.cx, d.seg, tracker, peer)?;
            init_recv_anchors(tracker, d.seg);
            tracker.flags |= TrackerFlags::SAW_SYN;
            peer.flags |= TrackerFlags::SAW_SYN;
            Ok(Some(State::SynReceived))
        }
        // An RST answering a SYN must acknowledge that SYN.
        (TcpEvent::Rst, Rel::Received) => {
            if acks_all_sent(d.seg, tracker) {
                d.norm.trim_rst_payload(d.cx, d.seg, 0);
                Ok(Some(State::Closed))
            } else {
                net_debug!("SYN-SENT: RST does not ack our SYN");
                d.cx.raise(ProtocolEvent::ProtocolAnomaly);
                d.norm.packet_dropper(d.cx, d.seg, BlockKind::Tcp);
                Err(DropReason::BadPacket)
            }
        }
        (TcpEvent::Ack, Rel::Received)
        | (TcpEvent::Data, Rel::Received)
        | (TcpEvent::Fin, Rel::Received) => {
            net_debug!("SYN-SENT: rejecting {} before the SYN was answered", event);
            d.cx.raise(ProtocolEvent::ProtocolAnomaly);
            Err(DropReason::BadPacket)
        }
        // SYN retransmission.
        (TcpEvent::Syn, Rel::Sent) => {
            note_sent_mss(tracker, d.seg);
            Ok(None)
        }
        (TcpEvent::SynAck, Rel::Sent)
        | (TcpEvent::Ack, Rel::Sent)
        | (TcpEvent::Data, Rel::Sent)
        | (TcpEvent::Fin, Rel::Sent) => Ok(None),
        (TcpEvent::Rst, Rel::Sent) => Ok(Some(State::Closed)),
    }
}

fn syn_received(
    d: &mut Dispatch,
    event: TcpEvent,
    rel: Rel,
    tracker: &mut Tracker,
    peer: &mut Tracker,
) -> Outcome {
    match (event, rel) {
        (TcpEvent::Ack, Rel::Received) => {
            recv_flow(d, tracker, peer)?;
            tracker.flags |= TrackerFlags::SAW_ACK;
            peer.flags |= TrackerFlags::SAW_ACK;
            Ok(Some(State::Established))
        }
        // Data carries the handshake ACK implicitly.
        (TcpEvent::Data, Rel::Received) => {
            recv_flow(d, tracker, peer)?;
            tracker.flags |= TrackerFlags::SAW_ACK;
            peer.flags |= TrackerFlags::SAW_ACK;
            Ok(Some(State::Established))
        }
        // RFC 793 has the receiver process the FIN as if from
        // ESTABLISHED once the handshake ack is in hand.
        (TcpEvent::Fin, Rel::Received) => {
            recv_flow(d, tracker, peer)?;
            tracker.flags |= TrackerFlags::SAW_ACK;
            peer.flags |= TrackerFlags::SAW_ACK;
            Ok(Some(State::CloseWait))
        }
        // SYN retransmission, nothing new.
        (TcpEvent::Syn, Rel::Received) | (TcpEvent::SynAck, Rel::Received) => Ok(None),
        (TcpEvent::Rst, Rel::Received) => recv_rst(d, tracker),
        // SYN|ACK retransmission.
        (TcpEvent::SynAck, Rel::Sent) => {
            note_sent_mss(tracker, d.seg);
            Ok(None)
        }
        (TcpEvent::Syn, Rel::Sent)
        | (TcpEvent::Ack, Rel::Sent)
        | (TcpEvent::Data, Rel::Sent)
        | (TcpEvent::Fin, Rel::Sent) => Ok(None),
        (TcpEvent::Rst, Rel::Sent) => Ok(Some(State::Closed)),
    }
}

fn established(
    d: &mut Dispatch,
    event: TcpEvent,
    rel: Rel,
    tracker: &mut Tracker,
    peer: &mut Tracker,
) -> Outcome {
    match (event, rel) {
        (TcpEvent::Ack, Rel::Received) | (TcpEvent::Data, Rel::Received) => {
            recv_flow(d, tracker, peer)?;
            Ok(None)
        }
        (TcpEvent::Fin, Rel::Received) => {
            recv_flow(d, tracker, peer)?;
            Ok(Some(State::CloseWait))
        }
        (TcpEvent::Rst, Rel::Received) => recv_rst(d, tracker),
        // Late SYN retransmissions on a synchronized connection
        // carry nothing actionable.
        (TcpEvent::Syn, Rel::Received) | (TcpEvent::SynAck, Rel::Received) => Ok(None),
        (TcpEvent::Fin, Rel::Sent) => Ok(Some(State::FinWait1)),
        (TcpEvent::Syn, Rel::Sent)
        | (TcpEvent::SynAck, Rel::Sent)
        | (TcpEvent::Ack, Rel::Sent)
        | (TcpEvent::Data, Rel::Sent) => Ok(None),
        (TcpEvent::Rst, Rel::Sent) => Ok(Some(State::Closed)),
    }
}

fn fin_wait_1(
    d: &mut Dispatch,
    event: TcpEvent,
    rel: Rel,
    tracker: &mut Tracker,
    peer: &mut Tracker,
) -> Outcome {
    match (event, rel) {
        (TcpEvent::Ack, Rel::Received) | (TcpEvent::Data, Rel::Received) => {
            recv_flow(d, tracker, peer)?;
            if acks_all_sent(d.seg, tracker) {
                Ok(Some(State::FinWait2))
            } else {
                Ok(None)
            }
        }
        (TcpEvent::Fin, Rel::Received) => {
            recv_flow(d, tracker, peer)?;
            if acks_all_sent(d.seg, tracker) {
                Ok(Some(State::TimeWait))
            } else {
                Ok(Some(State::Closing))
            }
        }
        (TcpEvent::Rst, Rel::Received) => recv_rst(d, tracker),
        (TcpEvent::Syn, Rel::Received) | (TcpEvent::SynAck, Rel::Received) => Ok(None),
        // FIN retransmission.
        (TcpEvent::Fin, Rel::Sent)
        | (TcpEvent::Syn, Rel::Sent)
        | (TcpEvent::SynAck, Rel::Sent)
        | (TcpEvent::Ack, Rel::Sent)
        | (TcpEvent::Data, Rel::Sent) => Ok(None),
        (TcpEvent::Rst, Rel::Sent) => Ok(Some(State::Closed)),
    }
}

fn fin_wait_2(
    d: &mut Dispatch,
    event: TcpEvent,
    rel: Rel,
    tracker: &mut Tracker,
    peer: &mut Tracker,
) -> Outcome {
    match (event, rel) {
        (TcpEvent::Ack, Rel::Received) | (TcpEvent::Data, Rel::Received) => {
            recv_flow(d, tracker, peer)?;
            Ok(None)
        }
        (TcpEvent::Fin, Rel::Received) => {
            recv_flow(d, tracker, peer)?;
            Ok(Some(State::TimeWait))
        }
        (TcpEvent::Rst, Rel::Received) => recv_rst(d, tracker),
        (TcpEvent::Syn, Rel::Received) | (TcpEvent::SynAck, Rel::Received) => Ok(None),
        (TcpEvent::Syn, Rel::Sent)
        | (TcpEvent::SynAck, Rel::Sent)
        | (TcpEvent::Ack, Rel::Sent)
        | (TcpEvent::Data, Rel::Sent)
        | (TcpEvent::Fin, Rel::Sent) => Ok(None),
        (TcpEvent::Rst, Rel::Sent) => Ok(Some(State::Closed)),
    }
}

fn close_wait(
    d: &mut Dispatch,
    event: TcpEvent,
    rel: Rel,
    tracker: &mut Tracker,
    peer: &mut Tracker,
) -> Outcome {
    match (event, rel) {
        // Retransmissions of the peer's closing sequence.
        (TcpEvent::Ack, Rel::Received)
        | (TcpEvent::Data, Rel::Received)
        | (TcpEvent::Fin, Rel::Received) => {
            recv_flow(d, tracker, peer)?;
            Ok(None)
        }
        (TcpEvent::Rst, Rel::Received) => recv_rst(d, tracker),
        (TcpEvent::Syn, Rel::Received) | (TcpEvent::SynAck, Rel::Received) => Ok(None),
        (TcpEvent::Fin, Rel::Sent) => Ok(Some(State::LastAck)),
        (TcpEvent::Syn, Rel::Sent)
        | (TcpEvent::SynAck, Rel::Sent)
        | (TcpEvent::Ack, Rel::Sent)
        | (TcpEvent::Data, Rel::Sent) => Ok(None),
        (TcpEvent::Rst, Rel::Sent) => Ok(Some(State::Closed)),
    }
}

fn closing(
    d: &mut Dispatch,
    event: TcpEvent,
    rel: Rel,
    tracker: &mut Tracker,
    peer: &mut Tracker,
) -> Outcome {
    match (event, rel) {
        (TcpEvent::Ack, Rel::Received) | (TcpEvent::Data, Rel::Received) => {
            recv_flow(d, tracker, peer)?;
            if acks_all_sent(d.seg, tracker) {
                Ok(Some(State::TimeWait))
            } else {
                Ok(None)
            }
        }
        (TcpEvent::Fin, Rel::Received) => {
            recv_flow(d, tracker, peer)?;
            Ok(None)
        }
        (TcpEvent::Rst, Rel::Received) => recv_rst(d, tracker),
        (TcpEvent::Syn, Rel::Received) | (TcpEvent::SynAck, Rel::Received) => Ok(None),
        (TcpEvent::Syn, Rel::Sent)
        | (TcpEvent::SynAck, Rel::Sent)
        | (TcpEvent::Ack, Rel::Sent)
        | (TcpEvent::Data, Rel::Sent)
        | (TcpEvent::Fin, Rel::Sent) => Ok(None),
        (TcpEvent::Rst, Rel::Sent) => Ok(Some(State::Closed)),
    }
}

fn last_ack(
    d: &mut Dispatch,
    event: TcpEvent,
    rel: Rel,
    tracker: &mut Tracker,
    peer: &mut Tracker,
) -> Outcome {
    match (event, rel) {
        (TcpEvent::Ack, Rel::Received) | (TcpEvent::Data, Rel::Received) => {
            recv_flow(d, tracker, peer)?;
            if acks_all_sent(d.seg, tracker) {
                Ok(Some(State::Closed))
            } else {
                Ok(None)
            }
        }
        (TcpEvent::Fin, Rel::Received) => {
            recv_flow(d, tracker, peer)?;
            Ok(None)
        }
        (TcpEvent::Rst, Rel::Received) => recv_rst(d, tracker),
        (TcpEvent::Syn, Rel::Received) | (TcpEvent::SynAck, Rel::Received) => Ok(None),
        (TcpEvent::Syn, Rel::Sent)
        | (TcpEvent::SynAck, Rel::Sent)
        | (TcpEvent::Ack, Rel::Sent)
        | (TcpEvent::Data, Rel::Sent)
        | (TcpEvent::Fin, Rel::Sent) => Ok(None),
        (TcpEvent::Rst, Rel::Sent) => Ok(Some(State::Closed)),
    }
}

fn time_wait(
    d: &mut Dispatch,
    event: TcpEvent,
    rel: Rel,
    tracker: &mut Tracker,
    _peer: &mut Tracker,
) -> Outcome {
    match (event, rel) {
        // Fresh payload after both sides closed is never
        // legitimate.
        (TcpEvent::Data, Rel::Received) => {
            net_debug!("TIME-WAIT: rejecting data after close");
            d.cx.raise(ProtocolEvent::ProtocolAnomaly);
            d.norm.packet_dropper(d.cx, d.seg, BlockKind::Tcp);
            Err(DropReason::BadPacket)
        }
        (TcpEvent::Rst, Rel::Received) => recv_rst(d, tracker),
        // Final ACK and FIN retransmissions drain here.
        (TcpEvent::Ack, Rel::Received)
        | (TcpEvent::Fin, Rel::Received)
        | (TcpEvent::Syn, Rel::Received)
        | (TcpEvent::SynAck, Rel::Received) => Ok(None),
        (TcpEvent::Syn, Rel::Sent)
        | (TcpEvent::SynAck, Rel::Sent)
        | (TcpEvent::Ack, Rel::Sent)
        | (TcpEvent::Data, Rel::Sent)
        | (TcpEvent::Fin, Rel::Sent) => Ok(None),
        (TcpEvent::Rst, Rel::Sent) => Ok(Some(State::Closed)),
    }
}
