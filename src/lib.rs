//! Inline TCP stream normalization and connection-state tracking.
//!
//! This crate is the TCP core of an intrusion prevention engine: it
//! tracks both endpoints of every observed connection through the
//! TCP lifecycle, validates segments against per-OS stack behavior
//! (RST legitimacy, PAWS timestamps), and rewrites hostile or
//! ambiguous segments in place so the traffic a protected host sees
//! matches what the detection engine analyzed.
//!
//! It is a library, not a sensor. Packet capture, flow hashing,
//! reassembly, and alerting live in the embedding engine; this crate
//! exposes [Session](stream/struct.Session.html), which consumes one
//! parsed segment at a time together with a
//! [Context](stream/struct.Context.html) carrying the clock, the
//! per-worker counters, and the collaborator sinks, and returns a
//! [Verdict](stream/enum.Verdict.html).
//!
//! The main modules are:
//!
//! - [wire](wire/index.html), sequence-number arithmetic and TCP
//!   option parsing;
//! - [stream](stream/index.html), the session, endpoint trackers,
//!   normalization engine, and connection state machine;
//! - [time](time/index.html), the clock abstraction; the crate never
//!   reads a clock itself.
//!
//! The crate is `no_std`; it performs no allocation and holds no
//! global state, so sessions can live in whatever table the engine
//! provides and workers can run fully independently.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

#[macro_use]
mod macros;

pub mod stream;
pub mod time;
pub mod wire;
