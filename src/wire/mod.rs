/*! Low-level access to already-parsed TCP header material.

The `wire` module deals with the parts of a TCP segment the
normalization core inspects and rewrites: header flags, sequence
numbers, and the raw options region.

 * [TcpFlags] is a bitset view of the TCP header flags octet.
 * [TcpSeqNumber] provides sequence number arithmetic that is
   correct across wraparound, following RFC 793 serial number
   semantics.
 * The option routines scan a raw options byte region without
   copying it, and locate options by their byte offset so they
   can be rewritten in place without changing the region's
   length.

The upstream capture layer owns full packet parsing; nothing here
reads past the options region it is handed. Malformed option data
terminates a scan early instead of producing an error: for the
purposes of normalization, an option that cannot be parsed does
not exist.
*/

mod tcp;

pub use self::tcp::{
    MssOption, SeqNumber as TcpSeqNumber, TcpFlags, TcpOptionsIter, TimestampOption, find_mss,
    find_timestamp, opt,
};
