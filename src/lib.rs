//! A reliable, ordered, stream-oriented transport running over a single UDP
//! socket, with a listen/dial surface analogous to TCP. Multiple peers are
//! multiplexed over one socket by source address.
//!
//! ## Design goals
//!
//! * To the caller a connection is a byte stream: `write` on one side comes
//!   out of `read` on the other side, complete and in order
//! * One UDP socket serves every peer - the listener demultiplexes inbound
//!   datagrams by source address, so a server needs a single port
//! * No handshake: a connection exists as soon as the first datagram from a
//!   new address arrives. The first write is the connection setup
//! * Packets are acknowledged in batches. The receiver delays its
//!   acknowledgement behind a short timer so one report covers a burst of
//!   packets, with a long timer bounding the delay under continuous traffic
//! * Senders keep recently sent packets in *groups* that re-send whatever
//!   the peer has not reported received, backing off exponentially, and
//!   declare the peer dead after a bounded number of attempts
//! * A fixed delivery-delay constant stands in for RTT estimation - the
//!   protocol aims at simplicity, not congestion control
//!
//! ## Packet format
//!
//! Exactly one packet per datagram, at most 1472 bytes (full Ethernet MTU
//! 1500 minus 20 bytes IP header and 8 bytes UDP header):
//!
//! ```ascii
//! 0               1               2
//! 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  ver  |*|               number                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     data                      |
//! +                     ....                      +
//!
//! * - is_command
//! ```
//!
//! The protocol version is 1. Packet numbers are 20-bit unsigned integers;
//! both data and command packets draw from the same per-direction number
//! sequence, so every packet a peer sends has a unique, monotonically
//! assigned number.
//!
//! ## Commands
//!
//! A packet with the command bit set carries a command in its payload,
//! keyed by the first byte:
//!
//! * `0xAA` - *CloseConnection*. No further payload. Sent exactly once when
//!   a side closes; never acknowledged and never answered with another
//!   close.
//! * `0xF0` - *ReceivedPackets*. The payload tail lists every packet number
//!   received so far as inclusive ranges, five bytes per range:
//!
//! ```ascii
//! B0 = lo >> 12
//! B1 = (lo >> 4) & 0xFF
//! B2 = ((lo & 0x0F) << 4) | ((hi >> 16) & 0x0F)
//! B3 = (hi >> 8) & 0xFF
//! B4 = hi & 0xFF
//! ```
//!
//! Acknowledgements are cumulative: each report describes the full received
//! set, so a lost report is subsumed by the next one. Reports are versioned
//! by their own packet number and stale reports are ignored.
//!
//! ## Related
//!
//! * TCP - full reliability and ordering, but per-connection sockets, a
//!   handshake, and head-of-line blocking on the kernel's terms
//! * QUIC - connection-based with enforced encryption and stream
//!   multiplexing; a far heavier protocol than this one
//! * UDT - dedicated socket per peer, optimized for bulk transfer over fat
//!   unreliable links

mod byte_queue;
mod config;
mod connection;
mod dial;
mod error;
mod listener;
mod packet;
mod range_set;
mod send_group;
mod send_pipeline;
mod sequencer;
mod timer;

pub use config::SudpConfig;
pub use connection::Connection;
pub use dial::{dial, dial_with_config};
pub use error::{DecodeError, SudpError};
pub use listener::{listen, listen_with_config, Listener};
