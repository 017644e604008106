use thiserror::Error;

/// The reasons a connection stops being usable.
///
/// The first reason is latched by the connection and handed back from every
/// subsequent `read`/`write`, so the type is cheap to clone and compare.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SudpError {
    /// `close` was called on this side.
    #[error("connection closed: close called locally")]
    LocallyClosed,

    /// The peer sent a close command.
    #[error("connection closed: closed by peer")]
    PeerClosed,

    /// Retransmission was exhausted without the peer confirming anything.
    #[error("connection closed: no response from peer")]
    NoResponse,

    /// The underlying UDP socket failed to read or write.
    #[error("socket error: {0}")]
    Io(String),

    /// The socket accepted fewer bytes than the encoded packet.
    #[error("packet corrupted while writing")]
    PacketCorrupted,

    /// An inbound datagram could not be decoded. The packet stream cannot
    /// resync after this, so it closes the connection.
    #[error("invalid packet: {0}")]
    Decode(#[from] DecodeError),

    /// Deadlines are not part of this transport.
    #[error("deadlines are not supported")]
    Unsupported,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("packet shorter than the header")]
    TooSmallPacket,

    #[error("destination buffer too small for the packet")]
    TooSmallBuffer,

    #[error("unknown command tag {0:#04x}")]
    UnknownCommand(u8),

    #[error("received-packets payload is not a whole number of ranges")]
    InvalidRangeFormat,
}
