use bytes::{BufMut, Bytes, BytesMut};

use crate::error::DecodeError;
use crate::range_set::PacketRange;

// 1500 (MTU) - 20 (IP header) - 8 (UDP header)
pub(crate) const MAX_PACKET_SIZE: usize = 1472;
pub(crate) const HEADER_SIZE: usize = 3;
pub(crate) const MAX_DATA_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

pub(crate) const MAX_PACKET_NUMBER: u32 = (1 << 20) - 1;

/// How many ranges fit into a single received-packets payload.
pub(crate) const MAX_ACK_RANGES: usize = (MAX_DATA_SIZE - 1) / 5;

pub(crate) const PROTOCOL_VERSION: u8 = 1;

const CLOSE_CONN_TAG: u8 = 0b1010_1010;
const RECEIVED_PACKETS_TAG: u8 = 0b1111_0000;

/// One framed unit, exactly one per datagram.
///
/// ```ascii
/// 0               1               2
/// 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  ver  |*|               number                |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                     data                      |
/// +                     ....                      +
///
/// * - is_command
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Packet {
    pub header: Header,
    pub data: Bytes, // max MAX_DATA_SIZE bytes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub version: u8, // 3 bits
    pub is_command: bool,
    pub number: u32, // u20
}

/// The payload of a command packet, keyed by its first byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    CloseConnection,
    ReceivedPackets(Bytes),
}

impl Header {
    fn decode(src: &[u8]) -> Header {
        Header {
            version: (src[0] & 0b1110_0000) >> 5,
            is_command: src[0] & 0b0001_0000 != 0,
            number: u32::from(src[0] & 0b0000_1111) << 16
                | u32::from(src[1]) << 8
                | u32::from(src[2]),
        }
    }

    fn encode(&self, dst: &mut [u8]) {
        dst[0] = self.version << 5;
        if self.is_command {
            dst[0] |= 0b0001_0000;
        }
        dst[0] |= ((self.number >> 16) as u8) & 0b0000_1111;
        dst[1] = (self.number >> 8) as u8;
        dst[2] = self.number as u8;
    }
}

impl Packet {
    pub fn decode(src: Bytes) -> Result<Packet, DecodeError> {
        if src.len() < HEADER_SIZE {
            return Err(DecodeError::TooSmallPacket);
        }
        Ok(Packet {
            header: Header::decode(&src),
            data: src.slice(HEADER_SIZE..),
        })
    }

    pub fn encode(&self, dst: &mut [u8]) -> Result<usize, DecodeError> {
        if dst.len() < self.len() {
            return Err(DecodeError::TooSmallBuffer);
        }
        self.header.encode(dst);
        dst[HEADER_SIZE..self.len()].copy_from_slice(&self.data);
        Ok(self.len())
    }

    /// The packet encoded into a freshly sized buffer.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.len()];
        self.encode(&mut buf)
            .expect("buffer is sized to the packet");
        buf
    }

    pub fn len(&self) -> usize {
        HEADER_SIZE + self.data.len()
    }

    pub fn command(&self) -> Result<Command, DecodeError> {
        match self.data.first() {
            Some(&CLOSE_CONN_TAG) => Ok(Command::CloseConnection),
            Some(&RECEIVED_PACKETS_TAG) => Ok(Command::ReceivedPackets(self.data.slice(1..))),
            Some(&tag) => Err(DecodeError::UnknownCommand(tag)),
            None => Err(DecodeError::TooSmallPacket),
        }
    }
}

pub(crate) fn close_connection_packet(number: u32) -> Packet {
    assert_u20(number);
    Packet {
        header: Header {
            version: PROTOCOL_VERSION,
            is_command: true,
            number,
        },
        data: Bytes::from_static(&[CLOSE_CONN_TAG]),
    }
}

/// Received packets are described by ranges with inclusive bounds: if the
/// received packets are 0, 1, 2, 3, 5, 7, 8, 11, 12 the ranges are 0-3,
/// 5-5, 7-8, 11-12.
pub(crate) fn received_packets_packet(number: u32, received: &[PacketRange]) -> Packet {
    assert_u20(number);
    Packet {
        header: Header {
            version: PROTOCOL_VERSION,
            is_command: true,
            number,
        },
        data: encode_received_ranges(received),
    }
}

/// Five bytes per range: 20 bits `lo` followed by 20 bits `hi`.
fn encode_received_ranges(received: &[PacketRange]) -> Bytes {
    let size = 1 + received.len() * 5;
    assert!(size <= MAX_DATA_SIZE, "too many ranges for one packet");

    let mut data = BytesMut::with_capacity(size);
    data.put_u8(RECEIVED_PACKETS_TAG);
    for range in received {
        assert_u20(range.lo);
        assert_u20(range.hi);
        data.put_u8((range.lo >> 12) as u8);
        data.put_u8((range.lo >> 4) as u8);
        data.put_u8(((range.lo as u8) << 4) | ((range.hi >> 16) as u8 & 0x0F));
        data.put_u8((range.hi >> 8) as u8);
        data.put_u8(range.hi as u8);
    }
    data.freeze()
}

pub(crate) fn decode_received_ranges(payload: &[u8]) -> Result<Vec<PacketRange>, DecodeError> {
    if payload.len() % 5 != 0 {
        return Err(DecodeError::InvalidRangeFormat);
    }

    let mut ranges = Vec::with_capacity(payload.len() / 5);
    for chunk in payload.chunks_exact(5) {
        let lo = u32::from(chunk[0]) << 12 | u32::from(chunk[1]) << 4 | u32::from(chunk[2]) >> 4;
        let hi = u32::from(chunk[2] & 0x0F) << 16 | u32::from(chunk[3]) << 8 | u32::from(chunk[4]);
        ranges.push(PacketRange { lo, hi });
    }
    Ok(ranges)
}

pub(crate) fn data_packet(number: u32, data: Bytes) -> Packet {
    assert_u20(number);
    assert!(data.len() <= MAX_DATA_SIZE, "data size overflow");
    Packet {
        header: Header {
            version: PROTOCOL_VERSION,
            is_command: false,
            number,
        },
        data,
    }
}

/// Fragments `data` into packets of at most `MAX_DATA_SIZE` bytes carrying
/// consecutive numbers starting at `first_number`. Returns the packets and
/// the number after the last one.
pub(crate) fn split_into_data_packets(first_number: u32, data: &[u8]) -> (Vec<Packet>, u32) {
    let count = data.len() / MAX_DATA_SIZE + 1;
    assert!(
        first_number + count as u32 - 1 <= MAX_PACKET_NUMBER,
        "u20 overflow"
    );

    let mut packets = Vec::with_capacity(count);
    let mut next = first_number;
    let mut rest = data;
    while rest.len() > MAX_DATA_SIZE {
        packets.push(data_packet(next, Bytes::copy_from_slice(&rest[..MAX_DATA_SIZE])));
        next += 1;
        rest = &rest[MAX_DATA_SIZE..];
    }
    packets.push(data_packet(next, Bytes::copy_from_slice(rest)));
    next += 1;
    (packets, next)
}

fn assert_u20(n: u32) {
    assert!(n <= MAX_PACKET_NUMBER, "u20 overflow");
}
