//! Messages exchanged between peers, together with their wire representation. The wire
//! layout is little-endian and bit-compatible with the classic C implementation, which
//! packs some fields into bit-fields; those are written here as explicit shift/mask
//! operations (flag in the lowest bit, a 31-bit signed frame number above it).

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::compression::MAX_COMPRESSED_BITS;
use crate::{Frame, NULL_FRAME};

/// Input packets always carry connection status entries for this many player slots,
/// regardless of the actual player count of the session.
pub(crate) const UDP_MSG_MAX_PLAYERS: usize = 4;
/// No serialized message may exceed this size.
pub(crate) const MAX_UDP_PACKET_SIZE: usize = 4096;

const MSG_TYPE_SYNC_REQUEST: u8 = 1;
const MSG_TYPE_SYNC_REPLY: u8 = 2;
const MSG_TYPE_INPUT: u8 = 3;
const MSG_TYPE_QUALITY_REPORT: u8 = 4;
const MSG_TYPE_QUALITY_REPLY: u8 = 5;
const MSG_TYPE_KEEP_ALIVE: u8 = 6;
const MSG_TYPE_INPUT_ACK: u8 = 7;

/// Per-player connection info, as exchanged between peers in every input packet.
/// `last_frame` of any slot never decreases across packets from the same peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ConnectionStatus {
    pub disconnected: bool,
    pub last_frame: Frame,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            disconnected: false,
            last_frame: NULL_FRAME,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub(crate) struct SyncRequest {
    pub random_request: u32, // please reply back with this random data
    pub remote_magic: u16,
    pub remote_endpoint: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub(crate) struct SyncReply {
    pub random_reply: u32, // here's your random data back
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Input {
    pub peer_connect_status: [ConnectionStatus; UDP_MSG_MAX_PLAYERS],
    pub start_frame: Frame,
    pub disconnect_requested: bool,
    pub ack_frame: Frame,
    pub num_bits: u16,
    pub input_size: u8,
    pub bits: Vec<u8>,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            peer_connect_status: [ConnectionStatus::default(); UDP_MSG_MAX_PLAYERS],
            start_frame: 0,
            disconnect_requested: false,
            ack_frame: NULL_FRAME,
            num_bits: 0,
            input_size: 0,
            bits: Vec::new(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct InputAck {
    pub ack_frame: Frame,
}

impl Default for InputAck {
    fn default() -> Self {
        Self {
            ack_frame: NULL_FRAME,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub(crate) struct QualityReport {
    pub frame_advantage: i8, // frame advantage of the other player
    pub ping: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub(crate) struct QualityReply {
    pub pong: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub(crate) struct MessageHeader {
    pub magic: u16,
    pub sequence_number: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum MessageBody {
    SyncRequest(SyncRequest),
    SyncReply(SyncReply),
    Input(Input),
    InputAck(InputAck),
    QualityReport(QualityReport),
    QualityReply(QualityReply),
    KeepAlive,
}

/// A single UDP datagram payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct UdpMessage {
    pub header: MessageHeader,
    pub body: MessageBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WireError {
    /// The datagram ended before the message was complete.
    UnexpectedEnd,
    /// The type byte does not denote a known message.
    UnknownMsgType(u8),
    /// A length field exceeded its allowed maximum.
    Oversized,
}

impl Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::UnexpectedEnd => write!(f, "Datagram ended unexpectedly."),
            WireError::UnknownMsgType(t) => write!(f, "Unknown message type {}.", t),
            WireError::Oversized => write!(f, "Message length field out of range."),
        }
    }
}

impl Error for WireError {}

impl MessageBody {
    const fn msg_type(&self) -> u8 {
        match self {
            MessageBody::SyncRequest(_) => MSG_TYPE_SYNC_REQUEST,
            MessageBody::SyncReply(_) => MSG_TYPE_SYNC_REPLY,
            MessageBody::Input(_) => MSG_TYPE_INPUT,
            MessageBody::InputAck(_) => MSG_TYPE_INPUT_ACK,
            MessageBody::QualityReport(_) => MSG_TYPE_QUALITY_REPORT,
            MessageBody::QualityReply(_) => MSG_TYPE_QUALITY_REPLY,
            MessageBody::KeepAlive => MSG_TYPE_KEEP_ALIVE,
        }
    }
}

/// Packs a flag and a 31-bit signed frame number into a single word, flag in the lowest bit.
const fn pack_frame_word(flag: bool, frame: Frame) -> u32 {
    (flag as u32) | ((frame as u32) << 1)
}

/// Inverse of `pack_frame_word`. The arithmetic shift restores the frame's sign.
const fn unpack_frame_word(word: u32) -> (bool, Frame) {
    (word & 1 != 0, (word as i32) >> 1)
}

impl UdpMessage {
    pub(crate) fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.packet_size());
        out.extend_from_slice(&self.header.magic.to_le_bytes());
        out.extend_from_slice(&self.header.sequence_number.to_le_bytes());
        out.push(self.body.msg_type());

        match &self.body {
            MessageBody::SyncRequest(body) => {
                out.extend_from_slice(&body.random_request.to_le_bytes());
                out.extend_from_slice(&body.remote_magic.to_le_bytes());
                out.push(body.remote_endpoint);
            }
            MessageBody::SyncReply(body) => {
                out.extend_from_slice(&body.random_reply.to_le_bytes());
            }
            MessageBody::Input(body) => {
                for status in &body.peer_connect_status {
                    out.extend_from_slice(
                        &pack_frame_word(status.disconnected, status.last_frame).to_le_bytes(),
                    );
                }
                out.extend_from_slice(&(body.start_frame as u32).to_le_bytes());
                out.extend_from_slice(
                    &pack_frame_word(body.disconnect_requested, body.ack_frame).to_le_bytes(),
                );
                out.extend_from_slice(&body.num_bits.to_le_bytes());
                out.push(body.input_size);
                out.extend_from_slice(&body.bits);
            }
            MessageBody::InputAck(body) => {
                out.extend_from_slice(&((body.ack_frame as u32) & 0x7fff_ffff).to_le_bytes());
            }
            MessageBody::QualityReport(body) => {
                out.push(body.frame_advantage as u8);
                out.extend_from_slice(&body.ping.to_le_bytes());
            }
            MessageBody::QualityReply(body) => {
                out.extend_from_slice(&body.pong.to_le_bytes());
            }
            MessageBody::KeepAlive => (),
        }

        assert!(out.len() <= MAX_UDP_PACKET_SIZE);
        out
    }

    pub(crate) fn deserialize(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = ByteReader::new(data);
        let magic = reader.read_u16()?;
        let sequence_number = reader.read_u16()?;
        let msg_type = reader.read_u8()?;

        let body = match msg_type {
            MSG_TYPE_SYNC_REQUEST => MessageBody::SyncRequest(SyncRequest {
                random_request: reader.read_u32()?,
                remote_magic: reader.read_u16()?,
                remote_endpoint: reader.read_u8()?,
            }),
            MSG_TYPE_SYNC_REPLY => MessageBody::SyncReply(SyncReply {
                random_reply: reader.read_u32()?,
            }),
            MSG_TYPE_INPUT => {
                let mut peer_connect_status = [ConnectionStatus::default(); UDP_MSG_MAX_PLAYERS];
                for status in &mut peer_connect_status {
                    let (disconnected, last_frame) = unpack_frame_word(reader.read_u32()?);
                    *status = ConnectionStatus {
                        disconnected,
                        last_frame,
                    };
                }
                let start_frame = reader.read_u32()? as i32;
                let (disconnect_requested, ack_frame) = unpack_frame_word(reader.read_u32()?);
                let num_bits = reader.read_u16()?;
                let input_size = reader.read_u8()?;
                if num_bits as usize > MAX_COMPRESSED_BITS {
                    return Err(WireError::Oversized);
                }
                let bits = reader.read_bytes((num_bits as usize + 7) / 8)?.to_vec();
                MessageBody::Input(Input {
                    peer_connect_status,
                    start_frame,
                    disconnect_requested,
                    ack_frame,
                    num_bits,
                    input_size,
                    bits,
                })
            }
            MSG_TYPE_INPUT_ACK => {
                let word = reader.read_u32()?;
                // sign-extend the 31-bit frame number
                let ack_frame = ((word << 1) as i32) >> 1;
                MessageBody::InputAck(InputAck { ack_frame })
            }
            MSG_TYPE_QUALITY_REPORT => MessageBody::QualityReport(QualityReport {
                frame_advantage: reader.read_u8()? as i8,
                ping: reader.read_u32()?,
            }),
            MSG_TYPE_QUALITY_REPLY => MessageBody::QualityReply(QualityReply {
                pong: reader.read_u32()?,
            }),
            MSG_TYPE_KEEP_ALIVE => MessageBody::KeepAlive,
            other => return Err(WireError::UnknownMsgType(other)),
        };

        Ok(Self {
            header: MessageHeader {
                magic,
                sequence_number,
            },
            body,
        })
    }

    /// The exact size of the serialized message in bytes, header included.
    pub(crate) fn packet_size(&self) -> usize {
        let payload = match &self.body {
            MessageBody::SyncRequest(_) => 7,
            MessageBody::SyncReply(_) => 4,
            MessageBody::Input(body) => {
                UDP_MSG_MAX_PLAYERS * 4 + 4 + 4 + 2 + 1 + body.bits.len()
            }
            MessageBody::InputAck(_) => 4,
            MessageBody::QualityReport(_) => 5,
            MessageBody::QualityReply(_) => 4,
            MessageBody::KeepAlive => 0,
        };
        5 + payload
    }
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], WireError> {
        let bytes = self
            .data
            .get(self.pos..self.pos + count)
            .ok_or(WireError::UnexpectedEnd)?;
        self.pos += count;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, WireError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

// #########
// # TESTS #
// #########
