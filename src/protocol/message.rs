//! BitTorrent protocol messages
//!
//! Defines all message types of the peer-wire protocol and their encoding.

use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;

use crate::error::{Result, TorrentError};

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = TorrentError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            _ => Err(TorrentError::protocol_violation_with_source(
                "Invalid message ID",
                format!("value: {}", value),
            )),
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
}

impl Message {
    /// Get the message ID (returns None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
            Message::KeepAlive => None,
        }
    }

    /// Get the message length (excluding the length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Port { .. } => 3,
        }
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());
        if let Some(id) = self.message_id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { listen_port } => buf.put_u16(*listen_port),
            _ => {}
        }

        buf.to_vec()
    }

    /// Decode a frame body (everything after the length prefix).
    ///
    /// An empty body is a keep-alive. Bodies whose size disagrees with their
    /// message id are protocol violations.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let mut buf = &frame[1..];
        let id = MessageId::try_from(frame[0])?;
        let expect = |len: usize| -> Result<()> {
            if frame.len() - 1 != len {
                return Err(TorrentError::protocol_violation_with_source(
                    format!("{:?} message has wrong length", id),
                    format!("expected {} payload bytes, got {}", len, frame.len() - 1),
                ));
            }
            Ok(())
        };

        let message = match id {
            MessageId::Choke => {
                expect(0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect(0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect(0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect(0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect(4)?;
                Message::Have { piece_index: buf.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: buf.to_vec() },
            MessageId::Request => {
                expect(12)?;
                Message::Request {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                }
            }
            MessageId::Piece => {
                if buf.remaining() < 8 {
                    return Err(TorrentError::protocol_violation_with_source(
                        "Piece message too short",
                        format!("expected at least 8 payload bytes, got {}", buf.remaining()),
                    ));
                }
                let index = buf.get_u32();
                let begin = buf.get_u32();
                Message::Piece { index, begin, block: buf.to_vec() }
            }
            MessageId::Cancel => {
                expect(12)?;
                Message::Cancel {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                }
            }
            MessageId::Port => {
                expect(2)?;
                Message::Port { listen_port: buf.get_u16() }
            }
        };
        trace!("Decoded {:?} ({} bytes)", id, frame.len());
        Ok(message)
    }
}
