//! Wire framing
//!
//! Incremental decoder turning an arbitrary byte stream into a handshake
//! followed by length-prefixed frames.

use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;

use super::handshake::{Handshake, HANDSHAKE_LEN};
use super::message::Message;
use crate::error::{Result, TorrentError};

/// Largest frame body accepted from a peer (1 MiB)
pub const MAX_MESSAGE_LEN: usize = 1 << 20;

/// Buffers partial input across reads
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    handshake_done: bool,
}

impl FrameDecoder {
    /// A decoder that expects a handshake first
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the handshake once all 68 bytes are present
    pub fn next_handshake(&mut self) -> Result<Option<Handshake>> {
        if self.handshake_done || self.buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        let bytes = self.buf.split_to(HANDSHAKE_LEN);
        self.handshake_done = true;
        Handshake::deserialize(&bytes).map(Some)
    }

    /// Take the next complete message, if any.
    ///
    /// A declared length above [`MAX_MESSAGE_LEN`] is a protocol violation.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        if !self.handshake_done {
            return Ok(None);
        }
        match read_frame(&mut self.buf)? {
            Some(frame) => Message::parse(&frame).map(Some),
            None => Ok(None),
        }
    }
}

/// Split one length-prefixed frame body off the front of `buf`
pub fn read_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > MAX_MESSAGE_LEN {
        return Err(TorrentError::protocol_violation_with_source(
            "Message exceeds maximum length",
            format!("declared {} bytes, limit {}", length, MAX_MESSAGE_LEN),
        ));
    }

    if buf.len() < 4 + length {
        trace!("Partial frame: {} of {} bytes", buf.len() - 4, length);
        return Ok(None);
    }

    buf.advance(4);
    Ok(Some(buf.split_to(length).to_vec()))
}

/// Append a length-prefixed frame body to `buf`
pub fn write_frame(buf: &mut BytesMut, body: &[u8]) {
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake_bytes() -> Vec<u8> {
        Handshake::new([1u8; 20], [2u8; 20]).serialize()
    }

    #[test]
    fn test_write_read_frame() {
        let mut buf = BytesMut::new();
        write_frame(&mut buf, b"hello");
        assert_eq!(read_frame(&mut buf).unwrap().unwrap(), b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_read_frame_incomplete() {
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_slice(b"hello");
        assert!(read_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_LEN as u32 + 1);
        let err = read_frame(&mut buf).unwrap_err();
        assert!(matches!(err, TorrentError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_decoder_splits_byte_by_byte() {
        let mut stream = handshake_bytes();
        stream.extend(Message::Unchoke.serialize());
        stream.extend(Message::Have { piece_index: 3 }.serialize());

        let mut decoder = FrameDecoder::new();
        let mut handshake = None;
        let mut messages = Vec::new();
        for byte in stream {
            decoder.extend(&[byte]);
            if let Some(h) = decoder.next_handshake().unwrap() {
                handshake = Some(h);
            }
            while let Some(m) = decoder.next_message().unwrap() {
                messages.push(m);
            }
        }

        assert_eq!(handshake.unwrap().peer_id, [2u8; 20]);
        assert_eq!(messages, vec![Message::Unchoke, Message::Have { piece_index: 3 }]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_no_messages_before_handshake() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&Message::Choke.serialize());
        assert!(decoder.next_message().unwrap().is_none());
    }
}
