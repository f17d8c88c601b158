use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::Error, wire::MessageId, Bitfield, BlockInfo, PieceIndex,
};

use super::{Handshake, Message, PROTOCOL_STRING};

/// Frames larger than this are rejected outright rather than buffered, so a
/// malicious or buggy peer can't force unbounded memory growth. Comfortably
/// larger than one block (16 KiB) plus its header.
const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Codec used only for the initial 68 byte handshake exchange; the
/// connection is switched over to [`PeerCodec`] immediately after.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        buf.reserve(68);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&[0u8; 8]);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 1 {
            return Ok(None);
        }
        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(Error::InvalidProtocolString);
        }
        let total_len = 1 + prot_len + 8 + 20 + 20;
        if buf.len() < total_len {
            return Ok(None);
        }

        let mut buf = buf.split_to(total_len);
        buf.advance(1);
        let prot = buf.split_to(prot_len);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::InvalidProtocolString);
        }
        buf.advance(8); // reserved bytes, ignored

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[0..20]);
        buf.advance(20);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[0..20]);

        Ok(Some(Handshake { info_hash, peer_id }))
    }
}

/// Codec for the length-prefixed message stream exchanged once the
/// handshake is complete.
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.reserve(4);
                buf.put_u32(0);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.reserve(5);
                buf.put_u32(1);
                buf.put_u8(msg.id().expect("non keep-alive has an id") as u8);
            }
            Message::Have(index) => {
                buf.reserve(9);
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(index as u32);
            }
            Message::Bitfield(bitfield) => {
                let raw = bitfield_to_bytes(&bitfield);
                buf.reserve(5 + raw.len());
                buf.put_u32(1 + raw.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&raw);
            }
            Message::Request(block) => {
                buf.reserve(17);
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Cancel(block) => {
                buf.reserve(17);
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Piece { block, data } => {
                buf.reserve(13 + data.len());
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_slice(&data);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }
            let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
            if len == 0 {
                buf.advance(4);
                return Ok(Some(Message::KeepAlive));
            }
            if len > MAX_FRAME_LEN {
                return Err(Error::FrameTooLarge(len));
            }
            if buf.len() < 4 + len as usize {
                // reserve so the next socket read can fill in the rest
                // without reallocating
                buf.reserve(4 + len as usize - buf.len());
                return Ok(None);
            }

            buf.advance(4);
            let mut payload = buf.split_to(len as usize);
            let id = MessageId::try_from(payload[0])?;
            payload.advance(1);

            let msg = match id {
                MessageId::Choke => Message::Choke,
                MessageId::Unchoke => Message::Unchoke,
                MessageId::Interested => Message::Interested,
                MessageId::NotInterested => Message::NotInterested,
                MessageId::Have => {
                    if payload.len() < 4 {
                        return Err(Error::InvalidBlockRange);
                    }
                    let index = u32::from_be_bytes([
                        payload[0], payload[1], payload[2], payload[3],
                    ]) as PieceIndex;
                    Message::Have(index)
                }
                MessageId::Bitfield => {
                    Message::Bitfield(bytes_to_bitfield(&payload))
                }
                MessageId::Request | MessageId::Cancel => {
                    if payload.len() < 12 {
                        return Err(Error::InvalidBlockRange);
                    }
                    let piece_index = u32::from_be_bytes([
                        payload[0], payload[1], payload[2], payload[3],
                    ]) as PieceIndex;
                    let offset = u32::from_be_bytes([
                        payload[4], payload[5], payload[6], payload[7],
                    ]);
                    let req_len = u32::from_be_bytes([
                        payload[8], payload[9], payload[10], payload[11],
                    ]);
                    let block = BlockInfo {
                        piece_index,
                        offset,
                        len: req_len,
                    };
                    if id == MessageId::Request {
                        Message::Request(block)
                    } else {
                        Message::Cancel(block)
                    }
                }
                MessageId::Piece => {
                    if payload.len() < 8 {
                        return Err(Error::InvalidBlockRange);
                    }
                    let piece_index = u32::from_be_bytes([
                        payload[0], payload[1], payload[2], payload[3],
                    ]) as PieceIndex;
                    let offset = u32::from_be_bytes([
                        payload[4], payload[5], payload[6], payload[7],
                    ]);
                    let data = payload[8..].to_vec();
                    Message::Piece {
                        block: BlockInfo {
                            piece_index,
                            offset,
                            len: data.len() as u32,
                        },
                        data,
                    }
                }
            };

            return Ok(Some(msg));
        }
    }
}

/// Packs a bitfield into its on-wire form: most-significant-bit first,
/// zero-padded to a whole number of bytes.
fn bitfield_to_bytes(bitfield: &Bitfield) -> Vec<u8> {
    bitfield.clone().into_vec()
}

/// Unpacks a wire bitfield into a [`Bitfield`]. The result may have trailing
/// bits beyond the torrent's piece count; callers are expected to truncate
/// (or resize) to the known piece count, per the spec's boundary behavior.
fn bytes_to_bitfield(bytes: &[u8]) -> Bitfield {
    Bitfield::from_vec(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_handshake_roundtrip() {
        let mut codec = HandshakeCodec;
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let mut buf = BytesMut::new();
        codec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 19);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_wrong_length_byte_rejected() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(20);
        buf.put_slice(&[0u8; 67]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_keepalive_roundtrip() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::KeepAlive);
    }

    #[test]
    fn test_request_roundtrip() {
        let mut codec = PeerCodec;
        let block = BlockInfo {
            piece_index: 3,
            offset: 16384,
            len: 16384,
        };
        let mut buf = BytesMut::new();
        codec.encode(Message::Request(block), &mut buf).unwrap();
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::Request(block));
    }

    #[test]
    fn test_piece_roundtrip() {
        let mut codec = PeerCodec;
        let block = BlockInfo {
            piece_index: 1,
            offset: 0,
            len: 4,
        };
        let mut buf = BytesMut::new();
        codec
            .encode(
                Message::Piece {
                    block,
                    data: vec![9, 8, 7, 6],
                },
                &mut buf,
            )
            .unwrap();
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        match msg {
            Message::Piece { block: b, data } => {
                assert_eq!(b, block);
                assert_eq!(data, vec![9, 8, 7, 6]);
            }
            _ => panic!("expected Piece"),
        }
    }

    #[test]
    fn test_split_reads_yield_one_message() {
        let mut codec = PeerCodec;
        let block = BlockInfo {
            piece_index: 7,
            offset: 42,
            len: 99,
        };
        let mut full = BytesMut::new();
        codec.encode(Message::Request(block), &mut full).unwrap();
        let full = full.to_vec();

        // deliver in chunks of lengths 2, 3, 8, ...
        let mut buf = BytesMut::new();
        let mut offset = 0;
        let chunk_lens = [2usize, 3, 8];
        let mut messages = Vec::new();
        for &chunk_len in &chunk_lens {
            let end = (offset + chunk_len).min(full.len());
            buf.extend_from_slice(&full[offset..end]);
            offset = end;
            if let Some(msg) = codec.decode(&mut buf).unwrap() {
                messages.push(msg);
            }
        }
        // feed the remainder, if any
        if offset < full.len() {
            buf.extend_from_slice(&full[offset..]);
            if let Some(msg) = codec.decode(&mut buf).unwrap() {
                messages.push(msg);
            }
        }
        assert_eq!(messages, vec![Message::Request(block)]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bitfield_with_trailing_padding_accepted() {
        // 10 pieces needs 2 bytes on the wire; the low 6 bits of the second
        // byte are padding and should be accepted, not treated as pieces.
        let mut bits: Bitfield = BitVec::new();
        bits.resize(10, false);
        bits.set(0, true);
        bits.set(9, true);

        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Message::Bitfield(bits.clone()), &mut buf)
            .unwrap();
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        match msg {
            Message::Bitfield(mut decoded) => {
                assert_eq!(decoded.len(), 16); // byte-aligned on the wire
                decoded.resize(10, false);
                assert_eq!(decoded, bits);
            }
            _ => panic!("expected Bitfield"),
        }
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN + 1);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_have_short_frame_rejected() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(MessageId::Have as u8);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_request_short_frame_rejected() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(MessageId::Request as u8);
        buf.put_u32(0);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_piece_short_frame_rejected() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(MessageId::Piece as u8);
        buf.put_u32(0);
        assert!(codec.decode(&mut buf).is_err());
    }
}
