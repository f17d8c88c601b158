//! The BitTorrent v1 wire protocol: the fixed handshake and the
//! length-prefixed message framing, plus the message types themselves.

mod codec;

pub(crate) use codec::{HandshakeCodec, PeerCodec};

use crate::{Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

/// The protocol string every BitTorrent v1 handshake carries.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The fixed 68 byte handshake that opens every peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }
}

/// The id byte of a message, used for logging and dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl std::convert::TryFrom<u8> for MessageId {
    type Error = crate::error::Error;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        match id {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Piece),
            8 => Ok(Cancel),
            _ => Err(crate::error::Error::InvalidMessageId(id)),
        }
    }
}

/// A fully decoded peer protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    /// A zero-length frame; a liveness ping with no type byte.
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(PieceIndex),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece { block: BlockInfo, data: Vec<u8> },
    Cancel(BlockInfo),
}

impl Message {
    /// Returns the id of the message, for logging. `None` for `KeepAlive`,
    /// which has no type byte.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have(_) => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}
