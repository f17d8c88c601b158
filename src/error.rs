//! The crate-wide error type and result alias.
//!
//! This mirrors the plain hand-rolled error enum style of the engine this
//! crate grew out of rather than pulling in a derive-macro crate: every
//! fallible operation in the crate returns this single `Error` type.

use std::fmt;

use crate::PieceIndex;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    /// The peer's handshake declared a different info hash than ours.
    InvalidPeerInfoHash,
    /// The peer's handshake declared a peer id that doesn't match the one
    /// the tracker gave us for this address.
    InvalidPeerId,
    /// The handshake's length prefix or protocol string didn't match the
    /// BitTorrent v1 constant.
    InvalidProtocolString,
    /// A BITFIELD message arrived somewhere other than directly after the
    /// handshake.
    BitfieldNotAfterHandshake,
    /// A frame's declared length exceeded the sanity ceiling.
    FrameTooLarge(u32),
    /// The message type byte didn't match any known message.
    InvalidMessageId(u8),
    /// A piece index was out of bounds for this torrent.
    InvalidPieceIndex(PieceIndex),
    /// A block request or PIECE payload didn't line up with piece bounds.
    InvalidBlockRange,
    /// The storage file doesn't yet have this piece; it can't be read.
    PieceNotComplete(PieceIndex),
    /// The torrent metainfo named more than one file; only single-file
    /// torrents are supported.
    MultiFileTorrentNotSupported,
    /// The tracker response couldn't be parsed as bencode or was missing
    /// required keys.
    InvalidTrackerResponse,
    /// Wraps `std::io::Error` (socket and disk I/O).
    Io(std::io::Error),
    /// Wraps bencode decode/encode failures.
    Bencode(serde_bencode::Error),
    /// Wraps tracker HTTP failures.
    Tracker(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidPeerInfoHash => {
                write!(f, "peer handshake advertised a different info hash")
            }
            Error::InvalidPeerId => {
                write!(f, "peer handshake advertised an unexpected peer id")
            }
            Error::InvalidProtocolString => {
                write!(f, "handshake protocol string is invalid")
            }
            Error::BitfieldNotAfterHandshake => {
                write!(f, "bitfield message received outside availability exchange")
            }
            Error::FrameTooLarge(len) => {
                write!(f, "frame length {} exceeds sanity ceiling", len)
            }
            Error::InvalidMessageId(id) => {
                write!(f, "invalid message id {}", id)
            }
            Error::InvalidPieceIndex(index) => {
                write!(f, "piece index {} is out of bounds", index)
            }
            Error::InvalidBlockRange => {
                write!(f, "block request/payload doesn't fit within its piece")
            }
            Error::PieceNotComplete(index) => {
                write!(f, "piece {} is not yet complete", index)
            }
            Error::MultiFileTorrentNotSupported => {
                write!(f, "multi-file torrents are not supported")
            }
            Error::InvalidTrackerResponse => {
                write!(f, "tracker response is missing required fields")
            }
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Bencode(e) => write!(f, "bencode error: {}", e),
            Error::Tracker(msg) => write!(f, "tracker error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::Bencode(e)
    }
}
