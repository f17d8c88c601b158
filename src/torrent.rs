//! The read-only torrent descriptor shared by every component.
//!
//! This plays the role of the teacher crate's `torrent::SharedStatus`: a
//! small, cheaply cloneable (`Arc`-wrapped by callers) bundle of everything
//! peer sessions, the planner, and the storage wrapper need to agree on.

use crate::{
    error::Error, metainfo::Metainfo, PeerId, PieceIndex, Sha1Hash,
};

/// Everything about a torrent that is fixed once it's loaded: identity,
/// dimensions, and the expected piece hashes.
#[derive(Clone, Debug)]
pub struct TorrentInfo {
    /// SHA-1 of the bencoded `info` dictionary; uniquely identifies the
    /// torrent to trackers and peers.
    pub info_hash: Sha1Hash,
    /// Our own 20 byte peer id, announced in every handshake and to the
    /// tracker.
    pub client_id: PeerId,
    /// The nominal piece length; every piece but the last is this long.
    pub piece_len: u32,
    /// The length of the last piece, which may be shorter than `piece_len`.
    pub last_piece_len: u32,
    /// The total length of the single file this torrent describes.
    pub total_len: u64,
    /// The tracker's announce URL.
    pub announce: String,
    /// The port we advertise to the tracker for inbound connections.
    pub listening_port: u16,
    /// The expected SHA-1 digest of every piece, in order.
    pub piece_hashes: Vec<Sha1Hash>,
}

impl TorrentInfo {
    /// Builds a torrent descriptor from decoded metainfo.
    ///
    /// Fails if the metainfo describes a multi-file torrent (out of scope,
    /// see the Non-goals in the specification this engine implements).
    pub fn from_metainfo(
        metainfo: &Metainfo,
        client_id: PeerId,
        listening_port: u16,
    ) -> Result<Self, Error> {
        let total_len = metainfo.single_file_length()?;
        let piece_len = metainfo.info.piece_length;
        let num_pieces = metainfo.piece_count();
        if num_pieces == 0 {
            return Err(Error::InvalidTrackerResponse);
        }
        let last_piece_len =
            total_len - piece_len as u64 * (num_pieces - 1) as u64;
        let info_hash = metainfo
            .info_hash()
            .map_err(|_| Error::InvalidTrackerResponse)?;
        let piece_hashes = (0..num_pieces)
            .map(|i| metainfo.piece_hash(i).expect("index in range"))
            .collect();
        Ok(Self {
            info_hash,
            client_id,
            piece_len,
            last_piece_len: last_piece_len as u32,
            total_len,
            announce: metainfo
                .announce
                .clone()
                .unwrap_or_else(|| String::new()),
            listening_port,
            piece_hashes,
        })
    }

    /// The number of pieces in the torrent.
    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Returns the length of the piece at `index`.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32, Error> {
        let num_pieces = self.num_pieces();
        if index + 1 == num_pieces {
            Ok(self.last_piece_len)
        } else if index < num_pieces {
            Ok(self.piece_len)
        } else {
            Err(Error::InvalidPieceIndex(index))
        }
    }

    /// Returns the expected SHA-1 digest of the piece at `index`.
    pub fn expected_hash(&self, index: PieceIndex) -> Result<Sha1Hash, Error> {
        self.piece_hashes
            .get(index)
            .copied()
            .ok_or(Error::InvalidPieceIndex(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{Info, Metainfo};
    use serde_bytes::ByteBuf;

    fn sample_metainfo() -> Metainfo {
        // 3 pieces of 16 KiB, last one is short
        let mut pieces = Vec::new();
        for b in 0..3u8 {
            pieces.extend_from_slice(&[b; 20]);
        }
        Metainfo {
            announce: Some("http://tracker.example/announce".to_owned()),
            info: Info {
                name: "file.bin".to_owned(),
                piece_length: 16384,
                pieces: ByteBuf::from(pieces),
                length: Some(16384 * 2 + 1000),
                files: None,
                private: None,
            },
        }
    }

    #[test]
    fn test_derived_piece_lengths() {
        let metainfo = sample_metainfo();
        let torrent =
            TorrentInfo::from_metainfo(&metainfo, [0; 20], 50881).unwrap();
        assert_eq!(torrent.num_pieces(), 3);
        assert_eq!(torrent.piece_len(0).unwrap(), 16384);
        assert_eq!(torrent.piece_len(1).unwrap(), 16384);
        assert_eq!(torrent.piece_len(2).unwrap(), 1000);
        assert!(torrent.piece_len(3).is_err());
    }

    #[test]
    fn test_expected_hash() {
        let metainfo = sample_metainfo();
        let torrent =
            TorrentInfo::from_metainfo(&metainfo, [0; 20], 50881).unwrap();
        assert_eq!(torrent.expected_hash(0).unwrap(), [0u8; 20]);
        assert_eq!(torrent.expected_hash(1).unwrap(), [1u8; 20]);
        assert_eq!(torrent.expected_hash(2).unwrap(), [2u8; 20]);
    }
}
