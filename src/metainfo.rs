//! Parsing of the bencoded `.torrent` metainfo file.
//!
//! This is deliberately thin: full bencode decoding is an external
//! collaborator (`serde_bencode`) and this module only adapts its output
//! into the single-file torrent descriptor the rest of the engine expects.

use serde_bencode::Error as BencodeError;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{error::Error, PieceIndex, Sha1Hash};

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub announce: Option<String>,
    pub info: Info,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, BencodeError> {
        serde_bencode::from_bytes(buf)
    }

    /// Computes the SHA-1 of the bencoded `info` dictionary, which is the
    /// torrent's info hash.
    pub fn info_hash(&self) -> Result<Sha1Hash, BencodeError> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Returns the single file's length, rejecting multi-file torrents.
    pub fn single_file_length(&self) -> Result<u64, Error> {
        if self.info.files.is_some() {
            return Err(Error::MultiFileTorrentNotSupported);
        }
        self.info.length.ok_or(Error::MultiFileTorrentNotSupported)
    }

    /// Returns the number of pieces implied by the `pieces` field.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Returns the expected SHA-1 digest of the piece at `index`.
    pub fn piece_hash(&self, index: PieceIndex) -> Option<Sha1Hash> {
        let start = index * 20;
        let end = start + 20;
        let slice = self.info.pieces.get(start..end)?;
        let mut hash = [0; 20];
        hash.copy_from_slice(slice);
        Some(hash)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    #[serde(with = "serde_bytes")]
    pub pieces: ByteBuf,
    /// Present for single-file torrents; this is the only case this engine
    /// supports.
    pub length: Option<u64>,
    /// Present for multi-file torrents; always rejected, see
    /// [`Metainfo::single_file_length`].
    pub files: Option<Vec<FileEntry>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub length: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metainfo_with(length: u64, piece_count: usize) -> Metainfo {
        let pieces = vec![7u8; 20 * piece_count];
        let info = Info {
            name: "a.bin".to_owned(),
            piece_length: 16384,
            pieces: ByteBuf::from(pieces),
            length: Some(length),
            files: None,
            private: None,
        };
        Metainfo {
            announce: Some("http://example.com/announce".to_owned()),
            info,
        }
    }

    #[test]
    fn test_single_file_length() {
        let metainfo = metainfo_with(12345, 1);
        assert_eq!(metainfo.single_file_length().unwrap(), 12345);
        assert_eq!(metainfo.piece_count(), 1);
    }

    #[test]
    fn test_multi_file_rejected() {
        let info = Info {
            name: "archive".to_owned(),
            piece_length: 16384,
            pieces: ByteBuf::from(vec![0u8; 20]),
            length: None,
            files: Some(vec![FileEntry {
                path: vec!["a".into()],
                length: 10,
            }]),
            private: None,
        };
        let metainfo = Metainfo {
            announce: None,
            info,
        };
        assert!(matches!(
            metainfo.single_file_length(),
            Err(Error::MultiFileTorrentNotSupported)
        ));
    }

    #[test]
    fn test_piece_hash_lookup() {
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&[1u8; 20]);
        pieces.extend_from_slice(&[2u8; 20]);
        let info = Info {
            name: "a".to_owned(),
            piece_length: 16384,
            pieces: ByteBuf::from(pieces),
            length: Some(20000),
            files: None,
            private: None,
        };
        let metainfo = Metainfo {
            announce: None,
            info,
        };
        assert_eq!(metainfo.piece_count(), 2);
        assert_eq!(metainfo.piece_hash(0), Some([1u8; 20]));
        assert_eq!(metainfo.piece_hash(1), Some([2u8; 20]));
        assert_eq!(metainfo.piece_hash(2), None);
    }

    #[test]
    fn test_info_hash_roundtrip_from_bytes() {
        let metainfo = metainfo_with(100, 1);
        let encoded = serde_bencode::to_bytes(&metainfo.info).unwrap();
        let decoded: Info = serde_bencode::from_bytes(&encoded).unwrap();
        assert_eq!(decoded.name, metainfo.info.name);
        assert_eq!(decoded.piece_length, metainfo.info.piece_length);
    }
}
