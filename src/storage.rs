//! Blocking, synchronous file access for the single file a torrent
//! describes. This is wrapped by [`crate::disk`] so the engine never blocks
//! on I/O directly.

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::PathBuf,
};

use sha1::{Digest, Sha1};

use crate::{error::Error, BlockInfo, Bitfield, PieceIndex, Sha1Hash, TorrentInfo};

/// Everything [`Storage`] needs to know about where and how big the
/// torrent's file is, derived once from the torrent descriptor.
#[derive(Clone, Debug)]
pub struct PieceInfo {
    pub piece_len: u32,
    pub last_piece_len: u32,
    pub num_pieces: usize,
    pub total_len: u64,
}

impl PieceInfo {
    pub fn from_torrent(torrent: &TorrentInfo) -> Self {
        Self {
            piece_len: torrent.piece_len,
            last_piece_len: torrent.last_piece_len,
            num_pieces: torrent.num_pieces(),
            total_len: torrent.total_len,
        }
    }

    /// The length of the piece at `index`.
    fn piece_len(&self, index: PieceIndex) -> u32 {
        if index + 1 == self.num_pieces {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }
}

/// Blocking wrapper around the single destination file. Every method here
/// does real, possibly slow, I/O and is meant to be called from within
/// `tokio::task::spawn_blocking`, never directly from an async task.
pub(crate) struct Storage {
    info: PieceInfo,
    piece_hashes: Vec<Sha1Hash>,
    file: File,
    /// Path the file is renamed to once every piece has been verified.
    final_path: PathBuf,
    part_path: PathBuf,
}

impl Storage {
    /// Opens (creating if absent) the `.part` file for this torrent,
    /// preallocated to the torrent's full length.
    pub(crate) fn new(
        download_dir: &std::path::Path,
        name: &str,
        info: PieceInfo,
        piece_hashes: Vec<Sha1Hash>,
    ) -> Result<Self, Error> {
        fs::create_dir_all(download_dir)?;
        let final_path = download_dir.join(name);
        let part_path = download_dir.join(format!("{}.part", name));

        if final_path.exists() {
            // already fully downloaded in a previous session; open it
            // directly rather than re-creating a .part file
            let file = OpenOptions::new().read(true).write(true).open(&final_path)?;
            return Ok(Self {
                info,
                piece_hashes,
                file,
                final_path,
                part_path,
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&part_path)?;
        file.set_len(info.total_len)?;

        Ok(Self {
            info,
            piece_hashes,
            file,
            final_path,
            part_path,
        })
    }

    /// Rebuilds the local bitfield by hashing every piece currently on
    /// disk. Used on startup to resume a partially downloaded torrent
    /// without trusting any in-memory state.
    pub(crate) fn rehash(&mut self) -> Result<Bitfield, Error> {
        let mut bitfield = Bitfield::new();
        bitfield.resize(self.info.num_pieces, false);
        for index in 0..self.info.num_pieces {
            if let Ok(data) = self.read_piece(index) {
                if Self::hash(&data) == self.piece_hashes[index] {
                    bitfield.set(index, true);
                }
            }
        }
        Ok(bitfield)
    }

    pub(crate) fn hash(data: &[u8]) -> Sha1Hash {
        let digest = Sha1::digest(data);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        hash
    }

    fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.info.piece_len as u64
    }

    fn read_piece(&mut self, index: PieceIndex) -> Result<Vec<u8>, Error> {
        let len = self.info.piece_len(index) as usize;
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(self.piece_offset(index)))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Writes a whole, already-verified piece to its place in the file. The
    /// caller is the one that assembled and hashed the piece in memory (see
    /// the engine's partial-piece buffer); by the time a piece reaches here
    /// it has already matched its expected digest, so no byte landing in the
    /// file is ever unverified.
    pub(crate) fn write_piece(
        &mut self,
        index: PieceIndex,
        data: &[u8],
    ) -> Result<(), Error> {
        if data.len() != self.info.piece_len(index) as usize {
            return Err(Error::InvalidBlockRange);
        }
        self.file.seek(SeekFrom::Start(self.piece_offset(index)))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Reads a single block out of the file, for serving upload requests.
    pub(crate) fn read_block(&mut self, block: BlockInfo) -> Result<Vec<u8>, Error> {
        let offset = self.piece_offset(block.piece_index) + block.offset as u64;
        let mut buf = vec![0u8; block.len as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Returns whether every piece of the torrent has been verified present,
    /// and if so renames the `.part` file to its final name.
    pub(crate) fn finalize_if_complete(&mut self, bitfield: &Bitfield) -> Result<bool, Error> {
        if bitfield.count_ones() != self.info.num_pieces {
            return Ok(false);
        }
        if self.part_path.exists() {
            fs::rename(&self.part_path, &self.final_path)?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test picks a unique subdirectory under the system temp dir and
    // cleans it up itself, since this crate doesn't depend on `tempfile`.
    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bittorrent-core-test-{}", name));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn sample_piece_hashes(pieces: &[Vec<u8>]) -> Vec<Sha1Hash> {
        pieces.iter().map(|p| Storage::hash(p)).collect()
    }

    #[test]
    fn test_write_piece_read_block_roundtrip() {
        let dir = scratch_dir("write_read_verify");
        let piece_a = vec![1u8; 16384];
        let piece_b = vec![2u8; 1000];
        let hashes = sample_piece_hashes(&[piece_a.clone(), piece_b.clone()]);
        let info = PieceInfo {
            piece_len: 16384,
            last_piece_len: 1000,
            num_pieces: 2,
            total_len: 16384 + 1000,
        };
        let mut storage =
            Storage::new(&dir, "file.bin", info, hashes).unwrap();

        storage.write_piece(0, &piece_a).unwrap();
        storage.write_piece(1, &piece_b).unwrap();

        let read_back = storage
            .read_block(BlockInfo {
                piece_index: 0,
                offset: 100,
                len: 10,
            })
            .unwrap();
        assert_eq!(read_back, vec![1u8; 10]);

        let read_back = storage
            .read_block(BlockInfo {
                piece_index: 1,
                offset: 0,
                len: 1000,
            })
            .unwrap();
        assert_eq!(read_back, piece_b);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_write_piece_rejects_wrong_length() {
        let dir = scratch_dir("write_piece_wrong_len");
        let piece = vec![5u8; 16384];
        let hashes = sample_piece_hashes(&[piece.clone()]);
        let info = PieceInfo {
            piece_len: 16384,
            last_piece_len: 16384,
            num_pieces: 1,
            total_len: 16384,
        };
        let mut storage = Storage::new(&dir, "file.bin", info, hashes).unwrap();
        assert!(storage.write_piece(0, &vec![9u8; 100]).is_err());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_finalize_renames_once_all_pieces_present() {
        let dir = scratch_dir("finalize");
        let piece = vec![3u8; 10];
        let hashes = sample_piece_hashes(&[piece.clone()]);
        let info = PieceInfo {
            piece_len: 10,
            last_piece_len: 10,
            num_pieces: 1,
            total_len: 10,
        };
        let mut storage = Storage::new(&dir, "file.bin", info, hashes).unwrap();
        storage.write_piece(0, &piece).unwrap();

        let mut bitfield = Bitfield::new();
        bitfield.resize(1, false);
        bitfield.set(0, true);

        assert!(storage.finalize_if_complete(&bitfield).unwrap());
        assert!(dir.join("file.bin").exists());

        let _ = fs::remove_dir_all(&dir);
    }
}
