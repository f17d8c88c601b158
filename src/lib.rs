// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

pub mod conf;
mod disk;
pub mod engine;
pub mod error;
pub mod metainfo;
mod peer_session;
mod request_manager;
mod storage;
mod torrent;
pub mod tracker;
mod wire;

use bitvec::prelude::{BitVec, Msb0};

pub use storage::PieceInfo;
pub use torrent::TorrentInfo;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in
/// the source code we use `usize` to be consistent with other index types in
/// Rust.
pub type PieceIndex = usize;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer, or our own
/// local completion state.
///
/// It is a compact bool vector from most significant bit to least
/// significant bit, i.e. the first highest bit represents the first piece,
/// the second highest bit the second piece, and so on (e.g. `0b1100_0001`
/// would mean we have pieces 0, 1, and 7). A truthy value at a piece's
/// position means the piece is present; a falsy value means it's missing.
pub type Bitfield = BitVec<Msb0, u8>;

/// This is the only block length we're dealing with (except for possibly the
/// last block of a piece). It is the widely used and accepted 16 KiB.
///
/// The source engine this crate is modeled on defines an 8 KiB block size
/// constant but never actually splits blocks any differently; 16 KiB is the
/// value real-world swarms expect, so this crate uses it throughout.
pub(crate) const BLOCK_LEN: u32 = 0x4000;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading and uploading both happen at this block
/// granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes. Always 16 KiB (0x4000 bytes), except
    /// possibly the last block of a piece.
    pub len: u32,
}

impl BlockInfo {
    /// Returns the index of the block within its piece, assuming the default
    /// block length of 16 KiB.
    pub fn index_in_piece(&self) -> usize {
        debug_assert!(self.len <= BLOCK_LEN);
        debug_assert!(self.len > 0);
        (self.offset / BLOCK_LEN) as usize
    }
}

/// Returns the length of the block at `index` within a piece of length
/// `piece_len`.
///
/// If the piece is not a multiple of the default block length, the last
/// block is shorter.
///
/// # Panics
///
/// Panics if `index * BLOCK_LEN` would be at or past `piece_len`.
pub(crate) fn block_len(piece_len: u32, index: usize) -> u32 {
    let index = index as u32;
    let block_offset = index * BLOCK_LEN;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

/// Returns the number of blocks in a piece of the given length.
pub(crate) fn block_count(piece_len: u32) -> usize {
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}

/// Splits a piece into its constituent block descriptors.
pub(crate) fn blocks_in_piece(
    piece_index: PieceIndex,
    piece_len: u32,
) -> Vec<BlockInfo> {
    (0..block_count(piece_len))
        .map(|i| BlockInfo {
            piece_index,
            offset: i as u32 * BLOCK_LEN,
            len: block_len(piece_len, i),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // An arbitrary piece length that is an exact multiple of the canonical
    // block length (16 KiB).
    const BLOCK_LEN_MULTIPLE_PIECE_LEN: u32 = 2 * BLOCK_LEN;

    // An arbitrary piece length that is _not_ a multiple of the canonical
    // block length, plus the amount by which it overlaps the nearest exact
    // multiple.
    const OVERLAP: u32 = 234;
    const UNEVEN_PIECE_LEN: u32 = 2 * BLOCK_LEN + OVERLAP;

    #[test]
    fn test_block_len() {
        assert_eq!(block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 1), BLOCK_LEN);

        assert_eq!(block_len(UNEVEN_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 1), BLOCK_LEN);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 2), OVERLAP);
    }

    #[test]
    #[should_panic]
    fn test_block_len_invalid_index_panic() {
        block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 2);
    }

    #[test]
    fn test_block_count() {
        assert_eq!(block_count(BLOCK_LEN_MULTIPLE_PIECE_LEN), 2);
        assert_eq!(block_count(UNEVEN_PIECE_LEN), 3);
    }

    #[test]
    fn test_blocks_in_piece_last_piece() {
        // last piece shorter than one block
        let blocks = blocks_in_piece(4, 1000);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[0].len, 1000);
    }
}
