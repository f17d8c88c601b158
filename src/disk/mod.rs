//! Async wrapper around [`crate::storage`]: the rest of the engine only
//! ever talks to disk through [`DiskHandle`] and bounded channels, so piece
//! hashing and file I/O never block the engine's own task.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use tokio::{sync::mpsc, sync::oneshot, task};

use crate::{
    conf::INTERNAL_QUEUE_CAPACITY, error::Error, storage::{PieceInfo, Storage},
    Bitfield, BlockInfo, PieceIndex, Sha1Hash,
};

/// Commands the engine sends to the disk task.
pub(crate) enum Command {
    /// Write a whole piece that the engine has already assembled from its
    /// blocks and verified against the expected hash in memory. The disk
    /// task never sees an unverified byte.
    WritePiece { index: PieceIndex, data: Vec<u8> },
    /// Read a single block back out, for serving an upload.
    ReadBlock {
        block: BlockInfo,
        reply: oneshot::Sender<Result<Vec<u8>, Error>>,
    },
    Shutdown,
}

/// Notifications the disk task sends back to the engine.
#[derive(Debug)]
pub(crate) enum Alert {
    /// A verified piece was written to disk.
    PieceWritten { index: PieceIndex },
    /// A piece failed to write; the engine should treat it as not yet
    /// downloaded and may re-request it from scratch.
    WriteError { index: PieceIndex },
    /// Every piece is now present and verified; the download is complete.
    TorrentComplete,
}

/// Handle used by the engine and peer sessions to queue disk work.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    cmd_tx: mpsc::Sender<Command>,
}

fn disk_gone() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "disk task is no longer running",
    ))
}

impl DiskHandle {
    pub(crate) async fn write_piece(
        &self,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<(), Error> {
        self.cmd_tx
            .clone()
            .send(Command::WritePiece { index, data })
            .await
            .map_err(|_| disk_gone())
    }

    pub(crate) async fn read_block(
        &self,
        block: BlockInfo,
    ) -> Result<Vec<u8>, Error> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .clone()
            .send(Command::ReadBlock { block, reply })
            .await
            .map_err(|_| disk_gone())?;
        reply_rx.await.map_err(|_| disk_gone())?
    }

    pub(crate) async fn shutdown(&self) {
        let _ = self.cmd_tx.clone().send(Command::Shutdown).await;
    }
}

/// Owns the torrent's [`Storage`] and drives its blocking operations on
/// tokio's blocking thread pool, one command at a time.
pub(crate) struct Disk {
    cmd_rx: mpsc::Receiver<Command>,
    alert_tx: mpsc::Sender<Alert>,
    storage: Arc<Mutex<Storage>>,
    bitfield: Arc<Mutex<Bitfield>>,
}

impl Disk {
    /// Opens (or resumes) the torrent's file and rehashes whatever is
    /// already on disk to build the starting local bitfield.
    pub(crate) fn new(
        download_dir: PathBuf,
        name: &str,
        piece_info: PieceInfo,
        piece_hashes: Vec<Sha1Hash>,
    ) -> Result<(Self, DiskHandle, mpsc::Receiver<Alert>, Bitfield), Error> {
        let mut storage = Storage::new(&download_dir, name, piece_info, piece_hashes)?;
        let bitfield = storage.rehash()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(INTERNAL_QUEUE_CAPACITY);
        let (alert_tx, alert_rx) = mpsc::channel(INTERNAL_QUEUE_CAPACITY);

        let disk = Self {
            cmd_rx,
            alert_tx,
            storage: Arc::new(Mutex::new(storage)),
            bitfield: Arc::new(Mutex::new(bitfield.clone())),
        };
        Ok((disk, DiskHandle { cmd_tx }, alert_rx, bitfield))
    }

    /// Runs until the engine sends [`Command::Shutdown`] or drops the
    /// handle.
    pub(crate) async fn start(&mut self) -> Result<(), Error> {
        log::info!("starting disk event loop");
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::WritePiece { index, data } => {
                    self.write_piece(index, data).await?;
                }
                Command::ReadBlock { block, reply } => {
                    let storage = Arc::clone(&self.storage);
                    let result =
                        task::spawn_blocking(move || storage.lock().unwrap().read_block(block))
                            .await
                            .expect("disk read task panicked");
                    // the caller may have given up waiting; that's fine
                    let _ = reply.send(result);
                }
                Command::Shutdown => {
                    log::info!("shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Writes a piece the engine has already assembled and hash-verified in
    /// memory. Disk I/O failure here is an I/O problem, not a corrupt piece;
    /// the engine treats it as not-yet-downloaded and retries.
    async fn write_piece(
        &mut self,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<(), Error> {
        let storage = Arc::clone(&self.storage);
        let bitfield = Arc::clone(&self.bitfield);

        let result = task::spawn_blocking(move || -> Result<bool, Error> {
            let mut storage = storage.lock().unwrap();
            storage.write_piece(index, &data)?;
            let mut bitfield = bitfield.lock().unwrap();
            bitfield.set(index, true);
            storage.finalize_if_complete(&bitfield)
        })
        .await
        .expect("disk write task panicked");

        match result {
            Ok(complete) => {
                self.alert_tx
                    .send(Alert::PieceWritten { index })
                    .await
                    .map_err(|_| disk_gone())?;
                if complete {
                    self.alert_tx
                        .send(Alert::TorrentComplete)
                        .await
                        .map_err(|_| disk_gone())?;
                }
            }
            Err(e) => {
                log::warn!("disk write error for piece {}: {}", index, e);
                self.alert_tx
                    .send(Alert::WriteError { index })
                    .await
                    .map_err(|_| disk_gone())?;
            }
        }
        Ok(())
    }
}
