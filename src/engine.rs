//! The torrent engine: the sole owner of all mutable download state.
//!
//! Peer sessions only ever see a snapshot of what they need (the local
//! bitfield at connect time) and otherwise communicate purely through
//! [`crate::peer_session::Event`] and [`crate::peer_session::Command`]. This
//! module is where every piece of shared state actually lives: the local
//! bitfield, the peer table, the request manager, and the planner that
//! decides what to request next.

use std::{collections::{HashMap, HashSet}, net::SocketAddr, sync::Arc, time::Duration};

use futures::{select, StreamExt};
use rand::seq::SliceRandom;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time,
};

use crate::{
    blocks_in_piece, block_count,
    conf::{Conf, TorrentConf},
    disk::{Alert, Disk, DiskHandle},
    error::Error,
    metainfo::Metainfo,
    peer_session::{self, Event, PeerSession},
    request_manager::RequestManager,
    storage::{PieceInfo, Storage},
    tracker::{self, Tracker},
    Bitfield, BlockInfo, PeerId, PieceIndex, TorrentInfo,
};

/// A piece being assembled in memory from its incoming blocks. Nothing here
/// ever touches disk until every block has arrived and the whole buffer
/// matches the piece's expected hash.
struct PartialPiece {
    data: Vec<u8>,
    received_offsets: HashSet<u32>,
    total_blocks: usize,
}

impl PartialPiece {
    fn new(piece_len: u32) -> Self {
        Self {
            data: vec![0u8; piece_len as usize],
            received_offsets: HashSet::new(),
            total_blocks: block_count(piece_len),
        }
    }

    /// Copies a block's bytes into place. Returns `false` if this offset was
    /// already received (a duplicate/re-delivered block), in which case the
    /// data is discarded rather than re-copied.
    fn insert(&mut self, offset: u32, data: &[u8]) -> bool {
        if !self.received_offsets.insert(offset) {
            return false;
        }
        let start = offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        true
    }

    fn is_complete(&self) -> bool {
        self.received_offsets.len() == self.total_blocks
    }
}

/// Bookkeeping the engine keeps per connected peer.
struct PeerHandle {
    cmd_tx: peer_session::Sender,
    peer_id: Option<PeerId>,
    bitfield: Bitfield,
    /// We are choking this peer (not serving their requests).
    choking_peer: bool,
    /// This peer is choking us (won't serve our requests).
    choked_by_peer: bool,
    /// This peer has told us they're interested in our pieces.
    peer_interested: bool,
    /// We've told this peer we're interested in theirs.
    interested_in_peer: bool,
    /// Bytes of piece data downloaded from this peer; used by the unchoke
    /// pass as a simple tit-for-tat signal.
    downloaded_bytes: u64,
}

impl PeerHandle {
    fn new(cmd_tx: peer_session::Sender, num_pieces: usize) -> Self {
        let mut bitfield = Bitfield::new();
        bitfield.resize(num_pieces, false);
        Self {
            cmd_tx,
            peer_id: None,
            bitfield,
            choking_peer: true,
            choked_by_peer: true,
            peer_interested: false,
            interested_in_peer: false,
            downloaded_bytes: 0,
        }
    }
}

/// Runs a single torrent end to end: tracker announces, inbound/outbound
/// peer connections, piece assembly, and seeding.
pub struct Engine {
    conf: TorrentConf,
    client_id: PeerId,
    listening_port: u16,
    torrent: Arc<TorrentInfo>,

    disk: DiskHandle,
    disk_alerts: mpsc::Receiver<Alert>,

    peers: HashMap<SocketAddr, PeerHandle>,
    request_manager: RequestManager,
    /// Pieces currently being assembled from incoming blocks, keyed once
    /// their first block arrives. Nothing here is written to disk until a
    /// buffer is complete and its hash has been checked.
    partial_pieces: HashMap<PieceIndex, PartialPiece>,
    /// Pieces that verified in memory and were handed to the disk task, but
    /// for which `Alert::PieceWritten` hasn't come back yet. Excluded from
    /// `plan_requests` candidates so a still-in-flight write isn't
    /// re-requested from peers.
    pending_writes: HashSet<PieceIndex>,
    local_bitfield: Bitfield,

    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    new_peers_tx: mpsc::Sender<(SocketAddr, TcpStream)>,
    new_peers_rx: mpsc::Receiver<(SocketAddr, TcpStream)>,
}

impl Engine {
    /// Builds an engine for a single torrent, opening (or resuming) its
    /// destination file and rehashing any pieces already on disk.
    pub async fn new(conf: Conf, metainfo: &Metainfo) -> Result<Self, Error> {
        let torrent = TorrentInfo::from_metainfo(
            metainfo,
            conf.engine.client_id,
            conf.engine.listening_port,
        )?;

        let piece_info = PieceInfo::from_torrent(&torrent);
        let (disk, disk_handle, disk_alerts, local_bitfield) = Disk::new(
            conf.torrent.download_dir.clone(),
            &metainfo.info.name,
            piece_info,
            torrent.piece_hashes.clone(),
        )?;
        tokio::spawn(run_disk(disk));

        let (events_tx, events_rx) = mpsc::channel(crate::conf::INTERNAL_QUEUE_CAPACITY);
        let (new_peers_tx, new_peers_rx) =
            mpsc::channel(crate::conf::INTERNAL_QUEUE_CAPACITY);

        Ok(Self {
            conf: conf.torrent,
            client_id: conf.engine.client_id,
            listening_port: conf.engine.listening_port,
            torrent: Arc::new(torrent),
            disk: disk_handle,
            disk_alerts,
            peers: HashMap::new(),
            request_manager: RequestManager::new(),
            partial_pieces: HashMap::new(),
            pending_writes: HashSet::new(),
            local_bitfield,
            events_tx,
            events_rx,
            new_peers_tx,
            new_peers_rx,
        })
    }

    /// Runs the engine until the torrent completes or an unrecoverable
    /// error occurs. Spawns the acceptor and tracker loop as background
    /// tasks and then drives the main event loop itself.
    pub async fn run(mut self) -> Result<(), Error> {
        log::info!("starting engine for {:?}", self.torrent.announce);

        tokio::spawn(run_acceptor(self.listening_port, self.new_peers_tx.clone()));

        let (announce_tx, mut announce_rx) = mpsc::channel(1);
        tokio::spawn(run_tracker_loop(
            self.torrent.clone(),
            self.conf.clone(),
            announce_tx,
        ));

        let mut unchoke_timer = time::interval(Duration::from_secs(10)).fuse();
        let mut stale_sweep_timer = time::interval(self.conf.stale_request_cleanup).fuse();

        loop {
            select! {
                peers = announce_rx.next() => {
                    match peers {
                        Some(peers) => self.dial_new_peers(peers),
                        None => log::warn!("tracker loop ended"),
                    }
                }
                accepted = self.new_peers_rx.next() => {
                    if let Some((addr, socket)) = accepted {
                        self.spawn_inbound(addr, socket);
                    }
                }
                event = self.events_rx.next() => {
                    match event {
                        Some(event) => self.handle_event(event).await?,
                        None => unreachable!("engine holds a sender clone"),
                    }
                }
                alert = self.disk_alerts.next() => {
                    match alert {
                        Some(alert) => self.handle_disk_alert(alert).await?,
                        None => log::warn!("disk task ended"),
                    }
                }
                _ = unchoke_timer.select_next_some() => {
                    self.run_unchoke_pass().await;
                }
                _ = stale_sweep_timer.select_next_some() => {
                    self.sweep_stale_requests();
                }
            }

            if self.local_bitfield.count_ones() == self.local_bitfield.len() {
                log::info!("torrent complete, entering seed mode");
            }
        }
    }

    fn dial_new_peers(&mut self, peers: Vec<SocketAddr>) {
        for addr in peers {
            if self.peers.contains_key(&addr) {
                continue;
            }
            let (mut session, cmd_tx) = PeerSession::new(
                addr,
                self.torrent.info_hash,
                self.client_id,
                self.conf.keepalive_interval,
                self.conf.max_outgoing_bytes_per_sec,
                self.events_tx.clone(),
            );
            let local_bitfield = self.local_bitfield.clone();
            self.peers
                .insert(addr, PeerHandle::new(cmd_tx, self.torrent.num_pieces()));
            tokio::spawn(async move {
                session.start_outbound(local_bitfield).await;
            });
        }
    }

    fn spawn_inbound(&mut self, addr: SocketAddr, socket: TcpStream) {
        if self.peers.contains_key(&addr) {
            return;
        }
        let (mut session, cmd_tx) = PeerSession::new(
            addr,
            self.torrent.info_hash,
            self.client_id,
            self.conf.keepalive_interval,
            self.conf.max_outgoing_bytes_per_sec,
            self.events_tx.clone(),
        );
        let local_bitfield = self.local_bitfield.clone();
        self.peers
            .insert(addr, PeerHandle::new(cmd_tx, self.torrent.num_pieces()));
        tokio::spawn(async move {
            session.start_inbound(socket, local_bitfield).await;
        });
    }

    async fn handle_event(&mut self, event: Event) -> Result<(), Error> {
        match event {
            Event::Connected { addr, peer_id } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_id = Some(peer_id);
                }
            }
            Event::BitfieldReceived { addr, mut bitfield } => {
                // the wire bitfield may be byte-padded past the real piece
                // count; truncate to the logical length
                bitfield.resize(self.torrent.num_pieces(), false);
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.bitfield = bitfield;
                }
                self.update_interest(addr).await;
                self.plan_requests(addr).await;
            }
            Event::HaveReceived { addr, index } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    if index < peer.bitfield.len() {
                        peer.bitfield.set(index, true);
                    }
                }
                self.update_interest(addr).await;
                self.plan_requests(addr).await;
            }
            Event::Choked(addr) => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.choked_by_peer = true;
                }
                self.request_manager.delete_all_for_peer(addr);
            }
            Event::Unchoked(addr) => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.choked_by_peer = false;
                }
                self.plan_requests(addr).await;
            }
            Event::Interested(addr) => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_interested = true;
                }
            }
            Event::NotInterested(addr) => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_interested = false;
                }
            }
            Event::BlockRequested { addr, block } => {
                self.handle_block_requested(addr, block);
            }
            Event::BlockCancelled { addr, block } => {
                if let Some(peer) = self.peers.get(&addr) {
                    let _ = peer
                        .cmd_tx
                        .clone()
                        .try_send(peer_session::Command::CancelUpload(block));
                }
            }
            Event::BlockReceived { addr, block, data } => {
                self.handle_block_received(addr, block, data).await?;
            }
            Event::Closed { addr, error } => {
                if let Some(error) = error {
                    log::warn!("peer {} session closed with error: {}", addr, error);
                } else {
                    log::info!("peer {} session closed", addr);
                }
                self.peers.remove(&addr);
                self.request_manager.delete_all_for_peer(addr);
            }
        }
        Ok(())
    }

    /// Recomputes whether we're interested in `addr` (they have a piece we
    /// lack) and tells them if it changed.
    async fn update_interest(&mut self, addr: SocketAddr) {
        let interested = match self.peers.get(&addr) {
            Some(peer) => (0..self.torrent.num_pieces())
                .any(|i| peer.bitfield[i] && !self.local_bitfield[i]),
            None => return,
        };
        let peer = self.peers.get_mut(&addr).unwrap();
        if peer.interested_in_peer != interested {
            peer.interested_in_peer = interested;
            let _ = peer
                .cmd_tx
                .clone()
                .send(peer_session::Command::InterestState(interested))
                .await;
        }
    }

    /// Fills a peer's outgoing request queue up to the per-peer cap,
    /// preferring to continue a piece already partially requested from
    /// them over starting a new one.
    async fn plan_requests(&mut self, addr: SocketAddr) {
        let peer = match self.peers.get(&addr) {
            Some(p) => p,
            None => return,
        };
        if peer.choked_by_peer {
            return;
        }
        let outstanding = self.request_manager.len_for_peer(addr);
        let want = self
            .conf
            .max_outstanding_requests_per_peer
            .saturating_sub(outstanding);
        if want == 0 {
            return;
        }

        let mut candidates: Vec<PieceIndex> = (0..self.torrent.num_pieces())
            .filter(|&i| {
                !self.local_bitfield[i]
                    && peer.bitfield[i]
                    && !self.pending_writes.contains(&i)
            })
            .collect();
        candidates.shuffle(&mut rand::thread_rng());

        let mut blocks = Vec::new();
        'outer: for piece_index in candidates {
            let piece_len = match self.torrent.piece_len(piece_index) {
                Ok(len) => len,
                Err(_) => continue,
            };
            for block in blocks_in_piece(piece_index, piece_len) {
                if blocks.len() >= want {
                    break 'outer;
                }
                if self.request_manager.is_requested(block) {
                    continue;
                }
                blocks.push(block);
            }
        }

        if blocks.is_empty() {
            return;
        }

        for &block in &blocks {
            self.request_manager.add(addr, block);
        }
        if let Some(peer) = self.peers.get(&addr) {
            let _ = peer
                .cmd_tx
                .clone()
                .send(peer_session::Command::RequestBlocks(blocks))
                .await;
        }
    }

    fn handle_block_requested(&mut self, addr: SocketAddr, block: BlockInfo) {
        let can_serve = self.peers.get(&addr).map_or(false, |p| !p.choking_peer)
            && block.piece_index < self.local_bitfield.len()
            && self.local_bitfield[block.piece_index];
        if !can_serve {
            return;
        }
        let cmd_tx = match self.peers.get(&addr) {
            Some(p) => p.cmd_tx.clone(),
            None => return,
        };
        let disk = self.disk.clone();
        tokio::spawn(async move {
            match disk.read_block(block).await {
                Ok(data) => {
                    let _ = cmd_tx
                        .clone()
                        .send(peer_session::Command::UploadBlock { block, data })
                        .await;
                }
                Err(e) => {
                    log::warn!("failed to read block {:?} for upload: {}", block, e);
                }
            }
        });
    }

    async fn handle_block_received(
        &mut self,
        addr: SocketAddr,
        block: BlockInfo,
        data: Vec<u8>,
    ) -> Result<(), Error> {
        if !self.request_manager.remove(addr, block) {
            log::warn!("peer {} sent unrequested block {:?}", addr, block);
            return Ok(());
        }

        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.downloaded_bytes += block.len as u64;
        }

        if self.local_bitfield[block.piece_index] {
            // already have this piece; a late duplicate delivery
            return Ok(());
        }

        let piece_len = self.torrent.piece_len(block.piece_index)?;
        if block.offset as u64 + block.len as u64 > piece_len as u64 {
            log::warn!("peer {} sent out-of-range block {:?}", addr, block);
            return Ok(());
        }

        let partial = self
            .partial_pieces
            .entry(block.piece_index)
            .or_insert_with(|| PartialPiece::new(piece_len));
        if !partial.insert(block.offset, &data) {
            // duplicate block within the same piece; nothing new to assemble
            self.plan_requests(addr).await;
            return Ok(());
        }

        if partial.is_complete() {
            let assembled = self.partial_pieces.remove(&block.piece_index).unwrap().data;
            let expected = self.torrent.expected_hash(block.piece_index)?;
            if Storage::hash(&assembled) == expected {
                self.pending_writes.insert(block.piece_index);
                self.disk.write_piece(block.piece_index, assembled).await?;
            } else {
                log::warn!(
                    "piece {} failed hash check after assembly, re-requesting",
                    block.piece_index
                );
                self.request_manager.delete_all_for_piece(block.piece_index);
            }
        }

        self.plan_requests(addr).await;
        Ok(())
    }

    async fn handle_disk_alert(&mut self, alert: Alert) -> Result<(), Error> {
        match alert {
            Alert::PieceWritten { index } => {
                log::info!("piece {} written and verified", index);
                self.pending_writes.remove(&index);
                self.request_manager.delete_all_for_piece(index);
                self.local_bitfield.set(index, true);
                self.broadcast_have(index).await;
            }
            Alert::WriteError { index } => {
                log::warn!("disk write failed for piece {}, will re-request", index);
                self.pending_writes.remove(&index);
                self.replan_piece(index).await;
            }
            Alert::TorrentComplete => {
                log::info!("torrent download complete");
                self.announce_completed();
            }
        }
        Ok(())
    }

    /// Re-triggers request planning against every peer known to have
    /// `index`, so a piece that failed to write is picked up again without
    /// waiting on an unrelated peer event.
    async fn replan_piece(&mut self, index: PieceIndex) {
        let addrs: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, p)| index < p.bitfield.len() && p.bitfield[index])
            .map(|(addr, _)| *addr)
            .collect();
        for addr in addrs {
            self.plan_requests(addr).await;
        }
    }

    /// Fires a best-effort, fire-and-forget `event=completed` announce; the
    /// periodic tracker loop keeps running independently of this.
    fn announce_completed(&self) {
        let torrent = self.torrent.clone();
        tokio::spawn(async move {
            let tracker = Tracker::new(torrent.announce.clone());
            let result = tracker
                .announce(
                    torrent.info_hash,
                    torrent.client_id,
                    torrent.listening_port,
                    0,
                    0,
                    0,
                    Some(tracker::Event::Completed),
                )
                .await;
            if let Err(e) = result {
                log::warn!("completed announce failed: {}", e);
            }
        });
    }

    async fn broadcast_have(&mut self, index: PieceIndex) {
        for peer in self.peers.values() {
            let _ = peer
                .cmd_tx
                .clone()
                .send(peer_session::Command::Have(index))
                .await;
        }
    }

    /// Picks the `num_unchoked_peers` interested peers that have sent us
    /// the most data recently and unchokes them, choking everyone else.
    async fn run_unchoke_pass(&mut self) {
        let mut interested: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, p)| p.peer_interested)
            .map(|(addr, _)| *addr)
            .collect();
        interested.sort_by_key(|addr| std::cmp::Reverse(self.peers[addr].downloaded_bytes));

        let to_unchoke: std::collections::HashSet<SocketAddr> = interested
            .into_iter()
            .take(self.conf.num_unchoked_peers)
            .collect();

        for (addr, peer) in self.peers.iter_mut() {
            let should_choke = !to_unchoke.contains(addr);
            if peer.choking_peer != should_choke {
                peer.choking_peer = should_choke;
                let _ = peer
                    .cmd_tx
                    .clone()
                    .send(peer_session::Command::ChokeState(should_choke))
                    .await;
            }
        }
    }

    fn sweep_stale_requests(&mut self) {
        let stale = self.request_manager.sweep_stale(self.conf.stale_request_cleanup);
        if !stale.is_empty() {
            log::debug!("swept {} stale requests", stale.len());
        }
    }
}

async fn run_disk(mut disk: Disk) {
    if let Err(e) = disk.start().await {
        log::error!("disk task exited with error: {}", e);
    }
}

async fn run_acceptor(port: u16, new_peers_tx: mpsc::Sender<(SocketAddr, TcpStream)>) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to bind listening port {}: {}", port, e);
            return;
        }
    };
    log::info!("listening for inbound peers on port {}", port);
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                if new_peers_tx.clone().send((addr, socket)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                log::warn!("failed to accept inbound connection: {}", e);
            }
        }
    }
}

async fn run_tracker_loop(
    torrent: Arc<TorrentInfo>,
    conf: TorrentConf,
    peers_tx: mpsc::Sender<Vec<SocketAddr>>,
) {
    let tracker = Tracker::new(torrent.announce.clone());
    let mut interval = conf.announce_interval;
    let mut event = Some(tracker::Event::Started);
    let mut error_count = 0;

    loop {
        let left = torrent.total_len;
        match tracker
            .announce(
                torrent.info_hash,
                torrent.client_id,
                torrent.listening_port,
                0,
                0,
                left,
                event.take(),
            )
            .await
        {
            Ok(response) => {
                error_count = 0;
                interval = response.interval.max(Duration::from_secs(5));
                if peers_tx.clone().send(response.peers).await.is_err() {
                    // the engine side of the channel is gone, i.e. the
                    // engine is shutting down; let the tracker know
                    send_stopped_best_effort(&tracker, &torrent).await;
                    break;
                }
            }
            Err(e) => {
                error_count += 1;
                log::warn!("tracker announce failed: {}", e);
                if error_count >= conf.tracker_error_threshold {
                    log::error!(
                        "tracker {} failed {} times in a row, giving up on it",
                        torrent.announce,
                        error_count
                    );
                    break;
                }
            }
        }
        time::delay_for(interval).await;
    }
}

/// Sends a final `event=stopped` announce when the engine shuts down.
/// Best-effort: the peer is going away regardless of whether the tracker
/// hears about it.
async fn send_stopped_best_effort(tracker: &Tracker, torrent: &TorrentInfo) {
    let result = tracker
        .announce(
            torrent.info_hash,
            torrent.client_id,
            torrent.listening_port,
            0,
            0,
            torrent.total_len,
            Some(tracker::Event::Stopped),
        )
        .await;
    if let Err(e) = result {
        log::warn!("stopped announce failed: {}", e);
    }
}
