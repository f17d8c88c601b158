//! A single peer connection.
//!
//! Mirrors the architecture of the engine this crate grew out of, but with
//! one deliberate change: a session never touches shared mutable state
//! directly. Everything it learns from the wire is reported to the engine
//! as an [`Event`]; everything the engine wants done is sent down as a
//! [`Command`]. The engine remains the sole owner of the piece planner,
//! the request manager, and the local bitfield.

use std::net::SocketAddr;

use futures::{select, stream::Fuse, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{self, Duration},
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    error::Error,
    wire::{Handshake, HandshakeCodec, Message, PeerCodec, PROTOCOL_STRING},
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

pub(crate) type Sender = mpsc::Sender<Command>;
type Receiver = mpsc::Receiver<Command>;

pub(crate) type EventSender = mpsc::Sender<Event>;
pub(crate) type EventReceiver = mpsc::Receiver<Event>;

/// Commands the engine sends down to a running session.
pub(crate) enum Command {
    /// Request these blocks from the peer; appended to the outgoing
    /// request queue in order.
    RequestBlocks(Vec<BlockInfo>),
    /// Send this block's data to the peer, unless we're choking them.
    UploadBlock { block: BlockInfo, data: Vec<u8> },
    /// A previously queued upload is no longer wanted.
    CancelUpload(BlockInfo),
    /// Announce that we now have this piece.
    Have(PieceIndex),
    /// Change whether we're choking the peer.
    ChokeState(bool),
    /// Change whether we're interested in the peer.
    InterestState(bool),
    Shutdown,
}

/// Things a session reports back to the engine. Every variant but
/// `Connected` and `Closed` carries the session's address so the engine can
/// look up which peer this came from without the session holding a
/// reference back to engine state.
#[derive(Debug)]
pub(crate) enum Event {
    Connected {
        addr: SocketAddr,
        peer_id: PeerId,
    },
    BitfieldReceived {
        addr: SocketAddr,
        bitfield: Bitfield,
    },
    HaveReceived {
        addr: SocketAddr,
        index: PieceIndex,
    },
    Choked(SocketAddr),
    Unchoked(SocketAddr),
    Interested(SocketAddr),
    NotInterested(SocketAddr),
    BlockReceived {
        addr: SocketAddr,
        block: BlockInfo,
        data: Vec<u8>,
    },
    BlockRequested {
        addr: SocketAddr,
        block: BlockInfo,
    },
    BlockCancelled {
        addr: SocketAddr,
        block: BlockInfo,
    },
    Closed {
        addr: SocketAddr,
        error: Option<String>,
    },
}

/// A simple token bucket enforcing an outbound byte rate cap. `None` means
/// unlimited.
struct RateLimiter {
    cap: Option<u64>,
    tokens: u64,
    last_refill: tokio::time::Instant,
}

impl RateLimiter {
    fn new(cap: Option<u64>) -> Self {
        Self {
            cap,
            tokens: cap.unwrap_or(0),
            last_refill: tokio::time::Instant::now(),
        }
    }

    fn refill(&mut self) {
        if let Some(cap) = self.cap {
            let now = tokio::time::Instant::now();
            let elapsed = now.saturating_duration_since(self.last_refill);
            if elapsed >= Duration::from_secs(1) {
                self.tokens = cap;
                self.last_refill = now;
            }
        }
    }

    /// Blocks until `len` bytes' worth of budget is available.
    async fn acquire(&mut self, len: u64) {
        let cap = match self.cap {
            Some(cap) => cap,
            None => return,
        };
        loop {
            self.refill();
            if self.tokens >= len || len >= cap {
                self.tokens = self.tokens.saturating_sub(len);
                return;
            }
            time::delay_for(Duration::from_millis(50)).await;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Handshaking,
    AvailabilityExchange,
    Connected,
}

struct Status {
    state: State,
    /// We are choked by the peer: they won't serve our requests.
    choked_by_peer: bool,
    /// We are choking the peer: we won't serve their requests.
    choking_peer: bool,
    /// We are interested in the peer's pieces.
    interested_in_peer: bool,
    /// The peer is interested in our pieces.
    peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::Handshaking,
            choked_by_peer: true,
            choking_peer: true,
            interested_in_peer: false,
            peer_interested: false,
        }
    }
}

pub(crate) struct PeerSession {
    addr: SocketAddr,
    info_hash: Sha1Hash,
    client_id: PeerId,
    keepalive_interval: Duration,
    max_outgoing_bytes_per_sec: Option<u64>,
    cmd_rx: Fuse<Receiver>,
    events_tx: EventSender,
    status: Status,
    /// Uploads the engine asked for while we were choking the peer; drained
    /// once we unchoke them, or dropped if cancelled first.
    queued_uploads: Vec<(BlockInfo, Vec<u8>)>,
}

impl PeerSession {
    /// Creates a session for the connection to/from `addr`. Whether it
    /// dials out or was already accepted is decided by calling
    /// [`PeerSession::start_outbound`] or [`PeerSession::start_inbound`].
    pub(crate) fn new(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        client_id: PeerId,
        keepalive_interval: Duration,
        max_outgoing_bytes_per_sec: Option<u64>,
        events_tx: EventSender,
    ) -> (Self, Sender) {
        let (cmd_tx, cmd_rx) = mpsc::channel(crate::conf::INTERNAL_QUEUE_CAPACITY);
        (
            Self {
                addr,
                info_hash,
                client_id,
                keepalive_interval,
                max_outgoing_bytes_per_sec,
                cmd_rx: cmd_rx.fuse(),
                events_tx,
                status: Status::default(),
                queued_uploads: Vec::new(),
            },
            cmd_tx,
        )
    }

    /// Dials the peer and runs the session until the connection closes.
    pub(crate) async fn start_outbound(&mut self, local_bitfield: Bitfield) {
        let result = self.run_outbound(local_bitfield).await;
        self.report_closed(result).await;
    }

    /// Runs a session over an already-accepted inbound socket.
    pub(crate) async fn start_inbound(&mut self, socket: TcpStream, local_bitfield: Bitfield) {
        let result = self.run_inbound(socket, local_bitfield).await;
        self.report_closed(result).await;
    }

    async fn report_closed(&mut self, result: Result<(), Error>) {
        let error = result.err().map(|e| e.to_string());
        let _ = self
            .events_tx
            .send(Event::Closed {
                addr: self.addr,
                error,
            })
            .await;
    }

    async fn run_outbound(&mut self, local_bitfield: Bitfield) -> Result<(), Error> {
        log::info!("connecting to peer {}", self.addr);
        let socket = TcpStream::connect(self.addr).await?;
        let mut handshake_socket = Framed::new(socket, HandshakeCodec);

        let handshake = Handshake::new(self.info_hash, self.client_id);
        handshake_socket.send(handshake).await?;

        let peer_handshake = match handshake_socket.next().await {
            Some(h) => h?,
            None => return Ok(()),
        };
        self.validate_handshake(&peer_handshake)?;

        let socket = switch_to_peer_codec(handshake_socket);
        self.events_tx
            .send(Event::Connected {
                addr: self.addr,
                peer_id: peer_handshake.peer_id,
            })
            .await
            .map_err(|_| disconnected())?;

        self.run(socket, local_bitfield).await
    }

    async fn run_inbound(
        &mut self,
        socket: TcpStream,
        local_bitfield: Bitfield,
    ) -> Result<(), Error> {
        let mut handshake_socket = Framed::new(socket, HandshakeCodec);

        let peer_handshake = match handshake_socket.next().await {
            Some(h) => h?,
            None => return Ok(()),
        };
        self.validate_handshake(&peer_handshake)?;

        let handshake = Handshake::new(self.info_hash, self.client_id);
        handshake_socket.send(handshake).await?;

        let socket = switch_to_peer_codec(handshake_socket);
        self.events_tx
            .send(Event::Connected {
                addr: self.addr,
                peer_id: peer_handshake.peer_id,
            })
            .await
            .map_err(|_| disconnected())?;

        self.run(socket, local_bitfield).await
    }

    fn validate_handshake(&self, handshake: &Handshake) -> Result<(), Error> {
        if handshake.info_hash != self.info_hash {
            log::warn!("peer {} sent mismatched info hash", self.addr);
            return Err(Error::InvalidPeerInfoHash);
        }
        Ok(())
    }

    async fn run(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
        local_bitfield: Bitfield,
    ) -> Result<(), Error> {
        self.status.state = State::AvailabilityExchange;

        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();
        let mut rate_limiter = RateLimiter::new(self.max_outgoing_bytes_per_sec);
        let mut keepalive = time::interval(self.keepalive_interval).fuse();
        let mut sent_since_tick = false;

        sink.send(Message::Bitfield(local_bitfield)).await?;

        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    self.handle_incoming(msg).await?;
                }
                cmd = self.cmd_rx.select_next_some() => {
                    match cmd {
                        Command::Shutdown => {
                            log::info!("shutting down peer {} session", self.addr);
                            break;
                        }
                        cmd => {
                            sent_since_tick |= self
                                .handle_command(cmd, &mut sink, &mut rate_limiter)
                                .await?;
                        }
                    }
                }
                _ = keepalive.select_next_some() => {
                    if !sent_since_tick {
                        sink.send(Message::KeepAlive).await?;
                    }
                    sent_since_tick = false;
                }
            }
        }

        Ok(())
    }

    async fn handle_incoming(&mut self, msg: Message) -> Result<(), Error> {
        if self.status.state == State::AvailabilityExchange {
            self.status.state = State::Connected;
            if let Message::Bitfield(bitfield) = msg {
                self.events_tx
                    .send(Event::BitfieldReceived {
                        addr: self.addr,
                        bitfield,
                    })
                    .await
                    .map_err(|_| disconnected())?;
                return Ok(());
            }
            // peer chose not to send a bitfield (has nothing yet); fall
            // through and handle this first message normally
        }

        match msg {
            Message::Bitfield(_) => {
                log::warn!(
                    "peer {} sent bitfield outside availability exchange",
                    self.addr
                );
                return Err(Error::BitfieldNotAfterHandshake);
            }
            Message::KeepAlive => {}
            Message::Choke => {
                self.status.choked_by_peer = true;
                self.events_tx
                    .send(Event::Choked(self.addr))
                    .await
                    .map_err(|_| disconnected())?;
            }
            Message::Unchoke => {
                self.status.choked_by_peer = false;
                self.events_tx
                    .send(Event::Unchoked(self.addr))
                    .await
                    .map_err(|_| disconnected())?;
            }
            Message::Interested => {
                self.status.peer_interested = true;
                self.events_tx
                    .send(Event::Interested(self.addr))
                    .await
                    .map_err(|_| disconnected())?;
            }
            Message::NotInterested => {
                self.status.peer_interested = false;
                self.events_tx
                    .send(Event::NotInterested(self.addr))
                    .await
                    .map_err(|_| disconnected())?;
            }
            Message::Have(index) => {
                self.events_tx
                    .send(Event::HaveReceived {
                        addr: self.addr,
                        index,
                    })
                    .await
                    .map_err(|_| disconnected())?;
            }
            Message::Request(block) => {
                self.events_tx
                    .send(Event::BlockRequested {
                        addr: self.addr,
                        block,
                    })
                    .await
                    .map_err(|_| disconnected())?;
            }
            Message::Cancel(block) => {
                self.events_tx
                    .send(Event::BlockCancelled {
                        addr: self.addr,
                        block,
                    })
                    .await
                    .map_err(|_| disconnected())?;
            }
            Message::Piece { block, data } => {
                if data.len() != block.len as usize {
                    return Err(Error::InvalidBlockRange);
                }
                self.events_tx
                    .send(Event::BlockReceived {
                        addr: self.addr,
                        block,
                        data,
                    })
                    .await
                    .map_err(|_| disconnected())?;
            }
        }

        Ok(())
    }

    /// Handles a non-shutdown command. Returns whether this produced
    /// outbound traffic, so the keep-alive timer can skip a beat.
    async fn handle_command(
        &mut self,
        cmd: Command,
        sink: &mut futures::stream::SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        rate_limiter: &mut RateLimiter,
    ) -> Result<bool, Error> {
        match cmd {
            Command::RequestBlocks(blocks) => {
                for block in blocks {
                    sink.send(Message::Request(block)).await?;
                }
                Ok(true)
            }
            Command::UploadBlock { block, data } => {
                if self.status.choking_peer {
                    self.queued_uploads.push((block, data));
                    return Ok(false);
                }
                rate_limiter.acquire(data.len() as u64).await;
                sink.send(Message::Piece { block, data }).await?;
                Ok(true)
            }
            Command::CancelUpload(block) => {
                self.queued_uploads.retain(|(b, _)| *b != block);
                Ok(false)
            }
            Command::Have(index) => {
                sink.send(Message::Have(index)).await?;
                Ok(true)
            }
            Command::ChokeState(choking) => {
                self.status.choking_peer = choking;
                sink.send(if choking {
                    Message::Choke
                } else {
                    Message::Unchoke
                })
                .await?;
                if !choking && !self.queued_uploads.is_empty() {
                    let queued = std::mem::take(&mut self.queued_uploads);
                    for (block, data) in queued {
                        rate_limiter.acquire(data.len() as u64).await;
                        sink.send(Message::Piece { block, data }).await?;
                    }
                }
                Ok(true)
            }
            Command::InterestState(interested) => {
                self.status.interested_in_peer = interested;
                sink.send(if interested {
                    Message::Interested
                } else {
                    Message::NotInterested
                })
                .await?;
                Ok(true)
            }
            Command::Shutdown => unreachable!("handled by caller"),
        }
    }
}

fn disconnected() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "engine event channel closed",
    ))
}

/// Switches a framed socket from the one-shot handshake codec to the
/// streaming peer message codec, carrying over any bytes the peer may have
/// already sent past the handshake.
fn switch_to_peer_codec(
    socket: Framed<TcpStream, HandshakeCodec>,
) -> Framed<TcpStream, PeerCodec> {
    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    Framed::from_parts(new_parts)
}
