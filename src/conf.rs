//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default client id this engine announces to trackers and other peers
/// with.
pub const CLIENT_ID: &PeerId = b"-BC0001-000000000000";

/// The port we listen on for inbound peer connections unless overridden.
pub const DEFAULT_LISTENING_PORT: u16 = 50881;

/// The capacity of every internal bounded channel (tracker peer list,
/// inbound peer messages, disk commands/alerts, per-peer outbound queues).
pub const INTERNAL_QUEUE_CAPACITY: usize = 100;

/// The maximum number of outstanding block requests we keep queued with a
/// single peer at any given time.
pub const MAX_OUTSTANDING_REQUESTS_PER_PEER: usize = 30;

/// The number of peers we keep unchoked (i.e. allow to download from us) at
/// any given time.
pub const NUM_UNCHOKED_PEERS: usize = 4;

/// If a peer session produces no outbound traffic for this long, a
/// keep-alive (zero-length frame) is sent to let the peer know we're still
/// here.
pub const KEEPALIVE_SECONDS: u64 = 115;

/// Outstanding requests older than this are considered stale and are purged
/// so the block becomes eligible for re-planning.
pub const STALE_REQUEST_CLEANUP: Duration = Duration::from_secs(10 * 60);

/// The default outbound rate cap, enforced per peer send task via a token
/// bucket. `None` disables the cap.
pub const DEFAULT_MAX_OUTGOING_BYTES_PER_SECOND: Option<u64> =
    Some(20 * 1024 * 1024);

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    /// It uses the default client id, [`CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *CLIENT_ID,
                listening_port: DEFAULT_LISTENING_PORT,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// The port the acceptor listens for inbound peer connections on.
    pub listening_port: u16,
}

/// Configuration for a torrent.
///
/// The engine applies a default instance of this to all torrents, but
/// individual torrents may override it.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which the torrent's file is placed upon download and
    /// from which it is seeded.
    pub download_dir: PathBuf,

    /// If the tracker doesn't provide a minimum announce interval, we
    /// default to announcing at this cadence.
    pub announce_interval: Duration,

    /// After this many consecutive tracker failures, we stop announcing to
    /// this tracker (but keep serving the swarm we already know about).
    pub tracker_error_threshold: usize,

    /// Maximum outstanding requests per peer. See
    /// [`MAX_OUTSTANDING_REQUESTS_PER_PEER`].
    pub max_outstanding_requests_per_peer: usize,

    /// Number of peers we keep unchoked. See [`NUM_UNCHOKED_PEERS`].
    pub num_unchoked_peers: usize,

    /// Keep-alive cadence. See [`KEEPALIVE_SECONDS`].
    pub keepalive_interval: Duration,

    /// Stale outstanding-request sweep cadence. See
    /// [`STALE_REQUEST_CLEANUP`].
    pub stale_request_cleanup: Duration,

    /// Outbound byte rate cap, per peer. `None` disables the cap.
    pub max_outgoing_bytes_per_sec: Option<u64>,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except
    /// for the download directory, as it is not sensible to guess that for
    /// the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // needs tuning against real trackers; 30s is a conservative
            // fallback before we've ever heard an interval back
            announce_interval: Duration::from_secs(30),
            tracker_error_threshold: 15,
            max_outstanding_requests_per_peer: MAX_OUTSTANDING_REQUESTS_PER_PEER,
            num_unchoked_peers: NUM_UNCHOKED_PEERS,
            keepalive_interval: Duration::from_secs(KEEPALIVE_SECONDS),
            stale_request_cleanup: STALE_REQUEST_CLEANUP,
            max_outgoing_bytes_per_sec: DEFAULT_MAX_OUTGOING_BYTES_PER_SECOND,
        }
    }
}
