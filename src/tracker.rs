//! The HTTP tracker client: announces our progress and pulls back a peer
//! list, compact-encoded per BEP 23.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde_bytes::ByteBuf;

use crate::{error::Error, PeerId, Sha1Hash};

/// The lifecycle event accompanying an announce, per the tracker protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Stopped,
    Completed,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Stopped => "stopped",
            Event::Completed => "completed",
        }
    }
}

/// The decoded reply to a tracker announce.
#[derive(Debug, Clone)]
pub struct Response {
    pub interval: Duration,
    pub peers: Vec<SocketAddr>,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<i64>,
    #[serde(with = "serde_bytes", default)]
    peers: Option<ByteBuf>,
}

/// A client for a single torrent's tracker.
pub struct Tracker {
    announce_url: String,
    client: reqwest::Client,
}

impl Tracker {
    pub fn new(announce_url: String) -> Self {
        Self {
            announce_url,
            client: reqwest::Client::new(),
        }
    }

    /// Sends a GET announce request and parses the compact peer list out of
    /// the bencoded reply.
    pub async fn announce(
        &self,
        info_hash: Sha1Hash,
        peer_id: PeerId,
        port: u16,
        uploaded: u64,
        downloaded: u64,
        left: u64,
        event: Option<Event>,
    ) -> Result<Response, Error> {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.announce_url,
            percent_encode(&info_hash, NON_ALPHANUMERIC),
            percent_encode(&peer_id, NON_ALPHANUMERIC),
            port,
            uploaded,
            downloaded,
            left,
        );
        if let Some(event) = event {
            url.push_str("&event=");
            url.push_str(event.as_str());
        }

        log::debug!("announcing to {}", self.announce_url);
        let bytes = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?;

        let raw: RawResponse = serde_bencode::from_bytes(&bytes)?;
        if let Some(reason) = raw.failure_reason {
            return Err(Error::Tracker(reason));
        }

        let interval = Duration::from_secs(raw.interval.unwrap_or(1800).max(0) as u64);
        let peers = match raw.peers {
            Some(buf) => parse_compact_peers(&buf)?,
            None => Vec::new(),
        };
        log::info!("tracker returned {} peers", peers.len());

        Ok(Response { interval, peers })
    }
}

/// Parses the compact peer list: 6 bytes per peer, 4 byte IPv4 address
/// followed by a 2 byte big endian port.
fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddr>, Error> {
    if bytes.len() % 6 != 0 {
        return Err(Error::InvalidTrackerResponse);
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact_peers() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[127, 0, 0, 1]);
        bytes.extend_from_slice(&6881u16.to_be_bytes());
        bytes.extend_from_slice(&[10, 0, 0, 5]);
        bytes.extend_from_slice(&51413u16.to_be_bytes());

        let peers = parse_compact_peers(&bytes).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].to_string(), "127.0.0.1:6881");
        assert_eq!(peers[1].to_string(), "10.0.0.5:51413");
    }

    #[test]
    fn test_parse_compact_peers_rejects_misaligned_length() {
        assert!(parse_compact_peers(&[1, 2, 3]).is_err());
    }

    #[tokio::test]
    async fn test_announce_against_mock_server() {
        let _ = env_logger::try_init();
        let _m = mockito::mock("GET", mockito::Matcher::Regex(r"^/announce.*".into()))
            .with_status(200)
            .with_body(
                [
                    b"d8:intervali1800e5:peers12:".as_ref(),
                    &[127, 0, 0, 1, 0x1a, 0xe1],
                    &[127, 0, 0, 2, 0x1a, 0xe2],
                    b"e".as_ref(),
                ]
                .concat(),
            )
            .create();

        let tracker = Tracker::new(format!("{}/announce", mockito::server_url()));
        let response = tracker
            .announce([1u8; 20], [2u8; 20], 6881, 0, 0, 100, Some(Event::Started))
            .await
            .unwrap();

        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0].to_string(), "127.0.0.1:6881");
    }

    #[tokio::test]
    async fn test_announce_propagates_failure_reason() {
        let _m = mockito::mock("GET", mockito::Matcher::Regex(r"^/announce.*".into()))
            .with_status(200)
            .with_body("d14:failure reason13:bad info hashe")
            .create();

        let tracker = Tracker::new(format!("{}/announce", mockito::server_url()));
        let err = tracker
            .announce([1u8; 20], [2u8; 20], 6881, 0, 0, 100, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tracker(msg) if msg == "bad info hash"));
    }
}
