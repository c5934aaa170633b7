//! Finding peers on the local network.
//!
//! A sharing server broadcasts an [`Announcement`] on the discovery port;
//! downloaders listen on that port and turn announcements into [`Peer`]s.

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use upgrade_core::error::{Result, UpgradeError};
use url::Url;

use crate::services::lifecycle::cancelled;

const PEER_QUEUE: usize = 32;
const MAX_DATAGRAM: usize = 1024;

/// A node that may be serving packages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
  pub id: String,
  pub base_url: Url,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
  pub node_id: String,
  pub port: u16,
}

pub trait PeerSource: Send + Sync {
  /// Starts producing peers. The source shuts down once the receiver is
  /// dropped. The same peer may be yielded more than once.
  fn subscribe(&self) -> Result<mpsc::Receiver<Peer>>;
}

/// Listens for UDP broadcast announcements.
pub struct UdpDiscovery {
  port: u16,
}

impl UdpDiscovery {
  pub fn new(port: u16) -> Self {
    Self { port }
  }
}

impl PeerSource for UdpDiscovery {
  fn subscribe(&self) -> Result<mpsc::Receiver<Peer>> {
    let socket = bind_listener(self.port)
      .map_err(|e| UpgradeError::Discovery(format!("udp port {}: {}", self.port, e)))?;
    let (tx, rx) = mpsc::channel(PEER_QUEUE);
    tokio::spawn(listen(socket, tx));
    Ok(rx)
  }
}

fn bind_listener(port: u16) -> std::io::Result<UdpSocket> {
  let addr = SocketAddr::from(([0, 0, 0, 0], port));
  let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
  socket.set_reuse_address(true)?;
  socket.set_broadcast(true)?;
  socket.set_nonblocking(true)?;
  socket.bind(&addr.into())?;
  UdpSocket::from_std(socket.into())
}

async fn listen(socket: UdpSocket, tx: mpsc::Sender<Peer>) {
  let mut buf = vec![0u8; MAX_DATAGRAM];
  loop {
    tokio::select! {
      _ = tx.closed() => break,
      recv = socket.recv_from(&mut buf) => {
        let (size, from) = match recv {
          Ok(r) => r,
          Err(e) => {
            warn!("Discovery socket error: {}", e);
            break;
          }
        };
        let Some(peer) = parse_announcement(&buf[..size], from) else {
          debug!("Ignoring datagram from {}", from);
          continue;
        };
        if tx.send(peer).await.is_err() {
          break;
        }
      }
    }
  }
}

fn parse_announcement(data: &[u8], from: SocketAddr) -> Option<Peer> {
  let announcement: Announcement = serde_json::from_slice(data).ok()?;
  let addr = SocketAddr::new(from.ip(), announcement.port);
  let base_url = Url::parse(&format!("http://{}/", addr)).ok()?;
  Some(Peer {
    id: announcement.node_id,
    base_url,
  })
}

/// Broadcasts `announcement` every `interval` until `shutdown` flips.
/// Failures are logged; the server keeps serving without announcements.
pub async fn announce(
  discovery_port: u16,
  announcement: Announcement,
  interval: Duration,
  mut shutdown: watch::Receiver<bool>,
) {
  let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
    Ok(s) => s,
    Err(e) => {
      warn!("Could not open announcement socket: {}", e);
      return;
    }
  };
  if let Err(e) = socket.set_broadcast(true) {
    warn!("Could not enable broadcast: {}", e);
    return;
  }
  let payload = match serde_json::to_vec(&announcement) {
    Ok(p) => p,
    Err(e) => {
      warn!("Could not encode announcement: {}", e);
      return;
    }
  };

  let target = SocketAddrV4::new(Ipv4Addr::BROADCAST, discovery_port);
  let mut ticker = tokio::time::interval(interval);
  loop {
    tokio::select! {
      _ = cancelled(&mut shutdown) => break,
      _ = ticker.tick() => {
        if let Err(e) = socket.send_to(&payload, target).await {
          debug!("Announcement failed: {}", e);
        }
      }
    }
  }
}

/// A fixed peer list, re-offered every `interval` so peers whose catalog
/// could not be read are retried.
pub struct StaticPeers {
  peers: Vec<Peer>,
  interval: Duration,
}

impl StaticPeers {
  pub fn new(urls: &[String], interval: Duration) -> Result<Self> {
    let peers = urls
      .iter()
      .map(|u| {
        let base_url = Url::parse(u)
          .map_err(|e| UpgradeError::Discovery(format!("invalid peer url {}: {}", u, e)))?;
        Ok(Peer {
          id: base_url.to_string(),
          base_url,
        })
      })
      .collect::<Result<Vec<_>>>()?;
    Ok(Self { peers, interval })
  }
}

impl PeerSource for StaticPeers {
  fn subscribe(&self) -> Result<mpsc::Receiver<Peer>> {
    let (tx, rx) = mpsc::channel(PEER_QUEUE);
    let peers = self.peers.clone();
    let interval = self.interval;
    tokio::spawn(async move {
      loop {
        for peer in &peers {
          if tx.send(peer.clone()).await.is_err() {
            return;
          }
        }
        tokio::select! {
          _ = tx.closed() => return,
          _ = tokio::time::sleep(interval) => {}
        }
      }
    });
    Ok(rx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_announcement_uses_sender_ip() {
    let data = serde_json::to_vec(&Announcement {
      node_id: "node-a".into(),
      port: 5010,
    })
    .unwrap();
    let peer = parse_announcement(&data, "192.168.1.7:40000".parse().unwrap()).unwrap();
    assert_eq!(peer.id, "node-a");
    assert_eq!(peer.base_url.as_str(), "http://192.168.1.7:5010/");

    assert!(parse_announcement(b"garbage", "192.168.1.7:1".parse().unwrap()).is_none());
  }

  #[test]
  fn test_static_peers_rejects_bad_urls() {
    let err = StaticPeers::new(&["not a url".into()], Duration::from_secs(1));
    assert!(matches!(err, Err(UpgradeError::Discovery(_))));
  }

  #[tokio::test]
  async fn test_static_peers_repeat() {
    let source = StaticPeers::new(
      &["http://127.0.0.1:5010/".into()],
      Duration::from_millis(10),
    )
    .unwrap();
    let mut rx = source.subscribe().unwrap();
    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.id, "http://127.0.0.1:5010/");
  }

  #[tokio::test]
  async fn test_announce_stops_on_shutdown() {
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(announce(
      0,
      Announcement {
        node_id: "node-c".into(),
        port: 5010,
      },
      Duration::from_millis(10),
      rx,
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
      .await
      .unwrap()
      .unwrap();
  }

  #[tokio::test]
  async fn test_udp_announcement_reaches_listener() {
    let listener = bind_listener(0).unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, mut rx) = mpsc::channel(4);
    tokio::spawn(listen(listener, tx));

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let payload = serde_json::to_vec(&Announcement {
      node_id: "node-b".into(),
      port: 6000,
    })
    .unwrap();
    sender.send_to(&payload, ("127.0.0.1", port)).await.unwrap();

    let peer = tokio::time::timeout(Duration::from_secs(5), rx.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(peer.id, "node-b");
    assert_eq!(peer.base_url.as_str(), "http://127.0.0.1:6000/");
  }
}
