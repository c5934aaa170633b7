//! Finds newer builds on peers and pulls them into local storage.
//!
//! A run consumes peers from a [`PeerSource`], reads each peer's catalog
//! once, and downloads the best compatible candidate. Downloads are
//! streamed into a partial file while being hashed; only content whose
//! digest matches the advertised hash is registered.

use futures_util::StreamExt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use upgrade_core::compat::{is_upgrade, select_best, Candidate, DeviceInfo};
use upgrade_core::error::{Result, UpgradeError};
use upgrade_core::hash::{self, is_valid_hash};
use upgrade_core::types::{PackageInfo, PackageRecord, ServiceStatus, TransferProgress};
use crate::services::discovery::{Peer, PeerSource};
use crate::services::lifecycle::{cancelled, Lifecycle};
use crate::services::storage::PackageStore;
use crate::services::transfers::{TransferEvent, TransferGuard, TransferTable};

const EVENT_CAPACITY: usize = 256;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub enum DownloaderEvent {
  State(ServiceStatus),
  Download(TransferEvent),
  CheckedPeers(Vec<String>),
  AvailableUpgrade(Option<PackageRecord>),
}

#[derive(Debug, Clone)]
pub struct DownloaderOptions {
  /// Baseline for deciding what counts as an upgrade.
  pub device: DeviceInfo,
  /// Announcements carrying this id come from ourselves and are skipped.
  pub node_id: Option<String>,
}

#[derive(Clone)]
pub struct UpgradeDownloader {
  inner: Arc<Inner>,
}

struct Inner {
  options: DownloaderOptions,
  storage: PackageStore,
  source: Arc<dyn PeerSource>,
  client: reqwest::Client,
  events: broadcast::Sender<DownloaderEvent>,
  lifecycle: Lifecycle<DownloaderEvent>,
  downloads: Arc<TransferTable<DownloaderEvent>>,
  cancel: Mutex<Option<watch::Sender<bool>>>,
  checked: Mutex<Vec<String>>,
  available: Mutex<Option<PackageRecord>>,
}

/// Per-run bookkeeping, owned by the run loop.
#[derive(Default)]
struct Session {
  peers: HashMap<String, Peer>,
  evaluating: HashSet<String>,
  candidates: Vec<Candidate>,
  downloading: Option<String>,
  next_seq: u64,
}

enum Outcome {
  Catalog {
    peer: Peer,
    result: Result<Vec<PackageInfo>>,
  },
  Download {
    peer_id: String,
    hash: String,
    result: Result<PackageRecord>,
  },
}

impl UpgradeDownloader {
  pub fn new(
    storage: PackageStore,
    source: Arc<dyn PeerSource>,
    options: DownloaderOptions,
  ) -> Result<Self> {
    let client = reqwest::Client::builder()
      .connect_timeout(CONNECT_TIMEOUT)
      .build()
      .map_err(|e| UpgradeError::Transport(format!("http client: {}", e)))?;
    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    let downloader = Self {
      inner: Arc::new(Inner {
        options,
        storage,
        source,
        client,
        lifecycle: Lifecycle::new("upgrade downloader", events.clone(), DownloaderEvent::State),
        downloads: TransferTable::new(events.clone(), DownloaderEvent::Download),
        events,
        cancel: Mutex::new(None),
        checked: Mutex::new(Vec::new()),
        available: Mutex::new(None),
      }),
    };
    downloader.refresh_available();
    Ok(downloader)
  }

  pub fn subscribe(&self) -> broadcast::Receiver<DownloaderEvent> {
    self.inner.events.subscribe()
  }

  pub fn status(&self) -> ServiceStatus {
    self.inner.lifecycle.status()
  }

  pub fn downloads(&self) -> Vec<TransferProgress> {
    self.inner.downloads.snapshot()
  }

  pub fn download_entries(&self) -> BTreeMap<String, TransferProgress> {
    self.inner.downloads.entries()
  }

  pub fn checked_peers(&self) -> Vec<String> {
    self.inner.checked.lock().clone()
  }

  pub fn available_upgrade(&self) -> Option<PackageRecord> {
    self.inner.available.lock().clone()
  }

  /// Starts discovery. A no-op unless stopped or in error.
  pub fn start(&self) {
    let mut slot = self.inner.cancel.lock();
    if !self.inner.lifecycle.begin_start() {
      debug!("start ignored in state {}", self.inner.lifecycle.state());
      return;
    }
    self.inner.set_checked(|c| c.clear());

    let (tx, rx) = watch::channel(false);
    *slot = Some(tx);
    drop(slot);

    let inner = self.inner.clone();
    tokio::spawn(async move { inner.run(rx).await });
  }

  /// Stops discovery and aborts in-flight downloads. Partial files are
  /// deleted.
  pub fn stop(&self) {
    if !self.inner.lifecycle.begin_stop() {
      debug!("stop ignored in state {}", self.inner.lifecycle.state());
      return;
    }
    if let Some(tx) = self.inner.cancel.lock().take() {
      let _ = tx.send(true);
    }
  }

  /// Recomputes the best stored upgrade, e.g. after a local registration.
  pub fn refresh_available(&self) {
    self.inner.refresh_available();
  }
}

impl Inner {
  async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
    let mut peers = match self.source.subscribe() {
      Ok(rx) => rx,
      Err(e) => {
        self.cancel.lock().take();
        self.lifecycle.fail(e.to_string());
        return;
      }
    };
    if !self.lifecycle.finish_start(None) {
      drop(peers);
      self.lifecycle.finish_stop();
      return;
    }
    self.refresh_available();

    let mut session = Session::default();
    let mut tasks: JoinSet<Outcome> = JoinSet::new();
    let mut source_failed = false;

    loop {
      tokio::select! {
        _ = cancelled(&mut cancel) => break,
        peer = peers.recv() => match peer {
          Some(peer) => self.on_peer(peer, &mut session, &mut tasks, &cancel),
          None => {
            source_failed = true;
            break;
          }
        },
        Some(joined) = tasks.join_next() => match joined {
          Ok(outcome) => self.on_outcome(outcome, &mut session, &mut tasks, &cancel),
          Err(e) => warn!("Downloader task failed: {}", e),
        },
      }
    }

    drop(peers);
    let requested = *cancel.borrow();
    if !requested {
      if let Some(tx) = self.cancel.lock().take() {
        let _ = tx.send(true);
      }
    }
    while tasks.join_next().await.is_some() {}

    if source_failed && !requested {
      let err = UpgradeError::Discovery("peer source closed".into());
      self.lifecycle.fail(err.to_string());
    } else {
      self.lifecycle.finish_stop();
    }
  }

  fn on_peer(
    self: &Arc<Self>,
    peer: Peer,
    session: &mut Session,
    tasks: &mut JoinSet<Outcome>,
    cancel: &watch::Receiver<bool>,
  ) {
    if self.options.node_id.as_deref() == Some(peer.id.as_str()) {
      return;
    }
    if session.evaluating.contains(&peer.id) || self.checked.lock().contains(&peer.id) {
      return;
    }

    debug!("Evaluating peer {} at {}", peer.id, peer.base_url);
    session.peers.insert(peer.id.clone(), peer.clone());
    session.evaluating.insert(peer.id.clone());

    let client = self.client.clone();
    let mut cancel = cancel.clone();
    tasks.spawn(async move {
      let result = tokio::select! {
        r = fetch_catalog(&client, &peer.base_url) => r,
        _ = cancelled(&mut cancel) => Err(UpgradeError::Cancelled),
      };
      Outcome::Catalog { peer, result }
    });
  }

  fn on_outcome(
    self: &Arc<Self>,
    outcome: Outcome,
    session: &mut Session,
    tasks: &mut JoinSet<Outcome>,
    cancel: &watch::Receiver<bool>,
  ) {
    match outcome {
      Outcome::Catalog { peer, result } => {
        session.evaluating.remove(&peer.id);
        match result {
          Ok(catalog) => self.add_candidates(&peer, catalog, session),
          Err(UpgradeError::Cancelled) => return,
          // The other catalogs may still settle the choice.
          Err(e) => warn!("Could not read catalog of {}: {}", peer.id, e),
        }
      }
      Outcome::Download {
        peer_id,
        hash,
        result,
      } => {
        session.downloading = None;
        match result {
          Ok(record) => {
            info!(
              "Downloaded {} v{} from {}",
              record.info.application_id, record.info.version_name, peer_id
            );
            session.candidates.retain(|c| c.info.hash != hash);
            self.refresh_available();
          }
          Err(UpgradeError::Cancelled) => return,
          Err(e) => {
            warn!("Download of {} from {} failed: {}", hash, peer_id, e);
            session
              .candidates
              .retain(|c| !(c.peer_id == peer_id && c.info.hash == hash));
            // Read the catalog again on the next announcement.
            self.set_checked(|c| c.retain(|id| *id != peer_id));
          }
        }
      }
    }
    self.maybe_download(session, tasks, cancel);
  }

  fn add_candidates(&self, peer: &Peer, catalog: Vec<PackageInfo>, session: &mut Session) {
    self.set_checked(|c| {
      if !c.contains(&peer.id) {
        c.push(peer.id.clone());
      }
    });

    session.candidates.retain(|c| c.peer_id != peer.id);
    for info in catalog {
      if !is_valid_hash(&info.hash) || !is_upgrade(&self.options.device, &info) {
        continue;
      }
      if self.storage.get_package(&info.hash).is_some() {
        continue;
      }
      debug!("Candidate {} v{} on {}", info.hash, info.version_code, peer.id);
      session.candidates.push(Candidate {
        peer_id: peer.id.clone(),
        info,
        seq: session.next_seq,
      });
      session.next_seq += 1;
    }
  }

  /// Picks among candidates only once every catalog in flight has been
  /// read, so a slower peer with a newer build is not passed over.
  fn maybe_download(
    self: &Arc<Self>,
    session: &mut Session,
    tasks: &mut JoinSet<Outcome>,
    cancel: &watch::Receiver<bool>,
  ) {
    if session.downloading.is_some() || !session.evaluating.is_empty() {
      return;
    }
    let floor = self
      .available
      .lock()
      .as_ref()
      .map(|r| r.info.version_code)
      .unwrap_or(self.options.device.version_code);
    let storage = &self.storage;
    let best = select_best(session.candidates.iter().filter(|c| {
      c.info.version_code > floor && storage.get_package(&c.info.hash).is_none()
    }))
    .cloned();

    let Some(best) = best else {
      return;
    };
    let Some(peer) = session.peers.get(&best.peer_id).cloned() else {
      return;
    };

    info!(
      "Downloading {} v{} from {}",
      best.info.application_id, best.info.version_name, peer.id
    );
    session.downloading = Some(best.info.hash.clone());
    let inner = self.clone();
    let cancel = cancel.clone();
    tasks.spawn(async move {
      let hash = best.info.hash.clone();
      let result = inner.download(&peer, &best.info, cancel).await;
      Outcome::Download {
        peer_id: peer.id,
        hash,
        result,
      }
    });
  }

  async fn download(
    &self,
    peer: &Peer,
    info: &PackageInfo,
    mut cancel: watch::Receiver<bool>,
  ) -> Result<PackageRecord> {
    let url = peer
      .base_url
      .join(&format!("packages/{}/file", info.hash))
      .map_err(|e| UpgradeError::Transport(format!("{}: {}", peer.base_url, e)))?;
    let partial = self.storage.partial_path(&info.hash);

    let fetched = tokio::select! {
      r = self.fetch(url, &partial, info) => r,
      _ = cancelled(&mut cancel) => Err(UpgradeError::Cancelled),
    };
    if let Err(e) = fetched {
      discard(&partial).await;
      return Err(e);
    }

    let target = self.storage.package_path(&info.hash);
    if let Err(e) = tokio::fs::rename(&partial, &target).await {
      discard(&partial).await;
      return Err(e.into());
    }
    match self.storage.register_package(target.clone(), info.version()).await {
      Ok(record) => Ok(record),
      Err(e) => {
        discard(&target).await;
        Err(e)
      }
    }
  }

  async fn fetch(&self, url: Url, partial: &Path, info: &PackageInfo) -> Result<()> {
    let mut transfer = self.downloads.begin(&info.hash, info.size);
    let result = self.fetch_into(&mut transfer, url, partial, info).await;
    match &result {
      Ok(()) => transfer.complete(),
      Err(e) => transfer.fail(e.to_string()),
    }
    result
  }

  async fn fetch_into(
    &self,
    transfer: &mut TransferGuard<DownloaderEvent>,
    url: Url,
    partial: &Path,
    info: &PackageInfo,
  ) -> Result<()> {
    let resp = self
      .client
      .get(url)
      .send()
      .await
      .and_then(|r| r.error_for_status())
      .map_err(transport)?;
    if let Some(len) = resp.content_length() {
      if len != info.size {
        return Err(UpgradeError::Transport(format!(
          "{}: advertised {} bytes, peer sent {}",
          info.hash, info.size, len
        )));
      }
    }

    let mut file = tokio::fs::File::create(partial).await?;
    let mut hasher = Sha256::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
      let chunk = chunk.map_err(transport)?;
      transfer.advance(chunk.len() as u64)?;
      hasher.update(&chunk);
      file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    if transfer.sofar() != transfer.total() {
      return Err(UpgradeError::Transport(format!(
        "{}: connection closed after {} of {} bytes",
        info.hash,
        transfer.sofar(),
        transfer.total()
      )));
    }
    let actual = hash::finish(hasher);
    if actual != info.hash {
      return Err(UpgradeError::Integrity {
        expected: info.hash.clone(),
        actual,
      });
    }
    Ok(())
  }

  fn refresh_available(&self) {
    let best = self
      .storage
      .list_packages()
      .into_iter()
      .filter(|r| is_upgrade(&self.options.device, &r.info))
      // Equal versions keep the earliest registration.
      .fold(None, |best: Option<PackageRecord>, r| match best {
        Some(b) if b.info.version_code >= r.info.version_code => Some(b),
        _ => Some(r),
      });

    let mut available = self.available.lock();
    if *available == best {
      return;
    }
    match &best {
      Some(r) => info!("Upgrade available: {} v{}", r.info.application_id, r.info.version_name),
      None => info!("No upgrade available"),
    }
    *available = best.clone();
    let _ = self.events.send(DownloaderEvent::AvailableUpgrade(best));
  }

  fn set_checked(&self, update: impl FnOnce(&mut Vec<String>)) {
    let mut checked = self.checked.lock();
    let before = checked.clone();
    update(&mut checked);
    if *checked != before {
      let _ = self.events.send(DownloaderEvent::CheckedPeers(checked.clone()));
    }
  }
}

async fn fetch_catalog(client: &reqwest::Client, base: &Url) -> Result<Vec<PackageInfo>> {
  let url = base
    .join("packages")
    .map_err(|e| UpgradeError::Transport(format!("{}: {}", base, e)))?;
  client
    .get(url)
    .send()
    .await
    .and_then(|r| r.error_for_status())
    .map_err(transport)?
    .json()
    .await
    .map_err(transport)
}

async fn discard(path: &Path) {
  match tokio::fs::remove_file(path).await {
    Ok(()) => debug!("Discarded {}", path.display()),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
    Err(e) => warn!("Could not remove {}: {}", path.display(), e),
  }
}

fn transport(e: reqwest::Error) -> UpgradeError {
  UpgradeError::Transport(e.to_string())
}
