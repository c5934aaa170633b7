//! Composes server and downloader into one observable upgrade state.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use upgrade_core::error::Result;
use upgrade_core::types::{PackageRecord, ServiceStatus, TransferProgress, UpgradeState, VersionInfo};
use crate::services::downloader::{DownloaderEvent, UpgradeDownloader};
use crate::services::server::{ServerEvent, UpgradeServer};
use crate::services::storage::PackageStore;
use crate::services::transfers::TransferEvent;

const NOTIFY_CAPACITY: usize = 256;

/// Inbound control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ControlCommand {
  GetState,
  StartServices,
  StopServices,
}

/// Outbound notifications. Every `state` carries a fresh snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum Notification {
  State(UpgradeState),
}

pub struct UpgradeManager {
  storage: PackageStore,
  server: UpgradeServer,
  downloader: UpgradeDownloader,
  shared: Arc<Shared>,
  relay: JoinHandle<()>,
}

struct Shared {
  cache: Mutex<Composite>,
  notifications: broadcast::Sender<Notification>,
}

#[derive(Default)]
struct Composite {
  server: ServiceStatus,
  downloader: ServiceStatus,
  uploads: BTreeMap<String, TransferProgress>,
  downloads: BTreeMap<String, TransferProgress>,
  checked_peers: Vec<String>,
  available_upgrade: Option<PackageRecord>,
}

impl UpgradeManager {
  pub fn new(storage: PackageStore, server: UpgradeServer, downloader: UpgradeDownloader) -> Self {
    let server_rx = server.subscribe();
    let downloader_rx = downloader.subscribe();

    let (notifications, _) = broadcast::channel(NOTIFY_CAPACITY);
    let shared = Arc::new(Shared {
      cache: Mutex::new(Composite::read(&server, &downloader)),
      notifications,
    });
    let relay = tokio::spawn(relay(
      shared.clone(),
      server.clone(),
      downloader.clone(),
      server_rx,
      downloader_rx,
    ));

    Self {
      storage,
      server,
      downloader,
      shared,
      relay,
    }
  }

  /// Receives every composite change from now on. Dropping the receiver
  /// unsubscribes.
  pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
    self.shared.notifications.subscribe()
  }

  /// The cached composite. Does not poll the components.
  pub fn get_state(&self) -> UpgradeState {
    self.shared.cache.lock().snapshot()
  }

  pub fn start_services(&self) {
    self.server.share();
    self.downloader.start();
    self.refresh();
  }

  pub fn stop_services(&self) {
    self.server.drain();
    self.downloader.stop();
    self.refresh();
  }

  /// Runs a control command. Only `get-state` has a direct reply.
  pub fn handle(&self, command: ControlCommand) -> Option<Notification> {
    debug!("Control command {:?}", command);
    match command {
      ControlCommand::GetState => Some(Notification::State(self.get_state())),
      ControlCommand::StartServices => {
        self.start_services();
        None
      }
      ControlCommand::StopServices => {
        self.stop_services();
        None
      }
    }
  }

  /// Registers a locally produced build.
  pub async fn register_built_package(
    &self,
    filepath: PathBuf,
    version: VersionInfo,
  ) -> Result<PackageRecord> {
    let record = self.storage.register_package(filepath, version).await?;
    self.downloader.refresh_available();
    Ok(record)
  }

  /// Forgets a package. Unknown hashes are not an error.
  pub async fn remove_package(&self, hash: String) -> Result<()> {
    self.storage.remove_package(hash).await?;
    self.downloader.refresh_available();
    Ok(())
  }

  pub fn packages(&self) -> Vec<PackageRecord> {
    self.storage.list_packages()
  }

  /// Resolves with the first composite state that satisfies `done`.
  pub async fn wait_until(&self, done: impl Fn(&UpgradeState) -> bool) -> UpgradeState {
    let mut rx = self.subscribe();
    loop {
      let state = self.get_state();
      if done(&state) {
        return state;
      }
      if let Err(RecvError::Closed) = rx.recv().await {
        return self.get_state();
      }
    }
  }

  // Commands transition synchronously; pull the new statuses in so the
  // cache never lags behind a command that already returned.
  fn refresh(&self) {
    let server = self.server.status();
    let downloader = self.downloader.status();
    self.shared.update(|c| {
      let a = c.set_server(server);
      let b = c.set_downloader(downloader);
      a || b
    });
  }
}

impl Drop for UpgradeManager {
  fn drop(&mut self) {
    self.relay.abort();
  }
}

impl Shared {
  /// Applies `change` and notifies when it reports a difference. Notifying
  /// under the cache lock keeps notifications in cache order.
  fn update(&self, change: impl FnOnce(&mut Composite) -> bool) {
    let mut cache = self.cache.lock();
    if change(&mut cache) {
      let _ = self.notifications.send(Notification::State(cache.snapshot()));
    }
  }
}

impl Composite {
  fn read(server: &UpgradeServer, downloader: &UpgradeDownloader) -> Self {
    Self {
      server: server.status(),
      downloader: downloader.status(),
      uploads: server.upload_entries(),
      downloads: downloader.download_entries(),
      checked_peers: downloader.checked_peers(),
      available_upgrade: downloader.available_upgrade(),
    }
  }

  fn snapshot(&self) -> UpgradeState {
    UpgradeState {
      server: self.server.clone(),
      downloader: self.downloader.clone(),
      uploads: self.uploads.values().cloned().collect(),
      downloads: self.downloads.values().cloned().collect(),
      checked_peers: self.checked_peers.clone(),
      available_upgrade: self.available_upgrade.clone(),
    }
  }

  fn set_server(&mut self, status: ServiceStatus) -> bool {
    apply_status(&mut self.server, status)
  }

  fn set_downloader(&mut self, status: ServiceStatus) -> bool {
    apply_status(&mut self.downloader, status)
  }

  fn on_server(&mut self, event: ServerEvent) -> bool {
    match event {
      ServerEvent::State(status) => self.set_server(status),
      ServerEvent::Upload(ev) => apply_transfer(&mut self.uploads, ev),
    }
  }

  fn on_downloader(&mut self, event: DownloaderEvent) -> bool {
    match event {
      DownloaderEvent::State(status) => self.set_downloader(status),
      DownloaderEvent::Download(ev) => apply_transfer(&mut self.downloads, ev),
      DownloaderEvent::CheckedPeers(peers) => {
        let changed = self.checked_peers != peers;
        self.checked_peers = peers;
        changed
      }
      DownloaderEvent::AvailableUpgrade(record) => {
        let changed = self.available_upgrade != record;
        self.available_upgrade = record;
        changed
      }
    }
  }
}

// Statuses can arrive both through events and through `refresh`; older
// revisions are ignored.
fn apply_status(slot: &mut ServiceStatus, status: ServiceStatus) -> bool {
  if status.revision <= slot.revision {
    return false;
  }
  *slot = status;
  true
}

fn apply_transfer(table: &mut BTreeMap<String, TransferProgress>, event: TransferEvent) -> bool {
  match event {
    TransferEvent::Progress { key, progress } => {
      table.insert(key, progress);
      true
    }
    TransferEvent::Ended { key, .. } => table.remove(&key).is_some(),
  }
}

async fn relay(
  shared: Arc<Shared>,
  server: UpgradeServer,
  downloader: UpgradeDownloader,
  mut server_rx: broadcast::Receiver<ServerEvent>,
  mut downloader_rx: broadcast::Receiver<DownloaderEvent>,
) {
  loop {
    tokio::select! {
      ev = server_rx.recv() => match ev {
        Ok(ev) => shared.update(|c| c.on_server(ev)),
        Err(RecvError::Lagged(n)) => {
          warn!("Manager missed {} server events, resyncing", n);
          resync(&shared, &server, &downloader);
        }
        Err(RecvError::Closed) => break,
      },
      ev = downloader_rx.recv() => match ev {
        Ok(ev) => shared.update(|c| c.on_downloader(ev)),
        Err(RecvError::Lagged(n)) => {
          warn!("Manager missed {} downloader events, resyncing", n);
          resync(&shared, &server, &downloader);
        }
        Err(RecvError::Closed) => break,
      },
    }
  }
}

fn resync(shared: &Shared, server: &UpgradeServer, downloader: &UpgradeDownloader) {
  let fresh = Composite::read(server, downloader);
  shared.update(|c| {
    *c = fresh;
    true
  });
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::services::test_support::{node, version, within, write_apk};
  use std::net::SocketAddr;
  use upgrade_core::types::ServiceState;

  fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
  }

  fn both(state: &UpgradeState, want: &ServiceState) -> bool {
    state.server.state == *want && state.downloader.state == *want
  }

  #[tokio::test]
  async fn test_stop_is_visible_immediately() {
    let tmp = tempfile::tempdir().unwrap();
    let n = node(tmp.path(), loopback(), &[], 1).await;

    n.manager.start_services();
    let state = n.manager.get_state();
    assert_ne!(state.server.state, ServiceState::Stopped);
    assert_ne!(state.downloader.state, ServiceState::Stopped);
    within(n.manager.wait_until(|s| both(s, &ServiceState::Started))).await;

    n.manager.stop_services();
    let state = n.manager.get_state();
    for s in [&state.server.state, &state.downloader.state] {
      assert!(
        matches!(s, ServiceState::Stopping | ServiceState::Stopped),
        "stale state {:?}",
        s
      );
    }
    within(n.manager.wait_until(|s| both(s, &ServiceState::Stopped))).await;
  }

  #[tokio::test]
  async fn test_component_errors_are_relayed_verbatim() {
    let tmp = tempfile::tempdir().unwrap();
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let n = node(tmp.path(), taken.local_addr().unwrap(), &[], 1).await;
    let mut rx = n.manager.subscribe();

    n.manager.start_services();
    let state = within(n.manager.wait_until(|s| s.server.state.is_error())).await;
    assert_eq!(state.server, n.server.status());

    let notified = within(async {
      loop {
        let Ok(Notification::State(s)) = rx.recv().await else {
          continue;
        };
        if s.server.state.is_error() {
          break s;
        }
      }
    })
    .await;
    assert_eq!(notified.server.state, state.server.state);
    n.manager.stop_services();
  }

  #[tokio::test]
  async fn test_handle_and_notification_shape() {
    let tmp = tempfile::tempdir().unwrap();
    let n = node(tmp.path(), loopback(), &[], 1).await;

    let reply = n.manager.handle(ControlCommand::GetState).unwrap();
    let json = serde_json::to_value(&reply).unwrap();
    assert_eq!(json["event"], "state");
    assert_eq!(json["payload"]["server"]["value"], "stopped");
    assert_eq!(json["payload"]["checkedPeers"], serde_json::json!([]));

    let cmd: ControlCommand = serde_json::from_str(r#"{"command":"start-services"}"#).unwrap();
    assert!(n.manager.handle(cmd).is_none());
    within(n.manager.wait_until(|s| both(s, &ServiceState::Started))).await;
    assert!(n.manager.handle(ControlCommand::StopServices).is_none());
    within(n.manager.wait_until(|s| both(s, &ServiceState::Stopped))).await;
  }

  #[tokio::test]
  async fn test_registered_build_updates_available_upgrade() {
    let tmp = tempfile::tempdir().unwrap();
    let n = node(tmp.path(), loopback(), &[], 8).await;

    let older = write_apk(tmp.path(), "old.apk", &["arm64-v8a"], b"seven");
    n.manager.register_built_package(older, version(7)).await.unwrap();
    assert!(n.manager.get_state().available_upgrade.is_none());

    let newer = write_apk(tmp.path(), "new.apk", &["arm64-v8a"], b"nine");
    let record = n.manager.register_built_package(newer, version(9)).await.unwrap();
    let state = within(n.manager.wait_until(|s| s.available_upgrade.is_some())).await;
    assert_eq!(state.available_upgrade, Some(record));
    assert_eq!(n.manager.packages().len(), 2);
  }

  #[tokio::test]
  async fn test_end_to_end_upgrade_between_nodes() {
    let tmp = tempfile::tempdir().unwrap();
    let a = node(&tmp.path().join("a"), loopback(), &[], 10).await;
    let apk = write_apk(tmp.path(), "a.apk", &["arm64-v8a"], b"build ten");
    let built = a.manager.register_built_package(apk, version(10)).await.unwrap();
    a.manager.start_services();
    within(a.manager.wait_until(|s| s.server.state == ServiceState::Started)).await;
    let url = format!("http://{}/", a.server.local_addr().unwrap());

    let b = node(&tmp.path().join("b"), loopback(), &[url.clone()], 8).await;
    b.manager.start_services();
    let state = within(b.manager.wait_until(|s| s.available_upgrade.is_some())).await;

    let available = state.available_upgrade.unwrap();
    assert_eq!(available.info.version_code, 10);
    assert_eq!(available.info.hash, built.info.hash);
    assert_eq!(state.checked_peers, vec![url]);
    assert_eq!(state.downloader.state, ServiceState::Started);
    assert!(available.filepath.starts_with(tmp.path().join("b").canonicalize().unwrap()));

    b.manager.stop_services();
    a.manager.stop_services();
    within(a.manager.wait_until(|s| both(s, &ServiceState::Stopped))).await;
    within(b.manager.wait_until(|s| both(s, &ServiceState::Stopped))).await;
  }
}
