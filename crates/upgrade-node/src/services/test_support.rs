use std::future::Future;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use upgrade_core::compat::DeviceInfo;
use upgrade_core::types::{Arch, Platform, VersionInfo};

use crate::services::discovery::StaticPeers;
use crate::services::downloader::{DownloaderOptions, UpgradeDownloader};
use crate::services::manager::UpgradeManager;
use crate::services::server::{ServerOptions, UpgradeServer};
use crate::services::storage::PackageStore;

pub const APP_ID: &str = "com.example.field";

/// Writes a minimal Android package. `payload` makes the content unique.
pub fn write_apk(dir: &Path, name: &str, abis: &[&str], payload: &[u8]) -> PathBuf {
  let path = dir.join(name);
  let mut zip = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
  let opts = zip::write::SimpleFileOptions::default()
    .compression_method(zip::CompressionMethod::Stored);
  zip.start_file("AndroidManifest.xml", opts).unwrap();
  zip.write_all(b"<manifest/>").unwrap();
  zip.start_file("classes.dex", opts).unwrap();
  zip.write_all(payload).unwrap();
  for abi in abis {
    zip.start_file(format!("lib/{}/libnative.so", abi), opts).unwrap();
    zip.write_all(b"\x7fELF").unwrap();
  }
  zip.finish().unwrap();
  path
}

pub fn version(code: u64) -> VersionInfo {
  VersionInfo {
    version_name: format!("{}.0.0", code),
    version_code: code,
    application_id: APP_ID.into(),
    min_sdk_version: 21,
    platform: Platform::Android,
  }
}

pub fn device(code: u64) -> DeviceInfo {
  DeviceInfo {
    application_id: APP_ID.into(),
    version_name: format!("{}.0.0", code),
    version_code: code,
    platform: Platform::Android,
    arch: Arch::Arm64V8a,
    sdk_version: 28,
  }
}

/// Polls `check` until it holds, failing the test after ten seconds.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
  let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
  while !check() {
    if tokio::time::Instant::now() > deadline {
      panic!("timed out waiting for {}", what);
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}

pub async fn within<T>(fut: impl Future<Output = T>) -> T {
  tokio::time::timeout(Duration::from_secs(10), fut)
    .await
    .expect("timed out")
}

pub struct Node {
  pub manager: UpgradeManager,
  pub server: UpgradeServer,
}

/// A full node rooted at `dir` that polls the given static peers.
pub async fn node(dir: &Path, bind: SocketAddr, peers: &[String], running: u64) -> Node {
  let storage = PackageStore::open(dir.join("packages"), false).await.unwrap();
  let server = UpgradeServer::new(
    storage.clone(),
    ServerOptions {
      bind_addr: bind,
      announce: None,
    },
  );
  let source = StaticPeers::new(peers, Duration::from_millis(50)).unwrap();
  let downloader = UpgradeDownloader::new(
    storage.clone(),
    Arc::new(source),
    DownloaderOptions {
      device: device(running),
      node_id: None,
    },
  )
  .unwrap();
  Node {
    manager: UpgradeManager::new(storage, server.clone(), downloader),
    server,
  }
}
