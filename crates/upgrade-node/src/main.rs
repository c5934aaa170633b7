mod routes;
mod services;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use upgrade_core::config::Config;
use upgrade_core::types::{ServiceState, UpgradeState, VersionInfo};

use services::discovery::{PeerSource, StaticPeers, UdpDiscovery};
use services::downloader::{DownloaderOptions, UpgradeDownloader};
use services::manager::UpgradeManager;
use services::server::{AnnounceOptions, ServerOptions, UpgradeServer};
use services::storage::PackageStore;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .init();

  let config = Config::from_env();
  let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
  let node_id = uuid::Uuid::new_v4().to_string();
  let interval = Duration::from_secs(config.announce_interval_secs.max(1));

  let storage = PackageStore::open(config.packages_dir(), config.verify_on_start)
    .await
    .expect("Failed to open package storage");

  // The running build is what peers will download from us
  if let Some(path) = &config.current_package {
    let device = &config.device;
    let version = VersionInfo {
      version_name: device.version_name.clone(),
      version_code: device.version_code,
      application_id: device.application_id.clone(),
      min_sdk_version: 0,
      platform: device.platform,
    };
    match storage.register_package(PathBuf::from(path), version).await {
      Ok(record) => tracing::info!("Sharing running build {}", record.hash()),
      Err(e) => tracing::warn!("Could not register {}: {}", path, e),
    }
  }

  let source: Arc<dyn PeerSource> = if config.static_peers.is_empty() {
    Arc::new(UdpDiscovery::new(config.discovery_port))
  } else {
    Arc::new(StaticPeers::new(&config.static_peers, interval).expect("Invalid STATIC_PEERS"))
  };

  let server = UpgradeServer::new(
    storage.clone(),
    ServerOptions {
      bind_addr: SocketAddr::from(([0, 0, 0, 0], config.upgrade_port)),
      announce: Some(AnnounceOptions {
        node_id: node_id.clone(),
        discovery_port: config.discovery_port,
        interval,
      }),
    },
  );
  let downloader = UpgradeDownloader::new(
    storage.clone(),
    source,
    DownloaderOptions {
      device: config.device.clone(),
      node_id: Some(node_id.clone()),
    },
  )
  .expect("Failed to create downloader");

  let app_state = state::AppState::new(
    config.clone(),
    UpgradeManager::new(storage, server, downloader),
  );
  let manager = app_state.manager.clone();
  if config.auto_start {
    manager.start_services();
  }

  let listener = TcpListener::bind(addr).await.expect("Failed to bind");
  tracing::info!("Control API listening on {} (node {})", addr, node_id);
  tracing::info!(
    "Data directory: {}",
    std::fs::canonicalize(&config.data_dir)
      .unwrap_or_else(|_| config.data_dir.clone().into())
      .display()
  );

  axum::serve(listener, routes::app(app_state))
    .with_graceful_shutdown(async {
      let _ = tokio::signal::ctrl_c().await;
    })
    .await
    .expect("Server error");

  tracing::info!("Shutting down upgrade services");
  manager.stop_services();
  manager.wait_until(settled).await;
}

fn settled(state: &UpgradeState) -> bool {
  let done = |s: &ServiceState| matches!(s, ServiceState::Stopped | ServiceState::Error { .. });
  done(&state.server.state) && done(&state.downloader.state)
}
