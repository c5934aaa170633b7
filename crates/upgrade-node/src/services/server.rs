use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use upgrade_core::error::UpgradeError;
use upgrade_core::types::{ServiceStatus, TransferProgress};
use crate::routes::peer::{self, PeerState};
use crate::services::discovery::{announce, Announcement};
use crate::services::lifecycle::{cancelled, Lifecycle};
use crate::services::storage::PackageStore;
use crate::services::transfers::{TransferEvent, TransferTable};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum ServerEvent {
  State(ServiceStatus),
  Upload(TransferEvent),
}

#[derive(Debug, Clone)]
pub struct AnnounceOptions {
  pub node_id: String,
  pub discovery_port: u16,
  pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
  pub bind_addr: SocketAddr,
  /// Broadcast announcements while sharing. `None` keeps the server silent.
  pub announce: Option<AnnounceOptions>,
}

/// Serves stored packages to peers over HTTP.
#[derive(Clone)]
pub struct UpgradeServer {
  inner: Arc<Inner>,
}

struct Inner {
  options: ServerOptions,
  storage: PackageStore,
  events: broadcast::Sender<ServerEvent>,
  lifecycle: Lifecycle<ServerEvent>,
  uploads: Arc<TransferTable<ServerEvent>>,
  // Present while the listener is accepting.
  shutdown: Mutex<Option<watch::Sender<bool>>>,
  local_addr: Mutex<Option<SocketAddr>>,
}

impl UpgradeServer {
  pub fn new(storage: PackageStore, options: ServerOptions) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      inner: Arc::new(Inner {
        options,
        storage,
        lifecycle: Lifecycle::new("upgrade server", events.clone(), ServerEvent::State),
        uploads: TransferTable::new(events.clone(), ServerEvent::Upload),
        events,
        shutdown: Mutex::new(None),
        local_addr: Mutex::new(None),
      }),
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
    self.inner.events.subscribe()
  }

  pub fn status(&self) -> ServiceStatus {
    self.inner.lifecycle.status()
  }

  pub fn uploads(&self) -> Vec<TransferProgress> {
    self.inner.uploads.snapshot()
  }

  pub fn upload_entries(&self) -> std::collections::BTreeMap<String, TransferProgress> {
    self.inner.uploads.entries()
  }

  /// Address the listener is bound to while started.
  pub fn local_addr(&self) -> Option<SocketAddr> {
    *self.inner.local_addr.lock()
  }

  /// Starts listening. A no-op unless stopped or in error.
  pub fn share(&self) {
    if !self.inner.lifecycle.begin_start() {
      debug!("share ignored in state {}", self.inner.lifecycle.state());
      return;
    }
    let inner = self.inner.clone();
    tokio::spawn(async move { inner.run().await });
  }

  /// Stops accepting connections. Uploads already in flight run to
  /// completion before the server reports stopped.
  pub fn drain(&self) {
    if !self.inner.lifecycle.begin_stop() {
      debug!("drain ignored in state {}", self.inner.lifecycle.state());
      return;
    }
    if let Some(tx) = self.inner.shutdown.lock().take() {
      let _ = tx.send(true);
    }
  }
}

impl Inner {
  async fn run(self: Arc<Self>) {
    let addr = self.options.bind_addr;
    let listener = match TcpListener::bind(addr).await {
      Ok(l) => l,
      Err(e) => {
        self.fail_bind(addr, e);
        return;
      }
    };
    let local = match listener.local_addr() {
      Ok(a) => a,
      Err(e) => {
        self.fail_bind(addr, e);
        return;
      }
    };

    let (tx, mut signal) = watch::channel(false);
    {
      let mut slot = self.shutdown.lock();
      if !self.lifecycle.finish_start(Some(format!("listening on {}", local))) {
        // Drained before the listener came up.
        drop(slot);
        self.lifecycle.finish_stop();
        return;
      }
      *slot = Some(tx);
      *self.local_addr.lock() = Some(local);
    }

    if let Some(opts) = &self.options.announce {
      let announcement = Announcement {
        node_id: opts.node_id.clone(),
        port: local.port(),
      };
      tokio::spawn(announce(
        opts.discovery_port,
        announcement,
        opts.interval,
        signal.clone(),
      ));
    }

    let app = peer::router(PeerState {
      storage: self.storage.clone(),
      uploads: self.uploads.clone(),
    });
    let result = axum::serve(listener, app)
      .with_graceful_shutdown(async move { cancelled(&mut signal).await })
      .await;

    let pending = self.uploads.snapshot().len();
    if pending > 0 {
      info!("Waiting for {} uploads to finish", pending);
    }
    self.uploads.idle().await;
    *self.local_addr.lock() = None;

    match result {
      Ok(()) => {
        self.lifecycle.finish_stop();
      }
      Err(e) => {
        self.shutdown.lock().take();
        self.lifecycle.fail(format!("server error: {}", e));
      }
    }
  }

  fn fail_bind(&self, addr: SocketAddr, e: std::io::Error) {
    let err = UpgradeError::Bind {
      addr: addr.to_string(),
      reason: e.to_string(),
    };
    self.lifecycle.fail(err.to_string());
  }
}
