use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use upgrade_core::error::UpgradeError;
use upgrade_core::types::TransferProgress;
use uuid::Uuid;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
const INTERRUPTED: &str = "transfer interrupted";

#[derive(Debug, Clone)]
pub enum TransferEvent {
  Progress {
    key: String,
    progress: TransferProgress,
  },
  Ended {
    key: String,
    id: String,
    error: Option<String>,
  },
}

/// In-flight transfers of one component, keyed per transfer so two peers
/// fetching the same package are tracked separately.
pub struct TransferTable<E> {
  entries: Mutex<BTreeMap<String, TransferProgress>>,
  active: watch::Sender<usize>,
  events: broadcast::Sender<E>,
  wrap: fn(TransferEvent) -> E,
}

impl<E> TransferTable<E> {
  pub fn new(events: broadcast::Sender<E>, wrap: fn(TransferEvent) -> E) -> Arc<Self> {
    Arc::new(Self {
      entries: Mutex::new(BTreeMap::new()),
      active: watch::channel(0).0,
      events,
      wrap,
    })
  }

  pub fn begin(self: &Arc<Self>, id: &str, total: u64) -> TransferGuard<E> {
    let key = Uuid::new_v4().to_string();
    let progress = TransferProgress {
      id: id.to_string(),
      sofar: 0,
      total,
    };

    {
      let mut entries = self.entries.lock();
      entries.insert(key.clone(), progress.clone());
      self.active.send_modify(|n| *n += 1);
      let _ = self.events.send((self.wrap)(TransferEvent::Progress {
        key: key.clone(),
        progress,
      }));
    }

    TransferGuard {
      table: self.clone(),
      key,
      id: id.to_string(),
      sofar: 0,
      total,
      last_emit: Instant::now(),
      error: Some(INTERRUPTED.into()),
    }
  }

  pub fn snapshot(&self) -> Vec<TransferProgress> {
    self.entries.lock().values().cloned().collect()
  }

  pub fn entries(&self) -> BTreeMap<String, TransferProgress> {
    self.entries.lock().clone()
  }

  /// Resolves once no transfer is in flight.
  pub async fn idle(&self) {
    let mut rx = self.active.subscribe();
    let _ = rx.wait_for(|n| *n == 0).await;
  }
}

/// Tracks one transfer. Dropping it removes the entry; the transfer counts
/// as failed unless every byte was accounted for and no failure recorded.
pub struct TransferGuard<E> {
  table: Arc<TransferTable<E>>,
  key: String,
  id: String,
  sofar: u64,
  total: u64,
  last_emit: Instant,
  error: Option<String>,
}

impl<E> TransferGuard<E> {
  pub fn sofar(&self) -> u64 {
    self.sofar
  }

  pub fn total(&self) -> u64 {
    self.total
  }

  /// Records `n` more bytes. Overrunning the expected total is an error and
  /// leaves the counters untouched.
  pub fn advance(&mut self, n: u64) -> Result<(), UpgradeError> {
    let sofar = self.sofar + n;
    if sofar > self.total {
      return Err(UpgradeError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("{}: {} bytes exceeds expected {}", self.id, sofar, self.total),
      )));
    }
    self.sofar = sofar;
    if sofar == self.total {
      self.error = None;
    }

    let progress = TransferProgress {
      id: self.id.clone(),
      sofar,
      total: self.total,
    };
    let mut entries = self.table.entries.lock();
    entries.insert(self.key.clone(), progress.clone());

    let now = Instant::now();
    if sofar == self.total || now.duration_since(self.last_emit) >= PROGRESS_INTERVAL {
      self.last_emit = now;
      let _ = self.table.events.send((self.table.wrap)(TransferEvent::Progress {
        key: self.key.clone(),
        progress,
      }));
    }
    Ok(())
  }

  pub fn complete(&mut self) {
    self.error = None;
  }

  pub fn fail(&mut self, reason: impl Into<String>) {
    self.error = Some(reason.into());
  }
}

impl<E> Drop for TransferGuard<E> {
  fn drop(&mut self) {
    let mut entries = self.table.entries.lock();
    entries.remove(&self.key);
    let _ = self.table.events.send((self.table.wrap)(TransferEvent::Ended {
      key: self.key.clone(),
      id: self.id.clone(),
      error: self.error.take(),
    }));
    drop(entries);
    self.table.active.send_modify(|n| *n = n.saturating_sub(1));
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn table() -> (Arc<TransferTable<TransferEvent>>, broadcast::Receiver<TransferEvent>) {
    let (tx, rx) = broadcast::channel(64);
    (TransferTable::new(tx, |e| e), rx)
  }

  #[test]
  fn test_progress_is_monotonic_and_bounded() {
    let (table, mut rx) = table();
    let mut guard = table.begin("abc", 10);
    guard.advance(4).unwrap();
    guard.advance(6).unwrap();
    assert!(guard.advance(1).is_err());
    assert_eq!(guard.sofar(), 10);
    drop(guard);

    let mut last = 0;
    let mut ended = None;
    while let Ok(ev) = rx.try_recv() {
      match ev {
        TransferEvent::Progress { progress, .. } => {
          assert!(progress.sofar >= last);
          assert!(progress.sofar <= progress.total);
          last = progress.sofar;
        }
        TransferEvent::Ended { error, .. } => ended = Some(error),
      }
    }
    assert_eq!(last, 10);
    assert_eq!(ended, Some(None));
  }

  #[test]
  fn test_drop_removes_entry_and_reports_interruption() {
    let (table, mut rx) = table();
    let mut guard = table.begin("abc", 100);
    guard.advance(30).unwrap();
    assert_eq!(
      table.snapshot(),
      vec![TransferProgress {
        id: "abc".into(),
        sofar: 30,
        total: 100
      }]
    );
    drop(guard);
    assert!(table.snapshot().is_empty());

    let last = std::iter::from_fn(|| rx.try_recv().ok()).last().unwrap();
    match last {
      TransferEvent::Ended { error, id, .. } => {
        assert_eq!(id, "abc");
        assert_eq!(error.as_deref(), Some(INTERRUPTED));
      }
      other => panic!("unexpected event {:?}", other),
    }
  }

  #[test]
  fn test_explicit_failure_after_last_byte() {
    let (table, mut rx) = table();
    let mut guard = table.begin("abc", 2);
    guard.advance(2).unwrap();
    guard.fail("digest mismatch");
    drop(guard);
    let last = std::iter::from_fn(|| rx.try_recv().ok()).last().unwrap();
    assert!(matches!(last, TransferEvent::Ended { error: Some(e), .. } if e == "digest mismatch"));
  }

  #[tokio::test]
  async fn test_idle_waits_for_all_transfers() {
    let (table, _rx) = table();
    let first = table.begin("a", 1);
    let second = table.begin("a", 1);
    assert_eq!(table.snapshot().len(), 2);

    let waiter = {
      let table = table.clone();
      tokio::spawn(async move { table.idle().await })
    };
    drop(first);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());
    drop(second);
    tokio::time::timeout(Duration::from_secs(5), waiter)
      .await
      .unwrap()
      .unwrap();
  }
}
