use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{error, info};
use upgrade_core::types::{ServiceState, ServiceStatus};

/// `stopped -> starting -> started -> stopping -> stopped`, with `error`
/// reachable from anywhere and left only through a new start.
///
/// Transitions are published while the state lock is held, so subscribers
/// observe them in the order they happened.
pub struct Lifecycle<E> {
  name: &'static str,
  status: Mutex<ServiceStatus>,
  events: broadcast::Sender<E>,
  wrap: fn(ServiceStatus) -> E,
}

enum Context {
  Keep,
  Set(Option<String>),
}

impl<E> Lifecycle<E> {
  pub fn new(name: &'static str, events: broadcast::Sender<E>, wrap: fn(ServiceStatus) -> E) -> Self {
    Self {
      name,
      status: Mutex::new(ServiceStatus::default()),
      events,
      wrap,
    }
  }

  pub fn status(&self) -> ServiceStatus {
    self.status.lock().clone()
  }

  pub fn state(&self) -> ServiceState {
    self.status.lock().state.clone()
  }

  /// `stopped | error -> starting`. False if already starting or running.
  pub fn begin_start(&self) -> bool {
    self.transition(
      |s| matches!(s, ServiceState::Stopped | ServiceState::Error { .. }),
      ServiceState::Starting,
      Context::Set(None),
    )
  }

  /// `starting -> started`. False when a stop arrived first.
  pub fn finish_start(&self, context: Option<String>) -> bool {
    self.transition(
      |s| *s == ServiceState::Starting,
      ServiceState::Started,
      Context::Set(context),
    )
  }

  /// `starting | started -> stopping`.
  pub fn begin_stop(&self) -> bool {
    self.transition(
      |s| matches!(s, ServiceState::Starting | ServiceState::Started),
      ServiceState::Stopping,
      Context::Keep,
    )
  }

  /// `stopping -> stopped`.
  pub fn finish_stop(&self) -> bool {
    self.transition(
      |s| *s == ServiceState::Stopping,
      ServiceState::Stopped,
      Context::Set(None),
    )
  }

  pub fn fail(&self, reason: impl Into<String>) {
    self.transition(
      |_| true,
      ServiceState::Error {
        error: reason.into(),
      },
      Context::Set(None),
    );
  }

  fn transition(
    &self,
    allowed: impl FnOnce(&ServiceState) -> bool,
    next: ServiceState,
    context: Context,
  ) -> bool {
    let mut status = self.status.lock();
    if !allowed(&status.state) {
      return false;
    }

    status.state = next;
    if let Context::Set(ctx) = context {
      status.context = ctx;
    }
    status.revision += 1;

    if status.state.is_error() {
      error!("{} {}", self.name, status.state);
    } else {
      info!("{} {}", self.name, status.state);
    }
    let _ = self.events.send((self.wrap)(status.clone()));
    true
  }
}

/// Resolves once `signal` flips to `true` or its sender is dropped.
pub async fn cancelled(signal: &mut watch::Receiver<bool>) {
  let _ = signal.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
  use super::*;

  fn lifecycle() -> (Lifecycle<ServiceStatus>, broadcast::Receiver<ServiceStatus>) {
    let (tx, rx) = broadcast::channel(16);
    (Lifecycle::new("test", tx, |s| s), rx)
  }

  fn drain(rx: &mut broadcast::Receiver<ServiceStatus>) -> Vec<ServiceState> {
    let mut out = Vec::new();
    while let Ok(s) = rx.try_recv() {
      out.push(s.state);
    }
    out
  }

  #[test]
  fn test_full_cycle_in_order() {
    let (lc, mut rx) = lifecycle();
    assert!(lc.begin_start());
    assert!(lc.finish_start(Some("listening on 127.0.0.1:1".into())));
    assert!(lc.begin_stop());
    assert_eq!(lc.status().context.as_deref(), Some("listening on 127.0.0.1:1"));
    assert!(lc.finish_stop());

    assert_eq!(
      drain(&mut rx),
      vec![
        ServiceState::Starting,
        ServiceState::Started,
        ServiceState::Stopping,
        ServiceState::Stopped,
      ]
    );
    assert_eq!(lc.status().revision, 4);
    assert_eq!(lc.status().context, None);
  }

  #[test]
  fn test_repeated_commands_are_noops() {
    let (lc, mut rx) = lifecycle();
    assert!(!lc.begin_stop());
    assert!(lc.begin_start());
    assert!(!lc.begin_start());
    assert!(lc.finish_start(None));
    assert!(!lc.begin_start());
    assert!(lc.begin_stop());
    assert!(!lc.begin_stop());
    assert_eq!(drain(&mut rx).len(), 3);
  }

  #[test]
  fn test_stop_while_starting_wins() {
    let (lc, _rx) = lifecycle();
    lc.begin_start();
    lc.begin_stop();
    assert!(!lc.finish_start(None));
    assert_eq!(lc.state(), ServiceState::Stopping);
  }

  #[test]
  fn test_error_needs_explicit_restart() {
    let (lc, _rx) = lifecycle();
    lc.begin_start();
    lc.fail("address in use");
    assert!(!lc.begin_stop());
    assert!(!lc.finish_start(None));
    assert_eq!(
      lc.state(),
      ServiceState::Error {
        error: "address in use".into()
      }
    );
    assert!(lc.begin_start());
    assert_eq!(lc.state(), ServiceState::Starting);
  }
}
