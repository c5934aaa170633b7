use std::sync::Arc;
use upgrade_core::config::Config;

use crate::services::manager::UpgradeManager;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
  pub config: Config,
  pub manager: Arc<UpgradeManager>,
}

impl AppState {
  pub fn new(config: Config, manager: UpgradeManager) -> Self {
    Self {
      config,
      manager: Arc::new(manager),
    }
  }
}
