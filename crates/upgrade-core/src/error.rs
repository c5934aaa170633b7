use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpgradeError {
  #[error("Invalid package: {0}")]
  InvalidPackage(String),

  #[error("Not found: {0}")]
  NotFound(String),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Integrity check failed for {expected}: got {actual}")]
  Integrity { expected: String, actual: String },

  #[error("Could not bind {addr}: {reason}")]
  Bind { addr: String, reason: String },

  #[error("Peer discovery failed: {0}")]
  Discovery(String),

  #[error("Transport error: {0}")]
  Transport(String),

  #[error("Cancelled")]
  Cancelled,

  #[error("Index error: {0}")]
  Index(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, UpgradeError>;

impl UpgradeError {
  pub fn status_code(&self) -> u16 {
    match self {
      UpgradeError::InvalidPackage(_) => 400,
      UpgradeError::NotFound(_) => 404,
      UpgradeError::Integrity { .. } | UpgradeError::Transport(_) => 502,
      UpgradeError::Io(_)
      | UpgradeError::Bind { .. }
      | UpgradeError::Discovery(_)
      | UpgradeError::Cancelled
      | UpgradeError::Index(_) => 500,
    }
  }
}
