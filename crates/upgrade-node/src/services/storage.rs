use std::path::PathBuf;
use std::sync::Arc;
use upgrade_core::error::{Result, UpgradeError};
use upgrade_core::storage::UpgradeStorage;
use upgrade_core::types::{PackageRecord, VersionInfo};

/// Async handle to the on-disk package store. Hashing and index writes run
/// on the blocking pool.
#[derive(Clone)]
pub struct PackageStore {
  inner: Arc<UpgradeStorage>,
}

impl PackageStore {
  pub async fn open(dir: PathBuf, verify: bool) -> Result<Self> {
    let storage = blocking(move || UpgradeStorage::open(dir, verify)).await?;
    Ok(Self {
      inner: Arc::new(storage),
    })
  }

  pub async fn register_package(
    &self,
    filepath: PathBuf,
    version: VersionInfo,
  ) -> Result<PackageRecord> {
    let inner = self.inner.clone();
    blocking(move || inner.register_package(&filepath, &version)).await
  }

  pub async fn remove_package(&self, hash: String) -> Result<()> {
    let inner = self.inner.clone();
    blocking(move || inner.remove_package(&hash)).await
  }

  pub fn list_packages(&self) -> Vec<PackageRecord> {
    self.inner.list_packages()
  }

  pub fn get_package(&self, hash: &str) -> Option<PackageRecord> {
    self.inner.get_package(hash)
  }

  pub fn package_path(&self, hash: &str) -> PathBuf {
    self.inner.package_path(hash)
  }

  pub fn partial_path(&self, hash: &str) -> PathBuf {
    self.inner.partial_path(hash)
  }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
  F: FnOnce() -> Result<T> + Send + 'static,
  T: Send + 'static,
{
  tokio::task::spawn_blocking(f)
    .await
    .map_err(|e| UpgradeError::Io(std::io::Error::other(format!("Spawn error: {}", e))))?
}
