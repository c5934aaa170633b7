//! On-disk package store: package files plus a JSON index keyed by hash.
//!
//! All methods block on filesystem I/O. Async callers should run them on a
//! blocking thread.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{Result, UpgradeError};
use crate::hash;
use crate::types::{Arch, HashType, PackageInfo, PackageRecord, VersionInfo};

pub const INDEX_FILE: &str = "index.json";
pub const INDEX_BACKUP: &str = "index.json.bak";
pub const PARTIAL_SUFFIX: &str = ".part";
const PACKAGE_EXT: &str = ".apk";
const MANIFEST_ENTRY: &str = "AndroidManifest.xml";

pub struct UpgradeStorage {
  dir: PathBuf,
  /// In registration order.
  records: RwLock<Vec<PackageRecord>>,
  // Serializes index mutations; readers only take `records`.
  write_lock: Mutex<()>,
}

struct LoadedIndex {
  records: Vec<PackageRecord>,
  intact: bool,
}

impl UpgradeStorage {
  /// Opens the store rooted at `dir`, creating it if needed.
  ///
  /// Index entries whose file is missing or changed size are dropped. With
  /// `verify` set every remaining file is rehashed as well. Leftover partial
  /// downloads and `{hash}.apk` files the index no longer references are
  /// deleted; anything else in `dir` is left alone. An unreadable index is
  /// kept as `index.json.bak` and no package file is deleted.
  pub fn open(dir: impl Into<PathBuf>, verify: bool) -> Result<Self> {
    let dir = dir.into();
    std::fs::create_dir_all(&dir)?;

    let loaded = load_index(&dir, verify);
    if !loaded.intact {
      std::fs::rename(dir.join(INDEX_FILE), dir.join(INDEX_BACKUP))?;
    }
    let storage = Self {
      dir,
      records: RwLock::new(loaded.records),
      write_lock: Mutex::new(()),
    };

    {
      let _guard = storage.write_lock.lock();
      let records = storage.records.read().clone();
      storage.write_index(&records)?;
      storage.clean_orphans(&records, loaded.intact);
      info!(
        "Opened package storage at {} ({} packages)",
        storage.dir.display(),
        records.len()
      );
    }

    Ok(storage)
  }

  /// Final location for a package downloaded into the store.
  pub fn package_path(&self, hash: &str) -> PathBuf {
    self.dir.join(format!("{}{}", hash, PACKAGE_EXT))
  }

  /// Scratch location used while a download is in flight.
  pub fn partial_path(&self, hash: &str) -> PathBuf {
    self.dir.join(format!("{}{}{}", hash, PACKAGE_EXT, PARTIAL_SUFFIX))
  }

  /// Hashes and inspects the package at `filepath` and indexes it.
  ///
  /// Registering content that is already indexed returns the existing
  /// record unchanged.
  pub fn register_package(&self, filepath: &Path, version: &VersionInfo) -> Result<PackageRecord> {
    validate_version(version)?;

    let invalid = |e: std::io::Error| {
      UpgradeError::InvalidPackage(format!("{}: {}", filepath.display(), e))
    };
    let file = File::open(filepath).map_err(invalid)?;
    let size = file.metadata().map_err(invalid)?.len();
    let arch = inspect_archive(file)?;
    let digest = hash::digest_file(filepath).map_err(invalid)?;

    let _guard = self.write_lock.lock();
    if let Some(existing) = self.get_package(&digest) {
      return Ok(existing);
    }

    let record = PackageRecord {
      info: PackageInfo {
        hash: digest.clone(),
        hash_type: HashType::Sha256,
        version_name: version.version_name.clone(),
        version_code: version.version_code,
        application_id: version.application_id.clone(),
        min_sdk_version: version.min_sdk_version,
        platform: version.platform,
        arch,
        size,
      },
      filepath: std::fs::canonicalize(filepath).unwrap_or_else(|_| filepath.to_path_buf()),
    };

    let mut next = self.records.read().clone();
    next.retain(|r| r.info.hash != digest);
    next.push(record.clone());
    self.write_index(&next)?;
    *self.records.write() = next;

    info!(
      "Registered package {} v{} ({}) from {}",
      record.info.application_id,
      record.info.version_name,
      record.hash(),
      record.filepath.display()
    );
    Ok(record)
  }

  /// All indexed packages whose file is still present, oldest registration
  /// first.
  pub fn list_packages(&self) -> Vec<PackageRecord> {
    self
      .records
      .read()
      .iter()
      .filter(|r| r.filepath.exists())
      .cloned()
      .collect()
  }

  pub fn get_package(&self, hash: &str) -> Option<PackageRecord> {
    self
      .records
      .read()
      .iter()
      .find(|r| r.info.hash == hash && r.filepath.exists())
      .cloned()
  }

  /// Drops the index entry. The file is deleted only when it lives inside
  /// the store directory; registered external builds are left in place.
  pub fn remove_package(&self, hash: &str) -> Result<()> {
    let _guard = self.write_lock.lock();
    let mut next = self.records.read().clone();
    let record = match next.iter().position(|r| r.info.hash == hash) {
      Some(pos) => next.remove(pos),
      None => return Ok(()),
    };

    self.write_index(&next)?;
    *self.records.write() = next;

    if path_within_base(&record.filepath, &self.dir) {
      match std::fs::remove_file(&record.filepath) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
      }
    }

    info!("Removed package {}", hash);
    Ok(())
  }

  fn write_index(&self, records: &[PackageRecord]) -> Result<()> {
    let data = serde_json::to_string_pretty(records)?;
    let tmp = self.dir.join(format!("{}{}", INDEX_FILE, PARTIAL_SUFFIX));
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, self.dir.join(INDEX_FILE))?;
    Ok(())
  }

  fn clean_orphans(&self, records: &[PackageRecord], packages_too: bool) {
    let known: HashSet<PathBuf> = records.iter().map(|r| canonical(&r.filepath)).collect();

    let entries = match std::fs::read_dir(&self.dir) {
      Ok(e) => e,
      Err(_) => return,
    };

    for entry in entries.flatten() {
      let path = entry.path();
      let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        continue;
      };
      if !path.is_file() {
        continue;
      }
      let stale = name.ends_with(PARTIAL_SUFFIX)
        || (packages_too && is_package_name(name) && !known.contains(&canonical(&path)));
      if stale {
        warn!("Removing orphaned file {}", path.display());
        let _ = std::fs::remove_file(&path);
      }
    }
  }
}

/// Names the store gives downloaded packages: `{hash}.apk`.
fn is_package_name(name: &str) -> bool {
  name.strip_suffix(PACKAGE_EXT).is_some_and(hash::is_valid_hash)
}

fn load_index(dir: &Path, verify: bool) -> LoadedIndex {
  let data = match std::fs::read_to_string(dir.join(INDEX_FILE)) {
    Ok(d) => d,
    Err(_) => {
      return LoadedIndex {
        records: Vec::new(),
        intact: true,
      }
    }
  };

  let items: Vec<PackageRecord> = match serde_json::from_str(&data) {
    Ok(v) => v,
    Err(e) => {
      warn!("Unreadable package index, keeping it as {}: {}", INDEX_BACKUP, e);
      return LoadedIndex {
        records: Vec::new(),
        intact: false,
      };
    }
  };

  let mut records: Vec<PackageRecord> = Vec::with_capacity(items.len());
  for record in items {
    if records.iter().any(|r| r.info.hash == record.info.hash) {
      continue;
    }
    let size = match std::fs::metadata(&record.filepath) {
      Ok(m) => m.len(),
      Err(_) => {
        warn!("Dropping {}: file {} is gone", record.hash(), record.filepath.display());
        continue;
      }
    };
    if size != record.info.size {
      warn!("Dropping {}: size changed", record.hash());
      continue;
    }
    if verify {
      match hash::digest_file(&record.filepath) {
        Ok(d) if d == record.info.hash => {}
        _ => {
          warn!("Dropping {}: digest mismatch", record.hash());
          continue;
        }
      }
    }
    records.push(record);
  }
  LoadedIndex {
    records,
    intact: true,
  }
}

fn validate_version(version: &VersionInfo) -> Result<()> {
  let mut missing = Vec::new();
  if version.application_id.trim().is_empty() {
    missing.push("applicationId");
  }
  if version.version_name.trim().is_empty() {
    missing.push("versionName");
  }
  if version.version_code == 0 {
    missing.push("versionCode");
  }
  if missing.is_empty() {
    Ok(())
  } else {
    Err(UpgradeError::InvalidPackage(format!(
      "missing metadata: {}",
      missing.join(", ")
    )))
  }
}

/// Checks the file is an Android package and returns the ABIs it ships
/// native code for. Packages without native code run everywhere.
pub fn inspect_archive<R: Read + Seek>(reader: R) -> Result<Vec<Arch>> {
  let archive = zip::ZipArchive::new(reader)
    .map_err(|e| UpgradeError::InvalidPackage(format!("not a zip archive: {}", e)))?;

  let mut has_manifest = false;
  let mut abis = BTreeSet::new();
  for name in archive.file_names() {
    if name == MANIFEST_ENTRY {
      has_manifest = true;
    } else if let Some(rest) = name.strip_prefix("lib/") {
      if let Some(arch) = rest.split('/').next().and_then(|abi| abi.parse::<Arch>().ok()) {
        abis.insert(arch);
      }
    }
  }

  if !has_manifest {
    return Err(UpgradeError::InvalidPackage(format!("{} not found", MANIFEST_ENTRY)));
  }

  if abis.is_empty() {
    Ok(Arch::ALL.to_vec())
  } else {
    Ok(abis.into_iter().collect())
  }
}

pub fn path_within_base(path: &Path, base: &Path) -> bool {
  canonical(path).starts_with(canonical(base))
}

fn canonical(path: &Path) -> PathBuf {
  std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
