use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Native ABIs a package can ship libraries for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Arch {
  #[serde(rename = "x86")]
  X86,
  #[serde(rename = "x86_64")]
  X86_64,
  #[serde(rename = "armeabi-v7a")]
  ArmeabiV7a,
  #[serde(rename = "arm64-v8a")]
  Arm64V8a,
}

impl Arch {
  pub const ALL: [Arch; 4] = [Arch::X86, Arch::X86_64, Arch::ArmeabiV7a, Arch::Arm64V8a];

  pub fn as_str(&self) -> &'static str {
    match self {
      Arch::X86 => "x86",
      Arch::X86_64 => "x86_64",
      Arch::ArmeabiV7a => "armeabi-v7a",
      Arch::Arm64V8a => "arm64-v8a",
    }
  }
}

impl fmt::Display for Arch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Arch {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Arch::ALL
      .into_iter()
      .find(|a| a.as_str() == s)
      .ok_or_else(|| format!("unknown arch: {}", s))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
  #[default]
  Android,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HashType {
  #[default]
  #[serde(rename = "sha256")]
  Sha256,
}

/// Version metadata supplied alongside a package file at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
  pub version_name: String,
  pub version_code: u64,
  pub application_id: String,
  #[serde(default)]
  pub min_sdk_version: u32,
  #[serde(default)]
  pub platform: Platform,
}

/// Package metadata as advertised to peers. Never carries a local path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
  pub hash: String,
  #[serde(default)]
  pub hash_type: HashType,
  pub version_name: String,
  pub version_code: u64,
  pub application_id: String,
  pub min_sdk_version: u32,
  pub platform: Platform,
  pub arch: Vec<Arch>,
  pub size: u64,
}

impl PackageInfo {
  pub fn version(&self) -> VersionInfo {
    VersionInfo {
      version_name: self.version_name.clone(),
      version_code: self.version_code,
      application_id: self.application_id.clone(),
      min_sdk_version: self.min_sdk_version,
      platform: self.platform,
    }
  }
}

/// A package known to local storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
  #[serde(flatten)]
  pub info: PackageInfo,
  pub filepath: PathBuf,
}

impl PackageRecord {
  pub fn hash(&self) -> &str {
    &self.info.hash
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
  /// Hash of the package being transferred.
  pub id: String,
  pub sofar: u64,
  pub total: u64,
}

/// Lifecycle state shared by the upgrade server and downloader.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "value", rename_all = "lowercase")]
pub enum ServiceState {
  #[default]
  Stopped,
  Starting,
  Started,
  Stopping,
  Error { error: String },
}

impl ServiceState {
  pub fn is_error(&self) -> bool {
    matches!(self, ServiceState::Error { .. })
  }
}

impl fmt::Display for ServiceState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ServiceState::Stopped => f.write_str("stopped"),
      ServiceState::Starting => f.write_str("starting"),
      ServiceState::Started => f.write_str("started"),
      ServiceState::Stopping => f.write_str("stopping"),
      ServiceState::Error { error } => write!(f, "error ({})", error),
    }
  }
}

/// A service state plus optional context, e.g. the address a server bound.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceStatus {
  #[serde(flatten)]
  pub state: ServiceState,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub context: Option<String>,
  /// Bumped on every transition so stale copies can be told apart.
  #[serde(skip)]
  pub revision: u64,
}

/// Composite snapshot of the server and downloader.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeState {
  pub server: ServiceStatus,
  pub downloader: ServiceStatus,
  pub uploads: Vec<TransferProgress>,
  pub downloads: Vec<TransferProgress>,
  pub checked_peers: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub available_upgrade: Option<PackageRecord>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn sample_info() -> PackageInfo {
    PackageInfo {
      hash: "ab".repeat(32),
      hash_type: HashType::Sha256,
      version_name: "5.1.0".into(),
      version_code: 51,
      application_id: "com.example.field".into(),
      min_sdk_version: 21,
      platform: Platform::Android,
      arch: vec![Arch::ArmeabiV7a, Arch::Arm64V8a],
      size: 1024,
    }
  }

  #[test]
  fn test_service_state_shape() {
    let started = serde_json::to_value(ServiceState::Started).unwrap();
    assert_eq!(started, json!({"value": "started"}));

    let failed = ServiceStatus {
      state: ServiceState::Error {
        error: "port in use".into(),
      },
      context: None,
      revision: 3,
    };
    assert_eq!(
      serde_json::to_value(&failed).unwrap(),
      json!({"value": "error", "error": "port in use"})
    );
  }

  #[test]
  fn test_package_info_wire_format() {
    let value = serde_json::to_value(sample_info()).unwrap();
    assert_eq!(value["hashType"], "sha256");
    assert_eq!(value["versionCode"], 51);
    assert_eq!(value["arch"], json!(["armeabi-v7a", "arm64-v8a"]));
    assert!(value.get("filepath").is_none());
  }

  #[test]
  fn test_record_flattens_info() {
    let record = PackageRecord {
      info: sample_info(),
      filepath: PathBuf::from("/data/packages/a.apk"),
    };
    let value = serde_json::to_value(&record).unwrap();
    assert_eq!(value["applicationId"], "com.example.field");
    assert_eq!(value["filepath"], "/data/packages/a.apk");

    let back: PackageRecord = serde_json::from_value(value).unwrap();
    assert_eq!(back, record);
  }

  #[test]
  fn test_arch_from_str() {
    assert_eq!("arm64-v8a".parse::<Arch>(), Ok(Arch::Arm64V8a));
    assert!("mips".parse::<Arch>().is_err());
  }

  #[test]
  fn test_upgrade_state_omits_missing_upgrade() {
    let value = serde_json::to_value(UpgradeState::default()).unwrap();
    assert_eq!(value["server"], json!({"value": "stopped"}));
    assert_eq!(value["checkedPeers"], json!([]));
    assert!(value.get("availableUpgrade").is_none());
  }
}
