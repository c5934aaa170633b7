use crate::compat::DeviceInfo;
use crate::types::{Arch, Platform};
use std::path::PathBuf;

/// Node configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
  /// Control API port.
  pub port: u16,
  /// Peer-facing upgrade server port. 0 picks an ephemeral port.
  pub upgrade_port: u16,
  pub discovery_port: u16,
  pub announce_interval_secs: u64,
  pub data_dir: String,
  pub verify_on_start: bool,
  pub static_peers: Vec<String>,
  pub auto_start: bool,
  pub current_package: Option<String>,
  pub device: DeviceInfo,
}

impl Config {
  pub fn from_env() -> Self {
    let defaults = Config::default();
    let device = DeviceInfo {
      application_id: env_or("APPLICATION_ID", defaults.device.application_id),
      version_name: env_or("VERSION_NAME", defaults.device.version_name),
      version_code: env_parse("VERSION_CODE").unwrap_or(defaults.device.version_code),
      platform: Platform::Android,
      arch: env_parse("DEVICE_ARCH").unwrap_or(defaults.device.arch),
      sdk_version: env_parse("SDK_VERSION").unwrap_or(defaults.device.sdk_version),
    };

    Self {
      port: env_parse("PORT").unwrap_or(defaults.port),
      upgrade_port: env_parse("UPGRADE_PORT").unwrap_or(defaults.upgrade_port),
      discovery_port: env_parse("DISCOVERY_PORT").unwrap_or(defaults.discovery_port),
      announce_interval_secs: env_parse("ANNOUNCE_INTERVAL_SECS")
        .unwrap_or(defaults.announce_interval_secs),
      data_dir: env_or("DATA_DIR", defaults.data_dir),
      verify_on_start: env_flag("VERIFY_ON_START"),
      static_peers: std::env::var("STATIC_PEERS")
        .map(|v| parse_peer_list(&v))
        .unwrap_or_default(),
      auto_start: env_flag("AUTO_START"),
      current_package: std::env::var("CURRENT_PACKAGE").ok().filter(|p| !p.is_empty()),
      device,
    }
  }

  pub fn packages_dir(&self) -> PathBuf {
    PathBuf::from(&self.data_dir).join("packages")
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      port: 8080,
      upgrade_port: 5010,
      discovery_port: 5011,
      announce_interval_secs: 5,
      data_dir: "./data".into(),
      verify_on_start: false,
      static_peers: Vec::new(),
      auto_start: false,
      current_package: None,
      device: DeviceInfo {
        application_id: "com.example.fieldapp".into(),
        version_name: "0.0.0".into(),
        version_code: 0,
        platform: Platform::Android,
        arch: Arch::Arm64V8a,
        sdk_version: 21,
      },
    }
  }
}

/// Splits a comma-separated list of peer base URLs.
pub fn parse_peer_list(value: &str) -> Vec<String> {
  value
    .split(',')
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(String::from)
    .collect()
}

fn env_or(key: &str, default: String) -> String {
  std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
  std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_flag(key: &str) -> bool {
  matches!(
    std::env::var(key).as_deref(),
    Ok("1") | Ok("true") | Ok("yes")
  )
}
