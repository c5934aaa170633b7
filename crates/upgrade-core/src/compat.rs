//! Decides which advertised packages are upgrades for the running device.

use serde::{Deserialize, Serialize};

use crate::types::{Arch, PackageInfo, Platform};

/// Identity of the running device and application build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
  pub application_id: String,
  pub version_name: String,
  pub version_code: u64,
  pub platform: Platform,
  pub arch: Arch,
  pub sdk_version: u32,
}

/// True when `package` can be installed on `device` and is newer than the
/// running build.
pub fn is_upgrade(device: &DeviceInfo, package: &PackageInfo) -> bool {
  package.application_id == device.application_id
    && package.platform == device.platform
    && package.arch.contains(&device.arch)
    && package.min_sdk_version <= device.sdk_version
    && package.version_code > device.version_code
}

/// A compatible package seen on a peer. `seq` orders discoveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
  pub peer_id: String,
  pub info: PackageInfo,
  pub seq: u64,
}

/// Highest `version_code` wins; ties go to the earliest discovery.
pub fn select_best<'a, I>(candidates: I) -> Option<&'a Candidate>
where
  I: IntoIterator<Item = &'a Candidate>,
{
  candidates.into_iter().fold(None, |best, c| match best {
    Some(b) if (b.info.version_code, std::cmp::Reverse(b.seq))
      >= (c.info.version_code, std::cmp::Reverse(c.seq)) =>
    {
      Some(b)
    }
    _ => Some(c),
  })
}
