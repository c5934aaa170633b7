//! SHA-256 helpers for package content addressing.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;

const BUF_SIZE: usize = 64 * 1024;

/// Hex digest of everything `reader` yields.
pub fn digest_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
  let mut hasher = Sha256::new();
  let mut buf = vec![0u8; BUF_SIZE];
  loop {
    let n = reader.read(&mut buf)?;
    if n == 0 {
      break;
    }
    hasher.update(&buf[..n]);
  }
  Ok(finish(hasher))
}

pub fn digest_file(path: &Path) -> std::io::Result<String> {
  let file = std::fs::File::open(path)?;
  digest_reader(file)
}

pub fn finish(hasher: Sha256) -> String {
  hex::encode(hasher.finalize())
}

/// True for 64 lowercase hex characters. Hashes received from peers end up
/// in file names and URLs, so anything else is rejected.
pub fn is_valid_hash(hash: &str) -> bool {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new("^[0-9a-f]{64}$").expect("static regex"))
    .is_match(hash)
}
