use axum::{
  body::Body,
  extract::{Path, State},
  http::{header, StatusCode},
  response::{IntoResponse, Json, Response},
  routing::get,
  Router,
};
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::warn;

use upgrade_core::error::UpgradeError;
use upgrade_core::hash::is_valid_hash;
use upgrade_core::types::PackageInfo;
use crate::routes::error_response;
use crate::services::server::ServerEvent;
use crate::services::storage::PackageStore;
use crate::services::transfers::TransferTable;

const APK_MIME: &str = "application/vnd.android.package-archive";

/// State behind the peer-facing upgrade protocol.
#[derive(Clone)]
pub struct PeerState {
  pub storage: PackageStore,
  pub uploads: Arc<TransferTable<ServerEvent>>,
}

pub fn router(state: PeerState) -> Router {
  Router::new()
    .route("/packages", get(list_packages))
    .route("/packages/{hash}/file", get(download_file))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

async fn list_packages(State(state): State<PeerState>) -> Json<Vec<PackageInfo>> {
  let packages = state
    .storage
    .list_packages()
    .into_iter()
    .map(|r| r.info)
    .collect();
  Json(packages)
}

async fn download_file(
  State(state): State<PeerState>,
  Path(hash): Path<String>,
) -> Result<Response, (StatusCode, Json<Value>)> {
  let not_found = || error_response(&UpgradeError::NotFound(hash.clone()));
  if !is_valid_hash(&hash) {
    return Err(not_found());
  }
  let record = state.storage.get_package(&hash).ok_or_else(not_found)?;

  let file = tokio::fs::File::open(&record.filepath)
    .await
    .map_err(|e| error_response(&UpgradeError::Io(e)))?;
  let size = file
    .metadata()
    .await
    .map_err(|e| error_response(&UpgradeError::Io(e)))?
    .len();

  let mut upload = state.uploads.begin(&hash, size);
  let stream = ReaderStream::new(file).map(move |chunk| match chunk {
    Ok(bytes) => match upload.advance(bytes.len() as u64) {
      Ok(()) => Ok(bytes),
      Err(e) => {
        warn!("Upload aborted after {} bytes: {}", upload.sofar(), e);
        upload.fail(e.to_string());
        Err(std::io::Error::other(e.to_string()))
      }
    },
    Err(e) => {
      warn!("Upload read error: {}", e);
      upload.fail(format!("read error: {}", e));
      Err(e)
    }
  });

  Ok(
    (
      [
        (header::CONTENT_TYPE, APK_MIME.to_string()),
        (header::CONTENT_LENGTH, size.to_string()),
      ],
      Body::from_stream(stream),
    )
      .into_response(),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::services::test_support::{version, write_apk};
  use axum::http::Request;
  use tokio::sync::broadcast;
  use tower::ServiceExt;

  async fn setup(tmp: &std::path::Path) -> (PeerState, String) {
    let storage = PackageStore::open(tmp.join("packages"), false).await.unwrap();
    let apk = write_apk(tmp, "app.apk", &["arm64-v8a"], b"payload");
    let record = storage.register_package(apk, version(10)).await.unwrap();
    let (tx, _) = broadcast::channel(16);
    let state = PeerState {
      storage,
      uploads: TransferTable::new(tx, ServerEvent::Upload),
    };
    (state, record.info.hash)
  }

  #[tokio::test]
  async fn test_listing_hides_local_paths() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, hash) = setup(tmp.path()).await;

    let resp = router(state)
      .oneshot(Request::get("/packages").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let listing: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listing[0]["hash"], hash);
    assert_eq!(listing[0]["versionCode"], 10);
    assert!(listing[0].get("filepath").is_none());
  }

  #[tokio::test]
  async fn test_download_streams_exact_bytes() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, hash) = setup(tmp.path()).await;
    let uploads = state.uploads.clone();
    let expected = std::fs::read(tmp.path().join("app.apk")).unwrap();

    let resp = router(state)
      .oneshot(
        Request::get(format!("/packages/{}/file", hash))
          .body(Body::empty())
          .unwrap(),
      )
      .await
      .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
      resp.headers()[header::CONTENT_LENGTH],
      expected.len().to_string().as_str()
    );
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.as_ref(), expected.as_slice());
    assert!(uploads.snapshot().is_empty());
  }

  #[tokio::test]
  async fn test_unknown_hash_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, _) = setup(tmp.path()).await;
    let app = router(state);

    for path in [
      format!("/packages/{}/file", "0".repeat(64)),
      "/packages/..%2Findex.json/file".to_string(),
    ] {
      let resp = app
        .clone()
        .oneshot(Request::get(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
      assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
  }
}
