//! Artifact downloads.
//!
//! A fetch whose target already exists is a no-op. New artifacts are
//! streamed to a hidden `.part` file next to the target and renamed into
//! place only after the body has been fully written, so an interrupted
//! transfer never leaves a truncated file under the artifact's name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::paths::ensure_dir_async;

const USER_AGENT: &str = concat!("sdserve/", env!("CARGO_PKG_VERSION"));

/// Result of a fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub path: PathBuf,
    /// False when the artifact was already present and nothing was requested.
    pub transferred: bool,
    pub bytes: u64,
}

/// Reject anything that is not a plain file name.
pub fn validate_artifact_name(filename: &str) -> Result<()> {
    let plain = !filename.is_empty()
        && filename != "."
        && filename != ".."
        && !filename.contains(['/', '\\'])
        && Path::new(filename).file_name().and_then(|n| n.to_str()) == Some(filename);

    if plain {
        Ok(())
    } else {
        Err(Error::InvalidArtifactName(filename.to_string()))
    }
}

type InFlight = Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>;

pub struct ArtifactFetcher {
    client: Client,
    in_flight: InFlight,
}

impl ArtifactFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Fetch(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Fetch `url` into `target_dir/filename`, returning the local path.
    ///
    /// The transfer runs on its own task and finishes (or cleans up after
    /// itself) even if the returned future is dropped.
    pub async fn fetch(
        &self,
        url: &str,
        filename: &str,
        target_dir: &Path,
    ) -> Result<FetchOutcome> {
        validate_artifact_name(filename)?;
        let dest = target_dir.join(filename);

        // Cheap path: no lock needed to observe an existing artifact.
        if let Some(outcome) = existing(&dest).await {
            debug!("Artifact already present: {:?}", dest);
            return Ok(outcome);
        }

        let task = Transfer {
            client: self.client.clone(),
            in_flight: self.in_flight.clone(),
            url: url.to_string(),
            target_dir: target_dir.to_path_buf(),
            dest,
        };
        tokio::spawn(task.run())
            .await
            .map_err(|e| Error::Fetch(format!("download task failed: {}", e)))?
    }
}

struct Transfer {
    client: Client,
    in_flight: InFlight,
    url: String,
    target_dir: PathBuf,
    dest: PathBuf,
}

impl Transfer {
    async fn run(self) -> Result<FetchOutcome> {
        let slot = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            in_flight.entry(self.dest.clone()).or_default().clone()
        };

        let result = {
            let _guard = slot.lock().await;
            match existing(&self.dest).await {
                Some(outcome) => Ok(outcome),
                None => self.download().await,
            }
        };

        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            // One reference in the map plus ours means nobody else is waiting.
            if Arc::strong_count(&slot) == 2 {
                in_flight.remove(&self.dest);
            }
        }

        result
    }

    async fn download(&self) -> Result<FetchOutcome> {
        let (url, dest) = (self.url.as_str(), self.dest.as_path());
        ensure_dir_async(&self.target_dir)
            .await
            .map_err(|e| Error::Fetch(e.to_string()))?;

        info!("Downloading {} to {:?}", url, dest);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Fetch(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Fetch(format!("HTTP {} for {}", response.status(), url)));
        }

        let file_name = dest
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("artifact");
        let partial = self
            .target_dir
            .join(format!(".{}.{}.part", file_name, uuid::Uuid::new_v4()));

        let bytes = match write_body(response, &partial).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove partial download {:?}: {}", partial, cleanup);
                    }
                }
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&partial, dest).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(Error::Fetch(format!("Failed to publish {:?}: {}", dest, e)));
        }

        info!("Downloaded {} bytes to {:?}", bytes, dest);
        Ok(FetchOutcome {
            path: dest.to_path_buf(),
            transferred: true,
            bytes,
        })
    }
}

/// An existing regular file at `dest`. Directories and other entries do not count.
async fn existing(dest: &Path) -> Option<FetchOutcome> {
    let metadata = tokio::fs::metadata(dest).await.ok()?;
    if !metadata.is_file() {
        return None;
    }
    Some(FetchOutcome {
        path: dest.to_path_buf(),
        transferred: false,
        bytes: metadata.len(),
    })
}

async fn write_body(response: reqwest::Response, partial: &Path) -> Result<u64> {
    let write_err =
        |e: std::io::Error| Error::Fetch(format!("Failed to write {:?}: {}", partial, e));

    let mut file = tokio::fs::File::create(partial).await.map_err(write_err)?;
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::Fetch(format!("Failed to read response: {}", e)))?;
        file.write_all(&chunk).await.map_err(write_err)?;
        written += chunk.len() as u64;
    }

    file.flush().await.map_err(write_err)?;
    file.sync_all().await.map_err(write_err)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{http::StatusCode, routing::get, Router};

    const BODY: &[u8] = b"not really a safetensors file";

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("sdserve-fetch-{}", uuid::Uuid::new_v4()))
    }

    /// Serve `BODY` at `/m.bin` and 404 at `/missing`, counting hits on `/m.bin`.
    /// `/truncated` sends one chunk and then drops the connection.
    async fn artifact_server() -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new()
            .route(
                "/m.bin",
                get(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        BODY.to_vec()
                    }
                }),
            )
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .route(
                "/truncated",
                get(|| async {
                    let first = futures::stream::iter([Ok(b"first chunk".to_vec())]);
                    let cut = futures::stream::once(async {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Err(std::io::Error::new(
                            std::io::ErrorKind::ConnectionReset,
                            "cut off",
                        ))
                    });
                    axum::body::Body::from_stream(first.chain(cut))
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), hits)
    }

    fn fetcher() -> ArtifactFetcher {
        ArtifactFetcher::new(Duration::from_secs(10)).unwrap()
    }

    fn leftover_parts(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
                    .count()
            })
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn second_fetch_is_a_noop() {
        let (base, hits) = artifact_server().await;
        let dir = scratch_dir();
        let fetcher = fetcher();
        let url = format!("{}/m.bin", base);

        let first = fetcher.fetch(&url, "a.bin", &dir).await.unwrap();
        assert!(first.transferred);
        assert_eq!(first.path, dir.join("a.bin"));
        assert_eq!(std::fs::read(&first.path).unwrap(), BODY);

        let second = fetcher.fetch(&url, "a.bin", &dir).await.unwrap();
        assert!(!second.transferred);
        assert_eq!(second.path, first.path);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn existing_file_is_never_overwritten() {
        let (base, hits) = artifact_server().await;
        let dir = scratch_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.bin"), b"local copy").unwrap();

        let outcome = fetcher()
            .fetch(&format!("{}/m.bin", base), "a.bin", &dir)
            .await
            .unwrap();
        assert!(!outcome.transferred);
        assert_eq!(std::fs::read(dir.join("a.bin")).unwrap(), b"local copy");
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn concurrent_fetches_transfer_once() {
        let (base, hits) = artifact_server().await;
        let dir = scratch_dir();
        let fetcher = Arc::new(fetcher());
        let url = format!("{}/m.bin", base);

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let fetcher = fetcher.clone();
                let url = url.clone();
                let dir = dir.clone();
                tokio::spawn(async move { fetcher.fetch(&url, "m.bin", &dir).await })
            })
            .collect();

        let mut transferred = 0;
        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            assert_eq!(outcome.path, dir.join("m.bin"));
            if outcome.transferred {
                transferred += 1;
            }
        }
        assert_eq!(transferred, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(fetcher.in_flight.lock().unwrap().is_empty());

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn http_error_leaves_nothing_behind() {
        let (base, _hits) = artifact_server().await;
        let dir = scratch_dir();

        let err = fetcher()
            .fetch(&format!("{}/missing", base), "m.bin", &dir)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fetch(_)));
        assert!(!dir.join("m.bin").exists());
        assert_eq!(leftover_parts(&dir), 0);

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn unreachable_host_is_a_fetch_error() {
        let dir = scratch_dir();
        let err = fetcher()
            .fetch("http://127.0.0.1:1/m.bin", "m.bin", &dir)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fetch(_)));
        assert!(!dir.join("m.bin").exists());

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn rejects_path_like_names() {
        let dir = scratch_dir();
        for name in ["", ".", "..", "../m.bin", "sub/m.bin", "sub\\m.bin"] {
            let err = fetcher().fetch("http://127.0.0.1:1/m.bin", name, &dir).await.unwrap_err();
            assert!(matches!(err, Error::InvalidArtifactName(_)), "{name:?}");
        }
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn truncated_body_removes_partial_file() {
        let (base, _hits) = artifact_server().await;
        let dir = scratch_dir();
        let fetcher = fetcher();

        let err = fetcher
            .fetch(&format!("{}/truncated", base), "slow.bin", &dir)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fetch(_)));
        assert!(!dir.join("slow.bin").exists());
        assert_eq!(leftover_parts(&dir), 0);
        assert!(fetcher.in_flight.lock().unwrap().is_empty());

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn dropped_fetch_still_cleans_up() {
        let (base, _hits) = artifact_server().await;
        let dir = scratch_dir();
        let fetcher = fetcher();
        let url = format!("{}/truncated", base);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), fetcher.fetch(&url, "slow.bin", &dir))
                .await;
        assert!(abandoned.is_err());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while (leftover_parts(&dir) > 0 || !fetcher.in_flight.lock().unwrap().is_empty())
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(leftover_parts(&dir), 0);
        assert!(fetcher.in_flight.lock().unwrap().is_empty());
        assert!(!dir.join("slow.bin").exists());

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn directory_at_target_is_not_an_artifact() {
        let (base, hits) = artifact_server().await;
        let dir = scratch_dir();
        std::fs::create_dir_all(dir.join("m.bin")).unwrap();

        let err = fetcher()
            .fetch(&format!("{}/m.bin", base), "m.bin", &dir)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fetch(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(dir.join("m.bin").is_dir());
        assert_eq!(leftover_parts(&dir), 0);

        std::fs::remove_dir_all(dir).ok();
    }
}
