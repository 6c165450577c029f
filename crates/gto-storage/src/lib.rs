//! Atomic run-artifact storage + retrying HTTP utilities for the GTO pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gto-storage";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub name: String,
    pub content_hash: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Owns the output directory: per-run artifact folders plus the published
/// fixed-name files at the root.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir().join(run_id.to_string())
    }

    pub fn published_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Write `bytes` to `dir/name` via temp file + rename; readers never see a partial file.
    pub async fn store_bytes(
        &self,
        dir: &Path,
        name: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let absolute_path = dir.join(name);
        write_atomic(&absolute_path, bytes).await?;
        Ok(StoredArtifact {
            name: name.to_string(),
            content_hash: Self::sha256_hex(bytes),
            absolute_path,
            byte_size: bytes.len(),
        })
    }

    pub async fn store_json<T: Serialize + ?Sized>(
        &self,
        dir: &Path,
        name: &str,
        value: &T,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing artifact {name}"))?;
        self.store_bytes(dir, name, &bytes).await
    }

    pub async fn store_text(
        &self,
        dir: &Path,
        name: &str,
        text: &str,
    ) -> anyhow::Result<StoredArtifact> {
        self.store_bytes(dir, name, text.as_bytes()).await
    }

    /// Copy a run artifact over the fixed-name file at the store root.
    pub async fn publish(&self, artifact: &StoredArtifact) -> anyhow::Result<PathBuf> {
        let bytes = fs::read(&artifact.absolute_path)
            .await
            .with_context(|| format!("reading artifact {}", artifact.absolute_path.display()))?;
        let target = self.published_path(&artifact.name);
        write_atomic(&target, &bytes).await?;
        Ok(target)
    }
}

async fn write_atomic(absolute_path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = absolute_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating artifact directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, absolute_path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp artifact {} -> {}",
                temp_path.display(),
                absolute_path.display()
            )
        });
    }
    Ok(())
}

pub async fn read_text_file(path: impl AsRef<Path>) -> anyhow::Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))
}

pub async fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let text = read_text_file(path).await?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
}

/// JSON-over-HTTP client that retries transient failures with capped exponential backoff.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    pub async fn post_json(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_post", url);
        self.post_json_with_retries(url, bearer_token, payload)
            .instrument(span)
            .await
    }

    async fn post_json_with_retries(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.post(url).json(payload);
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(attempt, status = status.as_u16(), delay_ms = delay.as_millis() as u64, "retrying request");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying request");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::{extract::State, routing::post, Router};
    use tempfile::tempdir;

    fn fast_client(max_retries: usize) -> HttpClient {
        HttpClient::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("gto-test".into()),
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        })
        .unwrap()
    }

    async fn spawn_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_writes_replace_content_and_leave_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let run_dir = store.run_dir(Uuid::new_v4());

        store
            .store_text(&run_dir, "market_analysis.txt", "first")
            .await
            .expect("first store");
        let second = store
            .store_text(&run_dir, "market_analysis.txt", "second")
            .await
            .expect("second store");

        assert_eq!(second.byte_size, 6);
        assert_eq!(second.content_hash, ArtifactStore::sha256_hex(b"second"));
        assert_eq!(std::fs::read_to_string(&second.absolute_path).unwrap(), "second");

        let leftovers = std::fs::read_dir(&run_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn publish_copies_run_artifact_to_fixed_name() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let run_dir = store.run_dir(Uuid::new_v4());

        let stored = store
            .store_json(&run_dir, "gto_recommendations.json", &serde_json::json!([{"property_id": "a"}]))
            .await
            .unwrap();
        let published = store.publish(&stored).await.unwrap();

        assert_eq!(published, dir.path().join("gto_recommendations.json"));
        let value: serde_json::Value = read_json_file(&published).await.unwrap();
        assert_eq!(value[0]["property_id"], "a");
        assert!(stored.absolute_path.exists());
    }

    #[tokio::test]
    async fn reading_missing_file_reports_path() {
        let dir = tempdir().expect("tempdir");
        let err = read_text_file(dir.path().join("nope.txt")).await.unwrap_err();
        assert!(err.to_string().contains("nope.txt"));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn status_classification_retries_throttling_and_server_errors_only() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn post_json_retries_server_errors_then_succeeds() {
        async fn flaky(State(hits): State<Arc<AtomicUsize>>) -> (axum::http::StatusCode, String) {
            if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                (axum::http::StatusCode::SERVICE_UNAVAILABLE, "busy".into())
            } else {
                (axum::http::StatusCode::OK, r#"{"ok":true}"#.into())
            }
        }

        let hits = Arc::new(AtomicUsize::new(0));
        let base = spawn_server(Router::new().route("/echo", post(flaky)).with_state(hits.clone())).await;

        let resp = fast_client(3)
            .post_json(&format!("{base}/echo"), Some("sk-test"), &serde_json::json!({"q": 1}))
            .await
            .expect("eventually succeeds");

        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, br#"{"ok":true}"#.to_vec());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn post_json_does_not_retry_client_errors() {
        async fn denied(State(hits): State<Arc<AtomicUsize>>) -> (axum::http::StatusCode, String) {
            hits.fetch_add(1, Ordering::SeqCst);
            (axum::http::StatusCode::UNAUTHORIZED, "bad key".into())
        }

        let hits = Arc::new(AtomicUsize::new(0));
        let base = spawn_server(Router::new().route("/echo", post(denied)).with_state(hits.clone())).await;

        let err = fast_client(3)
            .post_json(&format!("{base}/echo"), None, &serde_json::json!({}))
            .await
            .unwrap_err();

        match err {
            FetchError::HttpStatus { status, body, .. } => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad key");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
