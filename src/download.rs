//! Source acquisition with a content-addressed cache and bounded retries.
//!
//! Archives are cached at `<cache>/<sha256>` (or `<cache>/url-<sha256 of url>` for
//! local sources without a declared digest). Fresh downloads land in
//! `<cache>/tmp` first and are renamed into place only after they pass
//! verification, so a cache key never names unverified bytes.
//!
//! Acquisition is split in two so callers can observe the phases separately:
//! [`SourceFetcher::acquire`] fetches (or finds a verified cache entry) and
//! [`Acquired::verify`] checks the digest and publishes the archive.

use crate::error::{InstallError, Result};
use crate::formula::{FormulaRecord, SourceLocation};
use crate::lock::KeyedLocks;
use crate::verify::{self, Digest};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{NamedTempFile, TempPath};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Failure of one transfer attempt
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Worth another attempt (connection reset, 5xx, timeout)
    #[error("{0}")]
    Transient(String),
    /// Retrying cannot help (404, missing local file)
    #[error("{0}")]
    Permanent(String),
}

/// Moves the bytes behind a locator into a local file.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write the resource at `url` to `dest`, returning the number of bytes written.
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<&ProgressBar>,
    ) -> std::result::Result<u64, TransportError>;
}

/// HTTP(S) through reqwest, `file://` URLs and plain paths from the local filesystem.
#[derive(Clone)]
pub struct DefaultTransport {
    client: reqwest::Client,
}

impl DefaultTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(format!("kegsmith/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    async fn download_http(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<&ProgressBar>,
    ) -> std::result::Result<u64, TransportError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("server returned {}", status);
            let transient = status.is_server_error()
                || status == reqwest::StatusCode::REQUEST_TIMEOUT
                || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
            return Err(if transient {
                TransportError::Transient(message)
            } else {
                TransportError::Permanent(message)
            });
        }

        if let Some(pb) = progress
            && let Some(total) = response.content_length()
        {
            pb.set_length(total);
        }

        let mut file = fs::File::create(dest)
            .await
            .map_err(|e| TransportError::Permanent(format!("cannot create {}: {}", dest.display(), e)))?;
        let mut downloaded: u64 = 0;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| TransportError::Transient(format!("transfer interrupted: {}", e)))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| TransportError::Permanent(format!("write failed: {}", e)))?;
            downloaded += chunk.len() as u64;
            if let Some(pb) = progress {
                pb.set_position(downloaded);
            }
        }

        file.flush()
            .await
            .map_err(|e| TransportError::Permanent(format!("write failed: {}", e)))?;

        Ok(downloaded)
    }
}

#[async_trait]
impl Transport for DefaultTransport {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<&ProgressBar>,
    ) -> std::result::Result<u64, TransportError> {
        match SourceLocation::parse(url) {
            SourceLocation::Remote(url) => self.download_http(&url, dest, progress).await,
            SourceLocation::Local(path) => fs::copy(&path, dest).await.map_err(|e| {
                let message = format!("cannot read {}: {}", path.display(), e);
                if e.kind() == std::io::ErrorKind::NotFound {
                    TransportError::Permanent(message)
                } else {
                    TransportError::Transient(message)
                }
            }),
        }
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// A verified archive in the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSource {
    pub path: PathBuf,
    pub digest: Digest,
    /// Served from the cache without touching the transport
    pub cached: bool,
}

/// Fetched bytes awaiting verification. Holds the cache key's lock.
pub struct PendingDownload {
    temp: TempPath,
    key_path: PathBuf,
    expected: Option<Digest>,
    _guard: OwnedMutexGuard<()>,
}

/// Result of [`SourceFetcher::acquire`]
pub enum Acquired {
    Cached(FetchedSource),
    Pending(PendingDownload),
}

impl Acquired {
    /// Verify fetched bytes and publish them under their cache key.
    ///
    /// A mismatch discards the bytes; nothing is cached.
    pub async fn verify(self) -> Result<FetchedSource> {
        let pending = match self {
            Acquired::Cached(source) => return Ok(source),
            Acquired::Pending(pending) => pending,
        };
        let PendingDownload {
            temp,
            key_path,
            expected,
            _guard,
        } = pending;

        let (temp, actual) = tokio::task::spawn_blocking(move || {
            let digest = Digest::of_file(&temp);
            (temp, digest)
        })
        .await
        .map_err(|e| anyhow!("digest task failed: {}", e))?;
        let actual = actual?;

        if let Some(expected) = &expected {
            verify::compare(expected, &actual)?;
        }

        temp.persist(&key_path).map_err(|e| e.error)?;
        tracing::debug!(path = %key_path.display(), digest = %actual, "cached verified archive");

        Ok(FetchedSource {
            path: key_path,
            digest: actual,
            cached: false,
        })
    }
}

/// Fetches formula sources into the shared download cache
pub struct SourceFetcher {
    cache_dir: PathBuf,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    locks: KeyedLocks,
    progress: Option<MultiProgress>,
}

impl SourceFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>, transport: Arc<dyn Transport>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            transport,
            retry: RetryPolicy::default(),
            locks: KeyedLocks::new(),
            progress: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Show a progress bar per download
    pub fn with_progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Cache location for a formula's source
    pub fn cache_path(&self, formula: &FormulaRecord) -> PathBuf {
        self.cache_dir.join(cache_key(formula))
    }

    /// Fetch and verify in one call.
    pub async fn fetch(
        &self,
        formula: &FormulaRecord,
        cancel: &CancellationToken,
    ) -> Result<FetchedSource> {
        self.acquire(formula, cancel).await?.verify().await
    }

    /// Return a verified cache entry, or download the source with retries.
    pub async fn acquire(
        &self,
        formula: &FormulaRecord,
        cancel: &CancellationToken,
    ) -> Result<Acquired> {
        let key = cache_key(formula);
        let key_path = self.cache_dir.join(&key);
        let expected = formula.sha256.clone();

        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InstallError::Cancelled),
            guard = self.locks.lock(&key) => guard,
        };

        if let Some(source) = self.cached(&key_path, expected.as_ref()).await? {
            tracing::debug!(formula = %formula.name, path = %source.path.display(), "cache hit");
            return Ok(Acquired::Cached(source));
        }

        let tmp_dir = self.cache_dir.join("tmp");
        fs::create_dir_all(&tmp_dir)
            .await
            .with_context(|| format!("Failed to create cache directory: {}", tmp_dir.display()))?;

        let pb = self.progress_bar(formula);
        let mut last_error = String::new();

        for attempt in 1..=self.retry.attempts.max(1) {
            let temp = NamedTempFile::new_in(&tmp_dir)?.into_temp_path();

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(InstallError::Cancelled),
                result = self.transport.download(&formula.url, &temp, pb.as_ref()) => result,
            };

            match result {
                Ok(bytes) => {
                    if let Some(pb) = &pb {
                        pb.finish_with_message(format!("✓ {}", formula.name));
                    }
                    tracing::debug!(formula = %formula.name, bytes, attempt, "downloaded source");
                    return Ok(Acquired::Pending(PendingDownload {
                        temp,
                        key_path,
                        expected,
                        _guard: guard,
                    }));
                }
                Err(TransportError::Permanent(reason)) => {
                    if let Some(pb) = &pb {
                        pb.abandon_with_message(format!("✗ {}", formula.name));
                    }
                    return Err(InstallError::FetchFailed {
                        url: formula.url.clone(),
                        attempts: attempt,
                        reason,
                    });
                }
                Err(TransportError::Transient(reason)) => {
                    last_error = reason;
                    if attempt < self.retry.attempts {
                        let delay = self.retry.delay(attempt);
                        tracing::warn!(
                            formula = %formula.name,
                            attempt,
                            error = %last_error,
                            "fetch failed, retrying in {:?}",
                            delay
                        );
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(InstallError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        if let Some(pb) = &pb {
            pb.abandon_with_message(format!("✗ {}", formula.name));
        }
        Err(InstallError::FetchFailed {
            url: formula.url.clone(),
            attempts: self.retry.attempts.max(1),
            reason: last_error,
        })
    }

    /// A usable cache entry, evicting one that no longer matches its digest.
    async fn cached(
        &self,
        key_path: &Path,
        expected: Option<&Digest>,
    ) -> Result<Option<FetchedSource>> {
        if !key_path.is_file() {
            return Ok(None);
        }

        let path = key_path.to_path_buf();
        let actual = tokio::task::spawn_blocking(move || Digest::of_file(&path))
            .await
            .map_err(|e| anyhow!("digest task failed: {}", e))??;

        match expected {
            Some(expected) if *expected != actual => {
                tracing::warn!(
                    path = %key_path.display(),
                    expected = %expected,
                    actual = %actual,
                    "evicting corrupt cache entry"
                );
                fs::remove_file(key_path).await?;
                Ok(None)
            }
            _ => Ok(Some(FetchedSource {
                path: key_path.to_path_buf(),
                digest: actual,
                cached: true,
            })),
        }
    }

    fn progress_bar(&self, formula: &FormulaRecord) -> Option<ProgressBar> {
        let mp = self.progress.as_ref()?;
        let pb = mp.add(ProgressBar::new(0));
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_message(format!("⬇ {}", formula.name));
        Some(pb)
    }
}

/// Cache key: the declared digest, or a hash of the locator when there is none.
pub fn cache_key(formula: &FormulaRecord) -> String {
    match &formula.sha256 {
        Some(digest) => digest.to_string(),
        None => format!("url-{}", Digest::of_bytes(formula.url.as_bytes())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::InstallStep;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then serves `body`.
    struct FlakyTransport {
        body: Vec<u8>,
        failures: u32,
        permanent: bool,
        calls: AtomicU32,
    }

    impl FlakyTransport {
        fn new(body: &[u8], failures: u32) -> Self {
            Self {
                body: body.to_vec(),
                failures,
                permanent: false,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn download(
            &self,
            _url: &str,
            dest: &Path,
            _progress: Option<&ProgressBar>,
        ) -> std::result::Result<u64, TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                let message = format!("connection reset (call {})", call);
                return Err(if self.permanent {
                    TransportError::Permanent(message)
                } else {
                    TransportError::Transient(message)
                });
            }
            std::fs::write(dest, &self.body).map_err(|e| TransportError::Permanent(e.to_string()))?;
            Ok(self.body.len() as u64)
        }
    }

    fn formula(body: &[u8]) -> FormulaRecord {
        FormulaRecord {
            name: "libx".into(),
            desc: None,
            homepage: None,
            license: None,
            url: "https://example.com/libx-1.0.0.tar.gz".into(),
            sha256: Some(Digest::of_bytes(body)),
            version: None,
            dependencies: vec![],
            options: vec![],
            install: vec![InstallStep::Shell("true".into())],
            test: None,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_retries_then_caches() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FlakyTransport::new(b"archive", 2));
        let fetcher = SourceFetcher::new(dir.path(), transport.clone()).with_retry(fast_retry());
        let formula = formula(b"archive");
        let cancel = CancellationToken::new();

        let fetched = fetcher.fetch(&formula, &cancel).await.unwrap();
        assert!(!fetched.cached);
        assert_eq!(fetched.path, dir.path().join(formula.sha256.as_ref().unwrap().as_hex()));
        assert_eq!(std::fs::read(&fetched.path).unwrap(), b"archive");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);

        let again = fetcher.fetch(&formula, &cancel).await.unwrap();
        assert!(again.cached);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_last_error() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FlakyTransport::new(b"archive", 10));
        let fetcher = SourceFetcher::new(dir.path(), transport.clone()).with_retry(fast_retry());

        let err = fetcher
            .fetch(&formula(b"archive"), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            InstallError::FetchFailed { attempts, reason, .. } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("call 3"), "{}", reason);
            }
            other => panic!("expected FetchFailed, got {:?}", other),
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = FlakyTransport::new(b"archive", 10);
        transport.permanent = true;
        let transport = Arc::new(transport);
        let fetcher = SourceFetcher::new(dir.path(), transport.clone()).with_retry(fast_retry());

        let err = fetcher
            .fetch(&formula(b"archive"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::FetchFailed { attempts: 1, .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mismatch_is_never_cached() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FlakyTransport::new(b"tampered", 0));
        let fetcher = SourceFetcher::new(dir.path(), transport).with_retry(fast_retry());
        let formula = formula(b"archive");

        let err = fetcher
            .fetch(&formula, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::IntegrityMismatch { .. }));
        assert!(!fetcher.cache_path(&formula).exists());
        assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_cache_entry_is_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FlakyTransport::new(b"archive", 0));
        let fetcher = SourceFetcher::new(dir.path(), transport.clone()).with_retry(fast_retry());
        let formula = formula(b"archive");
        std::fs::write(fetcher.cache_path(&formula), b"bit rot").unwrap();

        let fetched = fetcher.fetch(&formula, &CancellationToken::new()).await.unwrap();
        assert!(!fetched.cached);
        assert_eq!(std::fs::read(&fetched.path).unwrap(), b"archive");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_source_without_digest_keyed_by_url() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("libx-1.0.0.tar.gz");
        std::fs::write(&archive, b"local bytes").unwrap();

        let mut formula = formula(b"");
        formula.url = format!("file://{}", archive.display());
        formula.sha256 = None;

        let fetcher = SourceFetcher::new(dir.path().join("cache"), Arc::new(DefaultTransport::new().unwrap()));
        let fetched = fetcher.fetch(&formula, &CancellationToken::new()).await.unwrap();

        assert!(cache_key(&formula).starts_with("url-"));
        assert_eq!(fetched.digest, Digest::of_bytes(b"local bytes"));
    }

    #[tokio::test]
    async fn test_cancelled_before_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = SourceFetcher::new(dir.path(), Arc::new(FlakyTransport::new(b"archive", 0)));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fetcher.fetch(&formula(b"archive"), &cancel).await.unwrap_err();
        assert!(matches!(err, InstallError::Cancelled));
    }
}
