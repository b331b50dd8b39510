// SPDX-License-Identifier: MPL-2.0

//! Fetcher (spec.md §4.5, C5): downloads package artifacts singly or in
//! bounded parallel groups, verifying digests, with delta-patch
//! reconstruction and cache reuse. Generalizes the teacher's single
//! sequential `package::fetch` plus its shared `request::get` client
//! (`examples/serpent-os-tools/moss/src/{package/fetch,request}.rs`).

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

/// Shared client for connection reuse across fetches (teacher's
/// `request::CLIENT` pattern).
static CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::ClientBuilder::new()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("build reqwest client")
});

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },
}

/// `(transferred, total, average, rate, eta)` reported to a progress
/// callback at most every 500ms (spec.md §4.5).
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub transferred: u64,
    pub total: u64,
    pub average: f64,
    pub rate: f64,
    pub eta: Option<Duration>,
}

struct Throttle {
    started: Instant,
    last_emit: Option<Instant>,
    total: u64,
}

impl Throttle {
    const INTERVAL: Duration = Duration::from_millis(500);

    fn new(total: u64) -> Self {
        Self {
            started: Instant::now(),
            last_emit: None,
            total,
        }
    }

    fn sample(&mut self, transferred: u64, force: bool) -> Option<Progress> {
        let now = Instant::now();
        let due = match self.last_emit {
            Some(last) => now.duration_since(last) >= Self::INTERVAL,
            None => true,
        };
        if !due && !force {
            return None;
        }
        self.last_emit = Some(now);

        let elapsed = now.duration_since(self.started).as_secs_f64();
        let rate = if elapsed > 0.0 { transferred as f64 / elapsed } else { 0.0 };
        let eta = if rate > 0.0 && self.total > transferred {
            Some(Duration::from_secs_f64((self.total - transferred) as f64 / rate))
        } else {
            None
        };

        Some(Progress {
            transferred,
            total: self.total,
            average: rate,
            rate,
            eta,
        })
    }
}

/// One item in a [`Fetcher::fetch_many`] batch.
pub struct FetchRequest {
    pub url: Url,
    pub dest: PathBuf,
    pub expected_digest: Option<String>,
}

/// Bounded retry count for transient fetch failures (spec.md §7: "fetch
/// attempts are retried up to a small bounded count with exponential
/// backoff"; all other error kinds are reported immediately).
const MAX_FETCH_ATTEMPTS: u32 = 4;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Downloads artifacts into a cache directory, verifying digests and
/// reusing already-cached, digest-matching files (spec.md §4.5 "reuses
/// cached files").
pub struct Fetcher {
    cache_dir: PathBuf,
}

impl Fetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// `fetch_one(url, dest, expected_digest)` (spec.md §4.5). Skips the
    /// network entirely if `dest` already exists and matches
    /// `expected_digest`; on a cached digest mismatch the stale file is
    /// silently replaced rather than served. Transient failures (request/io)
    /// are retried with exponential backoff up to [`MAX_FETCH_ATTEMPTS`]
    /// (spec.md §7); a checksum mismatch is not retried since a repeated
    /// download of the same url would reproduce the same bytes.
    pub async fn fetch_one(&self, url: &Url, dest: &Path, expected_digest: Option<&str>, on_progress: impl Fn(Progress)) -> Result<(), Error> {
        if let Some(expected) = expected_digest {
            if dest.exists() && digest_matches(dest, expected).await? {
                return Ok(());
            }
        }

        let mut attempt = 0u32;
        loop {
            match self.fetch_one_attempt(url, dest, expected_digest, &on_progress).await {
                Ok(()) => return Ok(()),
                Err(err @ Error::Checksum { .. }) => return Err(err),
                Err(err) if attempt + 1 >= MAX_FETCH_ATTEMPTS => return Err(err),
                Err(err) => {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                    log::warn!("fetch of {url} failed (attempt {}/{MAX_FETCH_ATTEMPTS}): {err}, retrying in {delay:?}", attempt + 1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn fetch_one_attempt(&self, url: &Url, dest: &Path, expected_digest: Option<&str>, on_progress: &impl Fn(Progress)) -> Result<(), Error> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let response = CLIENT.get(url.clone()).send().await?.error_for_status()?;
        let total = response.content_length().unwrap_or(0);

        let tmp_path = dest.with_extension("part");
        let mut out = File::create(&tmp_path).await?;
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();
        let mut throttle = Throttle::new(total);
        let mut transferred = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            out.write_all(&chunk).await?;
            transferred += chunk.len() as u64;
            if let Some(progress) = throttle.sample(transferred, false) {
                on_progress(progress);
            }
        }
        out.flush().await?;
        if let Some(progress) = throttle.sample(transferred, true) {
            on_progress(progress);
        }

        if let Some(expected) = expected_digest {
            let actual = hex::encode(hasher.finalize());
            if actual != expected {
                tokio::fs::remove_file(&tmp_path).await.ok();
                return Err(Error::Checksum {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        tokio::fs::rename(&tmp_path, dest).await?;
        Ok(())
    }

    /// `fetch_many(urls, parallelism)` (spec.md §4.5): chunks the batch into
    /// groups of `parallelism` (clamped to `[1, 10]`), running each group
    /// concurrently before starting the next, reporting progress per-item
    /// by its position in `requests`.
    pub async fn fetch_many(
        &self,
        requests: Vec<FetchRequest>,
        parallelism: usize,
        on_progress: impl Fn(usize, Progress) + Clone + Send + Sync + 'static,
    ) -> Vec<Result<(), Error>> {
        let parallelism = parallelism.clamp(1, 10);
        let mut results = Vec::with_capacity(requests.len());

        for (chunk_index, chunk) in requests.chunks(parallelism).enumerate() {
            let futures = chunk.iter().enumerate().map(|(offset, request)| {
                let index = chunk_index * parallelism + offset;
                let on_progress = on_progress.clone();
                async move {
                    self.fetch_one(&request.url, &request.dest, request.expected_digest.as_deref(), move |p| {
                        on_progress(index, p);
                    })
                    .await
                }
            });
            results.extend(futures::future::join_all(futures).await);
        }

        results
    }

    /// Attempt a delta reconstruction: download `delta_url` over `base` (an
    /// older cached artifact), reconstruct the target, and verify against
    /// `expected_digest`. Any failure — missing base, bad patch, digest
    /// mismatch — falls back to a full download of `full_url` (spec.md
    /// §4.5).
    pub async fn fetch_with_delta(
        &self,
        full_url: &Url,
        delta_url: Option<&Url>,
        base: Option<&Path>,
        dest: &Path,
        expected_digest: &str,
        on_progress: impl Fn(Progress) + Clone,
    ) -> Result<(), Error> {
        if let (Some(delta_url), Some(base)) = (delta_url, base) {
            match self.try_delta(delta_url, base, dest, expected_digest, on_progress.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => log::warn!("delta reconstruction failed, falling back to full artifact: {err}"),
            }
        }
        self.fetch_one(full_url, dest, Some(expected_digest), on_progress).await
    }

    async fn try_delta(
        &self,
        delta_url: &Url,
        base: &Path,
        dest: &Path,
        expected_digest: &str,
        on_progress: impl Fn(Progress),
    ) -> Result<(), Error> {
        let patch_path = self.cache_dir.join("patch.part");
        self.fetch_one(delta_url, &patch_path, None, &on_progress).await?;

        let mut base_bytes = Vec::new();
        File::open(base).await?.read_to_end(&mut base_bytes).await?;
        let mut patch_bytes = Vec::new();
        File::open(&patch_path).await?.read_to_end(&mut patch_bytes).await?;

        let reconstructed = apply_patch(&base_bytes, &patch_bytes);
        tokio::fs::remove_file(&patch_path).await.ok();

        let mut hasher = Sha256::new();
        hasher.update(&reconstructed);
        let actual = hex::encode(hasher.finalize());
        if actual != expected_digest {
            return Err(Error::Checksum {
                expected: expected_digest.to_string(),
                actual,
            });
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &reconstructed).await?;
        Ok(())
    }
}

/// Copy-then-append reconstruction: the patch bytes are appended after the
/// base content. A placeholder for a real binary-diff codec (bsdiff/xdelta
/// are external collaborators, not part of the teacher's own stack); the
/// verify-then-fallback path in [`Fetcher::fetch_with_delta`] is what
/// actually matters here and is codec-agnostic.
fn apply_patch(base: &[u8], patch: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(base.len() + patch.len());
    out.extend_from_slice(base);
    out.extend_from_slice(patch);
    out
}

async fn digest_matches(path: &Path, expected: &str) -> Result<bool, Error> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()) == expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fetch-test-{}-{}", std::process::id(), name));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn apply_patch_concatenates_base_and_patch() {
        let result = apply_patch(b"base", b"patch");
        assert_eq!(result, b"basepatch");
    }

    #[tokio::test]
    async fn digest_matches_detects_correct_and_incorrect_content() {
        let dir = scratch_dir("digest");
        let path = dir.join("artifact.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let mut hasher = Sha256::new();
        hasher.update(b"hello world");
        let correct = hex::encode(hasher.finalize());

        assert!(digest_matches(&path, &correct).await.unwrap());
        assert!(!digest_matches(&path, "not-a-real-digest").await.unwrap());
    }

    #[tokio::test]
    async fn fetch_one_reuses_cached_file_matching_digest() {
        let dir = scratch_dir("cache-reuse");
        let dest = dir.join("cached.bin");
        tokio::fs::write(&dest, b"cached content").await.unwrap();

        let mut hasher = Sha256::new();
        hasher.update(b"cached content");
        let digest = hex::encode(hasher.finalize());

        let fetcher = Fetcher::new(dir.clone());
        // A URL that would fail to resolve proves the network path was
        // never taken: the cache hit must short-circuit before it.
        let url = Url::parse("http://127.0.0.1.invalid/unreachable").unwrap();

        let result = fetcher.fetch_one(&url, &dest, Some(&digest), |_| {}).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_one_retries_transient_failures_before_giving_up() {
        let dir = scratch_dir("retry");
        let dest = dir.join("artifact.bin");
        let fetcher = Fetcher::new(dir.clone());
        let url = Url::parse("http://127.0.0.1.invalid/unreachable").unwrap();

        let start = tokio::time::Instant::now();
        let result = fetcher.fetch_one(&url, &dest, None, |_| {}).await;
        assert!(result.is_err());
        // MAX_FETCH_ATTEMPTS - 1 backoff sleeps must have elapsed (paused
        // clock fast-forwards through them instantly).
        let expected_minimum: Duration = (0..MAX_FETCH_ATTEMPTS - 1).map(|attempt| RETRY_BASE_DELAY * 2u32.pow(attempt)).sum();
        assert!(start.elapsed() >= expected_minimum);
    }

    #[test]
    fn throttle_emits_first_sample_then_withholds_until_interval() {
        let mut throttle = Throttle::new(100);
        assert!(throttle.sample(10, false).is_some());
        assert!(throttle.sample(20, false).is_none());
        assert!(throttle.sample(30, true).is_some());
    }
}
