// src/fetch.rs

//! Download transports and the parallel fetch pool
//!
//! A [`Transport`] turns a URL into a byte stream; `https`/`http` go
//! through a blocking reqwest client with a per-request timeout, and
//! `file://` serves local mirrors (and the test suite) through the
//! same pipeline. The [`Fetcher`] runs batches of artifact downloads
//! on a dedicated thread pool, streams each one into the
//! content-addressed cache, enforces an aggregate bandwidth cap via a
//! token bucket, and retries a failed download once before giving up.

use crate::cache::Cache;
use crate::config::DownloadConfig;
use crate::error::{Error, Result};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Source of bytes for a URL scheme
pub trait Transport: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Box<dyn Read + Send>>;
}

/// Production transport: `https`/`http` via reqwest, `file://` via the
/// local filesystem.
pub struct DefaultTransport {
    client: reqwest::blocking::Client,
}

impl DefaultTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Download {
                url: String::new(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

impl Transport for DefaultTransport {
    fn fetch(&self, url: &str) -> Result<Box<dyn Read + Send>> {
        if let Some(path) = url.strip_prefix("file://") {
            let file = File::open(PathBuf::from(path)).map_err(|e| Error::Download {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            return Ok(Box::new(file));
        }

        if !url.starts_with("https://") && !url.starts_with("http://") {
            return Err(Error::Download {
                url: url.to_string(),
                reason: "unsupported URL scheme".to_string(),
            });
        }

        let response = self.client.get(url).send().map_err(|e| Error::Download {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !response.status().is_success() {
            return Err(Error::Download {
                url: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }
        Ok(Box::new(response))
    }
}

/// Token bucket shared by all download workers
struct RateLimiter {
    bytes_per_sec: u64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            state: Mutex::new(BucketState {
                tokens: bytes_per_sec as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Block until `n` bytes of budget are available
    fn acquire(&self, n: usize) {
        loop {
            let wait = {
                let mut state = self.state.lock().expect("rate limiter poisoned");
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.last_refill = now;
                // The bucket never holds more than one second of budget,
                // which bounds bursts after idle periods.
                state.tokens = (state.tokens + elapsed * self.bytes_per_sec as f64)
                    .min(self.bytes_per_sec as f64);
                if state.tokens >= n as f64 {
                    state.tokens -= n as f64;
                    return;
                }
                let deficit = n as f64 - state.tokens;
                Duration::from_secs_f64(deficit / self.bytes_per_sec as f64)
            };
            std::thread::sleep(wait);
        }
    }
}

/// Reader adapter that charges the token bucket per chunk
struct ThrottledReader<R> {
    inner: R,
    limiter: Arc<RateLimiter>,
}

impl<R: Read> Read for ThrottledReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let want = buf.len().min(64 * 1024);
        let n = self.inner.read(&mut buf[..want])?;
        if n > 0 {
            self.limiter.acquire(n);
        }
        Ok(n)
    }
}

/// One artifact to download into the cache
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub url: String,
    /// Expected SHA-256 of the artifact, lowercase hex
    pub checksum: String,
}

/// Parallel downloader bound to a worker pool and an optional
/// bandwidth cap
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    pool: rayon::ThreadPool,
    limiter: Option<Arc<RateLimiter>>,
}

impl Fetcher {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let transport = DefaultTransport::new(Duration::from_secs(config.timeout_seconds))?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Construct with an explicit transport (tests, alternate mirrors)
    pub fn with_transport(config: &DownloadConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.parallelism)
            .thread_name(|i| format!("strata-fetch-{i}"))
            .build()
            .map_err(|e| Error::Download {
                url: String::new(),
                reason: format!("failed to build download pool: {e}"),
            })?;
        let limiter = (config.rate_limit_bytes_per_sec > 0)
            .then(|| Arc::new(RateLimiter::new(config.rate_limit_bytes_per_sec)));
        Ok(Self {
            transport,
            pool,
            limiter,
        })
    }

    fn open_stream(&self, url: &str) -> Result<Box<dyn Read + Send>> {
        let stream = self.transport.fetch(url)?;
        Ok(match &self.limiter {
            Some(limiter) => Box::new(ThrottledReader {
                inner: stream,
                limiter: Arc::clone(limiter),
            }),
            None => stream,
        })
    }

    /// Fetch a small document (catalog, key) fully into memory, with
    /// one retry on transient failure.
    pub fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.open_stream(url).and_then(|mut stream| {
                let mut bytes = Vec::new();
                stream.read_to_end(&mut bytes)?;
                Ok(bytes)
            });
            match result {
                Ok(bytes) => return Ok(bytes),
                Err(e) if attempt == 1 && e.is_transient() => {
                    warn!("Fetch of {url} failed ({e}), retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Download every job into the cache, in parallel up to the pool
    /// width. The first unrecoverable failure cancels the remaining
    /// queue cooperatively; each job gets one retry on checksum
    /// mismatch or transient failure before it is unrecoverable.
    pub fn fetch_into_cache(&self, jobs: &[FetchJob], cache: &Cache) -> Result<()> {
        use rayon::prelude::*;

        if jobs.is_empty() {
            return Ok(());
        }
        info!("Downloading {} artifact(s)", jobs.len());

        self.pool.install(|| {
            jobs.par_iter().try_for_each(|job| {
                if cache.has(&job.checksum) {
                    debug!("Cache hit for {}", job.url);
                    return Ok(());
                }
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    let result = self
                        .open_stream(&job.url)
                        .and_then(|stream| cache.insert(stream, &job.checksum));
                    match result {
                        Ok(size) => {
                            debug!("Downloaded {} ({size} bytes)", job.url);
                            return Ok(());
                        }
                        Err(e) if attempt == 1 && retryable(&e) => {
                            warn!("Download of {} failed ({e}), retrying once", job.url);
                        }
                        Err(e) => return Err(e),
                    }
                }
            })
        })
    }
}

fn retryable(e: &Error) -> bool {
    matches!(e, Error::ChecksumMismatch { .. }) || e.is_transient()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn test_config(parallelism: usize) -> DownloadConfig {
        DownloadConfig {
            parallelism,
            rate_limit_bytes_per_sec: 0,
            timeout_seconds: 5,
            transaction_timeout_seconds: 0,
        }
    }

    fn hash_of(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    #[test]
    fn test_file_transport_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.bin");
        std::fs::write(&path, b"mirror bytes").unwrap();

        let fetcher = Fetcher::new(&test_config(2)).unwrap();
        let url = format!("file://{}", path.display());
        assert_eq!(fetcher.fetch_bytes(&url).unwrap(), b"mirror bytes");
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        let fetcher = Fetcher::new(&test_config(1)).unwrap();
        let err = fetcher.fetch_bytes("ftp://mirror/INDEX");
        assert!(matches!(err, Err(Error::Download { .. })));
    }

    #[test]
    fn test_parallel_fetch_into_cache() {
        let dir = tempdir().unwrap();
        let cache = Cache::open_at(dir.path().join("cache"), 1 << 20).unwrap();

        let mut jobs = Vec::new();
        for i in 0..8 {
            let body = format!("artifact number {i}");
            let path = dir.path().join(format!("a{i}.pkg"));
            std::fs::write(&path, &body).unwrap();
            jobs.push(FetchJob {
                url: format!("file://{}", path.display()),
                checksum: hash_of(body.as_bytes()),
            });
        }

        let fetcher = Fetcher::new(&test_config(4)).unwrap();
        fetcher.fetch_into_cache(&jobs, &cache).unwrap();
        for job in &jobs {
            assert!(cache.has(&job.checksum));
        }
    }

    #[test]
    fn test_corrupt_artifact_fails_after_one_retry() {
        struct CountingTransport {
            calls: AtomicUsize,
        }
        impl Transport for CountingTransport {
            fn fetch(&self, _url: &str) -> Result<Box<dyn Read + Send>> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(&b"not what the index promised"[..]))
            }
        }

        let dir = tempdir().unwrap();
        let cache = Cache::open_at(dir.path(), 1 << 20).unwrap();
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
        });
        let fetcher = Fetcher::with_transport(&test_config(1), transport.clone()).unwrap();

        let jobs = [FetchJob {
            url: "https://mirror/pool/wi/widget_1.0_any.pkg".to_string(),
            checksum: hash_of(b"the real artifact"),
        }];
        let err = fetcher.fetch_into_cache(&jobs, &cache);
        assert!(matches!(err, Err(Error::ChecksumMismatch { .. })));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        // Neither the claimed nor the served hash may appear in cache.
        assert!(!cache.has(&jobs[0].checksum));
        assert!(!cache.has(&hash_of(b"not what the index promised")));
        assert_eq!(cache.total_bytes().unwrap(), 0);
    }

    #[test]
    fn test_rate_limiter_spreads_bytes() {
        let limiter = RateLimiter::new(100_000);
        let start = Instant::now();
        // First second of budget is free; the next chunk must wait.
        limiter.acquire(100_000);
        limiter.acquire(50_000);
        assert!(start.elapsed() >= Duration::from_millis(400));
    }
}
