// Large-file download with strategy fallback.
//
// Strategies are tried in order; the first one that leaves a plausibly-sized (and, when a digest
// is configured, matching) file on disk wins. Only the terminal result leaves this module.

use anyhow::{Context, Result};
use async_trait::async_trait;
use indicatif::{HumanBytes, HumanDuration};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, Duration, Instant};

use crate::error::{DeployError, DeployResult};
use crate::utils::logging::mask_url_query;

const BACKGROUND_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Progress lines are emitted at most this often.
const PROGRESS_LOG_GATE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Background,
    Streamed,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Background => write!(f, "background"),
            StrategyKind::Streamed => write!(f, "streamed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadResult {
    /// Bytes transferred by this call; zero when an existing file was reused.
    pub bytes: u64,
    pub file_size: u64,
    pub average_throughput: f64,
    /// `None` when an existing file was reused.
    pub strategy: Option<StrategyKind>,
    pub elapsed: Duration,
}

/// One way of moving bytes from a URL into a file.
#[async_trait]
pub trait TransferStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Transfer `url` into `destination`, returning the number of bytes written.
    async fn transfer(&self, url: &str, destination: &Path) -> Result<u64>;
}

/// Shared counters between a running transfer and whoever reports on it.
#[derive(Debug, Default)]
pub struct TransferProgress {
    pub transferred: AtomicU64,
    /// Zero while unknown.
    pub total: AtomicU64,
}

async fn stream_to_file(
    client: &reqwest::Client,
    url: &str,
    destination: &Path,
    progress: Option<&TransferProgress>,
) -> Result<u64> {
    let mut response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Request failed for {}", mask_url_query(url)))?;
    if !response.status().is_success() {
        anyhow::bail!("HTTP {} for {}", response.status(), mask_url_query(url));
    }
    if let (Some(p), Some(len)) = (progress, response.content_length()) {
        p.total.store(len, Ordering::Relaxed);
    }

    let mut file = tokio::fs::File::create(destination)
        .await
        .with_context(|| format!("Failed to create {:?}", destination))?;
    let mut written: u64 = 0;
    while let Some(chunk) = response
        .chunk()
        .await
        .context("Failed to read response body")?
    {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write {:?}", destination))?;
        written += chunk.len() as u64;
        if let Some(p) = progress {
            p.transferred.store(written, Ordering::Relaxed);
        }
    }
    file.flush().await.context("Failed to flush download")?;
    file.sync_all().await.context("Failed to sync download")?;
    Ok(written)
}

/// Human progress line: "12.00 MiB / 500.00 MiB (2%) at 1.00 MiB/s, ETA 8 minutes".
pub fn format_progress_line(transferred: u64, total: Option<u64>, rate_bytes_per_sec: f64) -> String {
    let rate = HumanBytes(rate_bytes_per_sec.max(0.0) as u64);
    match total.filter(|t| *t > 0) {
        Some(total) => {
            let pct = (transferred.saturating_mul(100) / total).min(100);
            // Server-advertised lengths can push the estimate past what `Duration` holds.
            let eta = Some(rate_bytes_per_sec)
                .filter(|r| *r > 0.0)
                .and_then(|r| {
                    Duration::try_from_secs_f64(total.saturating_sub(transferred) as f64 / r).ok()
                })
                .map(|d| HumanDuration(d).to_string())
                .unwrap_or_else(|| "unknown".to_string());
            format!(
                "{} / {} ({}%) at {}/s, ETA {}",
                HumanBytes(transferred),
                HumanBytes(total),
                pct,
                rate,
                eta
            )
        }
        None => format!("{} at {}/s", HumanBytes(transferred), rate),
    }
}

/// Transfer runs on its own task; this side polls the shared counters and reports progress.
pub struct BackgroundTransfer {
    client: reqwest::Client,
    poll_interval: Duration,
    log_gate: Duration,
    deadline: Duration,
}

impl BackgroundTransfer {
    pub fn new(client: reqwest::Client, deadline: Duration) -> Self {
        Self {
            client,
            poll_interval: BACKGROUND_POLL_INTERVAL,
            log_gate: PROGRESS_LOG_GATE,
            deadline,
        }
    }
}

#[async_trait]
impl TransferStrategy for BackgroundTransfer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Background
    }

    async fn transfer(&self, url: &str, destination: &Path) -> Result<u64> {
        let progress = Arc::new(TransferProgress::default());
        let client = self.client.clone();
        let url_owned = url.to_string();
        let dest_owned: PathBuf = destination.to_path_buf();
        let task_progress = progress.clone();

        let mut handle = tokio::spawn(async move {
            stream_to_file(&client, &url_owned, &dest_owned, Some(&task_progress)).await
        });

        let started = Instant::now();
        let mut last_report = started;
        let mut last_bytes: u64 = 0;
        loop {
            tokio::select! {
                joined = &mut handle => {
                    let result = joined.context("Background transfer task failed")?;
                    return result;
                }
                _ = sleep(self.poll_interval) => {
                    if started.elapsed() >= self.deadline {
                        handle.abort();
                        anyhow::bail!(
                            "Background transfer did not finish within {}s",
                            self.deadline.as_secs()
                        );
                    }
                    let now = Instant::now();
                    let since = now.duration_since(last_report);
                    if since >= self.log_gate {
                        let bytes = progress.transferred.load(Ordering::Relaxed);
                        let total = progress.total.load(Ordering::Relaxed);
                        let rate = bytes.saturating_sub(last_bytes) as f64 / since.as_secs_f64();
                        info!(
                            "[PHASE: docker_install] [STEP: download] {}",
                            format_progress_line(bytes, Some(total), rate)
                        );
                        last_report = now;
                        last_bytes = bytes;
                    }
                }
            }
        }
    }
}

/// Plain streamed GET, no progress reporting.
pub struct StreamedTransfer {
    client: reqwest::Client,
    deadline: Duration,
}

impl StreamedTransfer {
    pub fn new(client: reqwest::Client, deadline: Duration) -> Self {
        Self { client, deadline }
    }
}

#[async_trait]
impl TransferStrategy for StreamedTransfer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Streamed
    }

    async fn transfer(&self, url: &str, destination: &Path) -> Result<u64> {
        tokio::time::timeout(self.deadline, stream_to_file(&self.client, url, destination, None))
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "Streamed transfer did not finish within {}s",
                    self.deadline.as_secs()
                )
            })?
    }
}

pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {:?}", path))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await.context("Failed to read for hashing")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

async fn file_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(
            "[PHASE: docker_install] [STEP: download] Removed partial file {:?}",
            path
        ),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            "[PHASE: docker_install] [STEP: download] Failed to remove partial file {:?}: {}",
            path, e
        ),
    }
}

async fn validate_download(path: &Path, minimum_size: u64, sha256: Option<&str>) -> Result<u64> {
    let size = file_size(path)
        .await
        .ok_or_else(|| anyhow::anyhow!("Transfer reported success but {:?} is missing", path))?;
    if size < minimum_size {
        anyhow::bail!(
            "Downloaded file is {} bytes, below the {} byte minimum",
            size,
            minimum_size
        );
    }
    if let Some(expected) = sha256 {
        let actual = sha256_file(path).await?;
        if !actual.eq_ignore_ascii_case(expected) {
            anyhow::bail!("SHA-256 mismatch (expected {}, got {})", expected, actual);
        }
    }
    Ok(size)
}

pub struct DownloadManager {
    strategies: Vec<Box<dyn TransferStrategy>>,
}

impl DownloadManager {
    pub fn new(strategies: Vec<Box<dyn TransferStrategy>>) -> Self {
        Self { strategies }
    }

    /// Background transfer first, then a plain streamed GET.
    pub fn standard(deadline: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::new(vec![
            Box::new(BackgroundTransfer::new(client.clone(), deadline)),
            Box::new(StreamedTransfer::new(client, deadline)),
        ]))
    }

    pub async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        minimum_size: u64,
        sha256: Option<&str>,
    ) -> DeployResult<DownloadResult> {
        let started = Instant::now();
        let masked = mask_url_query(url);
        info!(
            "[PHASE: docker_install] [STEP: download] fetch entered (url={}, dest={:?}, minimum_size={})",
            masked, destination, minimum_size
        );

        if let Some(size) = file_size(destination).await {
            if size >= minimum_size {
                let reusable = match sha256 {
                    Some(_) => validate_download(destination, minimum_size, sha256).await.is_ok(),
                    None => true,
                };
                if reusable {
                    info!(
                        "[PHASE: docker_install] [STEP: download] Reusing existing file ({})",
                        HumanBytes(size)
                    );
                    return Ok(DownloadResult {
                        bytes: 0,
                        file_size: size,
                        average_throughput: 0.0,
                        strategy: None,
                        elapsed: started.elapsed(),
                    });
                }
            }
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| DeployError::Download {
                url: masked.clone(),
                attempts: 0,
                last_error: format!("cannot create {:?}: {}", parent, e),
            })?;
        }

        let mut attempts = 0usize;
        let mut last_error = "no transfer strategy configured".to_string();
        for strategy in &self.strategies {
            attempts += 1;
            remove_partial(destination).await;
            let attempt_started = Instant::now();
            info!(
                "[PHASE: docker_install] [STEP: download] Trying {} transfer (attempt {})",
                strategy.kind(),
                attempts
            );

            let outcome = match strategy.transfer(url, destination).await {
                Ok(_) => validate_download(destination, minimum_size, sha256).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(size) => {
                    let secs = attempt_started.elapsed().as_secs_f64();
                    let throughput = if secs > 0.0 { size as f64 / secs } else { 0.0 };
                    info!(
                        "[PHASE: docker_install] [STEP: download] fetch exit ok (strategy={}, size={}, throughput={}/s, duration_ms={})",
                        strategy.kind(),
                        HumanBytes(size),
                        HumanBytes(throughput as u64),
                        started.elapsed().as_millis()
                    );
                    return Ok(DownloadResult {
                        bytes: size,
                        file_size: size,
                        average_throughput: throughput,
                        strategy: Some(strategy.kind()),
                        elapsed: started.elapsed(),
                    });
                }
                Err(e) => {
                    warn!(
                        "[PHASE: docker_install] [STEP: download] {} transfer failed: {:#}",
                        strategy.kind(),
                        e
                    );
                    last_error = format!("{:#}", e);
                    remove_partial(destination).await;
                }
            }
        }

        Err(DeployError::Download {
            url: masked,
            attempts,
            last_error,
        })
    }
}
